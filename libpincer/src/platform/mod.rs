// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The platform layer: per-OS drivers that turn the raw byte channel
//! into POSIX-like primitives. The Linux driver frames commands on the
//! shared shell stream; the Windows driver bootstraps a stage-two agent
//! and marshals method calls to it.

use std::time;

use serde_derive::{Deserialize, Serialize};

use crate::{
    channel::Channel,
    error::Result,
    tty,
};

pub mod linux;
pub mod windows;

pub use linux::{LinuxPlatform, RemoteFile, RemoteProcess};
pub use windows::WindowsPlatform;

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    #[default]
    Linux,
    Windows,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformKind::Linux => write!(f, "linux"),
            PlatformKind::Windows => write!(f, "windows"),
        }
    }
}

/// The captured output and exit status of one framed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub status: i32,
}

impl ExecResult {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A user enumerated from the target.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub name: String,
    pub id: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

/// A group enumerated from the target.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    pub id: u32,
    pub members: Vec<String>,
}

/// Mode for `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    ReadWrite,
}

/// File-like operations a remote service manager supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOp {
    Status,
    Start,
    Stop,
    Restart,
}

/// The OS-specific driver bound to a session. Uses a tagged union
/// rather than a trait object so process and file handles can hold
/// driver-specific state without erasure games.
pub enum Platform {
    Linux(LinuxPlatform),
    Windows(WindowsPlatform),
}

impl Platform {
    pub fn kind(&self) -> PlatformKind {
        match self {
            Platform::Linux(_) => PlatformKind::Linux,
            Platform::Windows(_) => PlatformKind::Windows,
        }
    }

    /// Run a command to completion, capturing stdout and the exit
    /// status.
    pub fn run(
        &mut self,
        chan: &mut Channel,
        argv: &[String],
        env: &[(String, String)],
        timeout: Option<time::Duration>,
    ) -> Result<ExecResult> {
        match self {
            Platform::Linux(p) => p.run(chan, argv, env, timeout),
            Platform::Windows(p) => p.run(chan, argv, timeout),
        }
    }

    pub fn current_user(&mut self, chan: &mut Channel) -> Result<(u32, String)> {
        match self {
            Platform::Linux(p) => p.current_user(chan),
            Platform::Windows(p) => p.current_user(chan),
        }
    }

    pub fn users(&mut self, chan: &mut Channel) -> Result<Vec<User>> {
        match self {
            Platform::Linux(p) => p.users(chan),
            Platform::Windows(p) => p.users(chan),
        }
    }

    pub fn groups(&mut self, chan: &mut Channel) -> Result<Vec<Group>> {
        match self {
            Platform::Linux(p) => p.groups(chan),
            Platform::Windows(p) => p.groups(chan),
        }
    }

    pub fn cwd(&self) -> &str {
        match self {
            Platform::Linux(p) => p.cwd(),
            Platform::Windows(p) => p.cwd(),
        }
    }

    /// The stable identity hash used for reconnect routing.
    pub fn host_id(&mut self, chan: &mut Channel) -> Result<String> {
        match self {
            Platform::Linux(p) => p.host_id(chan),
            Platform::Windows(p) => p.host_id(chan),
        }
    }

    /// Whether the session runs on a real terminal remote side.
    pub fn has_pty(&self) -> bool {
        match self {
            Platform::Linux(p) => p.has_pty(),
            // a ConPTY is always available through stage two
            Platform::Windows(_) => true,
        }
    }

    /// Send the interrupt that cancels whatever is in flight: the
    /// Ctrl-C byte on a Linux PTY, a kill RPC on Windows.
    pub fn interrupt(&mut self, chan: &mut Channel) -> Result<()> {
        match self {
            Platform::Linux(p) => p.interrupt(chan),
            Platform::Windows(p) => p.interrupt(chan),
        }
    }

    /// Synchronize the remote terminal size with the local one.
    pub fn set_tty_size(&mut self, chan: &mut Channel, size: &tty::Size) -> Result<()> {
        match self {
            Platform::Linux(p) => p.set_tty_size(chan, size),
            Platform::Windows(p) => p.set_tty_size(chan, size),
        }
    }

    /// Prepare the stream for raw pass-through. On Windows this spawns
    /// the ConPTY session inside stage two.
    pub fn enter_interactive(&mut self, chan: &mut Channel) -> Result<()> {
        match self {
            Platform::Linux(_) => Ok(()),
            Platform::Windows(p) => p.enter_interactive(chan),
        }
    }

    /// Undo `enter_interactive`. On Windows this waits for the
    /// INTERACTIVE_COMPLETE marker.
    pub fn leave_interactive(&mut self, chan: &mut Channel) -> Result<()> {
        match self {
            Platform::Linux(_) => Ok(()),
            Platform::Windows(p) => p.leave_interactive(chan),
        }
    }
}

/// Helper shared by both drivers: shell-quote and join an argv, with
/// an optional `env -i`-style prefix.
pub(crate) fn render_command(argv: &[String], env: &[(String, String)]) -> String {
    let cmd = shell_words::join(argv.iter().map(String::as_str));
    if env.is_empty() {
        cmd
    } else {
        let assignments = env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_words::quote(v)))
            .collect::<Vec<_>>()
            .join(" ");
        format!("env -i {assignments} {cmd}")
    }
}

/// Parse `/etc/passwd`-shaped content.
pub(crate) fn parse_passwd(content: &str) -> Vec<User> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(User {
                name: String::from(fields[0]),
                id: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: String::from(fields[5]),
                shell: String::from(fields[6]),
            })
        })
        .collect()
}

/// Parse `/etc/group`-shaped content.
pub(crate) fn parse_groups(content: &str) -> Vec<Group> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(Group {
                name: String::from(fields[0]),
                id: fields[2].parse().ok()?,
                members: fields[3]
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_command_quotes() {
        let cases = vec![
            (vec!["id"], vec![], "id"),
            (vec!["echo", "a b"], vec![], "echo 'a b'"),
            (
                vec!["ls", "-la"],
                vec![("LANG", "C")],
                "env -i LANG=C ls -la",
            ),
            (
                vec!["printf", "%s"],
                vec![("V", "x y")],
                "env -i V='x y' printf %s",
            ),
        ];

        for (argv, env, want) in cases {
            let argv: Vec<String> = argv.into_iter().map(String::from).collect();
            let env: Vec<(String, String)> =
                env.into_iter().map(|(k, v)| (String::from(k), String::from(v))).collect();
            assert_eq!(render_command(&argv, &env), want);
        }
    }

    #[test]
    fn parse_passwd_lines() {
        let content = "root:x:0:0:root:/root:/bin/bash\n\
                       daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                       badline\n\
                       caleb:x:1000:1000:Caleb:/home/caleb:/bin/zsh\n";
        let users = parse_passwd(content);
        assert_eq!(users.len(), 3);
        assert_eq!(users[0].name, "root");
        assert_eq!(users[2].id, 1000);
        assert_eq!(users[2].shell, "/bin/zsh");
    }

    #[test]
    fn parse_group_lines() {
        let content = "root:x:0:\nsudo:x:27:caleb,amy\n";
        let groups = parse_groups(content);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].members.is_empty());
        assert_eq!(groups[1].members, vec!["caleb", "amy"]);
    }
}
