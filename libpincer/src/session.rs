// Copyright 2025 Google LLC
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

//! A session couples one channel with one platform driver and owns all
//! per-target state: identity, caches, the tamper and implant records,
//! and the session log stream.
//!
//! Raw pass-through and framed execution are mutually exclusive on the
//! shared channel; the session enforces the mode flag. Framed commands
//! on a single session serialize on the mutex the manager wraps the
//! session in; commands on different sessions run in parallel.

use std::{
    fs,
    io::Write as _,
    path::Path,
    time,
};

use anyhow::Context as _;
use tracing::{info, instrument, warn};

use crate::{
    channel::Channel,
    config::{Config, DuplicateKey},
    error::{Error, Result},
    platform::{
        ExecResult, FileMode, Group, LinuxPlatform, Platform, PlatformKind, RemoteFile,
        RemoteProcess, User, WindowsPlatform,
    },
    store::{Fact, Implant, Tamper},
    tty,
};

/// Whether the channel currently belongs to the interactive terminal
/// or to framed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Command,
    Raw,
}

/// The per-session plain-text log stream. Fatal errors and command
/// traces land here; the user-facing terminal only sees result titles.
pub struct SessionLog {
    file: Option<fs::File>,
}

impl SessionLog {
    fn open(dir: Option<&Path>, session_id: usize) -> SessionLog {
        let file = dir.and_then(|dir| {
            fs::create_dir_all(dir).ok()?;
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("session-{session_id}.log")))
                .ok()
        });
        SessionLog { file }
    }

    pub fn log(&mut self, line: &str) {
        if let Some(file) = &mut self.file {
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{stamp}] {line}");
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = &mut self.file {
            let _ = file.flush();
        }
    }
}

pub struct Session {
    pub id: usize,
    channel: Channel,
    platform: Platform,
    pub host_id: Option<String>,
    current_user: Option<(u32, String)>,
    users_cache: Option<Vec<User>>,
    pub facts: Vec<Fact>,
    pub tampers: Vec<Tamper>,
    pub implants: Vec<Implant>,
    mode: IoMode,
    log: SessionLog,
}

impl Session {
    /// Bring up a full session on a fresh channel: build the platform
    /// driver (probe + upgrade or stage-two bootstrap), then enumerate
    /// identity.
    #[instrument(skip_all, fields(id = id, host = chan.host()))]
    pub fn establish(
        id: usize,
        mut chan: Channel,
        kind: PlatformKind,
        config: &Config,
        log_dir: Option<&Path>,
    ) -> anyhow::Result<Session> {
        let mut log = SessionLog::open(log_dir, id);
        log.log(&format!("establishing session to {}:{}", chan.host(), chan.port()));

        let mut platform = match kind {
            PlatformKind::Linux => Platform::Linux(
                LinuxPlatform::embark(&mut chan, config).context("linux platform bring-up")?,
            ),
            PlatformKind::Windows => Platform::Windows(
                WindowsPlatform::embark(&mut chan, config).context("windows platform bring-up")?,
            ),
        };

        let host_id = match platform.host_id(&mut chan) {
            Ok(host_id) => Some(host_id),
            Err(e) => {
                warn!("could not derive host id: {}", e);
                None
            }
        };
        let current_user = platform.current_user(&mut chan).ok();
        log.log(&format!("established host_id={host_id:?} user={current_user:?}"));

        Ok(Session {
            id,
            channel: chan,
            platform,
            host_id,
            current_user,
            users_cache: None,
            facts: vec![],
            tampers: vec![],
            implants: vec![],
            mode: IoMode::Command,
            log,
        })
    }

    /// Wrap an already constructed channel/platform pair; used by tests
    /// and by reconnect paths that prebuild the platform.
    pub fn from_parts(id: usize, channel: Channel, platform: Platform) -> Session {
        Session {
            id,
            channel,
            platform,
            host_id: None,
            current_user: None,
            users_cache: None,
            facts: vec![],
            tampers: vec![],
            implants: vec![],
            mode: IoMode::Command,
            log: SessionLog { file: None },
        }
    }

    pub fn platform_kind(&self) -> PlatformKind {
        self.platform.kind()
    }

    pub fn has_pty(&self) -> bool {
        self.platform.has_pty()
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn host(&self) -> &str {
        self.channel.host()
    }

    pub fn port(&self) -> u16 {
        self.channel.port()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn current_user(&self) -> Option<&(u32, String)> {
        self.current_user.as_ref()
    }

    pub fn cwd(&self) -> &str {
        self.platform.cwd()
    }

    pub fn log(&mut self, line: &str) {
        self.log.log(line);
    }

    /// The key used for duplicate-session detection.
    pub fn identity_key(&self, duplicate_key: DuplicateKey) -> String {
        let host = self.host_id.as_deref().unwrap_or("unknown");
        match duplicate_key {
            DuplicateKey::Host => String::from(host),
            DuplicateKey::HostUser => {
                let user =
                    self.current_user.as_ref().map(|(_, name)| name.as_str()).unwrap_or("");
                format!("{host}:{user}")
            }
        }
    }

    fn ensure_command_mode(&self) -> Result<()> {
        if self.mode == IoMode::Raw {
            return Err(Error::Busy("session is in raw pass-through"));
        }
        Ok(())
    }

    //
    // framed primitives, all gated on the mode flag
    //

    pub fn run(
        &mut self,
        argv: &[String],
        env: &[(String, String)],
        timeout: Option<time::Duration>,
    ) -> Result<ExecResult> {
        self.ensure_command_mode()?;
        self.log.log(&format!("run: {argv:?}"));
        self.platform.run(&mut self.channel, argv, env, timeout)
    }

    pub fn popen(&mut self, argv: &[String], env: &[(String, String)]) -> Result<RemoteProcess> {
        self.ensure_command_mode()?;
        self.log.log(&format!("popen: {argv:?}"));
        match &mut self.platform {
            Platform::Linux(p) => p.popen(&mut self.channel, argv, env),
            Platform::Windows(_) => Err(Error::Argument(String::from(
                "use windows_popen for stage-two process handles",
            ))),
        }
    }

    pub fn open(
        &mut self,
        path: &str,
        mode: FileMode,
        length: Option<usize>,
    ) -> Result<RemoteFile> {
        self.ensure_command_mode()?;
        self.log.log(&format!("open: {path} {mode:?} len={length:?}"));
        match &mut self.platform {
            Platform::Linux(p) => p.open(&mut self.channel, path, mode, length),
            Platform::Windows(_) => Err(Error::Argument(String::from(
                "use windows file primitives for stage-two handles",
            ))),
        }
    }

    pub fn users(&mut self) -> Result<Vec<User>> {
        self.ensure_command_mode()?;
        if let Some(users) = &self.users_cache {
            return Ok(users.clone());
        }
        let users = self.platform.users(&mut self.channel)?;
        self.users_cache = Some(users.clone());
        Ok(users)
    }

    pub fn groups(&mut self) -> Result<Vec<Group>> {
        self.ensure_command_mode()?;
        self.platform.groups(&mut self.channel)
    }

    pub fn interrupt(&mut self) -> Result<()> {
        self.platform.interrupt(&mut self.channel)
    }

    pub fn set_tty_size(&mut self, size: &tty::Size) -> Result<()> {
        self.ensure_command_mode()?;
        self.platform.set_tty_size(&mut self.channel, size)
    }

    /// Split borrows for callers that need the platform driver and the
    /// channel at once (modules doing platform-specific work).
    pub fn platform_and_channel(&mut self) -> Result<(&mut Platform, &mut Channel)> {
        self.ensure_command_mode()?;
        Ok((&mut self.platform, &mut self.channel))
    }

    //
    // raw pass-through
    //

    /// Flip the session into raw mode. Framed primitives fail Busy
    /// until `leave_raw`.
    pub fn enter_raw(&mut self) -> Result<()> {
        self.ensure_command_mode()?;
        self.platform.enter_interactive(&mut self.channel)?;
        self.mode = IoMode::Raw;
        self.log.log("entered raw mode");
        Ok(())
    }

    pub fn leave_raw(&mut self) -> Result<()> {
        if self.mode != IoMode::Raw {
            return Ok(());
        }
        self.platform.leave_interactive(&mut self.channel)?;
        self.mode = IoMode::Command;
        self.log.log("left raw mode");
        Ok(())
    }

    /// Channel access for the raw pump loop. Only legal in raw mode.
    pub fn raw_channel(&mut self) -> Result<&mut Channel> {
        if self.mode != IoMode::Raw {
            return Err(Error::Busy("session is not in raw pass-through"));
        }
        Ok(&mut self.channel)
    }

    /// Does the remote stream need scanning for the ConPTY completion
    /// marker while raw?
    pub fn scans_interactive_marker(&self) -> bool {
        matches!(self.platform, Platform::Windows(_))
    }

    //
    // record keeping
    //

    pub fn record_tamper(&mut self, tamper: Tamper) {
        self.log.log(&format!("tamper: {}", tamper.description));
        self.tampers.push(tamper);
    }

    pub fn record_implant(&mut self, implant: Implant) {
        self.log.log(&format!("implant: {}", implant.module_name));
        self.implants.push(implant);
    }

    pub fn record_fact(&mut self, fact: Fact) {
        self.facts.push(fact);
    }

    /// Close the session: close the channel, flush the log. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        info!("closing session {}", self.id);
        self.log.log("closing session");
        self.log.flush();
        self.channel.close()
    }
}
