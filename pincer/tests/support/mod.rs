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

// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{
    io::{Read as _, Write as _},
    net::{TcpListener, TcpStream},
    thread, time,
};

use anyhow::anyhow;

/// How a scripted remote shell behaves. The server end of the tests:
/// it speaks just enough sh to satisfy the probe, the PTY upgrade
/// ladder, and framed execution.
#[derive(Clone)]
pub struct ShellBehavior {
    /// What the probe discovers at /proc/$$/exe.
    pub shell_path: String,
    /// Output of the host identity enumeration, so tests can control
    /// which targets look like duplicates.
    pub identity_material: String,
    pub username: String,
    pub uid: u32,
    /// Whether `tty` succeeds before any upgrade method ran (the SSH
    /// case).
    pub initial_tty: bool,
    /// Sent unprompted on connect, like a real shell's greeting.
    pub banner: Option<String>,
}

impl Default for ShellBehavior {
    fn default() -> Self {
        ShellBehavior {
            shell_path: String::from("/usr/bin/dash"),
            identity_material: String::from(
                "aa:bb:cc:dd:ee:ff\nLinux 5.15.0-generic\nID=debian",
            ),
            username: String::from("root"),
            uid: 0,
            initial_tty: false,
            banner: Some(String::from("$ ")),
        }
    }
}

/// A loopback TCP server that accepts up to `max_conns` connections and
/// runs the scripted shell on each.
pub struct FakeShellServer {
    pub port: u16,
    accept_h: Option<thread::JoinHandle<()>>,
}

impl FakeShellServer {
    pub fn spawn(behavior: ShellBehavior, max_conns: usize) -> anyhow::Result<FakeShellServer> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();

        let accept_h = thread::spawn(move || {
            for _ in 0..max_conns {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let behavior = behavior.clone();
                thread::spawn(move || {
                    let _ = serve_shell(stream, behavior);
                });
            }
        });

        Ok(FakeShellServer { port, accept_h: Some(accept_h) })
    }

    /// Connect a pincer channel to this server.
    pub fn connect(&self) -> libpincer::channel::Channel {
        libpincer::channel::TcpTransport::connect("127.0.0.1", self.port, None)
            .expect("connecting to fake shell")
    }
}

/// Run the scripted shell over an already connected stream; used by
/// tests that dial a listener like a reverse shell would.
pub fn serve_shell_on(stream: TcpStream, behavior: ShellBehavior) -> anyhow::Result<()> {
    serve_shell(stream, behavior)
}

/// One scripted shell conversation. Understands the framed command
/// wrapper (`echo S; cmd; echo E $?` with split markers) and treats
/// everything else as swallowed input, except the PTY spawn lines
/// which flip the tty state.
fn serve_shell(mut stream: TcpStream, behavior: ShellBehavior) -> anyhow::Result<()> {
    let frame = regex::Regex::new(
        r"^\s*echo ([0-9a-f]+)''([0-9a-f]+); (.*); echo ([0-9a-f]+)''([0-9a-f]+) \$\?$",
    )
    .unwrap();

    if let Some(banner) = &behavior.banner {
        stream.write_all(banner.as_bytes())?;
    }

    let mut pty_spawned = false;
    let mut inbuf: Vec<u8> = vec![];
    let mut read_buf = [0u8; 4096];

    loop {
        let nread = match stream.read(&mut read_buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(_) => return Ok(()),
        };
        inbuf.extend_from_slice(&read_buf[..nread]);

        while let Some(pos) = inbuf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = inbuf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1])
                .trim_end_matches('\r')
                .to_string();

            if let Some(caps) = frame.captures(&line) {
                let start = format!("{}{}", &caps[1], &caps[2]);
                let cmd = caps[3].to_string();
                let end = format!("{}{}", &caps[4], &caps[5]);
                let (out, status) = respond(&cmd, &behavior, pty_spawned);

                let mut reply = format!("{start}\r\n");
                if !out.is_empty() {
                    reply.push_str(&out);
                    reply.push_str("\r\n");
                }
                reply.push_str(&format!("{end} {status}\r\n"));
                stream.write_all(reply.as_bytes())?;
            } else if line.contains("script -qc")
                || line.contains("script -q /dev/null")
                || line.contains("pty.spawn")
                || line.contains("socat exec:")
            {
                pty_spawned = true;
            }
            // anything else: swallowed, like a shell with echo off
        }
    }
}

fn respond(cmd: &str, behavior: &ShellBehavior, pty_spawned: bool) -> (String, i32) {
    if cmd.starts_with("readlink /proc/$$/exe") {
        return (behavior.shell_path.clone(), 0);
    }
    if cmd == "tty" {
        return if pty_spawned || behavior.initial_tty {
            (String::from("/dev/pts/0"), 0)
        } else {
            (String::from("not a tty"), 1)
        };
    }
    if let Some(name) = cmd.strip_prefix("command -v ") {
        return if name == "script" {
            (String::from("/usr/bin/script"), 0)
        } else {
            (String::new(), 1)
        };
    }
    if cmd == "id -u; id -un; pwd" {
        return (format!("{}\n{}\n/root", behavior.uid, behavior.username), 0);
    }
    if cmd.starts_with("cat /sys/class/net") {
        return (behavior.identity_material.clone(), 0);
    }
    if cmd == "id" {
        return (format!("uid={}({}) gid=0(root) groups=0(root)", behavior.uid, behavior.username), 0);
    }
    if cmd == "cat /etc/passwd" {
        return (
            String::from(
                "root:x:0:0:root:/root:/bin/bash\ncaleb:x:1000:1000::/home/caleb:/bin/sh",
            ),
            0,
        );
    }
    if let Some(arg) = cmd.strip_prefix("echo ") {
        return (arg.trim_matches('\'').to_string(), 0);
    }
    // exports, stty, everything else: succeed quietly
    (String::new(), 0)
}

pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> bool,
{
    let mut sleep_dur = time::Duration::from_millis(10);
    for _ in 0..12 {
        if pred() {
            return Ok(());
        }
        thread::sleep(sleep_dur);
        sleep_dur *= 2;
    }
    Err(anyhow!("pred never became true"))
}
