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

use std::{
    io::{Read as _, Write as _},
    net::TcpStream,
    path::Path,
    time,
};

use tracing::info;

use crate::{
    channel::{Channel, Transport},
    error::{Error, Result},
};

/// An SSH shell channel adapted to the byte interface. The library
/// hides all SSH framing; callers see the same stream semantics as a
/// raw socket. The server allocates a PTY for us up front, which is
/// why sessions arriving over SSH skip the upgrade ladder entirely.
pub struct SshTransport {
    // session must outlive the channel, so keep both
    session: ssh2::Session,
    chan: ssh2::Channel,
    nonblocking: bool,
}

/// How to prove who we are to the remote sshd.
pub enum SshAuth<'a> {
    Password(&'a str),
    Identity(&'a Path),
}

impl SshTransport {
    pub fn connect(host: &str, port: u16, user: &str, auth: SshAuth) -> Result<Channel> {
        let tcp = TcpStream::connect((host, port)).map_err(Error::from_io)?;
        tcp.set_nodelay(true).map_err(Error::from_io)?;

        let mut session = ssh2::Session::new()
            .map_err(|e| Error::Platform(format!("creating ssh session: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::Protocol(format!("ssh handshake: {e}")))?;

        match auth {
            SshAuth::Password(password) => session
                .userauth_password(user, password)
                .map_err(|e| Error::Permission(format!("ssh password auth for {user}: {e}")))?,
            SshAuth::Identity(key) => session
                .userauth_pubkey_file(user, None, key, None)
                .map_err(|e| Error::Permission(format!("ssh key auth for {user}: {e}")))?,
        }
        if !session.authenticated() {
            return Err(Error::Permission(format!("ssh auth for {user} failed")));
        }

        let mut chan = session
            .channel_session()
            .map_err(|e| Error::Protocol(format!("opening ssh channel: {e}")))?;
        let term = std::env::var("TERM").unwrap_or_else(|_| String::from("xterm"));
        chan.request_pty(&term, None, None)
            .map_err(|e| Error::Protocol(format!("requesting pty: {e}")))?;
        chan.shell().map_err(|e| Error::Protocol(format!("starting shell: {e}")))?;
        info!("ssh shell established with {}@{}:{}", user, host, port);

        Ok(Channel::new(host, port, Box::new(SshTransport { session, chan, nonblocking: false })))
    }
}

impl Transport for SshTransport {
    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.chan.write(buf).map_err(Error::from_io)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.chan.read(buf) {
            Ok(0) => Err(Error::Eof),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if self.nonblocking {
                    Err(Error::Blocked)
                } else {
                    // libssh2 reports an expired session timeout the
                    // same way as a would-block on a non-blocking
                    // session
                    Err(Error::Timeout(time::Duration::ZERO))
                }
            }
            Err(e) => {
                if self.chan.eof() {
                    Err(Error::Eof)
                } else {
                    Err(Error::from_io(e))
                }
            }
        }
    }

    fn set_read_timeout(&mut self, dur: Option<time::Duration>) -> Result<()> {
        // 0 means block indefinitely
        let ms = dur.map(|d| d.as_millis().min(u32::MAX as u128) as u32).unwrap_or(0);
        self.session.set_timeout(ms);
        Ok(())
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        self.session.set_blocking(!nonblocking);
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        let _ = self.chan.send_eof();
        let _ = self.chan.close();
        self.session
            .disconnect(None, "closing session", None)
            .map_err(|e| Error::Protocol(format!("ssh disconnect: {e}")))?;
        Ok(())
    }
}
