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
    net::{Shutdown, TcpListener, TcpStream},
    path::Path,
    time,
};

use openssl::ssl::{
    SslAcceptor, SslConnector, SslFiletype, SslMethod, SslStream, SslVerifyMode,
};
use tracing::info;

use crate::{
    channel::{Channel, Transport},
    error::{Error, Result},
};

/// TLS-wrapped TCP. The remote ends we talk to present self-signed
/// certificates as a rule (ncat --ssl generates one on the fly), so
/// connects never verify the peer; binds present our own cert.
pub struct SslTransport {
    stream: SslStream<TcpStream>,
    nonblocking: bool,
}

/// Build a server-side acceptor from a cert and key. `key` may be
/// omitted when the cert file is a combined PEM carrying both.
pub fn build_acceptor(cert: &Path, key: Option<&Path>) -> Result<SslAcceptor> {
    let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls())
        .map_err(|e| Error::Platform(format!("building ssl acceptor: {e}")))?;
    acceptor
        .set_certificate_chain_file(cert)
        .map_err(|e| Error::Platform(format!("loading ssl cert {}: {e}", cert.display())))?;
    let key = key.unwrap_or(cert);
    acceptor
        .set_private_key_file(key, SslFiletype::PEM)
        .map_err(|e| Error::Platform(format!("loading ssl key {}: {e}", key.display())))?;
    acceptor.set_verify(SslVerifyMode::NONE);
    Ok(acceptor.build())
}

impl SslTransport {
    /// Outbound TLS to `(host, port)`.
    pub fn connect(host: &str, port: u16) -> Result<Channel> {
        let tcp = TcpStream::connect((host, port)).map_err(Error::from_io)?;
        tcp.set_nodelay(true).map_err(Error::from_io)?;

        let mut builder = SslConnector::builder(SslMethod::tls())
            .map_err(|e| Error::Platform(format!("building ssl connector: {e}")))?;
        builder.set_verify(SslVerifyMode::NONE);
        let connector = builder.build();

        let mut session = connector
            .configure()
            .map_err(|e| Error::Platform(format!("configuring ssl: {e}")))?;
        session.set_use_server_name_indication(false);
        session.set_verify_hostname(false);
        let stream = session
            .connect(host, tcp)
            .map_err(|e| Error::Protocol(format!("ssl handshake: {e}")))?;
        info!("ssl connected to {}:{}", host, port);
        Ok(Channel::new(host, port, Box::new(SslTransport { stream, nonblocking: false })))
    }

    /// Listen on `(host, port)`, accept one connection, handshake.
    pub fn bind(host: &str, port: u16, cert: &Path, key: Option<&Path>) -> Result<Channel> {
        let acceptor = build_acceptor(cert, key)?;
        let listener = TcpListener::bind((host, port)).map_err(Error::from_io)?;
        info!("ssl listening on {}:{}", host, port);
        let (tcp, peer) = listener.accept().map_err(Error::from_io)?;
        tcp.set_nodelay(true).map_err(Error::from_io)?;
        let stream = acceptor
            .accept(tcp)
            .map_err(|e| Error::Protocol(format!("ssl handshake: {e}")))?;
        info!("ssl accepted connection from {}", peer);
        Ok(Channel::new(
            peer.ip().to_string(),
            peer.port(),
            Box::new(SslTransport { stream, nonblocking: false }),
        ))
    }

    /// Wrap a stream already accepted and handshaken by a background
    /// listener.
    pub fn from_stream(stream: SslStream<TcpStream>) -> Result<Channel> {
        let peer = stream.get_ref().peer_addr().map_err(Error::from_io)?;
        Ok(Channel::new(
            peer.ip().to_string(),
            peer.port(),
            Box::new(SslTransport { stream, nonblocking: false }),
        ))
    }
}

impl Transport for SslTransport {
    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from_io)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(Error::Eof),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && !self.nonblocking => {
                Err(Error::Timeout(time::Duration::ZERO))
            }
            Err(e) => Err(Error::from_io(e)),
        }
    }

    fn set_read_timeout(&mut self, dur: Option<time::Duration>) -> Result<()> {
        self.stream.get_ref().set_read_timeout(dur).map_err(Error::from_io)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        self.stream.get_ref().set_nonblocking(nonblocking).map_err(Error::from_io)?;
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        // best effort close_notify; the underlying shutdown is the part
        // that must not fail silently
        let _ = self.stream.shutdown();
        match self.stream.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from_io(e)),
        }
    }
}
