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
    time,
};

use tracing::info;

use crate::{
    channel::{Channel, Transport},
    error::{Error, Result},
};

/// Plain TCP, for both `connect` (outbound to a bind shell) and `bind`
/// (accept exactly one reverse shell).
pub struct TcpTransport {
    stream: TcpStream,
    /// Whether the caller asked for non-blocking reads. Needed to
    /// disambiguate EAGAIN: on a blocking socket with SO_RCVTIMEO set,
    /// the kernel reports an expired deadline as EWOULDBLOCK.
    nonblocking: bool,
}

impl TcpTransport {
    /// Outbound TCP to `(host, port)`.
    pub fn connect(host: &str, port: u16, timeout: Option<time::Duration>) -> Result<Channel> {
        let stream = match timeout {
            Some(dur) => {
                let addr = (host, port)
                    .to_socket_addr()
                    .map_err(Error::from_io)?;
                TcpStream::connect_timeout(&addr, dur).map_err(Error::from_io)?
            }
            None => TcpStream::connect((host, port)).map_err(Error::from_io)?,
        };
        stream.set_nodelay(true).map_err(Error::from_io)?;
        info!("connected to {}:{}", host, port);
        Ok(Channel::new(host, port, Box::new(TcpTransport { stream, nonblocking: false })))
    }

    /// Listen on `(host, port)` and accept exactly one connection.
    pub fn bind(host: &str, port: u16) -> Result<Channel> {
        let listener = TcpListener::bind((host, port)).map_err(Error::from_io)?;
        info!("listening on {}:{}", host, port);
        let (stream, peer) = listener.accept().map_err(Error::from_io)?;
        stream.set_nodelay(true).map_err(Error::from_io)?;
        info!("accepted connection from {}", peer);
        Ok(Channel::new(peer.ip().to_string(), peer.port(), Box::new(TcpTransport { stream, nonblocking: false })))
    }

    /// Wrap an already-accepted stream, e.g. one handed over by a
    /// background listener.
    pub fn from_stream(stream: TcpStream) -> Result<Channel> {
        let peer = stream.peer_addr().map_err(Error::from_io)?;
        stream.set_nodelay(true).map_err(Error::from_io)?;
        Ok(Channel::new(peer.ip().to_string(), peer.port(), Box::new(TcpTransport { stream, nonblocking: false })))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from_io)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(Error::Eof),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && !self.nonblocking => {
                // blocking socket, so this is SO_RCVTIMEO expiring
                Err(Error::Timeout(time::Duration::ZERO))
            }
            Err(e) => Err(Error::from_io(e)),
        }
    }

    fn set_read_timeout(&mut self, dur: Option<time::Duration>) -> Result<()> {
        self.stream.set_read_timeout(dur).map_err(Error::from_io)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        self.stream.set_nonblocking(nonblocking).map_err(Error::from_io)?;
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // the peer hanging up first is not an error worth surfacing
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from_io(e)),
        }
    }
}

trait ToSocketAddr {
    fn to_socket_addr(&self) -> std::io::Result<std::net::SocketAddr>;
}

impl ToSocketAddr for (&str, u16) {
    fn to_socket_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        use std::net::ToSocketAddrs as _;
        self.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "could not resolve address")
        })
    }
}
