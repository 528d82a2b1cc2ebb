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

//! The channel layer: a uniform bidirectional byte transport over raw
//! TCP, TLS-wrapped TCP, or an SSH shell channel.
//!
//! A `Channel` owns a boxed `Transport` plus a peek buffer. Bytes are
//! strictly FIFO per direction; there is no multiplexing below the
//! channel. Everything above (framed execution, the stage-two C2, raw
//! pass-through) is built out of `recv`/`recvuntil`/`send` on this one
//! stream.

use std::{collections::VecDeque, time};

use tracing::{debug, trace};

use crate::error::{Error, Result};

mod ssh;
mod ssl;
mod tcp;

pub use ssh::{SshAuth, SshTransport};
pub use ssl::{build_acceptor, SslTransport};
pub use tcp::TcpTransport;

/// The raw byte pipe under a `Channel`. Implementations map their
/// native error surface into the shared taxonomy: a read on a closed
/// stream is `Eof`, an expired deadline is `Timeout`, an empty
/// non-blocking read is `Blocked`.
pub trait Transport: Send {
    fn send(&mut self, buf: &[u8]) -> Result<usize>;
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn set_read_timeout(&mut self, dur: Option<time::Duration>) -> Result<()>;
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()>;
    fn shutdown(&mut self) -> Result<()>;
}

/// A live byte-oriented connection to a single target.
pub struct Channel {
    host: String,
    port: u16,
    transport: Box<dyn Transport>,
    /// Bytes that have been read off the transport but not yet consumed
    /// by `recv`. Every non-empty `peek` is a prefix of the next `recv`.
    peeked: VecDeque<u8>,
    connected: bool,
    nonblocking: bool,
}

impl Channel {
    pub fn new<H: Into<String>>(host: H, port: u16, transport: Box<dyn Transport>) -> Self {
        Channel { host: host.into(), port, transport, peeked: VecDeque::new(), connected: true, nonblocking: false }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Switch the channel between blocking and non-blocking reads. In
    /// non-blocking mode a read with nothing buffered fails with
    /// `Blocked` rather than parking the thread.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        if self.nonblocking != nonblocking {
            self.transport.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.transport.send(buf)?;
        trace!("sent {} bytes", n);
        Ok(n)
    }

    pub fn send_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.send(buf) {
                Ok(0) => return Err(Error::Eof),
                Ok(n) => buf = &buf[n..],
                Err(Error::Blocked) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Receive up to `max` bytes, consuming the peek buffer first. A
    /// short read on any available data; never an empty success.
    pub fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        if max == 0 {
            return Ok(vec![]);
        }

        if !self.peeked.is_empty() {
            let take = max.min(self.peeked.len());
            let out: Vec<u8> = self.peeked.drain(..take).collect();
            return Ok(out);
        }

        let mut buf = vec![0; max];
        let n = self.transport.recv(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Return up to `max` bytes without consuming them. The bytes
    /// returned are always a prefix of what the next `recv` returns.
    pub fn peek(&mut self, max: usize) -> Result<Vec<u8>> {
        if self.peeked.len() < max {
            let want = max - self.peeked.len();
            let mut buf = vec![0; want];
            match self.transport.recv(&mut buf) {
                Ok(n) => self.peeked.extend(&buf[..n]),
                // nothing extra buffered right now; serve what we have
                Err(Error::Blocked) | Err(Error::Timeout(_)) if !self.peeked.is_empty() => {}
                Err(e) => return Err(e),
            }
        }

        let take = max.min(self.peeked.len());
        Ok(self.peeked.iter().take(take).copied().collect())
    }

    /// Push bytes back onto the front of the stream. Used by framed
    /// readers that overshoot a delimiter.
    pub fn unread(&mut self, buf: &[u8]) {
        for byte in buf.iter().rev() {
            self.peeked.push_front(*byte);
        }
    }

    /// Read until (and including) `delim`, or fail with `Timeout`.
    /// Bytes past the delimiter are pushed back for the next reader.
    pub fn recvuntil(&mut self, delim: &[u8], timeout: Option<time::Duration>) -> Result<Vec<u8>> {
        assert!(!delim.is_empty());

        let res = self.recvuntil_inner(delim, timeout);
        if timeout.is_some() {
            // don't leave a stale deadline behind for the next reader
            self.transport.set_read_timeout(None)?;
        }
        res
    }

    fn recvuntil_inner(
        &mut self,
        delim: &[u8],
        timeout: Option<time::Duration>,
    ) -> Result<Vec<u8>> {
        let deadline = timeout.map(|d| time::Instant::now() + d);
        let mut acc: Vec<u8> = Vec::new();

        // the delimiter may already be sitting in the peek buffer
        loop {
            if let Some(ix) = find_subsequence(&acc, delim) {
                let end = ix + delim.len();
                let rest = acc.split_off(end);
                self.unread(&rest);
                return Ok(acc);
            }

            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(time::Instant::now());
                if remaining.is_zero() {
                    // put everything back so a retry sees the same stream
                    self.unread(&acc);
                    return Err(Error::Timeout(timeout.unwrap_or_default()));
                }
                self.transport.set_read_timeout(Some(remaining))?;
            }

            match self.recv(crate::consts::BUF_SIZE) {
                Ok(chunk) => acc.extend_from_slice(&chunk),
                Err(Error::Timeout(_)) => {
                    self.unread(&acc);
                    return Err(Error::Timeout(timeout.unwrap_or_default()));
                }
                Err(e) => {
                    self.unread(&acc);
                    return Err(e);
                }
            }
        }
    }

    /// Discard everything currently buffered, returning how many bytes
    /// went on the floor.
    pub fn drain(&mut self) -> Result<usize> {
        let mut dropped = self.peeked.len();
        self.peeked.clear();

        let was_nonblocking = self.nonblocking;
        self.set_nonblocking(true)?;
        let res = loop {
            match self.recv(crate::consts::BUF_SIZE) {
                Ok(chunk) => dropped += chunk.len(),
                Err(Error::Blocked) => break Ok(dropped),
                Err(Error::Eof) => break Ok(dropped),
                Err(e) => break Err(e),
            }
        };
        self.set_nonblocking(was_nonblocking)?;

        if dropped > 0 {
            debug!("drained {} bytes", dropped);
        }
        res
    }

    /// Close the channel. Idempotent; the underlying shutdown happens
    /// exactly once.
    pub fn close(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.transport.shutdown()?;
        }
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.connected)
            .field("peeked", &self.peeked.len())
            .finish()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}


#[cfg(test)]
mod test {
    use super::{test_support::ScriptedTransport, *};
    use assert_matches::assert_matches;

    #[test]
    fn peek_is_prefix_of_recv() {
        let cases: Vec<(Vec<Vec<u8>>, usize)> = vec![
            (vec![b"hello world".to_vec()], 5),
            (vec![b"he".to_vec(), b"llo".to_vec()], 4),
            (vec![b"x".to_vec()], 8),
        ];

        for (chunks, n) in cases {
            let mut chan = ScriptedTransport::channel(chunks);
            let peeked = chan.peek(n).expect("peek to succeed");
            assert!(!peeked.is_empty());
            let received = chan.recv(n.max(peeked.len())).expect("recv to succeed");
            assert!(
                received.starts_with(&peeked),
                "peek {:?} not a prefix of recv {:?}",
                peeked,
                received
            );
        }
    }

    #[test]
    fn recv_consumes_peek_buffer_first() {
        let mut chan = ScriptedTransport::channel(vec![b"abcdef".to_vec()]);
        let _ = chan.peek(6).unwrap();
        assert_eq!(chan.recv(3).unwrap(), b"abc");
        assert_eq!(chan.recv(3).unwrap(), b"def");
    }

    #[test]
    fn recvuntil_stops_at_delimiter() {
        let mut chan =
            ScriptedTransport::channel(vec![b"line one\nline ".to_vec(), b"two\n".to_vec()]);
        assert_eq!(chan.recvuntil(b"\n", None).unwrap(), b"line one\n");
        assert_eq!(chan.recvuntil(b"\n", None).unwrap(), b"line two\n");
    }

    #[test]
    fn recvuntil_delimiter_split_across_chunks() {
        let mut chan = ScriptedTransport::channel(vec![
            b"data END".to_vec(),
            b"MAR".to_vec(),
            b"KER tail".to_vec(),
        ]);
        assert_eq!(chan.recvuntil(b"ENDMARKER", None).unwrap(), b"data ENDMARKER");
        // the tail must still be readable
        assert_eq!(chan.recv(16).unwrap(), b" tail");
    }

    #[test]
    fn recvuntil_eof_preserves_partial_data() {
        let mut chan = ScriptedTransport::channel(vec![b"partial".to_vec()]);
        assert_matches!(chan.recvuntil(b"\n", None), Err(Error::Eof));
        // the partial bytes went back into the peek buffer
        assert_eq!(chan.recv(16).unwrap(), b"partial");
    }

    #[test]
    fn drain_discards_buffered_bytes() {
        let mut chan = ScriptedTransport::channel(vec![b"junk".to_vec(), b"more".to_vec()]);
        let _ = chan.peek(2).unwrap();
        assert_eq!(chan.drain().unwrap(), 8);
        assert_matches!(chan.recv(4), Err(Error::Eof) | Err(Error::Blocked));
    }

    #[test]
    fn close_is_idempotent() {
        let mut chan = ScriptedTransport::channel(vec![]);
        assert!(chan.is_connected());
        chan.close().unwrap();
        assert!(!chan.is_connected());
        chan.close().unwrap();
    }

    #[test]
    fn nonblocking_read_reports_blocked() {
        let mut chan = ScriptedTransport::channel(vec![]);
        chan.set_nonblocking(true).unwrap();
        assert_matches!(chan.recv(8), Err(Error::Blocked));
    }
}
