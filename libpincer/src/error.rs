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

//! The error taxonomy surfaced by the session runtime.
//!
//! Transport and Platform errors are fatal for the session that raised
//! them and escape to the manager; everything else propagates to the
//! calling module, which decides whether to retry, skip, or abort.

use std::{io, time};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Channel-level I/O failure. Closes the session.
    #[error("transport: {0}")]
    Transport(#[source] io::Error),

    /// Unexpected byte sequence, missing delimiter, or malformed C2
    /// JSON. Poisons the channel.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Deadline exceeded. The caller chooses whether to retry.
    #[error("timed out after {0:?}")]
    Timeout(time::Duration),

    /// Nothing buffered and the channel is in non-blocking mode. Not
    /// really an error, just a read outcome.
    #[error("read would block")]
    Blocked,

    /// Orderly close of the remote end.
    #[error("end of stream")]
    Eof,

    /// Remote EACCES/EPERM or a missing capability. Recoverable.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Missing binary, file, user, module, or plugin. Recoverable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal concurrent operation on a session, e.g. issuing a framed
    /// command while raw pass-through is active.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// Bad argument type, missing required argument, or a value outside
    /// the declared choices. Never reaches the transport.
    #[error("argument: {0}")]
    Argument(String),

    /// No known escalation path. Aggregated from sub-attempts.
    #[error("escalation failed after {} attempts", .0.attempted.len())]
    EscalationFailed(EscalationFailure),

    /// A driver invariant was violated (e.g. the remote shell resolved
    /// to nologin). Fatal for the session.
    #[error("platform: {0}")]
    Platform(String),
}

/// The aggregate record of a failed automated escalation, retained so
/// the caller can inspect or render each step.
#[derive(Debug, Default)]
pub struct EscalationFailure {
    /// Human readable descriptions of every method attempted.
    pub attempted: Vec<String>,
    /// Users we could have pivoted through but didn't reach the target
    /// from.
    pub reachable_users: Vec<String>,
    /// The error from the final attempt, if any attempt ran at all.
    pub last_error: Option<Box<Error>>,
}

impl Error {
    /// Fatal errors terminate the session; the rest are the module's
    /// problem.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_) | Error::Platform(_))
    }

    /// Map an I/O error from a raw socket read or write into the
    /// taxonomy. WouldBlock and TimedOut show up as error kinds on
    /// non-blocking and deadline reads respectively, and both have
    /// dedicated variants that callers match on.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::Blocked,
            io::ErrorKind::TimedOut => Error::Timeout(time::Duration::ZERO),
            io::ErrorKind::UnexpectedEof => Error::Eof,
            io::ErrorKind::PermissionDenied => Error::Permission(err.to_string()),
            io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            _ => Error::Transport(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn io_error_mapping() {
        let cases = vec![
            (io::ErrorKind::WouldBlock, false),
            (io::ErrorKind::TimedOut, false),
            (io::ErrorKind::UnexpectedEof, false),
            (io::ErrorKind::PermissionDenied, false),
            (io::ErrorKind::NotFound, false),
            (io::ErrorKind::ConnectionReset, true),
            (io::ErrorKind::BrokenPipe, true),
        ];

        for (kind, want_fatal) in cases {
            let err = Error::from_io(io::Error::new(kind, "test"));
            assert_eq!(err.is_fatal(), want_fatal, "kind {kind:?}");
        }
    }

    #[test]
    fn blocked_is_not_fatal() {
        assert_matches!(
            Error::from_io(io::Error::new(io::ErrorKind::WouldBlock, "x")),
            Error::Blocked
        );
    }
}
