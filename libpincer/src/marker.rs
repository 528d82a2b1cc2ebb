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

//! Framing markers. Every programmatic command on a Linux session is
//! wrapped in a unique start/end marker pair so its output can be
//! located deterministically on the shared byte stream, and every
//! session embeds a marker in the remote prompt so the driver can find
//! the prompt without caring how the shell renders it.

use rand::Rng as _;

use crate::{
    consts,
    trie::{ByteTrie, Cursor},
};

/// A framing marker: a run of random hex characters, unique enough
/// that it cannot occur in organic command output.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    hex: String,
}

impl Marker {
    pub fn random(nbytes: usize) -> Self {
        let mut raw = vec![0u8; nbytes];
        rand::thread_rng().fill(&mut raw[..]);
        Marker { hex: hex::encode(raw) }
    }

    /// The marker for a session prompt.
    pub fn prompt() -> Self {
        Self::random(consts::PROMPT_MARKER_BYTES)
    }

    /// A start/end pair for one framed command.
    pub fn command_pair() -> (Self, Self) {
        (
            Self::random(consts::COMMAND_MARKER_BYTES),
            Self::random(consts::COMMAND_MARKER_BYTES),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.hex.as_bytes()
    }

    /// Render the marker split in two halves with a quote boundary in
    /// the middle, e.g. `deadbe''ef0123`. When the remote tty still has
    /// echo enabled, the echoed command contains the split form while
    /// real output contains the joined form, so a scanner looking for
    /// the joined marker can never match on the echo.
    pub fn shell_split(&self) -> String {
        let mid = self.hex.len() / 2;
        format!("{}''{}", &self.hex[..mid], &self.hex[mid..])
    }

    /// The prompt embedding: the marker wrapped in conceal/reveal SGR
    /// escapes so a rendering terminal shows nothing. Shells like dash
    /// that don't honour `\[...\]` print the escapes raw, which is fine
    /// because the driver matches the hex bytes, not the rendering.
    pub fn prompt_embedding(&self) -> String {
        format!("\\[\\033[8m\\]{}\\[\\033[28m\\]", self.hex)
    }
}

/// An online scanner that pumps one byte at a time and reports when the
/// complete marker has passed by.
pub struct MarkerScanner {
    trie: ByteTrie<()>,
    cursor: Cursor,
}

impl MarkerScanner {
    pub fn new(marker: &Marker) -> Self {
        Self::for_bytes(marker.as_bytes())
    }

    /// Scan for a fixed byte sequence that isn't a generated marker,
    /// e.g. the stage-two ConPTY completion line.
    pub fn for_bytes(needle: &[u8]) -> Self {
        let mut trie = ByteTrie::new();
        trie.insert(needle.iter().copied(), ());
        MarkerScanner { trie, cursor: Cursor::Start }
    }

    /// Feed one byte; true when the final byte of the marker was just
    /// consumed.
    pub fn transition(&mut self, byte: u8) -> bool {
        self.cursor = self.trie.advance(self.cursor, byte);
        match self.cursor {
            Cursor::NoMatch => {
                // the failed prefix could itself end with the start of
                // a match
                self.cursor = self.trie.advance(Cursor::Start, byte);
                if let Cursor::NoMatch = self.cursor {
                    self.cursor = Cursor::Start;
                }
                false
            }
            Cursor::Match { is_partial, .. } if !is_partial => {
                self.cursor = Cursor::Start;
                true
            }
            _ => false,
        }
    }

    /// Scan a buffer, returning the index one past the end of the
    /// marker if it completes anywhere inside.
    pub fn scan(&mut self, buf: &[u8]) -> Option<usize> {
        for (i, byte) in buf.iter().enumerate() {
            if self.transition(*byte) {
                return Some(i + 1);
            }
        }
        None
    }
}
