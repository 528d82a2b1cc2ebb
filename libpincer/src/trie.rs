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

//! A byte trie for online scanning of the channel streams. We scan raw
//! byte streams that are not guaranteed to be utf8, so the symbol type
//! is always u8 and each node carries a dense 256-way table to keep the
//! inner match loop branch-light.

#[derive(Debug)]
pub struct ByteTrie<V> {
    // The nodes which form the tree. The first node is the root node,
    // afterwards the order is undefined.
    nodes: Vec<Node<V>>,
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum Cursor {
    /// A cursor to use to start a byte-wise match
    Start,
    /// Represents a state in the middle or end of a match
    Match { idx: usize, is_partial: bool },
    /// A terminal state indicating a failure to match
    NoMatch,
}

#[derive(Debug)]
struct Node<V> {
    value: Option<V>,
    tab: Vec<Option<usize>>,
}

impl<V> Node<V> {
    fn new(value: Option<V>) -> Self {
        Node { value, tab: vec![None; u8::MAX as usize + 1] }
    }
}

impl<V> ByteTrie<V> {
    pub fn new() -> Self {
        ByteTrie { nodes: vec![Node::new(None)] }
    }

    /// Insert a byte sequence, value pair into the trie.
    pub fn insert<Seq: IntoIterator<Item = u8>>(&mut self, seq: Seq, value: V) {
        let mut current_node = 0;
        for byte in seq {
            current_node = if let Some(next_node) = self.nodes[current_node].tab[byte as usize] {
                next_node
            } else {
                let idx = self.nodes.len();
                self.nodes.push(Node::new(None));
                self.nodes[current_node].tab[byte as usize] = Some(idx);
                idx
            };
        }
        self.nodes[current_node].value = Some(value);
    }

    /// Process a single byte of input, returning the new match state.
    /// To start a new match, pass Cursor::Start.
    pub fn advance(&self, cursor: Cursor, byte: u8) -> Cursor {
        let node = match cursor {
            Cursor::Start => &self.nodes[0],
            Cursor::Match { idx, .. } => &self.nodes[idx],
            Cursor::NoMatch => return Cursor::NoMatch,
        };

        if let Some(idx) = node.tab[byte as usize] {
            Cursor::Match { idx, is_partial: self.nodes[idx].value.is_none() }
        } else {
            Cursor::NoMatch
        }
    }

    /// Get the value for a match cursor.
    pub fn get(&self, cursor: Cursor) -> Option<&V> {
        if let Cursor::Match { idx, .. } = cursor { self.nodes[idx].value.as_ref() } else { None }
    }

    /// Check if the given sequence exists in the trie, used by tests.
    #[allow(dead_code)]
    pub fn contains<Seq: IntoIterator<Item = u8>>(&self, seq: Seq) -> bool {
        let mut cursor = Cursor::Start;
        for byte in seq {
            cursor = self.advance(cursor, byte);
            if let Cursor::NoMatch = cursor {
                return false;
            }
        }
        match cursor {
            Cursor::Start => self.nodes[0].value.is_some(),
            Cursor::Match { is_partial, .. } => !is_partial,
            Cursor::NoMatch => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn contains_inserted() {
        let cases: Vec<Vec<&[u8]>> = vec![
            vec![b"word"],
            vec![b""],
            vec![b"word", b"words", b"blah", b"blip"],
        ];

        for words in cases.into_iter() {
            let mut trie = ByteTrie::new();
            for word in words.iter() {
                trie.insert(word.iter().copied(), ());
            }
            for word in words.iter() {
                assert!(trie.contains(word.iter().copied()));
            }
        }
    }

    #[test]
    fn partial_is_not_contained() {
        let mut trie = ByteTrie::new();
        trie.insert(b"marker".iter().copied(), ());
        assert!(!trie.contains(b"mark".iter().copied()));
        assert!(!trie.contains(b"markerx".iter().copied()));
    }
}
