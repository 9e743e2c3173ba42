//! Peer identity: opaque per-process token shown to the user and used to address envelopes.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of a generated identity token.
pub const PEER_ID_LEN: usize = 12;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Peer identity token. Generated once per session; never reused after the process exits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random identity (lowercase base36).
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let token: String = (0..PEER_ID_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        PeerId(token)
    }

    /// Wrap a token typed by the user or read off the wire. Surrounding whitespace is trimmed;
    /// returns None for an empty token.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            None
        } else {
            Some(PeerId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(6) {
            Some((i, _)) => &self.0[..i],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}
