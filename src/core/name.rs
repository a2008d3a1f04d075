//! Player Names
//!
//! Display names travel as replicated values, so they are bounded the same
//! way a fixed 64-byte network string is: at most 61 bytes of UTF-8 payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum payload size of a player name in bytes.
pub const MAX_NAME_BYTES: usize = 61;

/// A bounded, UTF-8 player display name.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerName(String);

impl PlayerName {
    /// Create a name, truncating on a character boundary if it is too long.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.len() <= MAX_NAME_BYTES {
            return Self(trimmed.to_string());
        }

        let mut end = MAX_NAME_BYTES;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        Self(trimmed[..end].to_string())
    }

    /// Name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name is empty (nothing worth pushing to the authority).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PlayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerName {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}
