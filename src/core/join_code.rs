//! Join Codes
//!
//! The join code is the only user-facing "wire format" of a session: a short
//! alphanumeric token the host reads out to its friends. Codes are
//! case-insensitive and users paste them with stray whitespace and
//! punctuation, so every code is normalized before it reaches the
//! rendezvous service:
//!
//! 1. Trim surrounding whitespace
//! 2. Convert to ASCII uppercase
//! 3. Drop everything outside `A-Z` and `0-9`
//!
//! The normalized form is the only form that is ever sent anywhere.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Raw input did not contain a single usable character.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("join code is empty after normalization (input: {raw:?})")]
pub struct InvalidCode {
    /// The input as the user typed it.
    pub raw: String,
}

/// A normalized join code.
///
/// # Example
///
/// ```
/// use relay_netvar::core::join_code::JoinCode;
///
/// let code = JoinCode::parse("  c86dgq!! ").unwrap();
/// assert_eq!(code.as_str(), "C86DGQ");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JoinCode(String);

impl JoinCode {
    /// Normalize user input into a join code.
    pub fn parse(raw: &str) -> Result<Self, InvalidCode> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Err(InvalidCode { raw: raw.to_string() });
        }
        Ok(Self(normalized))
    }

    /// Normalized code text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for JoinCode {
    type Err = InvalidCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Apply the normalization steps without validating the result.
pub fn normalize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}
