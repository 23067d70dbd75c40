//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a RaceId
//! where a UserId is expected). User and race ids become path segments of store keys,
//! so they are validated on construction and on deserialization.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Separator between key segments in the document store.
const KEY_SEPARATOR: char = '/';

/// Error returned when an identifier cannot be used as a key segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidId {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier {0:?} contains the key separator '/'")]
    ContainsSeparator(String),
}

fn check_segment(s: &str) -> Result<(), InvalidId> {
    if s.is_empty() {
        return Err(InvalidId::Empty);
    }
    if s.contains(KEY_SEPARATOR) {
        return Err(InvalidId::ContainsSeparator(s.to_string()));
    }
    Ok(())
}

/// The user a reading, record, or ledger entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Creates a user id, rejecting empty strings and strings containing `/`.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        check_segment(&s)?;
        Ok(UserId(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = InvalidId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        UserId::new(s)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A competitive race that steps can be attributed to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RaceId(String);

impl RaceId {
    /// Creates a race id, rejecting empty strings and strings containing `/`.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        check_segment(&s)?;
        Ok(RaceId(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RaceId {
    type Error = InvalidId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        RaceId::new(s)
    }
}

impl From<RaceId> for String {
    fn from(id: RaceId) -> Self {
        id.0
    }
}

impl fmt::Display for RaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A ledger transaction id (lowercase hex SHA-256).
///
/// Derived from the content of the physical event, never allocated randomly,
/// so that redelivery of one event maps onto one ledger row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(s: impl Into<String>) -> Self {
        TransactionId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (12-character) prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_empty_ids() {
        assert_eq!(UserId::new(""), Err(InvalidId::Empty));
        assert_eq!(RaceId::new(""), Err(InvalidId::Empty));
    }

    #[test]
    fn rejects_separator() {
        assert!(matches!(
            UserId::new("a/b"),
            Err(InvalidId::ContainsSeparator(_))
        ));
        assert!(matches!(
            RaceId::new("race/1"),
            Err(InvalidId::ContainsSeparator(_))
        ));
    }

    #[test]
    fn deserialize_validates() {
        let bad: Result<UserId, _> = serde_json::from_str("\"x/y\"");
        assert!(bad.is_err());
        let good: UserId = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(good.as_str(), "alice");
    }

    #[test]
    fn short_handles_short_input() {
        let id = TransactionId::new("abc");
        assert_eq!(id.short(), "abc");
    }

    proptest! {
        #[test]
        fn user_id_serde_roundtrip(s in "[a-zA-Z0-9_-]{1,40}") {
            let id = UserId::new(&s).unwrap();
            let json = serde_json::to_string(&id).unwrap();
            let parsed: UserId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(id, parsed);
        }

        #[test]
        fn race_id_display_matches_input(s in "[a-zA-Z0-9_-]{1,40}") {
            let id = RaceId::new(&s).unwrap();
            prop_assert_eq!(format!("{}", id), s);
        }
    }
}
