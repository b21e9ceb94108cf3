//! User identity
//!
//! Call identifiers are built from the two participants' user ids, so a user
//! id must never contain the characters used to join them.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Characters reserved by the call identifier encoding
pub const RESERVED_CHARS: [char; 2] = [crate::types::PAIR_SEPARATOR, crate::types::ATTEMPT_SEPARATOR];

/// Identity validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Empty identifier
    #[error("User id cannot be empty")]
    Empty,

    /// Identifier contains a character reserved by the call id encoding
    #[error("User id contains reserved character {0:?}")]
    ReservedCharacter(char),
}

/// Opaque user identifier issued by the identity service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Create a user id, rejecting empty ids and reserved characters
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty or contains a reserved character
    pub fn new(s: impl Into<String>) -> Result<Self, IdentityError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if let Some(c) = s.chars().find(|c| RESERVED_CHARS.contains(c)) {
            return Err(IdentityError::ReservedCharacter(c));
        }
        Ok(Self(s))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for UserId {
    type Error = IdentityError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl std::str::FromStr for UserId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id() {
        let id = UserId::new("uX3f9a").unwrap();
        assert_eq!(id.to_string(), "uX3f9a");
        assert_eq!(id.as_str(), "uX3f9a");
    }

    #[test]
    fn test_user_id_rejects_reserved() {
        assert_eq!(UserId::new(""), Err(IdentityError::Empty));
        assert_eq!(
            UserId::new("alice_bob"),
            Err(IdentityError::ReservedCharacter('_'))
        );
        assert_eq!(
            UserId::new("alice:1"),
            Err(IdentityError::ReservedCharacter(':'))
        );
    }

    #[test]
    fn test_user_id_serialization() {
        let id = UserId::new("alice").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alice\"");
        let deserialized: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);

        assert!(serde_json::from_str::<UserId>("\"a_b\"").is_err());
    }
}
