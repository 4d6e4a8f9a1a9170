//! Session identifiers.
//!
//! Ids become directory names and socket paths, so anything outside
//! `[A-Za-z0-9_-]{1,64}` is rejected before it reaches the filesystem.

use crate::error::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum id length in bytes.
pub const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate a caller-supplied id.
    pub fn parse(raw: &str) -> BrokerResult<Self> {
        if raw.is_empty() || raw.len() > MAX_SESSION_ID_LEN {
            return Err(BrokerError::validation(format!(
                "invalid session id {raw:?}: length must be 1..={MAX_SESSION_ID_LEN}"
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(BrokerError::validation(format!(
                "invalid session id {raw:?}: only letters, digits, '-' and '_' are allowed"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Random id (16 bytes, hex-encoded).
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = BrokerError;

    fn try_from(value: String) -> BrokerResult<Self> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> String {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn accepts_safe_ids() {
        assert!(SessionId::parse("abc-123_DEF").is_ok());
        assert!(SessionId::parse(&"a".repeat(MAX_SESSION_ID_LEN)).is_ok());
    }

    #[test]
    fn rejects_traversal_and_junk() {
        for bad in ["", "../etc", "a/b", "a b", "é", ".", "x\0y"] {
            let err = SessionId::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad:?}");
        }
        assert!(SessionId::parse(&"a".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(SessionId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn serde_validates() {
        let ok: SessionId = serde_json::from_str("\"good-id\"").unwrap();
        assert_eq!(ok.as_str(), "good-id");
        assert!(serde_json::from_str::<SessionId>("\"../bad\"").is_err());
    }
}
