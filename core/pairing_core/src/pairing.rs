//! Pairing credentials
//!
//! A pairing is the `{code, hash}` pair that identifies one rendezvous
//! session. The code is short and human-enterable, the hash is long and
//! exchanged programmatically.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Constants
// ============================================================================

/// Number of ASCII digits in a pairing code
pub const CODE_LEN: usize = 6;

/// Number of hex characters in a pairing hash
pub const HASH_LEN: usize = 64;

// ============================================================================
// Types
// ============================================================================

/// A pairing credential
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pairing {
    /// 6-digit numeric code
    pub code: String,
    /// 64-hex-character hash
    pub hash: String,
}

impl Pairing {
    pub fn new(code: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            hash: hash.into(),
        }
    }

    /// Parse a pairing out of a control message payload.
    ///
    /// Returns None when either field is missing or not a string. Unknown
    /// extra fields (e.g. `origin`) are ignored.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "code": self.code, "hash": self.hash })
    }

    /// Both fields are well-formed (does not consult any store)
    pub fn is_well_formed(&self) -> bool {
        code_is_valid(&self.code) && hash_is_valid(&self.hash)
    }
}

/// Outcome of checking a pairing against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub is_valid: bool,
}

// ============================================================================
// Format Checks
// ============================================================================

/// A code is exactly 6 ASCII digits
pub fn code_is_valid(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

/// A hash is exactly 64 ASCII hex characters
pub fn hash_is_valid(hash: &str) -> bool {
    hash.len() == HASH_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_code_validation() {
        assert!(code_is_valid("123456"));
        assert!(code_is_valid("000001"));
        assert!(!code_is_valid("12345"));
        assert!(!code_is_valid("1234567"));
        assert!(!code_is_valid("12345a"));
        assert!(!code_is_valid(""));
        // Non-ASCII digits are rejected even when char count matches
        assert!(!code_is_valid("１２３４５６"));
    }

    #[test]
    fn test_hash_validation() {
        assert!(hash_is_valid(HASH));
        assert!(!hash_is_valid(&HASH[..63]));
        assert!(!hash_is_valid(&format!("{}z", &HASH[..63])));
    }

    #[test]
    fn test_from_value_missing_fields() {
        let value = serde_json::json!({ "code": "123456" });
        assert!(Pairing::from_value(&value).is_none());

        let value = serde_json::json!({ "code": 123456, "hash": HASH });
        assert!(Pairing::from_value(&value).is_none());

        assert!(Pairing::from_value(&Value::Null).is_none());
    }

    #[test]
    fn test_from_value_ignores_extra_fields() {
        let value = serde_json::json!({ "code": "123456", "hash": HASH, "origin": "app://remote" });
        let pairing = Pairing::from_value(&value).unwrap();
        assert_eq!(pairing, Pairing::new("123456", HASH));
        assert!(pairing.is_well_formed());
    }

    #[test]
    fn test_validation_wire_name() {
        let json = serde_json::to_string(&Validation { is_valid: true }).unwrap();
        assert_eq!(json, r#"{"isValid":true}"#);
    }
}
