//! API key values: `lb-` followed by 16 lowercase hex characters.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Every issued key starts with this prefix.
pub const API_KEY_PREFIX: &str = "lb-";

/// Number of characters after the prefix.
pub const API_KEY_BODY_LEN: usize = 16;

const HEX_ALPHABET: &[u8; 16] = b"0123456789abcdef";

/// Generate a fresh plaintext API key.
pub fn generate_api_key() -> String {
    let mut rng = rand::rng();
    let body: String = (0..API_KEY_BODY_LEN)
        .map(|_| HEX_ALPHABET[rng.random_range(0..HEX_ALPHABET.len())] as char)
        .collect();
    format!("{API_KEY_PREFIX}{body}")
}

/// Check a candidate against `^lb-[0-9a-z]{16}$`.
/// Generation only emits hex, but any lowercase alphanumeric body passes.
pub fn validate_api_key_format(candidate: &str) -> bool {
    let Some(body) = candidate.strip_prefix(API_KEY_PREFIX) else {
        return false;
    };
    body.len() == API_KEY_BODY_LEN
        && body
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}

/// A key string that has passed format validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApiKeyValue(String);

impl ApiKeyValue {
    pub fn generate() -> Self {
        Self(generate_api_key())
    }

    pub fn parse(candidate: &str) -> Result<Self, KeyError> {
        if validate_api_key_format(candidate) {
            Ok(Self(candidate.to_string()))
        } else {
            Err(KeyError::MalformedKey)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ApiKeyValue {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if validate_api_key_format(&value) {
            Ok(Self(value))
        } else {
            Err(KeyError::MalformedKey)
        }
    }
}

impl From<ApiKeyValue> for String {
    fn from(value: ApiKeyValue) -> Self {
        value.0
    }
}

impl fmt::Display for ApiKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_prefix_and_hex_body() {
        let key = generate_api_key();
        assert!(key.starts_with("lb-"));
        assert_eq!(key.len(), 3 + 16);
        assert!(key[3..].bytes().all(|b| HEX_ALPHABET.contains(&b)));
        assert!(validate_api_key_format(&key));
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(generate_api_key(), generate_api_key());
    }

    #[test]
    fn rejects_malformed() {
        assert!(!validate_api_key_format(""));
        assert!(!validate_api_key_format("invalid-key"));
        assert!(!validate_api_key_format("lb-short"));
        assert!(!validate_api_key_format("lb-0123456789abcdef0"));
        assert!(!validate_api_key_format("lb-0123456789ABCDEF"));
        assert!(!validate_api_key_format("sk-0123456789abcdef"));
        assert!(!validate_api_key_format("lb-0123456789abcde!"));
    }

    #[test]
    fn accepts_lowercase_alphanumeric_body() {
        assert!(validate_api_key_format("lb-0123456789abcdef"));
        assert!(validate_api_key_format("lb-zzzzzzzzzzzzzzzz"));
    }

    #[test]
    fn api_key_value_serde() {
        let key = ApiKeyValue::parse("lb-fedcba9876543210").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"lb-fedcba9876543210\"");
        let back: ApiKeyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);

        let bad: Result<ApiKeyValue, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
