//! Error types and stable error codes for key handling.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("malformed api key")]
    MalformedKey,

    #[error("key vault does not support decryption")]
    DecryptionUnsupported,
}

impl KeyError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedKey => "malformed_key",
            Self::DecryptionUnsupported => "decryption_unsupported",
        }
    }
}

/// Serializable error body, printed by `lobe-db keys validate --json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl From<&KeyError> for ErrorResponse {
    fn from(err: &KeyError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(KeyError::MalformedKey.error_code(), "malformed_key");
        assert_eq!(
            KeyError::DecryptionUnsupported.error_code(),
            "decryption_unsupported"
        );
    }

    #[test]
    fn error_response_serde() {
        let resp = ErrorResponse::from(&KeyError::MalformedKey);
        let json = serde_json::to_string(&resp).unwrap();
        let back: ErrorResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, "malformed_key");
        assert_eq!(back.message, "malformed api key");
    }
}
