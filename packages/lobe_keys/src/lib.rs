//! API key material for lobe-db: generation, format checks, and the
//! encrypt/decrypt strategies applied before keys touch the database.

pub mod api_key;
pub mod error;
pub mod vault;

pub use api_key::{API_KEY_PREFIX, ApiKeyValue, generate_api_key, validate_api_key_format};
pub use error::{ErrorResponse, KeyError};
pub use vault::{Decryptor, DigestEncryptor, Encryptor, PassthroughVault};
