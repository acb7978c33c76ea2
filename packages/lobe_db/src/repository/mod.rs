// Repository layer: one type per entity family, each bound to a single user.
//
// Every statement filters on `user_id`. Rows owned by someone else behave
// exactly like rows that do not exist.

use sqlx::sqlite::SqlitePool;

mod ai_infra;
mod api_keys;
pub(crate) mod chat;
mod compression;
mod generation_topics;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use ai_infra::AiInfraRepository;
pub use api_keys::{ApiKeyRepository, IssuedApiKey, KeyLookup};
pub use chat::ChatRepository;
pub use compression::CompressionRepository;
pub use generation_topics::GenerationTopicRepository;

/// Shared handle the per-entity repositories are built from.
#[derive(Clone)]
pub struct UserScope {
    pub(crate) pool: SqlitePool,
    pub(crate) user_id: String,
}

impl UserScope {
    pub fn new(pool: SqlitePool, user_id: impl Into<String>) -> Self {
        Self {
            pool,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn api_keys(&self) -> ApiKeyRepository {
        ApiKeyRepository::new(self.clone())
    }

    pub fn chat(&self) -> ChatRepository {
        ChatRepository::new(self.clone())
    }

    pub fn compression(&self) -> CompressionRepository {
        CompressionRepository::new(self.clone())
    }

    pub fn generation_topics(&self) -> GenerationTopicRepository {
        GenerationTopicRepository::new(self.clone())
    }

    pub fn ai_infra(&self) -> AiInfraRepository {
        AiInfraRepository::new(self.clone())
    }
}
