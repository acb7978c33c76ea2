//! API keys issued to a user.
//!
//! Key material can pass through an [`Encryptor`] before it is stored. Lookups
//! by key run the candidate through the same encryptor, so only deterministic
//! strategies support [`ApiKeyRepository::find_by_key`].

use anyhow::{Context, Result};
use lobe_keys::{ApiKeyValue, Decryptor, Encryptor, generate_api_key};
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use super::UserScope;
use crate::models::{ApiKey, ApiKeyUpdate, NewApiKey, now_millis};

/// Outcome of looking up a key string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLookup {
    /// Not shaped like an API key; the database was not consulted.
    Malformed,
    NotFound,
    Found(ApiKey),
}

/// A freshly created key together with its plaintext.
#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    pub record: ApiKey,
    pub plaintext: String,
}

#[derive(Clone)]
pub struct ApiKeyRepository {
    pool: SqlitePool,
    user_id: String,
}

impl ApiKeyRepository {
    pub fn new(scope: UserScope) -> Self {
        Self {
            pool: scope.pool,
            user_id: scope.user_id,
        }
    }

    /// Issue a new key. The returned row carries the stored key value, which is
    /// the encryptor's output when one is supplied.
    pub async fn create(
        &self,
        params: NewApiKey,
        encryptor: Option<&dyn Encryptor>,
    ) -> Result<ApiKey> {
        Ok(self.issue(params, encryptor).await?.record)
    }

    /// Like [`Self::create`], but also hands back the plaintext key. With a
    /// one-way encryptor this is the only time the plaintext is available.
    pub async fn issue(
        &self,
        params: NewApiKey,
        encryptor: Option<&dyn Encryptor>,
    ) -> Result<IssuedApiKey> {
        let plaintext = generate_api_key();
        let stored = match encryptor {
            Some(enc) => enc
                .encrypt(&plaintext)
                .await
                .context("Failed to encrypt api key")?,
            None => plaintext.clone(),
        };

        let now = now_millis();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO api_keys (name, key, enabled, expires_at, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&params.name)
        .bind(&stored)
        .bind(params.enabled)
        .bind(params.expires_at)
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create api key")?;

        debug!(id, name = %params.name, "created api key");

        Ok(IssuedApiKey {
            record: ApiKey {
                id,
                name: params.name,
                key: stored,
                enabled: params.enabled,
                expires_at: params.expires_at,
                last_used_at: None,
                user_id: self.user_id.clone(),
                created_at: now,
                updated_at: now,
            },
            plaintext,
        })
    }

    /// All of this user's keys, most recently updated first.
    pub async fn query(&self, decryptor: Option<&dyn Decryptor>) -> Result<Vec<ApiKey>> {
        let mut keys = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE user_id = ? ORDER BY updated_at DESC, id DESC",
        )
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;

        if let Some(dec) = decryptor {
            for key in &mut keys {
                key.key = dec
                    .decrypt(&key.key)
                    .await
                    .with_context(|| format!("Failed to decrypt api key {}", key.id))?;
            }
        }
        Ok(keys)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<ApiKey>> {
        let key =
            sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(&self.user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(key)
    }

    /// Resolve a presented key. Format is checked before any database access.
    ///
    /// Keys are globally unique, so this lookup is not limited to the scope's
    /// user: it is how a caller discovers which user a key belongs to.
    pub async fn find_by_key(
        &self,
        candidate: &str,
        encryptor: Option<&dyn Encryptor>,
    ) -> Result<KeyLookup> {
        let Ok(candidate) = ApiKeyValue::parse(candidate) else {
            return Ok(KeyLookup::Malformed);
        };

        let needle = match encryptor {
            Some(enc) => enc
                .encrypt(candidate.as_str())
                .await
                .context("Failed to encrypt api key for lookup")?,
            None => candidate.into(),
        };

        let key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE key = ?")
            .bind(&needle)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match key {
            Some(key) => KeyLookup::Found(key),
            None => KeyLookup::NotFound,
        })
    }

    /// True when the key exists, is enabled, and has not expired.
    pub async fn validate_key(
        &self,
        candidate: &str,
        encryptor: Option<&dyn Encryptor>,
    ) -> Result<bool> {
        match self.find_by_key(candidate, encryptor).await? {
            KeyLookup::Found(key) => Ok(key.is_usable_at(now_millis())),
            KeyLookup::Malformed | KeyLookup::NotFound => Ok(false),
        }
    }

    /// Apply a partial update. Returns `None` when the key does not belong to
    /// this user.
    pub async fn update(&self, id: i64, patch: ApiKeyUpdate) -> Result<Option<ApiKey>> {
        let Some(mut key) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        if let Some(name) = patch.name {
            key.name = name;
        }
        if let Some(enabled) = patch.enabled {
            key.enabled = enabled;
        }
        if let Some(expires_at) = patch.expires_at {
            key.expires_at = expires_at;
        }
        key.updated_at = now_millis().max(key.updated_at + 1);

        sqlx::query(
            r#"
            UPDATE api_keys SET name = ?, enabled = ?, expires_at = ?, updated_at = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(&key.name)
        .bind(key.enabled)
        .bind(key.expires_at)
        .bind(key.updated_at)
        .bind(id)
        .bind(&self.user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update api key")?;

        Ok(Some(key))
    }

    /// Stamp `last_used_at`, always moving it forward.
    pub async fn update_last_used(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE api_keys SET last_used_at = MAX(?, COALESCE(last_used_at, 0) + 1)
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(now_millis())
        .bind(id)
        .bind(&self.user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(&self.user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete api key")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM api_keys WHERE user_id = ?")
            .bind(&self.user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete api keys")?;
        Ok(result.rows_affected())
    }
}
