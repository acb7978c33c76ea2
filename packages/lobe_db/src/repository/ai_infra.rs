//! Per-user AI provider and model configuration.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use super::UserScope;
use crate::models::{
    AiModel, AiModelConfigUpdate, AiProvider, ModelSource, NewAiModel, now_millis, parse_json,
};

const MODEL_COLUMNS: &str = "id, provider_id, display_name, type, enabled, sort, source, \
     abilities, config, context_window_tokens";

#[derive(Clone)]
pub struct AiInfraRepository {
    pool: SqlitePool,
    user_id: String,
}

impl AiInfraRepository {
    pub fn new(scope: UserScope) -> Self {
        Self {
            pool: scope.pool,
            user_id: scope.user_id,
        }
    }

    // ── providers ───────────────────────────────────────────────────────

    pub async fn create_provider(
        &self,
        id: &str,
        name: Option<&str>,
        source: ModelSource,
    ) -> Result<AiProvider> {
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO ai_providers (id, name, enabled, source, user_id, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(source.as_str())
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create provider {id}"))?;

        self.get_provider(id)
            .await?
            .context("Provider vanished after insert")
    }

    pub async fn get_provider(&self, id: &str) -> Result<Option<AiProvider>> {
        let row = sqlx::query("SELECT * FROM ai_providers WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(&self.user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_provider))
    }

    pub async fn list_providers(&self) -> Result<Vec<AiProvider>> {
        let rows = sqlx::query(
            "SELECT * FROM ai_providers WHERE user_id = ? ORDER BY sort IS NULL, sort, id",
        )
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_provider).collect())
    }

    pub async fn toggle_provider_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO ai_providers (id, enabled, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id, user_id) DO UPDATE SET enabled = excluded.enabled, updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(enabled)
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to toggle provider")?;
        Ok(())
    }

    // ── models ──────────────────────────────────────────────────────────

    pub async fn create_model(&self, provider_id: &str, model: NewAiModel) -> Result<AiModel> {
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO ai_models (id, provider_id, display_name, type, enabled, source, abilities,
                                   config, context_window_tokens, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&model.id)
        .bind(provider_id)
        .bind(&model.display_name)
        .bind(&model.model_type)
        .bind(model.enabled)
        .bind(model.source.as_str())
        .bind(abilities_text(&model.abilities))
        .bind(model.config.as_ref().map(Value::to_string))
        .bind(model.context_window_tokens)
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create model {}/{}", provider_id, model.id))?;

        self.get_model(&model.id, provider_id)
            .await?
            .context("Model vanished after insert")
    }

    pub async fn get_model(&self, id: &str, provider_id: &str) -> Result<Option<AiModel>> {
        let row = sqlx::query(&format!(
            "SELECT {MODEL_COLUMNS} FROM ai_models WHERE id = ? AND provider_id = ? AND user_id = ?"
        ))
        .bind(id)
        .bind(provider_id)
        .bind(&self.user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_model))
    }

    /// Models of a provider in display order: explicit `sort` first, then id.
    pub async fn list_models(&self, provider_id: &str) -> Result<Vec<AiModel>> {
        let rows = sqlx::query(&format!(
            "SELECT {MODEL_COLUMNS} FROM ai_models WHERE provider_id = ? AND user_id = ? ORDER BY sort IS NULL, sort, id"
        ))
        .bind(provider_id)
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_model).collect())
    }

    /// Enable or disable a model, creating its row if it only existed as a
    /// builtin default.
    pub async fn toggle_model_enabled(
        &self,
        id: &str,
        provider_id: &str,
        enabled: bool,
    ) -> Result<()> {
        upsert_enabled(&self.pool, &self.user_id, id, provider_id, enabled).await
    }

    pub async fn batch_toggle_models(
        &self,
        provider_id: &str,
        ids: &[String],
        enabled: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            upsert_enabled(&mut *tx, &self.user_id, id, provider_id, enabled).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Insert models that do not exist yet; existing rows are left alone.
    /// Returns how many were inserted.
    pub async fn batch_update_models(
        &self,
        provider_id: &str,
        models: &[NewAiModel],
    ) -> Result<u64> {
        let now = now_millis();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;
        for model in models {
            inserted += sqlx::query(
                r#"
                INSERT OR IGNORE INTO ai_models (id, provider_id, display_name, type, enabled, source,
                                                 abilities, config, context_window_tokens, user_id,
                                                 created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&model.id)
            .bind(provider_id)
            .bind(&model.display_name)
            .bind(&model.model_type)
            .bind(model.enabled)
            .bind(model.source.as_str())
            .bind(abilities_text(&model.abilities))
            .bind(model.config.as_ref().map(Value::to_string))
            .bind(model.context_window_tokens)
            .bind(&self.user_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to batch insert models")?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Patch a model's configuration, creating the row when missing.
    pub async fn update_model_config(
        &self,
        id: &str,
        provider_id: &str,
        patch: AiModelConfigUpdate,
    ) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO ai_models (id, provider_id, display_name, abilities, config,
                                   context_window_tokens, user_id, created_at, updated_at)
            VALUES (?, ?, ?, COALESCE(?, '{}'), ?, ?, ?, ?, ?)
            ON CONFLICT (id, provider_id, user_id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, display_name),
                abilities = CASE WHEN ? IS NULL THEN abilities ELSE excluded.abilities END,
                config = COALESCE(excluded.config, config),
                context_window_tokens = COALESCE(excluded.context_window_tokens, context_window_tokens),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(provider_id)
        .bind(&patch.display_name)
        .bind(patch.abilities.as_ref().map(Value::to_string))
        .bind(patch.config.as_ref().map(Value::to_string))
        .bind(patch.context_window_tokens)
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .bind(patch.abilities.as_ref().map(Value::to_string))
        .execute(&self.pool)
        .await
        .context("Failed to update model config")?;
        Ok(())
    }

    pub async fn update_models_sort(&self, provider_id: &str, order: &[(String, i64)]) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        for (id, sort) in order {
            sqlx::query(
                r#"
                INSERT INTO ai_models (id, provider_id, sort, user_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (id, provider_id, user_id) DO UPDATE SET sort = excluded.sort, updated_at = excluded.updated_at
                "#,
            )
            .bind(id)
            .bind(provider_id)
            .bind(sort)
            .bind(&self.user_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to update model sort")?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_model(&self, id: &str, provider_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM ai_models WHERE id = ? AND provider_id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(provider_id)
        .bind(&self.user_id)
        .execute(&self.pool)
        .await
        .context("Failed to delete model")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_models_by_provider(&self, provider_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ai_models WHERE provider_id = ? AND user_id = ?")
            .bind(provider_id)
            .bind(&self.user_id)
            .execute(&self.pool)
            .await
            .context("Failed to clear provider models")?;
        Ok(result.rows_affected())
    }

    /// Drop models fetched from the provider's remote list, keeping builtin and
    /// custom entries.
    pub async fn clear_remote_models(&self, provider_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM ai_models WHERE provider_id = ? AND user_id = ? AND source = 'remote'",
        )
        .bind(provider_id)
        .bind(&self.user_id)
        .execute(&self.pool)
        .await
        .context("Failed to clear remote models")?;
        Ok(result.rows_affected())
    }
}

async fn upsert_enabled<'e, E>(
    executor: E,
    user_id: &str,
    id: &str,
    provider_id: &str,
    enabled: bool,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let now = now_millis();
    sqlx::query(
        r#"
        INSERT INTO ai_models (id, provider_id, enabled, user_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (id, provider_id, user_id) DO UPDATE SET enabled = excluded.enabled, updated_at = excluded.updated_at
        "#,
    )
    .bind(id)
    .bind(provider_id)
    .bind(enabled)
    .bind(user_id)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await
    .context("Failed to toggle model")?;
    Ok(())
}

fn abilities_text(abilities: &Option<Value>) -> String {
    abilities
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_else(|| "{}".to_string())
}

fn row_to_provider(r: SqliteRow) -> AiProvider {
    AiProvider {
        id: r.get("id"),
        name: r.get("name"),
        enabled: r.get("enabled"),
        sort: r.get("sort"),
        source: ModelSource::parse(r.get::<&str, _>("source")),
        user_id: r.get("user_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_model(r: SqliteRow) -> AiModel {
    AiModel {
        id: r.get("id"),
        provider_id: r.get("provider_id"),
        display_name: r.get("display_name"),
        model_type: r.get("type"),
        enabled: r.get("enabled"),
        sort: r.get("sort"),
        source: ModelSource::parse(r.get::<&str, _>("source")),
        abilities: parse_json(r.get("abilities")).unwrap_or_else(|| serde_json::json!({})),
        config: parse_json(r.get("config")),
        context_window_tokens: r.get("context_window_tokens"),
    }
}
