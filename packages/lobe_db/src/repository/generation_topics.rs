use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::{debug, warn};

use super::UserScope;
use crate::files::{FileUrlResolver, ObjectStorage};
use crate::models::{
    DeletedGenerationTopic, Generation, GenerationAsset, GenerationBatch, GenerationTopic,
    GenerationTopicUpdate, NewGeneration, NewGenerationBatch, new_id, now_millis, parse_json,
};

#[derive(Clone)]
pub struct GenerationTopicRepository {
    pool: SqlitePool,
    user_id: String,
}

impl GenerationTopicRepository {
    pub fn new(scope: UserScope) -> Self {
        Self {
            pool: scope.pool,
            user_id: scope.user_id,
        }
    }

    pub async fn create(&self, title: Option<&str>) -> Result<GenerationTopic> {
        let now = now_millis();
        let topic = GenerationTopic {
            id: new_id("gt"),
            title: title.map(str::to_string),
            cover_url: None,
            user_id: self.user_id.clone(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO generation_topics (id, title, user_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&topic.id)
        .bind(&topic.title)
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create generation topic")?;
        Ok(topic)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<GenerationTopic>> {
        let topic = sqlx::query_as::<_, GenerationTopic>(
            "SELECT * FROM generation_topics WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(&self.user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(topic)
    }

    /// All topics, most recently updated first, with `cover_url` resolved to a
    /// full URL.
    pub async fn query_all(&self, resolver: &dyn FileUrlResolver) -> Result<Vec<GenerationTopic>> {
        let mut topics = sqlx::query_as::<_, GenerationTopic>(
            "SELECT * FROM generation_topics WHERE user_id = ? ORDER BY updated_at DESC, rowid DESC",
        )
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;

        for topic in &mut topics {
            if let Some(key) = topic.cover_url.take() {
                topic.cover_url = Some(resolver.get_full_file_url(&key).await?);
            }
        }
        Ok(topics)
    }

    /// Returns the updated row, or `None` when the topic is not visible.
    pub async fn update(
        &self,
        id: &str,
        patch: GenerationTopicUpdate,
    ) -> Result<Option<GenerationTopic>> {
        let Some(mut topic) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        if let Some(title) = patch.title {
            topic.title = title;
        }
        if let Some(cover_url) = patch.cover_url {
            topic.cover_url = cover_url;
        }
        topic.updated_at = now_millis().max(topic.updated_at + 1);

        sqlx::query(
            "UPDATE generation_topics SET title = ?, cover_url = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(&topic.title)
        .bind(&topic.cover_url)
        .bind(topic.updated_at)
        .bind(id)
        .bind(&self.user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update generation topic")?;

        Ok(Some(topic))
    }

    /// Add a batch under a topic. `None` when the topic is not visible.
    pub async fn create_batch(
        &self,
        topic_id: &str,
        new: NewGenerationBatch,
    ) -> Result<Option<GenerationBatch>> {
        if self.find_by_id(topic_id).await?.is_none() {
            return Ok(None);
        }

        let batch = GenerationBatch {
            id: new_id("gb"),
            generation_topic_id: topic_id.to_string(),
            provider: new.provider,
            model: new.model,
            prompt: new.prompt,
            width: new.width,
            height: new.height,
            config: new.config,
            user_id: self.user_id.clone(),
            created_at: now_millis(),
            generations: Vec::new(),
        };

        sqlx::query(
            r#"
            INSERT INTO generation_batches
                (id, generation_topic_id, provider, model, prompt, width, height, config, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.generation_topic_id)
        .bind(&batch.provider)
        .bind(&batch.model)
        .bind(&batch.prompt)
        .bind(batch.width)
        .bind(batch.height)
        .bind(batch.config.as_ref().map(|c| c.to_string()))
        .bind(&self.user_id)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to create generation batch")?;

        Ok(Some(batch))
    }

    /// Add a generation under a batch. `None` when the batch is not visible.
    pub async fn create_generation(
        &self,
        batch_id: &str,
        new: NewGeneration,
    ) -> Result<Option<Generation>> {
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT id FROM generation_batches WHERE id = ? AND user_id = ?",
        )
        .bind(batch_id)
        .bind(&self.user_id)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let generation = Generation {
            id: new_id("gen"),
            generation_batch_id: batch_id.to_string(),
            async_task_id: new.async_task_id,
            file_id: new.file_id,
            seed: new.seed,
            asset: new.asset,
            user_id: self.user_id.clone(),
            created_at: now_millis(),
        };
        let asset = generation
            .asset
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize generation asset")?;

        sqlx::query(
            r#"
            INSERT INTO generations
                (id, generation_batch_id, async_task_id, file_id, seed, asset, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&generation.id)
        .bind(&generation.generation_batch_id)
        .bind(&generation.async_task_id)
        .bind(&generation.file_id)
        .bind(generation.seed)
        .bind(asset)
        .bind(&self.user_id)
        .bind(generation.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to create generation")?;

        Ok(Some(generation))
    }

    /// Batches of a topic with their generations, oldest first.
    pub async fn get_batches(&self, topic_id: &str) -> Result<Vec<GenerationBatch>> {
        let batch_rows = sqlx::query(
            r#"
            SELECT * FROM generation_batches
            WHERE generation_topic_id = ? AND user_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(topic_id)
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;

        let generation_rows = sqlx::query(
            r#"
            SELECT g.* FROM generations g
            JOIN generation_batches b ON b.id = g.generation_batch_id
            WHERE b.generation_topic_id = ? AND g.user_id = ?
            ORDER BY g.created_at, g.rowid
            "#,
        )
        .bind(topic_id)
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut batches: Vec<GenerationBatch> = batch_rows.into_iter().map(row_to_batch).collect();
        for generation in generation_rows.into_iter().map(row_to_generation) {
            if let Some(batch) = batches
                .iter_mut()
                .find(|b| b.id == generation.generation_batch_id)
            {
                batch.generations.push(generation);
            }
        }
        Ok(batches)
    }

    /// Delete a topic and everything under it.
    ///
    /// Returns the deleted row plus every stored file the topic referenced
    /// (cover image and generation thumbnails) so the caller can remove them
    /// from object storage. `None` when the topic is not visible.
    pub async fn delete(&self, id: &str) -> Result<Option<DeletedGenerationTopic>> {
        let mut tx = self.pool.begin().await?;

        let topic = sqlx::query_as::<_, GenerationTopic>(
            "SELECT * FROM generation_topics WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(&self.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(topic) = topic else {
            return Ok(None);
        };

        let assets: Vec<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT g.asset FROM generations g
            JOIN generation_batches b ON b.id = g.generation_batch_id
            WHERE b.generation_topic_id = ? AND b.user_id = ?
            ORDER BY b.created_at, b.rowid, g.created_at, g.rowid
            "#,
        )
        .bind(id)
        .bind(&self.user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut files_to_delete = Vec::new();
        if let Some(cover) = &topic.cover_url {
            files_to_delete.push(cover.clone());
        }
        files_to_delete.extend(
            assets
                .into_iter()
                .filter_map(parse_asset)
                .filter_map(|asset| asset.thumbnail_url),
        );

        sqlx::query("DELETE FROM generation_topics WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(&self.user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete generation topic")?;

        tx.commit().await?;

        debug!(topic_id = id, files = files_to_delete.len(), "deleted generation topic");

        Ok(Some(DeletedGenerationTopic {
            deleted_topic: topic,
            files_to_delete,
        }))
    }

    /// Database first, files second: delete the topic, then hand the collected
    /// keys to `storage`. Storage failures are logged and do not undo the delete.
    pub async fn delete_with_files(
        &self,
        id: &str,
        storage: &dyn ObjectStorage,
    ) -> Result<Option<DeletedGenerationTopic>> {
        let Some(deleted) = self.delete(id).await? else {
            return Ok(None);
        };
        if !deleted.files_to_delete.is_empty() {
            if let Err(e) = storage.delete_objects(&deleted.files_to_delete).await {
                warn!(topic_id = id, "failed to delete generation files: {:#}", e);
            }
        }
        Ok(Some(deleted))
    }
}

fn parse_asset(raw: Option<String>) -> Option<GenerationAsset> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_batch(r: SqliteRow) -> GenerationBatch {
    GenerationBatch {
        id: r.get("id"),
        generation_topic_id: r.get("generation_topic_id"),
        provider: r.get("provider"),
        model: r.get("model"),
        prompt: r.get("prompt"),
        width: r.get("width"),
        height: r.get("height"),
        config: parse_json(r.get("config")),
        user_id: r.get("user_id"),
        created_at: r.get("created_at"),
        generations: Vec::new(),
    }
}

fn row_to_generation(r: SqliteRow) -> Generation {
    Generation {
        id: r.get("id"),
        generation_batch_id: r.get("generation_batch_id"),
        async_task_id: r.get("async_task_id"),
        file_id: r.get("file_id"),
        seed: r.get("seed"),
        asset: parse_asset(r.get("asset")),
        user_id: r.get("user_id"),
        created_at: r.get("created_at"),
    }
}
