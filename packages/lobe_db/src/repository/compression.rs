//! Compression groups: stored summaries that stand in for a run of messages.
//!
//! Membership is the nullable `messages.message_group_id`. Concurrent edits
//! to a group are last-write-wins.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use tracing::debug;

use super::UserScope;
use super::chat::{MESSAGE_COLUMNS, row_to_message};
use crate::models::{
    COMPRESSION_GROUP_TYPE, Message, MessageGroup, NewCompressionGroup, new_id, now_millis,
    parse_json,
};

/// Message ids per membership UPDATE.
const MEMBERSHIP_CHUNK: usize = 500;

/// Point `message_ids` at `group_id` (or clear it), skipping other users' rows.
async fn set_message_group(
    conn: &mut SqliteConnection,
    user_id: &str,
    group_id: Option<&str>,
    message_ids: &[String],
) -> Result<u64> {
    let mut affected = 0;
    for chunk in message_ids.chunks(MEMBERSHIP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE messages SET message_group_id = ? WHERE user_id = ? AND id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(group_id).bind(user_id);
        for id in chunk {
            query = query.bind(id);
        }
        affected += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

#[derive(Clone)]
pub struct CompressionRepository {
    pool: SqlitePool,
    user_id: String,
}

impl CompressionRepository {
    pub fn new(scope: UserScope) -> Self {
        Self {
            pool: scope.pool,
            user_id: scope.user_id,
        }
    }

    /// Create a group and attach `message_ids` to it. Ids that are unknown or
    /// belong to another user are ignored.
    pub async fn create_compression_group(&self, params: NewCompressionGroup) -> Result<String> {
        let id = new_id("mg");
        let now = now_millis();
        let metadata = params
            .metadata
            .as_ref()
            .map(Value::to_string);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO message_groups (id, topic_id, type, content, metadata, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&params.topic_id)
        .bind(COMPRESSION_GROUP_TYPE)
        .bind(&params.content)
        .bind(metadata)
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to create compression group")?;

        let marked = set_message_group(
            &mut *tx,
            &self.user_id,
            Some(id.as_str()),
            &params.message_ids,
        )
        .await
        .context("Failed to mark messages as compressed")?;

        tx.commit().await?;

        debug!(group_id = %id, marked, "created compression group");
        Ok(id)
    }

    /// Compression groups of a topic, oldest first.
    pub async fn get_compression_groups(&self, topic_id: &str) -> Result<Vec<MessageGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM message_groups
            WHERE topic_id = ? AND user_id = ? AND type = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(topic_id)
        .bind(&self.user_id)
        .bind(COMPRESSION_GROUP_TYPE)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_group).collect())
    }

    pub async fn get_latest_compression_group(
        &self,
        topic_id: &str,
    ) -> Result<Option<MessageGroup>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM message_groups
            WHERE topic_id = ? AND user_id = ? AND type = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(topic_id)
        .bind(&self.user_id)
        .bind(COMPRESSION_GROUP_TYPE)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_group))
    }

    pub async fn get_compression_group(&self, group_id: &str) -> Result<Option<MessageGroup>> {
        let row = sqlx::query("SELECT * FROM message_groups WHERE id = ? AND user_id = ?")
            .bind(group_id)
            .bind(&self.user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_group))
    }

    /// Replace the summary text and shallow-merge `metadata_patch` into the
    /// stored metadata. Returns false when the group is not visible.
    pub async fn update_compression_content(
        &self,
        group_id: &str,
        content: &str,
        metadata_patch: Option<Value>,
    ) -> Result<bool> {
        let Some(group) = self.get_compression_group(group_id).await? else {
            return Ok(false);
        };

        let merged = merge_metadata(group.metadata, metadata_patch);

        sqlx::query(
            "UPDATE message_groups SET content = ?, metadata = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(content)
        .bind(merged.as_ref().map(Value::to_string))
        .bind(now_millis())
        .bind(group_id)
        .bind(&self.user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update compression group")?;

        Ok(true)
    }

    /// Set `metadata.pinned` on a message, preserving its other metadata keys.
    pub async fn toggle_message_pin(&self, message_id: &str, pinned: bool) -> Result<bool> {
        let row = sqlx::query("SELECT metadata FROM messages WHERE id = ? AND user_id = ?")
            .bind(message_id)
            .bind(&self.user_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };

        let mut metadata = match parse_json(row.get("metadata")) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        metadata.insert("pinned".to_string(), Value::Bool(pinned));

        sqlx::query(
            "UPDATE messages SET metadata = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(Value::Object(metadata).to_string())
        .bind(now_millis())
        .bind(message_id)
        .bind(&self.user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update message pin")?;

        Ok(true)
    }

    /// Messages folded into a group, oldest first.
    pub async fn get_compressed_messages(&self, group_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_group_id = ? AND user_id = ? ORDER BY created_at, rowid"
        ))
        .bind(group_id)
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    /// Favorited members of a group; these are kept verbatim next to the summary.
    pub async fn get_pinned_messages(&self, group_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_group_id = ? AND user_id = ? AND favorite = 1 ORDER BY created_at, rowid"
        ))
        .bind(group_id)
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    /// Messages of a topic not folded into any group, oldest first.
    pub async fn get_uncompressed_messages(&self, topic_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE topic_id = ? AND user_id = ? AND message_group_id IS NULL ORDER BY created_at, rowid"
        ))
        .bind(topic_id)
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    pub async fn unmark_messages_from_compression(&self, message_ids: &[String]) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        set_message_group(&mut *conn, &self.user_id, None, message_ids)
            .await
            .context("Failed to unmark compressed messages")
    }

    /// Release the group's messages, then remove the group. Returns false when
    /// the group is not visible.
    pub async fn delete_compression_group(&self, group_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE messages SET message_group_id = NULL WHERE message_group_id = ? AND user_id = ?",
        )
        .bind(group_id)
        .bind(&self.user_id)
        .execute(&mut *tx)
        .await
        .context("Failed to release compressed messages")?;

        let deleted = sqlx::query("DELETE FROM message_groups WHERE id = ? AND user_id = ?")
            .bind(group_id)
            .bind(&self.user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete compression group")?
            .rows_affected();

        tx.commit().await?;

        debug!(group_id, deleted, "deleted compression group");
        Ok(deleted > 0)
    }
}

/// Shallow merge: keys in `patch` overwrite keys in `base`. A non-object
/// patch replaces the base outright.
fn merge_metadata(base: Option<Value>, patch: Option<Value>) -> Option<Value> {
    match (base, patch) {
        (Some(Value::Object(mut base)), Some(Value::Object(patch))) => {
            base.extend(patch);
            Some(Value::Object(base))
        }
        (base, None) => base,
        (_, Some(patch)) => Some(patch),
    }
}

fn row_to_group(r: SqliteRow) -> MessageGroup {
    MessageGroup {
        id: r.get("id"),
        topic_id: r.get("topic_id"),
        group_type: r.get("type"),
        content: r.get("content"),
        metadata: parse_json(r.get("metadata")),
        user_id: r.get("user_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
