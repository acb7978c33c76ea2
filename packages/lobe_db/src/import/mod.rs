//! Import of export bundles produced by another installation.
//!
//! Every entity in a bundle carries the id it had on the exporting side (its
//! client id). Rows are stored under fresh server ids, the client id is kept
//! in `client_id`, and references between entities are rewritten through
//! client-id → server-id maps. A client id already present for the user is a
//! skip, so importing the same bundle twice is harmless.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::ImportConfig;
use crate::models::{new_id, now_millis};
use crate::repository::UserScope;
use crate::repository::chat::new_slug;

mod tables;

pub use tables::{ConflictStrategy, ImportFailure, TableExport, TableImportOutcome};

/// SQLite's bound-parameter limit is 32766; a message row binds 13.
const MAX_MESSAGE_BATCH: usize = 2_000;

/// Rows per parent-patch statement (3 parameters each).
const PARENT_PATCH_CHUNK: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    #[error("unsupported bundle version {found} (this build supports up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("invalid import bundle: {0}")]
    InvalidBundle(String),
}

impl ImportError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::UnsupportedVersion { .. } => "unsupported_version",
            Self::InvalidBundle(_) => "invalid_bundle",
        }
    }
}

// =============================================================================
// Bundle format
// =============================================================================

/// Epoch milliseconds, or a date string (RFC 3339 or `YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl Timestamp {
    pub fn to_millis(&self) -> Option<i64> {
        match self {
            Self::Millis(ms) => Some(*ms),
            Self::Fractional(ms) if ms.is_finite() => Some(*ms as i64),
            Self::Fractional(_) => None,
            Self::Text(text) => parse_timestamp_text(text),
        }
    }
}

fn parse_timestamp_text(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis());
    }
    text.parse::<i64>().ok()
}

fn resolve_time(ts: &Option<Timestamp>, fallback: i64, entity: &str, client_id: &str) -> i64 {
    match ts {
        None => fallback,
        Some(ts) => ts.to_millis().unwrap_or_else(|| {
            warn!(entity, client_id, "unparseable timestamp {:?}, using import time", ts);
            fallback
        }),
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBundle {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_groups: Option<Vec<ImportSessionGroup>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<ImportSession>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<ImportTopic>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ImportMessage>>,
}

impl ImportBundle {
    pub fn from_json(raw: &str) -> Result<Self, ImportError> {
        serde_json::from_str(raw).map_err(|e| ImportError::InvalidBundle(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSessionGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sort: Option<i64>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSession {
    pub id: String,
    #[serde(rename = "type", default)]
    pub session_type: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
    /// Agent configuration (model, params, systemRole, plugins, ...).
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub meta: ImportSessionMeta,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSessionMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub background_color: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTopic {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub favorite: Option<bool>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMessage {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub favorite: Option<bool>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub plugin: Option<ImportPlugin>,
    #[serde(default)]
    pub plugin_state: Option<Value>,
    #[serde(rename = "tool_call_id", default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub extra: Option<ImportMessageExtra>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPlugin {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub api_name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(rename = "type", default)]
    pub plugin_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMessageExtra {
    #[serde(default)]
    pub from_model: Option<String>,
    #[serde(default)]
    pub from_provider: Option<String>,
    #[serde(default)]
    pub translate: Option<ImportTranslate>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImportTranslate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

// =============================================================================
// Results
// =============================================================================

/// Per-entity counters.
///
/// A bundle import aborts on the first failure, so its `errors` and `updated`
/// stay zero. A table import counts rows the database rejected in `errors`
/// and rows rewritten by a conflict strategy in `updated`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub added: u64,
    pub errors: u64,
    pub skips: u64,
    #[serde(default)]
    pub updated: u64,
}

impl ImportResult {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Counters for each entity type present in the bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_groups: Option<ImportResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<ImportResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<ImportResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<ImportResult>,
}

impl ImportResults {
    fn each(&self) -> impl Iterator<Item = &ImportResult> {
        [
            &self.session_groups,
            &self.sessions,
            &self.topics,
            &self.messages,
        ]
        .into_iter()
        .flatten()
    }

    pub fn total_added(&self) -> u64 {
        self.each().map(|r| r.added).sum()
    }

    pub fn total_skips(&self) -> u64 {
        self.each().map(|r| r.skips).sum()
    }
}

// =============================================================================
// Importer
// =============================================================================

pub struct DataImporter {
    pool: SqlitePool,
    user_id: String,
    config: ImportConfig,
}

/// Client id → server id, for one entity type.
type IdMap = HashMap<String, String>;

impl DataImporter {
    pub fn new(scope: UserScope, config: ImportConfig) -> Self {
        Self {
            pool: scope.pool,
            user_id: scope.user_id,
            config,
        }
    }

    /// Read a bundle from a JSON file and import it.
    pub async fn import_file(&self, path: &Path) -> Result<ImportResults> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read import bundle: {:?}", path))?;
        let bundle = ImportBundle::from_json(&raw)?;
        self.import_data(&bundle).await
    }

    /// Import a bundle inside a single transaction.
    pub async fn import_data(&self, bundle: &ImportBundle) -> Result<ImportResults> {
        if bundle.version > self.config.supported_version {
            return Err(ImportError::UnsupportedVersion {
                found: bundle.version,
                supported: self.config.supported_version,
            }
            .into());
        }

        info!(
            "📥 Importing bundle v{} for user {}",
            bundle.version, self.user_id
        );

        let mut results = ImportResults::default();
        let mut tx = self.pool.begin().await?;

        let mut group_map = IdMap::new();
        if let Some(groups) = &bundle.session_groups {
            results.session_groups =
                Some(self.import_session_groups(&mut tx, groups, &mut group_map).await?);
        }

        let mut session_map = IdMap::new();
        if let Some(sessions) = &bundle.sessions {
            results.sessions = Some(
                self.import_sessions(&mut tx, sessions, &group_map, &mut session_map)
                    .await?,
            );
        }

        let mut topic_map = IdMap::new();
        if let Some(topics) = &bundle.topics {
            results.topics = Some(
                self.import_topics(&mut tx, topics, &session_map, &mut topic_map)
                    .await?,
            );
        }

        if let Some(messages) = &bundle.messages {
            results.messages = Some(
                self.import_messages(&mut tx, messages, &session_map, &topic_map)
                    .await?,
            );
        }

        tx.commit().await.context("Failed to commit import")?;

        info!(
            "✅ Import complete: {} added, {} skipped",
            results.total_added(),
            results.total_skips()
        );

        Ok(results)
    }

    async fn existing_id(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        client_id: &str,
    ) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(&format!(
            "SELECT id FROM {table} WHERE client_id = ? AND user_id = ?"
        ))
        .bind(client_id)
        .bind(&self.user_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn import_session_groups(
        &self,
        conn: &mut SqliteConnection,
        groups: &[ImportSessionGroup],
        group_map: &mut IdMap,
    ) -> Result<ImportResult> {
        let mut result = ImportResult::default();
        let now = now_millis();

        for group in groups {
            if group_map.contains_key(&group.id) {
                result.skips += 1;
                continue;
            }
            if let Some(id) = self.existing_id(conn, "session_groups", &group.id).await? {
                group_map.insert(group.id.clone(), id);
                result.skips += 1;
                continue;
            }

            let id = new_id("sg");
            sqlx::query(
                r#"
                INSERT INTO session_groups (id, name, sort, client_id, user_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&group.name)
            .bind(group.sort)
            .bind(&group.id)
            .bind(&self.user_id)
            .bind(resolve_time(&group.created_at, now, "session_group", &group.id))
            .bind(resolve_time(&group.updated_at, now, "session_group", &group.id))
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to import session group {}", group.id))?;

            group_map.insert(group.id.clone(), id);
            result.added += 1;
        }

        debug!(?result, "imported session groups");
        Ok(result)
    }

    async fn import_sessions(
        &self,
        conn: &mut SqliteConnection,
        sessions: &[ImportSession],
        group_map: &IdMap,
        session_map: &mut IdMap,
    ) -> Result<ImportResult> {
        let mut result = ImportResult::default();
        let now = now_millis();

        for session in sessions {
            if session_map.contains_key(&session.id) {
                result.skips += 1;
                continue;
            }
            if let Some(id) = self.existing_id(conn, "sessions", &session.id).await? {
                session_map.insert(session.id.clone(), id);
                result.skips += 1;
                continue;
            }

            let group_id = session.group.as_ref().and_then(|g| group_map.get(g));
            if session.group.is_some() && group_id.is_none() {
                debug!(session = %session.id, group = ?session.group, "session group not found, leaving ungrouped");
            }

            let created_at = resolve_time(&session.created_at, now, "session", &session.id);
            let updated_at = resolve_time(&session.updated_at, now, "session", &session.id);
            let id = new_id("ssn");
            let meta = &session.meta;

            sqlx::query(
                r#"
                INSERT INTO sessions (id, slug, title, description, avatar, background_color, type,
                                      group_id, pinned, client_id, user_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(new_slug())
            .bind(&meta.title)
            .bind(&meta.description)
            .bind(&meta.avatar)
            .bind(&meta.background_color)
            .bind(session.session_type.as_deref().unwrap_or("agent"))
            .bind(group_id)
            .bind(session.pinned.unwrap_or(false))
            .bind(&session.id)
            .bind(&self.user_id)
            .bind(created_at)
            .bind(updated_at)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to import session {}", session.id))?;

            let agent_id = self
                .insert_agent(conn, session, created_at, updated_at)
                .await?;

            sqlx::query(
                "INSERT INTO agents_to_sessions (agent_id, session_id, user_id) VALUES (?, ?, ?)",
            )
            .bind(&agent_id)
            .bind(&id)
            .bind(&self.user_id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to link agent for session {}", session.id))?;

            session_map.insert(session.id.clone(), id);
            result.added += 1;
        }

        debug!(?result, "imported sessions");
        Ok(result)
    }

    /// Materialize the agent described by a session's `config` and `meta`.
    async fn insert_agent(
        &self,
        conn: &mut SqliteConnection,
        session: &ImportSession,
        created_at: i64,
        updated_at: i64,
    ) -> Result<String> {
        let config = &session.config;
        let meta = &session.meta;
        let text = |key: &str| config.get(key).and_then(Value::as_str).map(str::to_string);
        let json = |key: &str| config.get(key).filter(|v| !v.is_null()).map(Value::to_string);
        let json_or = |key: &str, fallback: &str| json(key).unwrap_or_else(|| fallback.to_string());
        let tags = serde_json::to_string(meta.tags.as_deref().unwrap_or(&[]))
            .context("Failed to encode agent tags")?;

        let id = new_id("agt");
        sqlx::query(
            r#"
            INSERT INTO agents (id, title, description, tags, avatar, background_color, plugins,
                                chat_config, params, model, provider, system_role, tts,
                                opening_message, opening_questions, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&meta.title)
        .bind(&meta.description)
        .bind(tags)
        .bind(&meta.avatar)
        .bind(&meta.background_color)
        .bind(json_or("plugins", "[]"))
        .bind(json("chatConfig"))
        .bind(json_or("params", "{}"))
        .bind(text("model"))
        .bind(text("provider"))
        .bind(text("systemRole"))
        .bind(json("tts"))
        .bind(text("openingMessage"))
        .bind(json_or("openingQuestions", "[]"))
        .bind(&self.user_id)
        .bind(created_at)
        .bind(updated_at)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to create agent for session {}", session.id))?;

        Ok(id)
    }

    async fn import_topics(
        &self,
        conn: &mut SqliteConnection,
        topics: &[ImportTopic],
        session_map: &IdMap,
        topic_map: &mut IdMap,
    ) -> Result<ImportResult> {
        let mut result = ImportResult::default();
        let now = now_millis();

        for topic in topics {
            if topic_map.contains_key(&topic.id) {
                result.skips += 1;
                continue;
            }
            if let Some(id) = self.existing_id(conn, "topics", &topic.id).await? {
                topic_map.insert(topic.id.clone(), id);
                result.skips += 1;
                continue;
            }

            // the exporter's pseudo-session ("inbox") has no row, so it maps to NULL
            let session_id = topic
                .session_id
                .as_ref()
                .and_then(|s| session_map.get(s));

            let id = new_id("tpc");
            sqlx::query(
                r#"
                INSERT INTO topics (id, title, favorite, session_id, client_id, user_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&topic.title)
            .bind(topic.favorite.unwrap_or(false))
            .bind(session_id)
            .bind(&topic.id)
            .bind(&self.user_id)
            .bind(resolve_time(&topic.created_at, now, "topic", &topic.id))
            .bind(resolve_time(&topic.updated_at, now, "topic", &topic.id))
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to import topic {}", topic.id))?;

            topic_map.insert(topic.id.clone(), id);
            result.added += 1;
        }

        debug!(?result, "imported topics");
        Ok(result)
    }

    async fn import_messages(
        &self,
        conn: &mut SqliteConnection,
        messages: &[ImportMessage],
        session_map: &IdMap,
        topic_map: &IdMap,
    ) -> Result<ImportResult> {
        let mut result = ImportResult::default();
        let now = now_millis();
        let batch_size = self.config.batch_size.clamp(1, MAX_MESSAGE_BATCH);

        // client ids already stored for this user
        let mut message_map = IdMap::new();
        for chunk in messages.chunks(batch_size) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let query = format!(
                "SELECT client_id, id FROM messages WHERE user_id = ? AND client_id IN ({placeholders})"
            );
            let mut q = sqlx::query_as::<_, (String, String)>(&query).bind(&self.user_id);
            for msg in chunk {
                q = q.bind(&msg.id);
            }
            message_map.extend(q.fetch_all(&mut *conn).await?);
        }

        let mut fresh: Vec<(&ImportMessage, String)> = Vec::new();
        for msg in messages {
            if message_map.contains_key(&msg.id) {
                result.skips += 1;
                continue;
            }
            let id = new_id("msg");
            message_map.insert(msg.id.clone(), id.clone());
            fresh.push((msg, id));
        }

        for chunk in fresh.chunks(batch_size) {
            let rows = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let query = format!(
                "INSERT INTO messages (id, role, content, model, provider, favorite, error, \
                 session_id, topic_id, client_id, user_id, created_at, updated_at) VALUES {rows}"
            );
            let mut q = sqlx::query(&query);
            for (msg, id) in chunk {
                let extra = msg.extra.as_ref();
                q = q
                    .bind(id)
                    .bind(&msg.role)
                    .bind(&msg.content)
                    .bind(extra.and_then(|e| e.from_model.as_deref()))
                    .bind(extra.and_then(|e| e.from_provider.as_deref()))
                    .bind(msg.favorite.unwrap_or(false))
                    .bind(msg.error.as_ref().map(Value::to_string))
                    .bind(msg.session_id.as_ref().and_then(|s| session_map.get(s)))
                    .bind(msg.topic_id.as_ref().and_then(|t| topic_map.get(t)))
                    .bind(&msg.id)
                    .bind(&self.user_id)
                    .bind(resolve_time(&msg.created_at, now, "message", &msg.id))
                    .bind(resolve_time(&msg.updated_at, now, "message", &msg.id));
            }
            q.execute(&mut *conn)
                .await
                .context("Failed to insert message batch")?;
            result.added += chunk.len() as u64;
        }

        // Parents can appear after their children in the bundle, or may have
        // been imported earlier, so links are patched once every row exists.
        let parent_links: Vec<(String, String)> = fresh
            .iter()
            .filter_map(|(msg, _)| {
                let parent = msg.parent_id.as_ref()?;
                match message_map.get(parent) {
                    Some(server_id) => Some((msg.id.clone(), server_id.clone())),
                    None => {
                        warn!(message = %msg.id, parent = %parent, "parent message not found, dropping link");
                        None
                    }
                }
            })
            .collect();

        for chunk in parent_links.chunks(PARENT_PATCH_CHUNK) {
            let cases = vec!["WHEN ? THEN ?"; chunk.len()].join(" ");
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let query = format!(
                "UPDATE messages SET parent_id = CASE client_id {cases} END \
                 WHERE user_id = ? AND client_id IN ({placeholders})"
            );
            let mut q = sqlx::query(&query);
            for (client_id, parent_id) in chunk {
                q = q.bind(client_id).bind(parent_id);
            }
            q = q.bind(&self.user_id);
            for (client_id, _) in chunk {
                q = q.bind(client_id);
            }
            q.execute(&mut *conn)
                .await
                .context("Failed to link parent messages")?;
        }

        for (msg, id) in &fresh {
            if let Some(plugin) = &msg.plugin {
                sqlx::query(
                    r#"
                    INSERT INTO message_plugins (id, tool_call_id, type, api_name, arguments,
                                                 identifier, state, client_id, user_id)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(&msg.tool_call_id)
                .bind(plugin.plugin_type.as_deref().unwrap_or("default"))
                .bind(&plugin.api_name)
                .bind(&plugin.arguments)
                .bind(&plugin.identifier)
                .bind(msg.plugin_state.as_ref().map(Value::to_string))
                .bind(&msg.id)
                .bind(&self.user_id)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("Failed to import plugin for message {}", msg.id))?;
            }

            if let Some(translate) = msg.extra.as_ref().and_then(|e| e.translate.as_ref()) {
                sqlx::query(
                    r#"
                    INSERT INTO message_translates (id, content, from_lang, to_lang, client_id, user_id)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(&translate.content)
                .bind(&translate.from)
                .bind(&translate.to)
                .bind(&msg.id)
                .bind(&self.user_id)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("Failed to import translation for message {}", msg.id))?;
            }
        }

        debug!(?result, "imported messages");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_helpers;
    use serde_json::json;

    fn importer(scope: &UserScope) -> DataImporter {
        DataImporter::new(scope.clone(), ImportConfig::default())
    }

    fn sample_bundle() -> ImportBundle {
        serde_json::from_value(json!({
            "version": 1,
            "sessionGroups": [
                { "id": "group-1", "name": "Work", "sort": 0, "createdAt": 1_700_000_000_000_i64 }
            ],
            "sessions": [
                {
                    "id": "session-1",
                    "type": "agent",
                    "group": "group-1",
                    "pinned": true,
                    "config": {
                        "model": "gpt-4o",
                        "provider": "openai",
                        "params": { "temperature": 0.6 },
                        "systemRole": "You are helpful",
                        "plugins": ["search"],
                        "openingQuestions": ["Hi?"],
                        "tts": { "voice": "alloy" }
                    },
                    "meta": { "title": "Helper", "tags": ["a", "b"], "avatar": "🤖" },
                    "createdAt": "2024-01-02T03:04:05.000Z"
                },
                {
                    "id": "session-2",
                    "group": "default",
                    "config": {},
                    "meta": { "title": "Loose" }
                }
            ],
            "topics": [
                { "id": "topic-1", "title": "Chat", "sessionId": "session-1", "favorite": true },
                { "id": "topic-inbox", "title": "Inbox chat", "sessionId": "inbox" }
            ],
            "messages": [
                {
                    "id": "msg-2",
                    "role": "assistant",
                    "content": "Hello!",
                    "sessionId": "session-1",
                    "topicId": "topic-1",
                    "parentId": "msg-1",
                    "extra": {
                        "fromModel": "gpt-4o",
                        "fromProvider": "openai",
                        "translate": { "content": "Bonjour!", "from": "en", "to": "fr" }
                    },
                    "createdAt": 1_700_000_000_200_i64
                },
                {
                    "id": "msg-1",
                    "role": "user",
                    "content": "Hi",
                    "sessionId": "session-1",
                    "topicId": "topic-1",
                    "createdAt": 1_700_000_000_100_i64
                },
                {
                    "id": "msg-3",
                    "role": "tool",
                    "content": "{}",
                    "sessionId": "inbox",
                    "topicId": "topic-inbox",
                    "parentId": "msg-2",
                    "tool_call_id": "call_1",
                    "plugin": {
                        "identifier": "search",
                        "apiName": "query",
                        "arguments": "{\"q\":\"rust\"}",
                        "type": "default"
                    },
                    "pluginState": { "done": true },
                    "createdAt": "2024-01-01"
                }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn imports_everything_and_remaps_ids() {
        let scope = test_helpers::test_scope().await;
        let results = importer(&scope).import_data(&sample_bundle()).await.unwrap();

        assert_eq!(results.session_groups, Some(ImportResult { added: 1, errors: 0, skips: 0, updated: 0 }));
        assert_eq!(results.sessions, Some(ImportResult { added: 2, errors: 0, skips: 0, updated: 0 }));
        assert_eq!(results.topics, Some(ImportResult { added: 2, errors: 0, skips: 0, updated: 0 }));
        assert_eq!(results.messages, Some(ImportResult { added: 3, errors: 0, skips: 0, updated: 0 }));

        let chat = scope.chat();
        let groups = chat.list_session_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_ne!(groups[0].id, "group-1");
        assert_eq!(groups[0].client_id.as_deref(), Some("group-1"));

        let s1 = chat.find_session_by_client_id("session-1").await.unwrap().unwrap();
        assert_eq!(s1.group_id.as_deref(), Some(groups[0].id.as_str()));
        assert!(s1.pinned);
        assert_eq!(s1.title.as_deref(), Some("Helper"));
        assert_eq!(s1.created_at, 1_704_164_645_000);

        // unknown group maps to NULL
        let s2 = chat.find_session_by_client_id("session-2").await.unwrap().unwrap();
        assert!(s2.group_id.is_none());

        let t1 = chat.find_topic_by_client_id("topic-1").await.unwrap().unwrap();
        assert_eq!(t1.session_id.as_deref(), Some(s1.id.as_str()));
        assert!(t1.favorite);
        let inbox = chat.find_topic_by_client_id("topic-inbox").await.unwrap().unwrap();
        assert!(inbox.session_id.is_none());

        let m1 = chat.find_message_by_client_id("msg-1").await.unwrap().unwrap();
        let m2 = chat.find_message_by_client_id("msg-2").await.unwrap().unwrap();
        let m3 = chat.find_message_by_client_id("msg-3").await.unwrap().unwrap();
        assert_eq!(m2.parent_id.as_deref(), Some(m1.id.as_str()));
        assert_eq!(m3.parent_id.as_deref(), Some(m2.id.as_str()));
        assert!(m1.parent_id.is_none());
        assert_eq!(m2.topic_id.as_deref(), Some(t1.id.as_str()));
        assert_eq!(m2.model.as_deref(), Some("gpt-4o"));
        assert_eq!(m2.provider.as_deref(), Some("openai"));
        assert!(m3.session_id.is_none());
        assert_eq!(m3.created_at, 1_704_067_200_000);
    }

    #[tokio::test]
    async fn creates_agents_and_links() {
        let scope = test_helpers::test_scope().await;
        importer(&scope).import_data(&sample_bundle()).await.unwrap();

        let chat = scope.chat();
        let s1 = chat.find_session_by_client_id("session-1").await.unwrap().unwrap();
        let agents = chat.get_session_agents(&s1.id).await.unwrap();
        assert_eq!(agents.len(), 1);
        let agent = &agents[0];
        assert_eq!(agent.model.as_deref(), Some("gpt-4o"));
        assert_eq!(agent.provider.as_deref(), Some("openai"));
        assert_eq!(agent.system_role.as_deref(), Some("You are helpful"));
        assert_eq!(agent.title.as_deref(), Some("Helper"));
        assert_eq!(agent.tags, json!(["a", "b"]));
        assert_eq!(agent.plugins, json!(["search"]));
        assert_eq!(agent.params, json!({ "temperature": 0.6 }));
        assert_eq!(agent.opening_questions, json!(["Hi?"]));
        assert_eq!(agent.tts, Some(json!({ "voice": "alloy" })));
        assert_eq!(chat.count_agents().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn imports_plugins_and_translations() {
        let scope = test_helpers::test_scope().await;
        importer(&scope).import_data(&sample_bundle()).await.unwrap();

        let chat = scope.chat();
        let m2 = chat.find_message_by_client_id("msg-2").await.unwrap().unwrap();
        let m3 = chat.find_message_by_client_id("msg-3").await.unwrap().unwrap();

        let translate = chat.get_message_translate(&m2.id).await.unwrap().unwrap();
        assert_eq!(translate.content.as_deref(), Some("Bonjour!"));
        assert_eq!(translate.from.as_deref(), Some("en"));
        assert_eq!(translate.to.as_deref(), Some("fr"));
        assert!(chat.get_message_plugin(&m2.id).await.unwrap().is_none());

        let plugin = chat.get_message_plugin(&m3.id).await.unwrap().unwrap();
        assert_eq!(plugin.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(plugin.identifier.as_deref(), Some("search"));
        assert_eq!(plugin.api_name.as_deref(), Some("query"));
        assert_eq!(plugin.state, Some(json!({ "done": true })));
    }

    #[tokio::test]
    async fn reimport_is_all_skips() {
        let scope = test_helpers::test_scope().await;
        let bundle = sample_bundle();
        importer(&scope).import_data(&bundle).await.unwrap();
        let second = importer(&scope).import_data(&bundle).await.unwrap();

        assert_eq!(second.session_groups, Some(ImportResult { added: 0, errors: 0, skips: 1, updated: 0 }));
        assert_eq!(second.sessions, Some(ImportResult { added: 0, errors: 0, skips: 2, updated: 0 }));
        assert_eq!(second.topics, Some(ImportResult { added: 0, errors: 0, skips: 2, updated: 0 }));
        assert_eq!(second.messages, Some(ImportResult { added: 0, errors: 0, skips: 3, updated: 0 }));
        assert_eq!(second.total_added(), 0);
        assert_eq!(second.total_skips(), 8);

        // no duplicate agents or links
        assert_eq!(scope.chat().count_agents().await.unwrap(), 2);
        assert_eq!(scope.chat().count_messages().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn new_messages_link_to_previously_imported_parents() {
        let scope = test_helpers::test_scope().await;
        importer(&scope).import_data(&sample_bundle()).await.unwrap();

        let follow_up: ImportBundle = serde_json::from_value(json!({
            "version": 1,
            "topics": [{ "id": "topic-1", "title": "Chat" }],
            "messages": [
                { "id": "msg-4", "role": "user", "content": "more", "topicId": "topic-1", "parentId": "msg-2" }
            ]
        }))
        .unwrap();
        let results = importer(&scope).import_data(&follow_up).await.unwrap();
        assert_eq!(results.topics, Some(ImportResult { added: 0, errors: 0, skips: 1, updated: 0 }));
        assert_eq!(results.messages, Some(ImportResult { added: 1, errors: 0, skips: 0, updated: 0 }));
        assert!(results.sessions.is_none());

        let chat = scope.chat();
        let m2 = chat.find_message_by_client_id("msg-2").await.unwrap().unwrap();
        let m4 = chat.find_message_by_client_id("msg-4").await.unwrap().unwrap();
        assert_eq!(m4.parent_id.as_deref(), Some(m2.id.as_str()));
        assert_eq!(m4.topic_id, m2.topic_id);
    }

    #[tokio::test]
    async fn same_client_ids_are_independent_per_user() {
        let pool = test_helpers::test_pool().await;
        let alice = test_helpers::user_scope(&pool, "alice").await;
        let bob = test_helpers::user_scope(&pool, "bob").await;

        importer(&alice).import_data(&sample_bundle()).await.unwrap();
        let results = importer(&bob).import_data(&sample_bundle()).await.unwrap();
        assert_eq!(results.messages, Some(ImportResult { added: 3, errors: 0, skips: 0, updated: 0 }));

        let a = alice.chat().find_message_by_client_id("msg-1").await.unwrap().unwrap();
        let b = bob.chat().find_message_by_client_id("msg-1").await.unwrap().unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn rejects_newer_version_before_writing() {
        let scope = test_helpers::test_scope().await;
        let mut bundle = sample_bundle();
        bundle.version = 99;

        let err = DataImporter::new(
            scope.clone(),
            ImportConfig {
                batch_size: 100,
                supported_version: 7,
            },
        )
        .import_data(&bundle)
        .await
        .unwrap_err();

        assert_eq!(
            err.downcast_ref::<ImportError>(),
            Some(&ImportError::UnsupportedVersion {
                found: 99,
                supported: 7
            })
        );
        assert_eq!(scope.chat().count_messages().await.unwrap(), 0);
        assert!(scope.chat().list_session_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn small_batches_import_everything() {
        let scope = test_helpers::test_scope().await;
        let messages: Vec<_> = (0..25)
            .map(|i| {
                json!({
                    "id": format!("m{i}"),
                    "role": if i % 2 == 0 { "user" } else { "assistant" },
                    "content": format!("message {i}"),
                    "topicId": "t",
                    "parentId": if i > 0 { Some(format!("m{}", i - 1)) } else { None },
                    "createdAt": 1_700_000_000_000_i64 + i,
                })
            })
            .collect();
        let bundle: ImportBundle = serde_json::from_value(json!({
            "version": 1,
            "topics": [{ "id": "t", "title": "long" }],
            "messages": messages,
        }))
        .unwrap();

        let importer = DataImporter::new(
            scope.clone(),
            ImportConfig {
                batch_size: 4,
                supported_version: 7,
            },
        );
        let results = importer.import_data(&bundle).await.unwrap();
        assert_eq!(results.messages, Some(ImportResult { added: 25, errors: 0, skips: 0, updated: 0 }));

        let chat = scope.chat();
        let topic = chat.find_topic_by_client_id("t").await.unwrap().unwrap();
        let listed = chat.list_messages(&topic.id).await.unwrap();
        assert_eq!(listed.len(), 25);
        for pair in listed.windows(2) {
            assert_eq!(pair[1].parent_id.as_deref(), Some(pair[0].id.as_str()));
        }
    }

    #[tokio::test]
    async fn failure_rolls_back_whole_import() {
        let scope = test_helpers::test_scope().await;
        // message inserts fail after groups, sessions and topics are written
        sqlx::query("CREATE TRIGGER fail_messages BEFORE INSERT ON messages BEGIN SELECT RAISE(ABORT, 'boom'); END")
            .execute(&scope.pool)
            .await
            .unwrap();

        let err = importer(&scope).import_data(&sample_bundle()).await;
        assert!(err.is_err());

        let chat = scope.chat();
        assert!(chat.list_session_groups().await.unwrap().is_empty());
        assert!(chat.list_sessions().await.unwrap().is_empty());
        assert!(chat.list_topics().await.unwrap().is_empty());
        assert_eq!(chat.count_agents().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn import_file_reads_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("export.json");
        std::fs::write(&path, serde_json::to_string(&sample_bundle()).unwrap()).unwrap();

        let scope = test_helpers::test_scope().await;
        let results = importer(&scope).import_file(&path).await.unwrap();
        assert_eq!(results.total_added(), 8);

        std::fs::write(&path, "{ not json").unwrap();
        let err = importer(&scope).import_file(&path).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImportError>(),
            Some(ImportError::InvalidBundle(_))
        ));
    }

    #[test]
    fn timestamps_parse_all_forms() {
        assert_eq!(Timestamp::Millis(5).to_millis(), Some(5));
        assert_eq!(Timestamp::Fractional(5.9).to_millis(), Some(5));
        assert_eq!(
            Timestamp::Text("2024-01-01".into()).to_millis(),
            Some(1_704_067_200_000)
        );
        assert_eq!(
            Timestamp::Text("2024-01-01T00:00:01Z".into()).to_millis(),
            Some(1_704_067_201_000)
        );
        assert_eq!(
            Timestamp::Text("2024-01-01T00:00:01.5".into()).to_millis(),
            Some(1_704_067_201_500)
        );
        assert_eq!(Timestamp::Text("1700000000000".into()).to_millis(), Some(1_700_000_000_000));
        assert_eq!(Timestamp::Text("yesterday".into()).to_millis(), None);
    }

    #[test]
    fn results_serialize_camel_case_and_omit_absent() {
        let results = ImportResults {
            session_groups: Some(ImportResult { added: 1, errors: 0, skips: 2, updated: 0 }),
            ..Default::default()
        };
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(
            json,
            json!({ "sessionGroups": { "added": 1, "errors": 0, "skips": 2, "updated": 0 } })
        );
    }

    #[test]
    fn import_error_codes() {
        assert_eq!(
            ImportError::UnsupportedVersion { found: 2, supported: 1 }.error_code(),
            "unsupported_version"
        );
        assert_eq!(ImportError::InvalidBundle("x".into()).error_code(), "invalid_bundle");
    }
}
