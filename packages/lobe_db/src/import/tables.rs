//! Table-by-table import of a database export.
//!
//! An export maps table names (`aiProviders`, `sessions`, `messages`, ...) to
//! raw rows. Tables are imported in dependency order inside one transaction.
//! Foreign keys are rewritten through the id maps of the tables imported
//! before them, and a row that matches a stored one (same client id, or same
//! unique key) is resolved by a [`ConflictStrategy`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::{DataImporter, IdMap, ImportError, ImportResult, Timestamp};
use crate::models::{new_id, now_millis};
use crate::repository::chat::new_slug;

/// Client ids per existence lookup.
const LOOKUP_CHUNK: usize = 500;

/// What to do with an incoming row that matches a stored one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the stored row and point references at it.
    #[default]
    Skip,
    /// Incoming values replace stored ones. A collision on a generated slug
    /// gets a fresh slug and is inserted as a new row instead.
    Override,
    /// Stored values win; incoming values only fill stored NULLs.
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Override => "override",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "override" => Ok(Self::Override),
            "merge" => Ok(Self::Merge),
            other => Err(format!(
                "unknown conflict strategy '{other}' (expected skip, override or merge)"
            )),
        }
    }
}

// =============================================================================
// Export format and outcome
// =============================================================================

/// Rows per table, keyed by the exporter's camelCase table name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableExport {
    pub data: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
}

impl TableExport {
    pub fn from_json(raw: &str) -> Result<Self, ImportError> {
        serde_json::from_str(raw).map_err(|e| ImportError::InvalidBundle(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFailure {
    pub message: String,
    /// Innermost cause, e.g. the violated constraint.
    pub details: String,
}

impl ImportFailure {
    fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
            details: err.root_cause().to_string(),
        }
    }
}

/// Result of [`DataImporter::import_tables`]. On failure nothing was written
/// and `results` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableImportOutcome {
    pub success: bool,
    /// Counters for tables where anything happened.
    pub results: BTreeMap<String, ImportResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ImportFailure>,
}

impl TableImportOutcome {
    pub fn total_added(&self) -> u64 {
        self.results.values().map(|r| r.added).sum()
    }

    pub fn total_updated(&self) -> u64 {
        self.results.values().map(|r| r.updated).sum()
    }

    pub fn total_skips(&self) -> u64 {
        self.results.values().map(|r| r.skips).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.results.values().map(|r| r.errors).sum()
    }
}

// =============================================================================
// Table descriptions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Integer,
    Bool,
    Json,
    /// Optional timestamp.
    Time,
    /// Required timestamp; the import time when absent.
    Stamp,
}

struct Column {
    /// Field name in the export.
    field: &'static str,
    name: &'static str,
    kind: Kind,
}

const fn col(field: &'static str, name: &'static str, kind: Kind) -> Column {
    Column { field, name, kind }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlugRule {
    /// Suffix a slug when there is one.
    Optional,
    /// Suffix the slug, generating one when absent.
    Required,
}

struct TableSpec {
    export_name: &'static str,
    table: &'static str,
    /// Prefix for server-generated ids. `None` with `preserve_id` unset means
    /// the table has no id column.
    id_prefix: Option<&'static str>,
    preserve_id: bool,
    client_id: bool,
    /// Fixed strategy; otherwise the caller's applies.
    conflict: Option<ConflictStrategy>,
    unique: &'static [&'static str],
    /// (column, export name of the referenced table)
    relations: &'static [(&'static str, &'static str)],
    /// Columns referencing rows of the same table.
    self_refs: &'static [&'static str],
    slug: Option<SlugRule>,
    columns: &'static [Column],
}

impl TableSpec {
    fn has_id(&self) -> bool {
        self.preserve_id || self.id_prefix.is_some()
    }
}

use Kind::{Bool, Integer, Json, Stamp, Text, Time};

/// Import order: every table comes after the tables it references.
const TABLES: &[TableSpec] = &[
    TableSpec {
        export_name: "aiProviders",
        table: "ai_providers",
        id_prefix: None,
        preserve_id: true,
        client_id: false,
        conflict: Some(ConflictStrategy::Skip),
        unique: &["id"],
        relations: &[],
        self_refs: &[],
        slug: None,
        columns: &[
            col("id", "id", Text),
            col("name", "name", Text),
            col("enabled", "enabled", Bool),
            col("sort", "sort", Integer),
            col("source", "source", Text),
            col("createdAt", "created_at", Stamp),
            col("updatedAt", "updated_at", Stamp),
        ],
    },
    TableSpec {
        export_name: "aiModels",
        table: "ai_models",
        id_prefix: None,
        preserve_id: true,
        client_id: false,
        conflict: Some(ConflictStrategy::Skip),
        unique: &["id", "provider_id"],
        relations: &[("provider_id", "aiProviders")],
        self_refs: &[],
        slug: None,
        columns: &[
            col("id", "id", Text),
            col("providerId", "provider_id", Text),
            col("displayName", "display_name", Text),
            col("type", "type", Text),
            col("enabled", "enabled", Bool),
            col("sort", "sort", Integer),
            col("source", "source", Text),
            col("abilities", "abilities", Json),
            col("config", "config", Json),
            col("contextWindowTokens", "context_window_tokens", Integer),
            col("createdAt", "created_at", Stamp),
            col("updatedAt", "updated_at", Stamp),
        ],
    },
    TableSpec {
        export_name: "sessionGroups",
        table: "session_groups",
        id_prefix: Some("sg"),
        preserve_id: false,
        client_id: true,
        conflict: None,
        unique: &[],
        relations: &[],
        self_refs: &[],
        slug: None,
        columns: &[
            col("name", "name", Text),
            col("sort", "sort", Integer),
            col("createdAt", "created_at", Stamp),
            col("updatedAt", "updated_at", Stamp),
        ],
    },
    TableSpec {
        export_name: "agents",
        table: "agents",
        id_prefix: Some("agt"),
        preserve_id: false,
        client_id: true,
        conflict: None,
        unique: &["slug"],
        relations: &[],
        self_refs: &[],
        slug: Some(SlugRule::Optional),
        columns: &[
            col("slug", "slug", Text),
            col("title", "title", Text),
            col("description", "description", Text),
            col("tags", "tags", Json),
            col("avatar", "avatar", Text),
            col("backgroundColor", "background_color", Text),
            col("plugins", "plugins", Json),
            col("chatConfig", "chat_config", Json),
            col("params", "params", Json),
            col("model", "model", Text),
            col("provider", "provider", Text),
            col("systemRole", "system_role", Text),
            col("tts", "tts", Json),
            col("openingMessage", "opening_message", Text),
            col("openingQuestions", "opening_questions", Json),
            col("createdAt", "created_at", Stamp),
            col("updatedAt", "updated_at", Stamp),
        ],
    },
    TableSpec {
        export_name: "sessions",
        table: "sessions",
        id_prefix: Some("ssn"),
        preserve_id: false,
        client_id: true,
        conflict: None,
        unique: &["slug"],
        relations: &[("group_id", "sessionGroups")],
        self_refs: &[],
        slug: Some(SlugRule::Required),
        columns: &[
            col("slug", "slug", Text),
            col("title", "title", Text),
            col("description", "description", Text),
            col("avatar", "avatar", Text),
            col("backgroundColor", "background_color", Text),
            col("type", "type", Text),
            col("groupId", "group_id", Text),
            col("pinned", "pinned", Bool),
            col("createdAt", "created_at", Stamp),
            col("updatedAt", "updated_at", Stamp),
        ],
    },
    TableSpec {
        export_name: "topics",
        table: "topics",
        id_prefix: Some("tpc"),
        preserve_id: false,
        client_id: true,
        conflict: None,
        unique: &[],
        relations: &[("session_id", "sessions")],
        self_refs: &[],
        slug: None,
        columns: &[
            col("title", "title", Text),
            col("favorite", "favorite", Bool),
            col("sessionId", "session_id", Text),
            col("createdAt", "created_at", Stamp),
            col("updatedAt", "updated_at", Stamp),
        ],
    },
    TableSpec {
        export_name: "agentsToSessions",
        table: "agents_to_sessions",
        id_prefix: None,
        preserve_id: false,
        client_id: false,
        conflict: Some(ConflictStrategy::Skip),
        unique: &["agent_id", "session_id"],
        relations: &[("agent_id", "agents"), ("session_id", "sessions")],
        self_refs: &[],
        slug: None,
        columns: &[
            col("agentId", "agent_id", Text),
            col("sessionId", "session_id", Text),
        ],
    },
    TableSpec {
        export_name: "threads",
        table: "threads",
        id_prefix: Some("thd"),
        preserve_id: false,
        client_id: true,
        conflict: None,
        unique: &[],
        relations: &[("topic_id", "topics")],
        self_refs: &["parent_thread_id"],
        slug: None,
        columns: &[
            col("title", "title", Text),
            col("type", "type", Text),
            col("status", "status", Text),
            col("topicId", "topic_id", Text),
            col("sourceMessageId", "source_message_id", Text),
            col("parentThreadId", "parent_thread_id", Text),
            col("lastActiveAt", "last_active_at", Time),
            col("createdAt", "created_at", Stamp),
            col("updatedAt", "updated_at", Stamp),
        ],
    },
    TableSpec {
        export_name: "messages",
        table: "messages",
        id_prefix: Some("msg"),
        preserve_id: false,
        client_id: true,
        conflict: None,
        unique: &[],
        relations: &[
            ("session_id", "sessions"),
            ("topic_id", "topics"),
            ("agent_id", "agents"),
            ("thread_id", "threads"),
        ],
        self_refs: &["parent_id"],
        slug: None,
        columns: &[
            col("role", "role", Text),
            col("content", "content", Text),
            col("model", "model", Text),
            col("provider", "provider", Text),
            col("favorite", "favorite", Bool),
            col("error", "error", Json),
            col("metadata", "metadata", Json),
            col("sessionId", "session_id", Text),
            col("topicId", "topic_id", Text),
            col("agentId", "agent_id", Text),
            col("threadId", "thread_id", Text),
            col("parentId", "parent_id", Text),
            col("createdAt", "created_at", Stamp),
            col("updatedAt", "updated_at", Stamp),
        ],
    },
    TableSpec {
        export_name: "messagePlugins",
        table: "message_plugins",
        id_prefix: None,
        preserve_id: true,
        client_id: true,
        conflict: Some(ConflictStrategy::Skip),
        unique: &["id"],
        relations: &[("id", "messages")],
        self_refs: &[],
        slug: None,
        columns: &[
            col("id", "id", Text),
            col("toolCallId", "tool_call_id", Text),
            col("type", "type", Text),
            col("apiName", "api_name", Text),
            col("arguments", "arguments", Text),
            col("identifier", "identifier", Text),
            col("state", "state", Json),
            col("error", "error", Json),
        ],
    },
    TableSpec {
        export_name: "messageTranslates",
        table: "message_translates",
        id_prefix: None,
        preserve_id: true,
        client_id: true,
        conflict: Some(ConflictStrategy::Skip),
        unique: &["id"],
        relations: &[("id", "messages")],
        self_refs: &[],
        slug: None,
        columns: &[
            col("id", "id", Text),
            col("content", "content", Text),
            col("from", "from_lang", Text),
            col("to", "to_lang", Text),
        ],
    },
];

// =============================================================================
// Row values
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum SqlValue {
    Integer(i64),
    Text(String),
}

/// Column → value. NULLs are left out so column defaults apply.
type Record = BTreeMap<&'static str, SqlValue>;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &SqlValue) -> SqliteQuery<'q> {
    match value {
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
    }
}

/// Ids show up as strings or numbers.
fn as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_millis(value: &Value) -> Option<i64> {
    serde_json::from_value::<Timestamp>(value.clone())
        .ok()?
        .to_millis()
}

fn convert(kind: Kind, value: &Value) -> Option<SqlValue> {
    if value.is_null() {
        return None;
    }
    match kind {
        Kind::Text => Some(SqlValue::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        Kind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(SqlValue::Integer),
            Value::String(s) => s.trim().parse().ok().map(SqlValue::Integer),
            Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
            _ => None,
        },
        Kind::Bool => match value {
            Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) => Some(SqlValue::Integer(i64::from(n.as_f64() != Some(0.0)))),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(SqlValue::Integer(1)),
                "false" | "0" => Some(SqlValue::Integer(0)),
                _ => None,
            },
            _ => None,
        },
        Kind::Json => Some(SqlValue::Text(value.to_string())),
        Kind::Time | Kind::Stamp => to_millis(value).map(SqlValue::Integer),
    }
}

fn suffixed_slug(slug: &str) -> String {
    format!("{slug}-{}", new_slug())
}

/// A fresh slug derived from the exported one.
fn regenerated_slug(item: &Map<String, Value>) -> String {
    match item.get("slug").and_then(Value::as_str) {
        Some(slug) => suffixed_slug(slug),
        None => new_slug(),
    }
}

fn keeps_ids(export_name: &str) -> bool {
    TABLES
        .iter()
        .any(|spec| spec.export_name == export_name && spec.preserve_id)
}

fn remember(map: &mut IdMap, original_id: Option<&str>, client_key: Option<&str>, server_id: &str) {
    for key in [original_id, client_key].into_iter().flatten() {
        map.insert(key.to_string(), server_id.to_string());
    }
}

/// A stored row an incoming row collides with.
struct Conflict {
    /// Stored id, for tables that have one.
    id: Option<String>,
    /// Matched on a unique key rather than on the client id.
    by_key: bool,
    /// Conditions selecting the stored row.
    filter: Vec<(&'static str, SqlValue)>,
}

/// A self reference to resolve once the table's rows exist.
struct SelfRef {
    row_id: String,
    column: &'static str,
    target: String,
    fill_only: bool,
}

async fn insert_record(
    conn: &mut SqliteConnection,
    table: &str,
    record: &Record,
) -> sqlx::Result<()> {
    let columns: Vec<&str> = record.keys().copied().collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    );
    let mut query = sqlx::query(&sql);
    for value in record.values() {
        query = bind_value(query, value);
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

/// Apply `strategy` to the stored row selected by `filter`. Keys and unique
/// columns are never rewritten. Returns whether a row was touched.
async fn update_existing(
    conn: &mut SqliteConnection,
    spec: &TableSpec,
    user_id: &str,
    record: &Record,
    strategy: ConflictStrategy,
    filter: &[(&'static str, SqlValue)],
) -> sqlx::Result<bool> {
    let assignments: Vec<(&str, &SqlValue)> = record
        .iter()
        .map(|(column, value)| (*column, value))
        .filter(|(column, _)| {
            !["id", "client_id", "user_id"].contains(column)
                && !spec.unique.contains(column)
                && !filter.iter().any(|(f, _)| f == column)
        })
        .collect();
    if assignments.is_empty() {
        return Ok(false);
    }

    let set = assignments
        .iter()
        .map(|(column, _)| match strategy {
            ConflictStrategy::Merge => format!("{column} = COALESCE({column}, ?)"),
            _ => format!("{column} = ?"),
        })
        .collect::<Vec<_>>()
        .join(", ");
    let conditions = filter
        .iter()
        .map(|(column, _)| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = format!(
        "UPDATE {} SET {set} WHERE user_id = ? AND {conditions}",
        spec.table
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in &assignments {
        query = bind_value(query, value);
    }
    query = query.bind(user_id.to_string());
    for (_, value) in filter {
        query = bind_value(query, value);
    }
    Ok(query.execute(&mut *conn).await?.rows_affected() > 0)
}

// =============================================================================
// Importer
// =============================================================================

impl DataImporter {
    /// Read a table export from a JSON file and import it.
    pub async fn import_tables_file(
        &self,
        path: &Path,
        strategy: ConflictStrategy,
    ) -> Result<TableImportOutcome> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read table export: {:?}", path))?;
        let export = TableExport::from_json(&raw)?;
        Ok(self.import_tables(&export, strategy).await)
    }

    /// Import every known table of `export` in one transaction. `strategy`
    /// applies to tables without a fixed one. A failure rolls everything back
    /// and is reported in the outcome.
    pub async fn import_tables(
        &self,
        export: &TableExport,
        strategy: ConflictStrategy,
    ) -> TableImportOutcome {
        match self.run_table_import(export, strategy).await {
            Ok(results) => TableImportOutcome {
                success: true,
                results,
                error: None,
            },
            Err(err) => {
                warn!("❌ Table import failed: {:#}", err);
                TableImportOutcome {
                    success: false,
                    results: BTreeMap::new(),
                    error: Some(ImportFailure::from_error(&err)),
                }
            }
        }
    }

    async fn run_table_import(
        &self,
        export: &TableExport,
        strategy: ConflictStrategy,
    ) -> Result<BTreeMap<String, ImportResult>> {
        info!(
            "📥 Importing {} table(s) for user {} (mode {}, strategy {})",
            export.data.len(),
            self.user_id,
            export.mode.as_deref().unwrap_or("unknown"),
            strategy
        );
        for name in export.data.keys() {
            if !TABLES.iter().any(|spec| spec.export_name == name) {
                warn!(table = %name, "table cannot be imported, ignoring");
            }
        }

        let mut maps: HashMap<&'static str, IdMap> = HashMap::new();
        let mut results = BTreeMap::new();
        let mut tx = self.pool.begin().await?;

        for spec in TABLES {
            let Some(rows) = export.data.get(spec.export_name) else {
                continue;
            };
            if rows.is_empty() {
                continue;
            }
            let result = self
                .import_table(&mut tx, spec, rows, strategy, &mut maps)
                .await
                .with_context(|| format!("Failed to import table {}", spec.export_name))?;
            debug!(table = spec.export_name, rows = rows.len(), ?result, "imported table");
            if !result.is_empty() {
                results.insert(spec.export_name.to_string(), result);
            }
        }

        tx.commit().await.context("Failed to commit import")?;

        let added: u64 = results.values().map(|r: &ImportResult| r.added).sum();
        let updated: u64 = results.values().map(|r: &ImportResult| r.updated).sum();
        info!("✅ Table import complete: {} added, {} updated", added, updated);
        Ok(results)
    }

    /// Stored (client id → id) for the client ids in `rows`.
    async fn stored_client_ids(
        &self,
        conn: &mut SqliteConnection,
        spec: &TableSpec,
        rows: &[Value],
    ) -> Result<IdMap> {
        let keys: Vec<String> = rows
            .iter()
            .filter_map(|row| {
                let item = row.as_object()?;
                item.get("clientId")
                    .and_then(as_key)
                    .or_else(|| item.get("id").and_then(as_key))
            })
            .collect();

        let mut stored = IdMap::new();
        for chunk in keys.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT client_id, id FROM {} WHERE user_id = ? AND client_id IN ({placeholders})",
                spec.table
            );
            let mut query = sqlx::query_as::<_, (String, String)>(&sql).bind(&self.user_id);
            for key in chunk {
                query = query.bind(key);
            }
            stored.extend(query.fetch_all(&mut *conn).await?);
        }
        Ok(stored)
    }

    /// Build the row to store: known columns only, keys assigned, references
    /// rewritten. `None` when the row cannot be stored at all.
    fn prepare_record(
        &self,
        spec: &TableSpec,
        item: &Map<String, Value>,
        client_key: Option<&str>,
        maps: &HashMap<&'static str, IdMap>,
    ) -> Option<Record> {
        let mut record = Record::new();
        for column in spec.columns {
            let value = item.get(column.field);
            let converted = value.and_then(|v| convert(column.kind, v));
            if value.is_some_and(|v| !v.is_null()) && converted.is_none() {
                warn!(
                    table = spec.export_name,
                    field = column.field,
                    "unusable value {:?}, leaving it out",
                    value
                );
            }
            if let Some(v) = converted {
                record.insert(column.name, v);
            }
        }

        if let Some(prefix) = spec.id_prefix {
            record.insert("id", SqlValue::Text(new_id(prefix)));
        } else if spec.preserve_id && !record.contains_key("id") {
            warn!(table = spec.export_name, "row without an id, ignoring");
            return None;
        }
        if spec.client_id {
            if let Some(key) = client_key {
                record.insert("client_id", SqlValue::Text(key.to_string()));
            }
        }
        record.insert("user_id", SqlValue::Text(self.user_id.clone()));

        if let Some(rule) = spec.slug {
            let slug = match record.get("slug") {
                Some(SqlValue::Text(slug)) => Some(suffixed_slug(slug)),
                _ if rule == SlugRule::Required => Some(new_slug()),
                _ => None,
            };
            if let Some(slug) = slug {
                record.insert("slug", SqlValue::Text(slug));
            }
        }

        for &(column, source) in spec.relations {
            // references into a table that is not part of this import stay as exported
            let Some(map) = maps.get(source) else {
                continue;
            };
            let Some(SqlValue::Text(value)) = record.get(column).cloned() else {
                continue;
            };
            match map.get(&value) {
                Some(mapped) => {
                    record.insert(column, SqlValue::Text(mapped.clone()));
                }
                None if column == "id" => {
                    warn!(table = spec.export_name, source, id = %value, "owning row was not imported, ignoring");
                    return None;
                }
                // exported ids are stored as is, so the row may predate this import
                None if keeps_ids(source) => {}
                None => {
                    debug!(table = spec.export_name, column, value = %value, "reference not found, clearing it");
                    record.remove(column);
                }
            }
        }

        Some(record)
    }

    /// Find a stored row with the same unique key.
    async fn find_conflict(
        &self,
        conn: &mut SqliteConnection,
        spec: &TableSpec,
        record: &Record,
    ) -> Result<Option<Conflict>> {
        if spec.unique.is_empty() {
            return Ok(None);
        }
        let mut filter = Vec::with_capacity(spec.unique.len());
        for &column in spec.unique {
            match record.get(column) {
                Some(value) => filter.push((column, value.clone())),
                None => return Ok(None),
            }
        }

        let conditions = filter
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let key = if spec.has_id() { "id" } else { "NULL" };
        let sql = format!(
            "SELECT {key} FROM {} WHERE user_id = ? AND {conditions} LIMIT 1",
            spec.table
        );
        let mut query = sqlx::query(&sql).bind(&self.user_id);
        for (_, value) in &filter {
            query = bind_value(query, value);
        }
        let Some(row) = query.fetch_optional(&mut *conn).await? else {
            return Ok(None);
        };
        Ok(Some(Conflict {
            id: row.try_get::<Option<String>, _>(0)?,
            by_key: true,
            filter,
        }))
    }

    async fn import_table(
        &self,
        conn: &mut SqliteConnection,
        spec: &TableSpec,
        rows: &[Value],
        strategy: ConflictStrategy,
        maps: &mut HashMap<&'static str, IdMap>,
    ) -> Result<ImportResult> {
        let mut result = ImportResult::default();
        let strategy = spec.conflict.unwrap_or(strategy);
        let now = now_millis();
        maps.entry(spec.export_name).or_default();

        let stored = if spec.client_id {
            self.stored_client_ids(conn, spec, rows).await?
        } else {
            IdMap::new()
        };
        let mut seen = HashSet::new();
        let mut pending: Vec<SelfRef> = Vec::new();

        for row in rows {
            let Some(item) = row.as_object() else {
                warn!(table = spec.export_name, "row is not an object, ignoring");
                result.errors += 1;
                continue;
            };
            let original_id = item.get("id").and_then(as_key);
            let client_key = item
                .get("clientId")
                .and_then(as_key)
                .or_else(|| original_id.clone());

            if spec.client_id {
                if let Some(key) = &client_key {
                    if !seen.insert(key.clone()) {
                        debug!(table = spec.export_name, client_id = %key, "duplicate row in export");
                        result.skips += 1;
                        continue;
                    }
                }
            }

            let stored_id = client_key
                .as_ref()
                .filter(|_| spec.client_id)
                .and_then(|key| stored.get(key))
                .cloned();
            if let (Some(id), ConflictStrategy::Skip) = (&stored_id, strategy) {
                let map = maps.entry(spec.export_name).or_default();
                remember(map, original_id.as_deref(), client_key.as_deref(), id);
                result.skips += 1;
                continue;
            }

            let Some(mut record) = self.prepare_record(spec, item, client_key.as_deref(), maps)
            else {
                result.errors += 1;
                continue;
            };
            let self_refs: Vec<(&'static str, String)> = spec
                .self_refs
                .iter()
                .filter_map(|&column| match record.remove(column) {
                    Some(SqlValue::Text(target)) => Some((column, target)),
                    _ => None,
                })
                .collect();

            let conflict = match stored_id {
                Some(id) => Some(Conflict {
                    id: Some(id.clone()),
                    by_key: false,
                    filter: vec![("id", SqlValue::Text(id))],
                }),
                None => self.find_conflict(conn, spec, &record).await?,
            };

            if let Some(conflict) = conflict {
                match strategy {
                    ConflictStrategy::Skip => {
                        if let Some(id) = &conflict.id {
                            let map = maps.entry(spec.export_name).or_default();
                            remember(map, original_id.as_deref(), client_key.as_deref(), id);
                        }
                        result.skips += 1;
                        continue;
                    }
                    ConflictStrategy::Override
                        if conflict.by_key && spec.slug.is_some() && spec.unique.contains(&"slug") =>
                    {
                        record.insert("slug", SqlValue::Text(regenerated_slug(item)));
                    }
                    _ => {
                        match update_existing(
                            conn,
                            spec,
                            &self.user_id,
                            &record,
                            strategy,
                            &conflict.filter,
                        )
                        .await
                        {
                            Ok(true) => result.updated += 1,
                            Ok(false) => result.skips += 1,
                            Err(e) => {
                                warn!(table = spec.export_name, id = ?original_id, "update rejected: {}", e);
                                result.errors += 1;
                                continue;
                            }
                        }
                        if let Some(id) = &conflict.id {
                            let map = maps.entry(spec.export_name).or_default();
                            remember(map, original_id.as_deref(), client_key.as_deref(), id);
                            pending.extend(self_refs.into_iter().map(|(column, target)| SelfRef {
                                row_id: id.clone(),
                                column,
                                target,
                                fill_only: strategy == ConflictStrategy::Merge,
                            }));
                        }
                        continue;
                    }
                }
            }

            for column in spec.columns.iter().filter(|c| c.kind == Kind::Stamp) {
                record.entry(column.name).or_insert(SqlValue::Integer(now));
            }
            match insert_record(conn, spec.table, &record).await {
                Ok(()) => {
                    result.added += 1;
                    if let Some(SqlValue::Text(id)) = record.get("id") {
                        let map = maps.entry(spec.export_name).or_default();
                        remember(map, original_id.as_deref(), client_key.as_deref(), id);
                        pending.extend(self_refs.into_iter().map(|(column, target)| SelfRef {
                            row_id: id.clone(),
                            column,
                            target,
                            fill_only: false,
                        }));
                    }
                }
                Err(e) => {
                    warn!(table = spec.export_name, id = ?original_id, "row rejected: {}", e);
                    result.errors += 1;
                }
            }
        }

        self.link_self_refs(conn, spec, pending, maps).await?;
        Ok(result)
    }

    /// Point self references at their server ids. Targets may come from this
    /// import or from an earlier one.
    async fn link_self_refs(
        &self,
        conn: &mut SqliteConnection,
        spec: &TableSpec,
        pending: Vec<SelfRef>,
        maps: &HashMap<&'static str, IdMap>,
    ) -> Result<()> {
        for self_ref in pending {
            let mut target = maps
                .get(spec.export_name)
                .and_then(|map| map.get(&self_ref.target))
                .cloned();
            if target.is_none() && spec.client_id {
                target = sqlx::query_scalar::<_, String>(&format!(
                    "SELECT id FROM {} WHERE user_id = ? AND client_id = ?",
                    spec.table
                ))
                .bind(&self.user_id)
                .bind(&self_ref.target)
                .fetch_optional(&mut *conn)
                .await?;
            }
            let Some(target) = target else {
                warn!(
                    table = spec.export_name,
                    column = self_ref.column,
                    target = %self_ref.target,
                    "referenced row not found, dropping link"
                );
                continue;
            };

            let guard = if self_ref.fill_only {
                format!(" AND {} IS NULL", self_ref.column)
            } else {
                String::new()
            };
            let sql = format!(
                "UPDATE {} SET {} = ? WHERE id = ? AND user_id = ?{guard}",
                spec.table, self_ref.column
            );
            sqlx::query(&sql)
                .bind(&target)
                .bind(&self_ref.row_id)
                .bind(&self.user_id)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("Failed to link {}.{}", spec.table, self_ref.column))?;
        }
        Ok(())
    }
}
