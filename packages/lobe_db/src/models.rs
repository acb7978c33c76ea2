use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Milliseconds since the Unix epoch; every timestamp column uses this unit.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Server-generated primary key, e.g. `msg_01890a5d...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

/// Parse a JSON TEXT column. Unparseable content reads as absent.
pub(crate) fn parse_json(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn to_json_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

// ── chat entities ───────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGroup {
    pub id: String,
    pub name: String,
    pub sort: Option<i64>,
    pub client_id: Option<String>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub slug: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub background_color: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub session_type: String,
    pub group_id: Option<String>,
    pub pinned: bool,
    pub client_id: Option<String>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Value,
    pub avatar: Option<String>,
    pub background_color: Option<String>,
    pub plugins: Value,
    pub chat_config: Option<Value>,
    pub params: Value,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub system_role: Option<String>,
    pub tts: Option<Value>,
    pub opening_message: Option<String>,
    pub opening_questions: Value,
    pub client_id: Option<String>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: String,
    pub title: Option<String>,
    pub favorite: bool,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: String,
    pub content: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub favorite: bool,
    pub error: Option<Value>,
    pub metadata: Option<Value>,
    pub session_id: Option<String>,
    pub topic_id: Option<String>,
    pub parent_id: Option<String>,
    pub message_group_id: Option<String>,
    pub client_id: Option<String>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    pub fn is_pinned(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("pinned"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Input for [`crate::repository::ChatRepository::create_message`].
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub role: String,
    pub content: Option<String>,
    pub topic_id: Option<String>,
    pub session_id: Option<String>,
    pub parent_id: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub favorite: bool,
    pub metadata: Option<Value>,
}

impl NewMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn in_topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePlugin {
    pub id: String,
    pub tool_call_id: Option<String>,
    #[serde(rename = "type")]
    pub plugin_type: Option<String>,
    pub api_name: Option<String>,
    pub arguments: Option<String>,
    pub identifier: Option<String>,
    pub state: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageTranslate {
    pub id: String,
    pub content: Option<String>,
    #[sqlx(rename = "from_lang")]
    pub from: Option<String>,
    #[sqlx(rename = "to_lang")]
    pub to: Option<String>,
}

// ── compression ─────────────────────────────────────────────────────────

pub const COMPRESSION_GROUP_TYPE: &str = "compression";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageGroup {
    pub id: String,
    pub topic_id: Option<String>,
    #[serde(rename = "type")]
    pub group_type: String,
    pub content: Option<String>,
    pub metadata: Option<Value>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCompressionGroup {
    pub topic_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub message_ids: Vec<String>,
}

// ── api keys ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub enabled: bool,
    pub expires_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApiKey {
    /// Usable right now: enabled and not past `expires_at`.
    pub fn is_usable_at(&self, now: i64) -> bool {
        self.enabled && self.expires_at.is_none_or(|expires| expires > now)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApiKey {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl NewApiKey {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            expires_at: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Partial update; `None` leaves a field untouched.
/// `expires_at: Some(None)` clears the expiry.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub expires_at: Option<Option<i64>>,
}

// ── image generation ────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTopic {
    pub id: String,
    pub title: Option<String>,
    pub cover_url: Option<String>,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update; `None` leaves a field untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct GenerationTopicUpdate {
    pub title: Option<Option<String>>,
    pub cover_url: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationBatch {
    pub id: String,
    pub generation_topic_id: String,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub config: Option<Value>,
    pub user_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub generations: Vec<Generation>,
}

#[derive(Debug, Clone, Default)]
pub struct NewGenerationBatch {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub id: String,
    pub generation_batch_id: String,
    pub async_task_id: Option<String>,
    pub file_id: Option<String>,
    pub seed: Option<i64>,
    pub asset: Option<GenerationAsset>,
    pub user_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewGeneration {
    pub seed: Option<i64>,
    pub asset: Option<GenerationAsset>,
    pub async_task_id: Option<String>,
    pub file_id: Option<String>,
}

/// Stored output of a finished generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAsset {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletedGenerationTopic {
    pub deleted_topic: GenerationTopic,
    pub files_to_delete: Vec<String>,
}

// ── ai infra ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    #[default]
    Builtin,
    Custom,
    Remote,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Custom => "custom",
            Self::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "custom" => Self::Custom,
            "remote" => Self::Remote,
            _ => Self::Builtin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiProvider {
    pub id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub sort: Option<i64>,
    pub source: ModelSource,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiModel {
    pub id: String,
    pub provider_id: String,
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub model_type: String,
    pub enabled: bool,
    pub sort: Option<i64>,
    pub source: ModelSource,
    pub abilities: Value,
    pub config: Option<Value>,
    pub context_window_tokens: Option<i64>,
}

/// Input for creating or upserting a model row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewAiModel {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(rename = "type", default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub source: ModelSource,
    #[serde(default)]
    pub abilities: Option<Value>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub context_window_tokens: Option<i64>,
}

impl NewAiModel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            model_type: default_model_type(),
            enabled: false,
            source: ModelSource::Builtin,
            abilities: None,
            config: None,
            context_window_tokens: None,
        }
    }
}

fn default_model_type() -> String {
    "chat".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct AiModelConfigUpdate {
    pub display_name: Option<String>,
    pub abilities: Option<Value>,
    pub config: Option<Value>,
    pub context_window_tokens: Option<i64>,
}
