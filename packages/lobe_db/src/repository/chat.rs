use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use super::UserScope;
use crate::models::{
    Agent, Message, MessagePlugin, MessageTranslate, NewMessage, Session, SessionGroup, Topic,
    new_id, now_millis, parse_json, to_json_text,
};

pub(crate) const MESSAGE_COLUMNS: &str = "id, role, content, model, provider, favorite, error, \
     metadata, session_id, topic_id, parent_id, message_group_id, client_id, user_id, \
     created_at, updated_at";

/// Sessions, topics and messages owned by one user.
#[derive(Clone)]
pub struct ChatRepository {
    pool: SqlitePool,
    user_id: String,
}

impl ChatRepository {
    pub fn new(scope: UserScope) -> Self {
        Self {
            pool: scope.pool,
            user_id: scope.user_id,
        }
    }

    pub async fn ensure_user(&self) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO users (id, created_at) VALUES (?, ?)")
            .bind(&self.user_id)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .context("Failed to register user")?;
        Ok(())
    }

    // ── session groups / sessions ───────────────────────────────────────

    pub async fn create_session_group(&self, name: &str, sort: Option<i64>) -> Result<SessionGroup> {
        let now = now_millis();
        let group = SessionGroup {
            id: new_id("sg"),
            name: name.to_string(),
            sort,
            client_id: None,
            user_id: self.user_id.clone(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO session_groups (id, name, sort, user_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(group.sort)
        .bind(&group.user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create session group")?;
        Ok(group)
    }

    pub async fn list_session_groups(&self) -> Result<Vec<SessionGroup>> {
        let groups = sqlx::query_as::<_, SessionGroup>(
            "SELECT * FROM session_groups WHERE user_id = ? ORDER BY sort, created_at, rowid",
        )
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }

    pub async fn create_session(&self, title: &str) -> Result<Session> {
        let now = now_millis();
        let id = new_id("ssn");
        sqlx::query(
            r#"
            INSERT INTO sessions (id, slug, title, type, user_id, created_at, updated_at)
            VALUES (?, ?, ?, 'agent', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(new_slug())
        .bind(title)
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create session")?;

        self.get_session(&id)
            .await?
            .context("Session vanished after insert")
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let session =
            sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(&self.user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = ? ORDER BY created_at, rowid",
        )
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    pub async fn find_session_by_client_id(&self, client_id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE client_id = ? AND user_id = ?",
        )
        .bind(client_id)
        .bind(&self.user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Agents linked to a session through `agents_to_sessions`.
    pub async fn get_session_agents(&self, session_id: &str) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            r#"
            SELECT a.* FROM agents a
            JOIN agents_to_sessions ats ON ats.agent_id = a.id
            WHERE ats.session_id = ? AND a.user_id = ?
            ORDER BY a.created_at, a.rowid
            "#,
        )
        .bind(session_id)
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_agent).collect())
    }

    pub async fn count_agents(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agents WHERE user_id = ?")
            .bind(&self.user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ── topics ──────────────────────────────────────────────────────────

    pub async fn create_topic(&self, session_id: Option<&str>, title: &str) -> Result<Topic> {
        let now = now_millis();
        let topic = Topic {
            id: new_id("tpc"),
            title: Some(title.to_string()),
            favorite: false,
            session_id: session_id.map(str::to_string),
            client_id: None,
            user_id: self.user_id.clone(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO topics (id, title, session_id, user_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&topic.id)
        .bind(&topic.title)
        .bind(&topic.session_id)
        .bind(&topic.user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create topic")?;
        Ok(topic)
    }

    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        let topics = sqlx::query_as::<_, Topic>(
            "SELECT * FROM topics WHERE user_id = ? ORDER BY created_at, rowid",
        )
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(topics)
    }

    pub async fn find_topic_by_client_id(&self, client_id: &str) -> Result<Option<Topic>> {
        let topic =
            sqlx::query_as::<_, Topic>("SELECT * FROM topics WHERE client_id = ? AND user_id = ?")
                .bind(client_id)
                .bind(&self.user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(topic)
    }

    // ── messages ────────────────────────────────────────────────────────

    pub async fn create_message(&self, new: NewMessage) -> Result<Message> {
        let now = now_millis();
        let id = new_id("msg");
        sqlx::query(
            r#"
            INSERT INTO messages (id, role, content, model, provider, favorite, metadata,
                                  session_id, topic_id, parent_id, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.role)
        .bind(&new.content)
        .bind(&new.model)
        .bind(&new.provider)
        .bind(new.favorite)
        .bind(to_json_text(&new.metadata))
        .bind(&new.session_id)
        .bind(&new.topic_id)
        .bind(&new.parent_id)
        .bind(&self.user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create message")?;

        self.get_message(&id)
            .await?
            .context("Message vanished after insert")
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ? AND user_id = ?"
        ))
        .bind(id)
        .bind(&self.user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_message))
    }

    pub async fn find_message_by_client_id(&self, client_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE client_id = ? AND user_id = ?"
        ))
        .bind(client_id)
        .bind(&self.user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_message))
    }

    /// All messages in a topic, oldest first.
    pub async fn list_messages(&self, topic_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE topic_id = ? AND user_id = ? ORDER BY created_at, rowid"
        ))
        .bind(topic_id)
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    pub async fn count_messages(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE user_id = ?")
            .bind(&self.user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_message_plugin(&self, message_id: &str) -> Result<Option<MessagePlugin>> {
        let row = sqlx::query(
            r#"
            SELECT id, tool_call_id, type, api_name, arguments, identifier, state, error
            FROM message_plugins WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(message_id)
        .bind(&self.user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| MessagePlugin {
            id: r.get("id"),
            tool_call_id: r.get("tool_call_id"),
            plugin_type: r.get("type"),
            api_name: r.get("api_name"),
            arguments: r.get("arguments"),
            identifier: r.get("identifier"),
            state: parse_json(r.get("state")),
            error: parse_json(r.get("error")),
        }))
    }

    pub async fn get_message_translate(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageTranslate>> {
        let translate = sqlx::query_as::<_, MessageTranslate>(
            "SELECT id, content, from_lang, to_lang FROM message_translates WHERE id = ? AND user_id = ?",
        )
        .bind(message_id)
        .bind(&self.user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(translate)
    }
}

/// Slugs only need to be unique per user.
pub(crate) fn new_slug() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

pub(crate) fn row_to_message(r: SqliteRow) -> Message {
    Message {
        id: r.get("id"),
        role: r.get("role"),
        content: r.get("content"),
        model: r.get("model"),
        provider: r.get("provider"),
        favorite: r.get("favorite"),
        error: parse_json(r.get("error")),
        metadata: parse_json(r.get("metadata")),
        session_id: r.get("session_id"),
        topic_id: r.get("topic_id"),
        parent_id: r.get("parent_id"),
        message_group_id: r.get("message_group_id"),
        client_id: r.get("client_id"),
        user_id: r.get("user_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_agent(r: SqliteRow) -> Agent {
    let json_or = |col: &str, fallback: serde_json::Value| {
        parse_json(r.get(col)).unwrap_or(fallback)
    };
    Agent {
        id: r.get("id"),
        slug: r.get("slug"),
        title: r.get("title"),
        description: r.get("description"),
        tags: json_or("tags", serde_json::json!([])),
        avatar: r.get("avatar"),
        background_color: r.get("background_color"),
        plugins: json_or("plugins", serde_json::json!([])),
        chat_config: parse_json(r.get("chat_config")),
        params: json_or("params", serde_json::json!({})),
        model: r.get("model"),
        provider: r.get("provider"),
        system_role: r.get("system_role"),
        tts: parse_json(r.get("tts")),
        opening_message: r.get("opening_message"),
        opening_questions: json_or("opening_questions", serde_json::json!([])),
        client_id: r.get("client_id"),
        user_id: r.get("user_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
