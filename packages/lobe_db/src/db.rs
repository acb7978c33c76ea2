use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use crate::config::{DatabaseFileConfig, LobeDbConfig};

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &LobeDbConfig, tuning: &DatabaseFileConfig) -> Result<Self> {
        info!("🗄️  Connecting to database: {}", config.db_path.display());

        // foreign_keys is per-connection, so it has to ride on the connect options
        let options = SqliteConnectOptions::from_str(&config.db_url())
            .with_context(|| format!("Invalid database url: {}", config.db_url()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(tuning.max_connections.max(1))
            .min_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database: {}", config.db_url()))?;

        info!("Running database migrations...");
        self::run_migrations(&pool).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(&pool)
            .await?;

        info!("✅ Database initialized successfully");

        Ok(Self { pool })
    }

    pub async fn get_stats(&self) -> Result<DbStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users) as user_count,
                (SELECT COUNT(*) FROM sessions) as session_count,
                (SELECT COUNT(*) FROM topics) as topic_count,
                (SELECT COUNT(*) FROM messages) as message_count,
                (SELECT COUNT(*) FROM message_groups) as group_count,
                (SELECT COUNT(*) FROM api_keys) as api_key_count,
                (SELECT COUNT(*) FROM generation_topics) as generation_topic_count,
                (SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()) as db_size
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DbStats {
            users: row.try_get::<i64, _>("user_count").unwrap_or(0) as u64,
            sessions: row.try_get::<i64, _>("session_count").unwrap_or(0) as u64,
            topics: row.try_get::<i64, _>("topic_count").unwrap_or(0) as u64,
            messages: row.try_get::<i64, _>("message_count").unwrap_or(0) as u64,
            compression_groups: row.try_get::<i64, _>("group_count").unwrap_or(0) as u64,
            api_keys: row.try_get::<i64, _>("api_key_count").unwrap_or(0) as u64,
            generation_topics: row.try_get::<i64, _>("generation_topic_count").unwrap_or(0)
                as u64,
            database_size_bytes: row.try_get::<i64, _>("db_size").unwrap_or(0) as u64,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub users: u64,
    pub sessions: u64,
    pub topics: u64,
    pub messages: u64,
    pub compression_groups: u64,
    pub api_keys: u64,
    pub generation_topics: u64,
    pub database_size_bytes: u64,
}

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 1;

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}. Please upgrade the application.",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version == SCHEMA_VERSION {
        info!(
            "Database schema is up to date (version {})",
            current_version
        );
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    // Chat entities
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL DEFAULT (unixepoch() * 1000)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sort INTEGER,
            client_id TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (client_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL,
            title TEXT,
            description TEXT,
            avatar TEXT,
            background_color TEXT,
            type TEXT NOT NULL DEFAULT 'agent',
            group_id TEXT REFERENCES session_groups(id) ON DELETE SET NULL,
            pinned INTEGER NOT NULL DEFAULT 0,
            client_id TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (client_id, user_id),
            UNIQUE (slug, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            slug TEXT,
            title TEXT,
            description TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            avatar TEXT,
            background_color TEXT,
            plugins TEXT NOT NULL DEFAULT '[]',
            chat_config TEXT,
            params TEXT NOT NULL DEFAULT '{}',
            model TEXT,
            provider TEXT,
            system_role TEXT,
            tts TEXT,
            opening_message TEXT,
            opening_questions TEXT NOT NULL DEFAULT '[]',
            client_id TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agents_to_sessions (
            agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            PRIMARY KEY (agent_id, session_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            id TEXT PRIMARY KEY,
            title TEXT,
            favorite INTEGER NOT NULL DEFAULT 0,
            session_id TEXT REFERENCES sessions(id) ON DELETE CASCADE,
            client_id TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (client_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_groups (
            id TEXT PRIMARY KEY,
            topic_id TEXT REFERENCES topics(id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            content TEXT,
            metadata TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS threads (
            id TEXT PRIMARY KEY,
            title TEXT,
            type TEXT NOT NULL DEFAULT 'continuation',
            status TEXT,
            topic_id TEXT REFERENCES topics(id) ON DELETE CASCADE,
            source_message_id TEXT,
            parent_thread_id TEXT REFERENCES threads(id) ON DELETE SET NULL,
            client_id TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            last_active_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (client_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            content TEXT,
            model TEXT,
            provider TEXT,
            favorite INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            metadata TEXT,
            session_id TEXT REFERENCES sessions(id) ON DELETE CASCADE,
            topic_id TEXT REFERENCES topics(id) ON DELETE CASCADE,
            parent_id TEXT REFERENCES messages(id) ON DELETE SET NULL,
            agent_id TEXT REFERENCES agents(id) ON DELETE SET NULL,
            thread_id TEXT REFERENCES threads(id) ON DELETE CASCADE,
            message_group_id TEXT REFERENCES message_groups(id) ON DELETE SET NULL,
            client_id TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (client_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_plugins (
            id TEXT PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            tool_call_id TEXT,
            type TEXT DEFAULT 'default',
            api_name TEXT,
            arguments TEXT,
            identifier TEXT,
            state TEXT,
            error TEXT,
            client_id TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_translates (
            id TEXT PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            content TEXT,
            from_lang TEXT,
            to_lang TEXT,
            client_id TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages(topic_id, created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_group ON messages(message_group_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_message_groups_topic ON message_groups(topic_id, created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_topics_session ON topics(session_id)")
        .execute(pool)
        .await?;

    // API keys
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            key TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            expires_at INTEGER,
            last_used_at INTEGER,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id)")
        .execute(pool)
        .await?;

    // Image generation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generation_topics (
            id TEXT PRIMARY KEY,
            title TEXT,
            cover_url TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generation_batches (
            id TEXT PRIMARY KEY,
            generation_topic_id TEXT NOT NULL REFERENCES generation_topics(id) ON DELETE CASCADE,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt TEXT NOT NULL,
            width INTEGER,
            height INTEGER,
            config TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generations (
            id TEXT PRIMARY KEY,
            generation_batch_id TEXT NOT NULL REFERENCES generation_batches(id) ON DELETE CASCADE,
            async_task_id TEXT,
            file_id TEXT,
            seed INTEGER,
            asset TEXT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_generation_batches_topic ON generation_batches(generation_topic_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_generations_batch ON generations(generation_batch_id)")
        .execute(pool)
        .await?;

    // AI provider / model configuration
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ai_providers (
            id TEXT NOT NULL,
            name TEXT,
            enabled INTEGER NOT NULL DEFAULT 0,
            sort INTEGER,
            source TEXT NOT NULL DEFAULT 'builtin',
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ai_models (
            id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            display_name TEXT,
            type TEXT NOT NULL DEFAULT 'chat',
            enabled INTEGER NOT NULL DEFAULT 0,
            sort INTEGER,
            source TEXT NOT NULL DEFAULT 'builtin',
            abilities TEXT NOT NULL DEFAULT '{}',
            config TEXT,
            context_window_tokens INTEGER,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (id, provider_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    if current_version < SCHEMA_VERSION {
        sqlx::query("INSERT OR REPLACE INTO schema_version (version, description) VALUES (?, ?)")
            .bind(SCHEMA_VERSION)
            .bind("Chat entities, threads, compression groups, api keys, generation topics, ai infra")
            .execute(pool)
            .await?;
        info!("Schema upgraded to version {}", SCHEMA_VERSION);
    }

    info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn get_stats_empty_db() {
        let pool = test_pool().await;
        let db = Database { pool };
        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.users, 0);
        assert_eq!(stats.messages, 0);
        assert_eq!(stats.api_keys, 0);
        assert!(stats.database_size_bytes > 0);
    }

    #[tokio::test]
    async fn get_stats_counts_rows() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO users (id) VALUES ('u1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO topics (id, user_id, created_at, updated_at) VALUES ('t1', 'u1', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        for i in 0..3 {
            sqlx::query("INSERT INTO messages (id, role, topic_id, user_id, created_at, updated_at) VALUES (?, 'user', 't1', 'u1', 0, 0)")
                .bind(format!("m{i}"))
                .execute(&pool)
                .await
                .unwrap();
        }

        let db = Database { pool };
        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.users, 1);
        assert_eq!(stats.topics, 1);
        assert_eq!(stats.messages, 3);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();

        let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(versions, vec![1]);
        assert_eq!(SCHEMA_VERSION, 1);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO schema_version (version, description) VALUES (?, 'future')")
            .bind(SCHEMA_VERSION + 1)
            .execute(&pool)
            .await
            .unwrap();

        let err = run_migrations(&pool).await.unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[tokio::test]
    async fn all_tables_exist_after_migration() {
        let pool = test_pool().await;

        let tables = [
            "users",
            "session_groups",
            "sessions",
            "agents",
            "agents_to_sessions",
            "topics",
            "message_groups",
            "threads",
            "messages",
            "message_plugins",
            "message_translates",
            "api_keys",
            "generation_topics",
            "generation_batches",
            "generations",
            "ai_providers",
            "ai_models",
        ];

        for table in tables {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count.0, 0, "Table {} should exist and be empty", table);
        }
    }

    #[tokio::test]
    async fn deleting_group_nulls_member_messages() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO users (id) VALUES ('u1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO message_groups (id, type, user_id, created_at, updated_at) VALUES ('g1', 'compression', 'u1', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO messages (id, role, message_group_id, user_id, created_at, updated_at) VALUES ('m1', 'user', 'g1', 'u1', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query("DELETE FROM message_groups WHERE id = 'g1'")
            .execute(&pool)
            .await
            .unwrap();

        let group: Option<String> =
            sqlx::query_scalar("SELECT message_group_id FROM messages WHERE id = 'm1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(group.is_none());
    }
}
