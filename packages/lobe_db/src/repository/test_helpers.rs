use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Fresh in-memory database with all migrations applied (~1ms).
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("Failed to enable foreign keys");

    pool
}

/// Register `user_id` in `pool` and return a scope bound to it.
pub async fn user_scope(pool: &SqlitePool, user_id: &str) -> super::UserScope {
    let scope = super::UserScope::new(pool.clone(), user_id);
    scope
        .chat()
        .ensure_user()
        .await
        .expect("Failed to create test user");
    scope
}

/// Single-user scope on a fresh database.
pub async fn test_scope() -> super::UserScope {
    let pool = test_pool().await;
    user_scope(&pool, "test-user").await
}
