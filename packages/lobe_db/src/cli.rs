use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

use lobe_db::config::{FileConfig, ImportConfig, LobeDbConfig};
use lobe_db::db::Database;
use lobe_db::files::{FileUrlResolver, LocalObjectStorage, PassthroughUrlResolver, PublicUrlResolver};
use lobe_db::import::{ConflictStrategy, DataImporter};
use lobe_db::models::{NewApiKey, now_millis};
use lobe_db::repository::{KeyLookup, UserScope};
use lobe_keys::{DigestEncryptor, Encryptor, ErrorResponse, KeyError};
use serde::Serialize;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

async fn open_database(paths: &LobeDbConfig, fc: &FileConfig) -> Result<Database> {
    Database::new(paths, &fc.database).await
}

/// Scope for `user`, registering the user on first use.
async fn user_scope(db: &Database, user: &str) -> Result<UserScope> {
    let scope = UserScope::new(db.pool.clone(), user);
    scope.chat().ensure_user().await?;
    Ok(scope)
}

fn key_encryptor(fc: &FileConfig) -> Option<DigestEncryptor> {
    fc.keys.pepper.as_deref().map(DigestEncryptor::new)
}

fn format_millis(ms: Option<i64>) -> String {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Show enough of a stored key to tell keys apart.
fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(7).collect();
    format!("{visible}…")
}

pub async fn import_command(
    paths: &LobeDbConfig,
    fc: &FileConfig,
    file: &Path,
    user: &str,
    json: bool,
) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let scope = user_scope(&db, user).await?;
    let importer = DataImporter::new(scope, ImportConfig::from_file(&fc.import));

    info!("Importing {} for user {}", file.display(), user);
    let results = importer.import_file(file).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    let rows = [
        ("session groups", results.session_groups),
        ("sessions", results.sessions),
        ("topics", results.topics),
        ("messages", results.messages),
    ];
    println!("{:<16} {:>8} {:>8} {:>8}", "ENTITY", "ADDED", "SKIPPED", "ERRORS");
    for (label, result) in rows {
        if let Some(r) = result {
            println!("{:<16} {:>8} {:>8} {:>8}", label, r.added, r.skips, r.errors);
        }
    }
    println!(
        "\n{} added, {} skipped",
        results.total_added(),
        results.total_skips()
    );
    Ok(())
}

pub async fn import_tables_command(
    paths: &LobeDbConfig,
    fc: &FileConfig,
    file: &Path,
    user: &str,
    conflict: ConflictStrategy,
    json: bool,
) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let scope = user_scope(&db, user).await?;
    let importer = DataImporter::new(scope, ImportConfig::from_file(&fc.import));

    info!("Importing tables from {} for user {} ({})", file.display(), user, conflict);
    let outcome = importer.import_tables_file(file, conflict).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.success {
        println!(
            "{:<20} {:>8} {:>8} {:>8} {:>8}",
            "TABLE", "ADDED", "UPDATED", "SKIPPED", "ERRORS"
        );
        for (table, r) in &outcome.results {
            println!(
                "{:<20} {:>8} {:>8} {:>8} {:>8}",
                table, r.added, r.updated, r.skips, r.errors
            );
        }
        println!(
            "\n{} added, {} updated, {} skipped, {} rejected",
            outcome.total_added(),
            outcome.total_updated(),
            outcome.total_skips(),
            outcome.total_errors()
        );
    }

    match outcome.error {
        Some(failure) => bail!("Import failed: {} ({})", failure.message, failure.details),
        None => Ok(()),
    }
}

pub async fn keys_create_command(
    paths: &LobeDbConfig,
    fc: &FileConfig,
    user: &str,
    name: String,
    expires_in_days: Option<i64>,
    enabled: bool,
) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let scope = user_scope(&db, user).await?;
    let encryptor = key_encryptor(fc);

    let params = NewApiKey {
        name,
        enabled,
        expires_at: expires_in_days.map(|days| now_millis() + days * DAY_MS),
    };
    let issued = scope
        .api_keys()
        .issue(params, encryptor.as_ref().map(|e| e as &dyn Encryptor))
        .await?;

    println!("Created key #{} ({})", issued.record.id, issued.record.name);
    println!("{}", issued.plaintext);
    if encryptor.is_some() {
        eprintln!("Store this key now; only its digest is kept.");
    }
    Ok(())
}

pub async fn keys_list_command(
    paths: &LobeDbConfig,
    fc: &FileConfig,
    user: &str,
    json: bool,
) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let keys = UserScope::new(db.pool.clone(), user)
        .api_keys()
        .query(None)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&keys)?);
    } else if keys.is_empty() {
        println!("No API keys.");
    } else {
        println!(
            "{:<6} {:<24} {:<8} {:<17} {:<17} {}",
            "ID", "NAME", "ENABLED", "EXPIRES", "LAST USED", "KEY"
        );
        println!("{}", "-".repeat(90));
        for key in &keys {
            println!(
                "{:<6} {:<24} {:<8} {:<17} {:<17} {}",
                key.id,
                key.name,
                if key.enabled { "yes" } else { "no" },
                format_millis(key.expires_at),
                format_millis(key.last_used_at),
                mask_key(&key.key)
            );
        }
        println!("\n{} key(s)", keys.len());
    }
    Ok(())
}

/// Outcome of `keys validate --json` for a key that exists.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyValidation {
    valid: bool,
    id: i64,
    user_id: String,
}

pub async fn keys_validate_command(
    paths: &LobeDbConfig,
    fc: &FileConfig,
    key: &str,
    json: bool,
) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let encryptor = key_encryptor(fc);
    let encryptor = encryptor.as_ref().map(|e| e as &dyn Encryptor);

    // key lookups are not limited to the scope's user
    let repo = UserScope::new(db.pool.clone(), "").api_keys();

    match repo.find_by_key(key, encryptor).await? {
        KeyLookup::Malformed if json => {
            let body = ErrorResponse::from(&KeyError::MalformedKey);
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        KeyLookup::Malformed => println!("malformed: not an API key"),
        KeyLookup::NotFound if json => {
            let body = ErrorResponse {
                error: "not_found".to_string(),
                message: "unknown api key".to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        KeyLookup::NotFound => println!("unknown key"),
        KeyLookup::Found(found) => {
            let usable = found.is_usable_at(now_millis());
            if usable {
                UserScope::new(db.pool.clone(), found.user_id.clone())
                    .api_keys()
                    .update_last_used(found.id)
                    .await?;
            }
            if json {
                let body = KeyValidation {
                    valid: usable,
                    id: found.id,
                    user_id: found.user_id,
                };
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!(
                    "{} (key #{} owned by {})",
                    if usable { "valid" } else { "unusable" },
                    found.id,
                    found.user_id
                );
            }
        }
    }
    Ok(())
}

pub async fn keys_revoke_command(
    paths: &LobeDbConfig,
    fc: &FileConfig,
    user: &str,
    id: i64,
) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let deleted = UserScope::new(db.pool.clone(), user)
        .api_keys()
        .delete(id)
        .await?;

    if deleted {
        println!("Revoked key #{id}");
    } else {
        println!("No key #{id} for user {user}");
    }
    Ok(())
}

pub async fn generation_topics_list_command(
    paths: &LobeDbConfig,
    fc: &FileConfig,
    user: &str,
    json: bool,
) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let resolver: Box<dyn FileUrlResolver> = match &fc.files.public_base_url {
        Some(base) => Box::new(PublicUrlResolver::new(base.clone())),
        None => Box::new(PassthroughUrlResolver),
    };
    let topics = UserScope::new(db.pool.clone(), user)
        .generation_topics()
        .query_all(resolver.as_ref())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&topics)?);
    } else if topics.is_empty() {
        println!("No generation topics.");
    } else {
        println!("{:<40} {:<24} {:<17} {}", "ID", "TITLE", "UPDATED", "COVER");
        println!("{}", "-".repeat(100));
        for topic in &topics {
            println!(
                "{:<40} {:<24} {:<17} {}",
                topic.id,
                topic.title.as_deref().unwrap_or("(untitled)"),
                format_millis(Some(topic.updated_at)),
                topic.cover_url.as_deref().unwrap_or("-")
            );
        }
        println!("\n{} topic(s)", topics.len());
    }
    Ok(())
}

pub async fn generation_topics_delete_command(
    paths: &LobeDbConfig,
    fc: &FileConfig,
    user: &str,
    id: &str,
) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let storage = LocalObjectStorage::new(paths.storage_dir(&fc.files));

    let deleted = UserScope::new(db.pool.clone(), user)
        .generation_topics()
        .delete_with_files(id, &storage)
        .await?;

    match deleted {
        Some(result) => println!(
            "Deleted topic {} ({} file(s) removed)",
            result.deleted_topic.id,
            result.files_to_delete.len()
        ),
        None => println!("No generation topic {id} for user {user}"),
    }
    Ok(())
}

pub async fn stats_command(paths: &LobeDbConfig, fc: &FileConfig, json: bool) -> Result<()> {
    let db = open_database(paths, fc).await?;
    let stats = db.get_stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Database: {}", paths.db_path.display());
    println!("   Users:              {}", stats.users);
    println!("   Sessions:           {}", stats.sessions);
    println!("   Topics:             {}", stats.topics);
    println!("   Messages:           {}", stats.messages);
    println!("   Compression groups: {}", stats.compression_groups);
    println!("   API keys:           {}", stats.api_keys);
    println!("   Generation topics:  {}", stats.generation_topics);
    println!(
        "   Size:               {:.1} KiB",
        stats.database_size_bytes as f64 / 1024.0
    );
    Ok(())
}

pub fn reset_db_command(paths: &LobeDbConfig, yes: bool) -> Result<()> {
    if !paths.db_path.exists() {
        println!("No database at {}", paths.db_path.display());
        return Ok(());
    }

    if !yes {
        println!("This will delete all stored data!");
        print!("Are you sure? (yes/no): ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("Failed to read confirmation")?;
        if input.trim() != "yes" {
            println!("Cancelled.");
            return Ok(());
        }
    }

    paths.reset_database()?;
    println!("Database reset.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_keys() {
        assert_eq!(mask_key("lb-0123456789abcdef"), "lb-0123…");
        assert_eq!(mask_key("abc"), "abc…");
    }

    #[test]
    fn formats_missing_time_as_dash() {
        assert_eq!(format_millis(None), "-");
        assert_eq!(format_millis(Some(0)), "1970-01-01 00:00");
    }

    #[test]
    fn pepper_enables_digest() {
        let mut fc = FileConfig::default();
        assert!(key_encryptor(&fc).is_none());
        fc.keys.pepper = Some("s3cret".into());
        assert!(key_encryptor(&fc).is_some());
    }
}
