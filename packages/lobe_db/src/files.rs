//! Stored-object collaborators: turning object keys into public URLs, and
//! removing objects once the rows referencing them are gone.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

#[async_trait]
pub trait FileUrlResolver: Send + Sync {
    async fn get_full_file_url(&self, key: &str) -> Result<String>;
}

/// Returns keys unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughUrlResolver;

#[async_trait]
impl FileUrlResolver for PassthroughUrlResolver {
    async fn get_full_file_url(&self, key: &str) -> Result<String> {
        Ok(key.to_string())
    }
}

/// Joins keys onto a public base URL. Keys that are already absolute URLs
/// pass through untouched.
#[derive(Debug, Clone)]
pub struct PublicUrlResolver {
    base_url: String,
}

impl PublicUrlResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }
}

#[async_trait]
impl FileUrlResolver for PublicUrlResolver {
    async fn get_full_file_url(&self, key: &str) -> Result<String> {
        if key.starts_with("http://") || key.starts_with("https://") {
            return Ok(key.to_string());
        }
        Ok(format!("{}/{}", self.base_url, key.trim_start_matches('/')))
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Remove the objects behind `keys`. Missing objects are not an error.
    async fn delete_objects(&self, keys: &[String]) -> Result<()>;
}

/// Objects stored as plain files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a key to a path under the root, refusing keys that would escape it.
    fn resolve(&self, key: &str) -> Option<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        let mut failed = Vec::new();
        for key in keys {
            let Some(path) = self.resolve(key) else {
                warn!(key = %key, "refusing to delete object outside storage root");
                continue;
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "deleted object"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), "failed to delete object: {}", e);
                    failed.push(format!("{key}: {e}"));
                }
            }
        }
        if !failed.is_empty() {
            bail!(
                "Failed to delete {} of {} object(s): {}",
                failed.len(),
                keys.len(),
                failed.join("; ")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn public_url_resolver_joins_keys() {
        let resolver = PublicUrlResolver::new("https://cdn.example.com/");
        assert_eq!(
            resolver.get_full_file_url("images/a.png").await.unwrap(),
            "https://cdn.example.com/images/a.png"
        );
        assert_eq!(
            resolver.get_full_file_url("/images/a.png").await.unwrap(),
            "https://cdn.example.com/images/a.png"
        );
        assert_eq!(
            resolver
                .get_full_file_url("https://other.example.com/x.png")
                .await
                .unwrap(),
            "https://other.example.com/x.png"
        );
    }

    #[tokio::test]
    async fn local_storage_deletes_and_ignores_missing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("images")).unwrap();
        std::fs::write(tmp.path().join("images/a.png"), b"png").unwrap();

        let storage = LocalObjectStorage::new(tmp.path());
        storage
            .delete_objects(&["images/a.png".to_string(), "images/missing.png".to_string()])
            .await
            .unwrap();

        assert!(!tmp.path().join("images/a.png").exists());
    }

    #[tokio::test]
    async fn local_storage_keeps_going_after_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        // a non-empty directory cannot be removed as a file
        std::fs::create_dir_all(tmp.path().join("blocker/inner")).unwrap();
        std::fs::write(tmp.path().join("b.png"), b"png").unwrap();

        let storage = LocalObjectStorage::new(tmp.path());
        let err = storage
            .delete_objects(&["blocker".to_string(), "b.png".to_string()])
            .await
            .unwrap_err();

        assert!(!tmp.path().join("b.png").exists());
        let message = err.to_string();
        assert!(message.contains("1 of 2"));
        assert!(message.contains("blocker"));
    }

    #[tokio::test]
    async fn local_storage_refuses_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("outside.txt");
        std::fs::write(&outside, b"keep").unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();

        let storage = LocalObjectStorage::new(&root);
        storage
            .delete_objects(&["../outside.txt".to_string()])
            .await
            .unwrap();

        assert!(outside.exists());
    }
}
