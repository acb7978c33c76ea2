use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [import]
//                    batch_size = 250
//
//   env var:         LOBE_IMPORT__BATCH_SIZE=250   (double underscore = nesting)
//
//   (single underscore stays within field names: LOBE_FILES__PUBLIC_BASE_URL)

/// Newest export bundle version this build understands.
pub const CURRENT_EXPORT_VERSION: u32 = 7;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub import: ImportFileConfig,
    #[serde(default)]
    pub files: FilesFileConfig,
    #[serde(default)]
    pub database: DatabaseFileConfig,
    #[serde(default)]
    pub keys: KeysFileConfig,
}

/// Import tunables (lives under `[import]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportFileConfig {
    /// Messages inserted per statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bundles with a higher `version` are rejected before any write.
    #[serde(default = "default_supported_version")]
    pub supported_version: u32,
}

impl Default for ImportFileConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            supported_version: default_supported_version(),
        }
    }
}

/// File storage (lives under `[files]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FilesFileConfig {
    /// Prefix joined onto stored object keys to build public URLs.
    /// When unset, keys are returned as-is.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Root directory for locally stored objects. Defaults to `<data_dir>/files`.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

/// Database tuning (lives under `[database]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseFileConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseFileConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

/// API key storage (lives under `[keys]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysFileConfig {
    /// When set, keys are stored as a peppered SHA-256 digest instead of plaintext.
    #[serde(default)]
    pub pepper: Option<String>,
}

fn default_batch_size() -> usize {
    100
}
fn default_supported_version() -> u32 {
    CURRENT_EXPORT_VERSION
}
fn default_max_connections() -> u32 {
    5
}

/// Build a figment that layers: defaults → config.toml → LOBE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `LOBE_IMPORT__BATCH_SIZE=50`  →  `import.batch_size = 50`
///   `LOBE_KEYS__PEPPER=s3cret`  →  `keys.pepper = "s3cret"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("LOBE_").split("__"))
}

/// Write a `config.toml` holding every default, unless one already exists.
pub fn write_default_config(data_dir: &Path) -> Result<PathBuf> {
    let path = data_dir.join("config.toml");
    if path.exists() {
        return Ok(path);
    }
    let body = toml::to_string_pretty(&FileConfig::default())
        .context("Failed to serialize default config")?;
    std::fs::write(&path, body)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;
    info!("Wrote default config: {}", path.display());
    Ok(path)
}

// =============================================================================
// Runtime views
// =============================================================================

/// Importer settings (runtime view).
#[derive(Clone, Debug)]
pub struct ImportConfig {
    pub batch_size: usize,
    pub supported_version: u32,
}

impl ImportConfig {
    pub fn from_file(fc: &ImportFileConfig) -> Self {
        Self {
            // a zero batch would never make progress
            batch_size: fc.batch_size.max(1),
            supported_version: fc.supported_version,
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_file(&ImportFileConfig::default())
    }
}

// =============================================================================
// Directory layout config (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct LobeDbConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub files_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl LobeDbConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".lobe-db"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let files_dir = data_dir.join("files");
        std::fs::create_dir_all(&files_dir)
            .with_context(|| format!("Failed to create files directory: {:?}", files_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        let db_path = data_dir.join("lobe.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            files_dir,
            logs_dir,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    /// Storage root for objects, honoring `[files] storage_dir`.
    pub fn storage_dir(&self, fc: &FilesFileConfig) -> PathBuf {
        fc.storage_dir
            .clone()
            .unwrap_or_else(|| self.files_dir.clone())
    }

    pub fn reset_database(&self) -> Result<()> {
        if self.db_path.exists() {
            std::fs::remove_file(&self.db_path)
                .with_context(|| format!("Failed to delete database: {:?}", self.db_path))?;
            info!("Database reset: {:?}", self.db_path);

            let wal_path = self.db_path.with_extension("db-wal");
            if wal_path.exists() {
                std::fs::remove_file(&wal_path)?;
            }
            let shm_path = self.db_path.with_extension("db-shm");
            if shm_path.exists() {
                std::fs::remove_file(&shm_path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_import_defaults() {
        let d = ImportFileConfig::default();
        assert_eq!(d.batch_size, 100);
        assert_eq!(d.supported_version, CURRENT_EXPORT_VERSION);
    }

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert!(fc.files.public_base_url.is_none());
        assert!(fc.files.storage_dir.is_none());
        assert_eq!(fc.database.max_connections, 5);
        assert!(fc.keys.pepper.is_none());
    }

    #[test]
    fn test_import_config_clamps_zero_batch() {
        let ic = ImportConfig::from_file(&ImportFileConfig {
            batch_size: 0,
            supported_version: 1,
        });
        assert_eq!(ic.batch_size, 1);
        assert_eq!(ic.supported_version, 1);
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_without_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.import.batch_size, 100);
    }

    #[test]
    fn test_load_config_from_toml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            r#"
[import]
batch_size = 25
supported_version = 3

[files]
public_base_url = "https://cdn.example.com"
"#,
        )
        .unwrap();

        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.import.batch_size, 25);
        assert_eq!(fc.import.supported_version, 3);
        assert_eq!(
            fc.files.public_base_url.as_deref(),
            Some("https://cdn.example.com")
        );
        // untouched sections keep their defaults
        assert_eq!(fc.database.max_connections, 5);
    }

    #[test]
    fn test_partial_section_keeps_field_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[import]\nsupported_version = 2\n",
        )
        .unwrap();

        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.import.supported_version, 2);
        assert_eq!(fc.import.batch_size, 100);
    }

    // ── write_default_config ────────────────────────────────────────────

    #[test]
    fn test_write_default_config_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_default_config(tmp.path()).unwrap();
        assert!(path.exists());

        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.import.batch_size, 100);
        assert_eq!(fc.import.supported_version, CURRENT_EXPORT_VERSION);
    }

    #[test]
    fn test_write_default_config_keeps_existing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "[import]\nbatch_size = 7\n").unwrap();

        write_default_config(tmp.path()).unwrap();

        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.import.batch_size, 7);
    }

    // ── LobeDbConfig ────────────────────────────────────────────────────

    #[test]
    fn test_lobe_db_config_creates_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("data");
        let config = LobeDbConfig::new(Some(root.clone())).unwrap();

        assert!(config.files_dir.is_dir());
        assert!(config.logs_dir.is_dir());
        assert_eq!(config.db_path, root.join("lobe.db"));
        assert!(config.db_url().starts_with("sqlite://"));
        assert!(config.db_url().ends_with("?mode=rwc"));
    }

    #[test]
    fn test_storage_dir_override() {
        let tmp = tempfile::tempdir().unwrap();
        let config = LobeDbConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        let default_fc = FilesFileConfig::default();
        assert_eq!(config.storage_dir(&default_fc), config.files_dir);

        let custom = FilesFileConfig {
            public_base_url: None,
            storage_dir: Some(PathBuf::from("/srv/objects")),
        };
        assert_eq!(config.storage_dir(&custom), PathBuf::from("/srv/objects"));
    }

    #[test]
    fn test_reset_database_removes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let config = LobeDbConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        std::fs::write(&config.db_path, b"").unwrap();
        std::fs::write(config.db_path.with_extension("db-wal"), b"").unwrap();

        config.reset_database().unwrap();
        assert!(!config.db_path.exists());
        assert!(!config.db_path.with_extension("db-wal").exists());
    }
}
