//! Server-side persistence for LobeChat data.
//!
//! Every repository is bound to one user through [`repository::UserScope`].
//! On top of them sit the importer for export bundles and table exports
//! ([`import::DataImporter`]) and the
//! model-configuration cache ([`store::AiModelStore`]).

pub mod config;
pub mod db;
pub mod files;
pub mod import;
pub mod models;
pub mod repository;
pub mod store;

pub use config::{FileConfig, ImportConfig, LobeDbConfig};
pub use db::{Database, DbStats};
pub use import::{
    ConflictStrategy, DataImporter, ImportBundle, ImportError, ImportResult, ImportResults,
    TableExport, TableImportOutcome,
};
pub use repository::UserScope;
pub use store::{AiModelAction, AiModelState, AiModelStore};
