use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

use lobe_db::ConflictStrategy;
use lobe_db::config::{self, FileConfig, LobeDbConfig};

mod cli;

#[derive(Parser)]
#[command(name = "lobe-db")]
#[command(about = "Maintain a LobeChat server database: imports, API keys, generation topics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.lobe-db)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import an export bundle into a user's account
    Import(ImportArgs),

    /// Import a table-by-table database export into a user's account
    ImportTables(ImportTablesArgs),

    /// Issue, list, check and revoke API keys
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Image-generation topics
    #[command(subcommand)]
    GenerationTopics(GenerationTopicsCommand),

    /// Show row counts and database size
    Stats(StatsArgs),

    /// Write config.toml with every default value
    InitConfig,

    /// Delete the database file (prompts for confirmation)
    ResetDb(ResetDbArgs),
}

#[derive(Parser)]
struct ImportArgs {
    /// Path to the exported JSON bundle
    file: PathBuf,

    /// User that receives the imported data
    #[arg(short, long)]
    user: String,

    /// Print the per-entity results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ImportTablesArgs {
    /// Path to the exported JSON file
    file: PathBuf,

    /// User that receives the imported data
    #[arg(short, long)]
    user: String,

    /// How rows matching stored ones are handled: skip, override or merge
    #[arg(long, default_value_t = ConflictStrategy::Skip)]
    conflict: ConflictStrategy,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Create a key and print it once
    Create {
        #[arg(short, long)]
        user: String,

        /// Display name for the key
        #[arg(short, long)]
        name: String,

        /// Expire the key after this many days
        #[arg(long)]
        expires_in_days: Option<i64>,

        /// Create the key disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List a user's keys
    List {
        #[arg(short, long)]
        user: String,

        #[arg(long)]
        json: bool,
    },

    /// Check whether a key is usable
    Validate {
        key: String,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a key
    Revoke {
        #[arg(short, long)]
        user: String,

        id: i64,
    },
}

#[derive(Subcommand)]
enum GenerationTopicsCommand {
    /// List a user's generation topics, newest first
    List {
        #[arg(short, long)]
        user: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete a topic with its batches and generations, and remove its files
    Delete {
        #[arg(short, long)]
        user: String,

        id: String,
    },
}

#[derive(Parser)]
struct StatsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ResetDbArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "lobe_db=debug,info"
    } else {
        "lobe_db=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let paths = LobeDbConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = config::load_config(&paths.data_dir)
        .extract()
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Import(args) => {
            cli::import_command(&paths, &file_config, &args.file, &args.user, args.json).await
        }
        Commands::ImportTables(args) => {
            cli::import_tables_command(
                &paths,
                &file_config,
                &args.file,
                &args.user,
                args.conflict,
                args.json,
            )
            .await
        }
        Commands::Keys(KeysCommand::Create {
            user,
            name,
            expires_in_days,
            disabled,
        }) => {
            cli::keys_create_command(&paths, &file_config, &user, name, expires_in_days, !disabled)
                .await
        }
        Commands::Keys(KeysCommand::List { user, json }) => {
            cli::keys_list_command(&paths, &file_config, &user, json).await
        }
        Commands::Keys(KeysCommand::Validate { key, json }) => {
            cli::keys_validate_command(&paths, &file_config, &key, json).await
        }
        Commands::Keys(KeysCommand::Revoke { user, id }) => {
            cli::keys_revoke_command(&paths, &file_config, &user, id).await
        }
        Commands::GenerationTopics(GenerationTopicsCommand::List { user, json }) => {
            cli::generation_topics_list_command(&paths, &file_config, &user, json).await
        }
        Commands::GenerationTopics(GenerationTopicsCommand::Delete { user, id }) => {
            cli::generation_topics_delete_command(&paths, &file_config, &user, &id).await
        }
        Commands::Stats(args) => cli::stats_command(&paths, &file_config, args.json).await,
        Commands::InitConfig => {
            let path = config::write_default_config(&paths.data_dir)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::ResetDb(args) => cli::reset_db_command(&paths, args.yes),
    }
}
