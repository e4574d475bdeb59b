//! outbox CLI — operator interface to a local outbox queue file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use outbox_sender::config::OutboxConfig;
use outbox_sender::model::EntryId;
use outbox_sender::storage::QueueStore;
use outbox_sender::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "outbox", about = "Inspect and maintain a durable outbox")]
struct Cli {
    /// TOML config file. Without it, configuration comes from the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Queue file to operate on, overriding the configured one
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List pending messages, oldest first
    List {
        /// Truncate content previews to this many characters
        #[arg(long, default_value_t = 60)]
        width: usize,
    },
    /// Print the number of pending messages
    Count,
    /// Drop a pending message by id (no-op if absent)
    Remove {
        /// Entry ID
        id: String,
    },
    /// Print the broker address the outbox would connect to
    Address,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => OutboxConfig::from_toml_file(path)?,
        None => OutboxConfig::from_env()?,
    };
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    match cli.command {
        Command::List { width } => cmd_list(&config, width),
        Command::Count => {
            let store = QueueStore::open(&config.store_path)?;
            println!("{}", store.len());
            Ok(())
        }
        Command::Remove { id } => cmd_remove(&config, id),
        Command::Address => {
            println!("{}", config.redacted_address());
            println!("destination: {}", config.destination());
            Ok(())
        }
    }
}

fn cmd_list(config: &OutboxConfig, width: usize) -> anyhow::Result<()> {
    let store = QueueStore::open(&config.store_path)?;

    if store.is_empty() {
        println!("No pending messages.");
        return Ok(());
    }

    println!("{:<4}  {:<36}  CONTENT", "#", "ID");
    println!("{}", "-".repeat(44 + width));

    for (pos, entry) in store.entries().iter().enumerate() {
        let preview: String = entry.content.chars().take(width).collect();
        let ellipsis = if entry.content.chars().count() > width {
            "…"
        } else {
            ""
        };
        println!("{:<4}  {:<36}  {preview}{ellipsis}", pos, entry.id);
    }

    println!("\n{} pending message(s) in {}", store.len(), store.path().display());
    Ok(())
}

fn cmd_remove(config: &OutboxConfig, id: String) -> anyhow::Result<()> {
    let mut store = QueueStore::open(&config.store_path)?;
    let id = EntryId(id);
    let before = store.len();

    store.remove(&id)?;

    if store.len() < before {
        println!("Removed {id}");
    } else {
        println!("No pending message with id {id}");
    }
    Ok(())
}
