//! todo-sync - command line front end for the offline-first todo core
//!
//! Usage:
//!   todo-sync list                 # load todos (remote first, local fallback)
//!   todo-sync add "Buy milk"       # optimistic create
//!   todo-sync --offline add ...    # queue without touching the network
//!   todo-sync sync                 # flush the mutation queue
//!   todo-sync watch                # follow connectivity until Ctrl-C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use todo_sync::{
    InMemoryRemote, LoadState, MemoryStore, MutationRecord, SyncConfig, SyncEvent, TodoSync,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "todo-sync")]
#[command(version, about = "Offline-first todo list with a durable sync queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Start in the offline state
    #[arg(long)]
    offline: bool,

    /// In-memory store and demo server instead of SQLite and HTTP
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List todos
    List,

    /// Add a todo
    Add {
        /// Title of the new todo
        title: String,
    },

    /// Toggle a todo's completed flag
    Toggle { id: String },

    /// Remove a todo
    Remove { id: String },

    /// Flush pending mutations to the server
    Sync,

    /// Show connectivity and queue status
    Status,

    /// List pending mutations
    Queue,

    /// List mutations that stopped retrying
    DeadLetters {
        /// Move them back onto the queue
        #[arg(long)]
        requeue: bool,
    },

    /// Drop all pending mutations
    ClearQueue,

    /// List categories (online only)
    Categories,

    /// Show storage health and usage
    Storage,

    /// Run the connectivity monitor and print sync events until Ctrl-C
    Watch,

    /// Show configuration
    Config {
        /// Write the current configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = SyncConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Commands::Config { init } = cli.command {
        return cmd_config(config, cli.config, init);
    }

    let sync = if cli.ephemeral {
        let remote = Arc::new(InMemoryRemote::with_demo_data());
        let store = Arc::new(MemoryStore::new().with_quota(config.storage.quota_bytes));
        TodoSync::new(config, store, remote.clone(), remote)
    } else {
        TodoSync::open(config).context("Failed to open todo store")?
    };

    if cli.offline {
        sync.set_online(false).await;
    }

    let result = match cli.command {
        Commands::List => cmd_list(&sync).await,
        Commands::Add { title } => {
            let receipt = sync.create_item(&title).await?;
            print_warning(receipt.storage_warning.as_deref());
            println!("✓ Added {} ({})", receipt.item.title, receipt.item.id);
            Ok(())
        }
        Commands::Toggle { id } => {
            let receipt = sync.toggle_item(&id).await?;
            print_warning(receipt.storage_warning.as_deref());
            let state = if receipt.item.completed { "done" } else { "open" };
            println!("✓ {} is now {}", receipt.item.title, state);
            Ok(())
        }
        Commands::Remove { id } => {
            let receipt = sync.remove_item(&id).await?;
            print_warning(receipt.storage_warning.as_deref());
            println!("✓ Removed {}", receipt.item.title);
            Ok(())
        }
        Commands::Sync => {
            let report = sync.flush().await;
            if let Some(reason) = report.skipped {
                println!("Sync skipped: {:?}", reason);
            } else if report.total == 0 {
                println!("Nothing to sync");
            } else {
                println!("Synced {}/{}", report.synced, report.total);
                if report.remaining() > 0 {
                    println!("  {} still pending", report.remaining());
                }
                if report.dead_lettered > 0 {
                    println!("  {} moved to dead letters", report.dead_lettered);
                }
            }
            Ok(())
        }
        Commands::Status => {
            let status = sync.status().await;
            println!("Online:    {}", if status.online { "yes" } else { "no" });
            println!("Pending:   {}", status.pending);
            println!("Syncing:   {}", if status.syncing { "yes" } else { "no" });
            match status.last_sync {
                Some(at) => println!("Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Last sync: never (this session)"),
            }
            if let Some(error) = status.last_error {
                println!("Last error: {}", error);
            }
            Ok(())
        }
        Commands::Queue => {
            let records = sync.pending_mutations().await?;
            print_records(&records, "No pending mutations.");
            Ok(())
        }
        Commands::DeadLetters { requeue } => {
            if requeue {
                let moved = sync.requeue_dead_letters().await?;
                println!("✓ Requeued {} mutation(s)", moved);
            } else {
                let records = sync.dead_letters().await?;
                print_records(&records, "No dead letters.");
            }
            Ok(())
        }
        Commands::ClearQueue => {
            sync.clear_queue().await?;
            println!("✓ Queue cleared");
            Ok(())
        }
        Commands::Categories => {
            let categories = sync.categories().await?;
            if categories.is_empty() {
                println!("No categories.");
            }
            for category in categories {
                println!("  {}  {}", category.id, category.name);
            }
            Ok(())
        }
        Commands::Storage => {
            let report = sync.storage_report().await;
            println!("Healthy: {}", if report.healthy { "yes" } else { "no" });
            match report.estimate {
                Some(estimate) => {
                    let used = estimate.usage_bytes as f64 / 1024.0 / 1024.0;
                    match estimate.quota_bytes {
                        Some(quota) => println!(
                            "Usage:   {:.2}MB / {:.2}MB",
                            used,
                            quota as f64 / 1024.0 / 1024.0
                        ),
                        None => println!("Usage:   {:.2}MB", used),
                    }
                }
                None => println!("Usage:   not available"),
            }
            print_warning(report.warning.as_deref());
            Ok(())
        }
        Commands::Watch => cmd_watch(&sync).await,
        Commands::Config { .. } => Ok(()),
    };

    // writes may have spawned a flush; let it finish before the runtime goes away
    sync.settle().await;
    result
}

async fn cmd_list(sync: &TodoSync) -> Result<()> {
    let state = sync.load().await;
    match &state {
        LoadState::Remote(_) => {}
        LoadState::Cached { reason, .. } => println!("(offline copy: {})\n", reason),
        LoadState::Failed { message } => anyhow::bail!("{}", message),
    }

    let items = state.items();
    if items.is_empty() {
        println!("No todos yet.");
    }
    for item in items {
        let mark = if item.completed { "x" } else { " " };
        println!("[{}] {}  {}", mark, item.title, item.id);
    }

    let pending = sync.status().await.pending;
    if pending > 0 {
        println!("\n{} change(s) waiting to sync", pending);
    }
    Ok(())
}

async fn cmd_watch(sync: &TodoSync) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut events = sync.subscribe();
    let poller = sync.start(cancel.child_token());
    info!("Watching connectivity, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SyncEvent::SyncComplete { synced, total }) => {
                    println!("sync complete: {}/{}", synced, total)
                }
                Some(SyncEvent::QueueDepthChanged(depth)) => println!("pending: {}", depth),
                Some(SyncEvent::ConnectivityChanged(online)) => {
                    println!("{}", if online { "online" } else { "offline" })
                }
                Some(SyncEvent::MutationDeadLettered { mutation_id, item_id, error }) => {
                    println!("dead letter {} ({}): {}", mutation_id, item_id, error)
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    poller.await.context("Connectivity monitor panicked")?;
    Ok(())
}

fn cmd_config(config: SyncConfig, path: Option<PathBuf>, init: bool) -> Result<()> {
    let path = path.unwrap_or_else(SyncConfig::default_path);
    if init {
        config.save(Some(path.as_path()))?;
        println!("✓ Wrote {}", path.display());
        return Ok(());
    }

    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn print_records(records: &[MutationRecord], empty: &str) {
    if records.is_empty() {
        println!("{}", empty);
        return;
    }
    for record in records {
        print!(
            "{}  {:<6} {}  queued {}",
            record.id,
            record.kind,
            record.item_id(),
            record.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
        if record.attempts > 0 {
            print!("  attempts {}", record.attempts);
        }
        println!();
        if let Some(error) = &record.last_error {
            println!("    last error: {}", error);
        }
    }
}

fn print_warning(warning: Option<&str>) {
    if let Some(warning) = warning {
        eprintln!("⚠ {}", warning);
    }
}
