//! case-sync command line client.
//!
//! `watch` keeps the push channel open and logs every event. `move` performs
//! one optimistic kanban move against the REST API. `config` prints the
//! effective configuration and, with `--save`, writes it to disk.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use anyhow::{Context, Result};
use case_sync::connection::LifecycleEvent;
use case_sync::kanban::LogNotifier;
use case_sync::notifications::LogAnnouncer;
use case_sync::{
    constants, ApiClient, Config, ConnectionManager, EntityId, EventType, KanbanBoard,
    MoveOutcome, NotificationInbox, SharedCredential,
};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "case-sync")]
#[command(version = VERSION)]
#[command(about = "Real-time sync client for the case-tracking service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the push channel and log events until Ctrl-C
    Watch,
    /// Move a process to another kanban column
    Move {
        /// Process id
        id: String,
        /// Target column (status)
        status: String,
    },
    /// Print the effective configuration (token excluded)
    Config {
        /// Also write it to config.json
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_dir()?.join("config.json").display());
            }
            Ok(())
        }
        Commands::Watch => runtime()?.block_on(watch(config)),
        Commands::Move { id, status } => runtime()?.block_on(move_process(config, id, status)),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")
}

fn api_client(config: &Config) -> Result<ApiClient> {
    let api_url = config
        .api_url
        .as_deref()
        .context("No API URL configured (set CASE_SYNC_API_URL)")?;
    if !config.has_token() {
        anyhow::bail!("No token configured (set CASE_SYNC_TOKEN)");
    }
    ApiClient::new(api_url, config.token.clone())
}

async fn move_process(config: Config, id: String, status: String) -> Result<()> {
    let api = Arc::new(api_client(&config)?);
    let board = KanbanBoard::new(Arc::clone(&api) as _, Arc::new(LogNotifier))
        .with_source(api)
        .with_timeout(config.mutation_timeout());
    board.resync().await.context("Failed to load kanban board")?;

    let id = EntityId::from(id.as_str());
    match board.move_card(&id, &status).await? {
        MoveOutcome::Confirmed(edit) => {
            println!("{} moved: {} -> {}", id, edit.previous_value, edit.proposed_value);
        }
        MoveOutcome::RolledBack { edit, error } => {
            anyhow::bail!(
                "{} not moved from {} to {}: {}",
                id,
                edit.previous_value,
                edit.proposed_value,
                error
            );
        }
        MoveOutcome::Unchanged => println!("{} is already in {}", id, status),
    }
    Ok(())
}

async fn watch(config: Config) -> Result<()> {
    let api = api_client(&config)?;
    let credential = SharedCredential::new(Some(config.token.clone()));
    let manager = ConnectionManager::new(config.to_connection_options(), Arc::new(credential));

    let _loggers: Vec<_> = EventType::KNOWN
        .into_iter()
        .map(|event_type| {
            manager.register(event_type, |data, envelope| {
                log::info!("[Watch] {}: {}", envelope.event_type, data);
                Ok(())
            })
        })
        .collect();

    let inbox = Arc::new(NotificationInbox::new(Arc::new(LogAnnouncer)));
    let _inbox_subscriptions = inbox.attach(&manager);
    if let Err(e) = inbox.poll(&api).await {
        log::warn!("[Watch] Initial notification fetch failed: {:#}", e);
    }

    let shutdown = CancellationToken::new();

    let mut lifecycle = manager.subscribe_lifecycle();
    let lifecycle_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = lifecycle.recv() => match event {
                        Ok(LifecycleEvent::Connected) => log::info!("[Watch] Connected"),
                        Ok(LifecycleEvent::Disconnected { code, reason }) => {
                            log::info!("[Watch] Disconnected ({}) {}", code, reason);
                        }
                        Ok(LifecycleEvent::StateChanged { .. }) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("[Watch] Missed {} lifecycle event(s)", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    };

    // Fallback polling while the push channel is down.
    let poll_task = {
        let shutdown = shutdown.clone();
        let manager = manager.clone();
        let inbox = Arc::clone(&inbox);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(constants::NOTIFICATION_POLL_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if !manager.is_connected() {
                            if let Err(e) = inbox.poll(&api).await {
                                log::warn!("[Watch] Notification poll failed: {:#}", e);
                            }
                        }
                    }
                }
            }
        })
    };

    manager.connect()?;
    log::info!("[Watch] Watching for events (Ctrl-C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    shutdown.cancel();
    manager.teardown();
    let _ = tokio::join!(lifecycle_task, poll_task);
    log::info!("[Watch] {} unread notification(s)", inbox.unread_count());
    Ok(())
}
