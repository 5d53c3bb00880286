use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use fleetq::api::{build_router, ApiState};
use fleetq::config::Config;
use fleetq::db::{ApprovalStatus, Direction, NewQueueMessage, Priority, QueueStore};
use fleetq::handlers::HandlerRegistry;
use fleetq::metrics::QueueMetrics;
use fleetq::processor::MessageProcessor;
use fleetq::transport::ConnectionManager;

#[derive(Parser)]
#[command(name = "fleetq")]
#[command(about = "Durable agent message queue and delivery engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (default: ~/.fleetq/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the delivery driver and the operator HTTP API
    Serve,
    /// Show queue counters by status
    Stats {
        #[arg(long)]
        host_id: Option<String>,
        /// inbound or outbound
        #[arg(long)]
        direction: Option<String>,
    },
    /// List failed messages, newest first
    Failed {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete failed messages by id
    PurgeFailed {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete terminal messages older than the retention window
    Cleanup {
        #[arg(long)]
        older_than_days: Option<i64>,
        /// Also delete failed messages
        #[arg(long)]
        include_failed: bool,
    },
    /// Enqueue a message
    Enqueue {
        #[arg(long = "type")]
        message_type: String,
        #[arg(long)]
        host_id: Option<String>,
        /// JSON object payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(long, default_value = "outbound")]
        direction: String,
    },
    /// Host directory management
    Host {
        #[command(subcommand)]
        cmd: HostCommands,
    },
}

#[derive(Subcommand)]
enum HostCommands {
    /// Register a host
    Add {
        id: String,
        fqdn: String,
        /// Register as approved instead of pending
        #[arg(long)]
        approved: bool,
    },
    Approve { id: String },
    Revoke { id: String },
    /// Delete a host and every queued message for it
    Remove { id: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    fleetq::logging::init(&config.logging.level, cli.verbose);

    if let Commands::Serve = cli.command {
        return serve(config).await;
    }
    let store = open_store(&config)?;
    run_command(cli.command, &store, &config)
}

fn open_store(config: &Config) -> Result<QueueStore> {
    let path = config.database_path()?;
    Ok(QueueStore::open(&path)?.with_retry_config(config.retry.clone()))
}

async fn serve(config: Config) -> Result<()> {
    let store = Arc::new(open_store(&config)?);
    let metrics = QueueMetrics::new()?;
    let connections = Arc::new(ConnectionManager::new());
    let router = Arc::new(HandlerRegistry::with_defaults());

    let processor = Arc::new(MessageProcessor::new(
        store.clone(),
        router,
        connections,
        &config,
        metrics.clone(),
    ));
    let driver = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.start().await })
    };

    let app = build_router(ApiState {
        store: store.clone(),
        metrics,
        retention: config.retention.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(
        "fleetq listening on http://{} (db {})",
        listener.local_addr()?,
        store.db_path().display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    // The driver may not have reached RUNNING yet; keep asking until it exits.
    while !driver.is_finished() {
        processor.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tracing::info!("fleetq shut down");
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_command(command: Commands, store: &QueueStore, config: &Config) -> Result<()> {
    match command {
        Commands::Serve => bail!("serve runs from main"),
        Commands::Stats { host_id, direction } => {
            let direction = direction
                .as_deref()
                .map(str::parse::<Direction>)
                .transpose()?;
            let stats = store.get_queue_stats(host_id.as_deref(), direction)?;
            print_json(&stats)
        }
        Commands::Failed { limit } => {
            let failed = store.get_failed_messages(limit)?;
            if failed.is_empty() {
                println!("No failed messages.");
            }
            for m in failed {
                println!(
                    "{}  {:<8} {:<20} host={} retries={}/{}  {}",
                    m.message_id,
                    m.direction,
                    m.message_type,
                    m.host_id.as_deref().unwrap_or("-"),
                    m.retry_count,
                    m.max_retries,
                    m.error_message.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::PurgeFailed { ids } => {
            let deleted = store.delete_failed_messages(&ids)?;
            println!("Deleted {deleted} failed message(s).");
            Ok(())
        }
        Commands::Cleanup {
            older_than_days,
            include_failed,
        } => {
            let days = older_than_days.unwrap_or(config.retention.cleanup_after_days);
            if days <= 0 {
                bail!("--older-than-days must be greater than 0");
            }
            let deleted = store.cleanup_old_messages(days, !include_failed)?;
            println!("Deleted {deleted} message(s) older than {days} day(s).");
            Ok(())
        }
        Commands::Enqueue {
            message_type,
            host_id,
            payload,
            priority,
            direction,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let mut msg = NewQueueMessage::new(message_type, payload, direction.parse()?)
                .with_priority(priority.parse::<Priority>()?);
            msg.host_id = host_id;
            let id = store.enqueue_message(&msg)?;
            println!("{id}");
            Ok(())
        }
        Commands::Host { cmd } => run_host_command(cmd, store),
    }
}

fn run_host_command(cmd: HostCommands, store: &QueueStore) -> Result<()> {
    match cmd {
        HostCommands::Add { id, fqdn, approved } => {
            let status = if approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Pending
            };
            let host = store.create_host(&id, &fqdn, status)?;
            println!("Registered {} ({}) as {}", host.id, host.fqdn, host.approval_status.as_str());
        }
        HostCommands::Approve { id } => {
            if !store.set_approval_status(&id, ApprovalStatus::Approved)? {
                bail!("Host '{id}' not found");
            }
            println!("Host {id} approved.");
        }
        HostCommands::Revoke { id } => match store.revoke_host(&id)? {
            Some(purged) => println!("Host {id} revoked ({purged} queued message(s) purged)."),
            None => bail!("Host '{id}' not found"),
        },
        HostCommands::Remove { id } => match store.remove_host(&id)? {
            Some(purged) => println!("Host {id} removed ({purged} queued message(s) purged)."),
            None => bail!("Host '{id}' not found"),
        },
        HostCommands::List => {
            for host in store.list_hosts()? {
                println!(
                    "{:<24} {:<40} {:<9} last_seen={}",
                    host.id,
                    host.fqdn,
                    host.approval_status.as_str(),
                    host.last_seen_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".into())
                );
            }
        }
    }
    Ok(())
}
