//! ddq CLI: operator interface to a ddq queue table.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ddq_rs::config::{Config, QueueConfig};
use ddq_rs::db::Db;
use ddq_rs::engine::{Enqueuer, Listener, RemoveOutcome, SendOutcome};
use ddq_rs::event::ListenerEvent;
use ddq_rs::model::{MessageHash, QueueRecord};
use ddq_rs::store::RecordStore;
use ddq_rs::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ddq", about = "Lease-based work queue over one Postgres table")]
struct Cli {
    /// Queue config TOML. Falls back to DDQ_* environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the queue table and its indexes
    Init,
    /// Enqueue a message
    Send {
        message: String,
        #[arg(long)]
        topic: Option<String>,
    },
    /// Show one record
    Show {
        /// Record hash (full or prefix)
        hash: String,
        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records, most recent heartbeat first
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Claim and log messages until interrupted
    Listen {
        /// Remove each message after logging it. Without this the claim is
        /// kept until its lease expires.
        #[arg(long)]
        remove: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let queue = match cli.config {
        Some(ref path) => QueueConfig::load(path)?,
        None => QueueConfig::from_env()?,
    };

    if let Command::Listen { remove } = cli.command {
        return cmd_listen(config, queue, remove).await;
    }

    let db = Db::connect(config.database_url.expose_secret(), &queue.table).await?;
    match cli.command {
        Command::Init => {
            db.ensure_schema().await?;
            println!("Table {} ready.", db.table());
            Ok(())
        }
        Command::Send { message, topic } => cmd_send(db, &queue, message, topic).await,
        Command::Show { hash, json } => cmd_show(&db, hash, json).await,
        Command::List { limit, json } => cmd_list(&db, limit, json).await,
        Command::Listen { .. } => Ok(()),
    }
}

async fn cmd_send(
    db: Db,
    queue: &QueueConfig,
    message: String,
    topic: Option<String>,
) -> anyhow::Result<()> {
    let enqueuer = Enqueuer::new(Arc::new(db), queue.create_message_cycle_limit);
    match enqueuer.send(&message, topic.as_deref()).await? {
        SendOutcome::Created(hash) => println!("Created: {hash}"),
        SendOutcome::Requeued(hash) => println!("Requeued (in flight): {hash}"),
    }
    Ok(())
}

async fn cmd_show(db: &Db, hash: String, json: bool) -> anyhow::Result<()> {
    let record = if hash.len() < 64 {
        // Prefix search
        let records = db.list(1000).await?;
        let matches: Vec<_> = records
            .into_iter()
            .filter(|r| r.hash.as_str().starts_with(&hash))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no record with hash prefix {hash}"),
            1 => matches.into_iter().next(),
            n => anyhow::bail!("ambiguous prefix {hash}: {n} records match"),
        }
    } else {
        db.get(&MessageHash::from_hex(hash.clone())).await?
    };

    let Some(record) = record else {
        anyhow::bail!("no record with hash {hash}");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("Hash:       {}", record.hash);
    println!("Topic:      {}", record.topic.as_deref().unwrap_or("-"));
    println!("Processing: {}", record.is_processing);
    println!(
        "Owner:      {}",
        record
            .owner
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Heartbeat:  {}", record.heartbeat_date.format("%Y-%m-%d %H:%M:%S%.3f"));
    println!("Requeued:   {}", record.requeued);
    println!("Message:\n{}", record.message);
    Ok(())
}

async fn cmd_list(db: &Db, limit: i64, json: bool) -> anyhow::Result<()> {
    let records = db.list(limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    println!(
        "{:<12}  {:<16}  {:<5}  {:<5}  {:<12}  HEARTBEAT",
        "HASH", "TOPIC", "PROC", "REQ", "OWNER"
    );
    println!("{}", "-".repeat(90));
    for record in &records {
        print_row(record);
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}

fn print_row(record: &QueueRecord) {
    let topic = truncate(record.topic.as_deref().unwrap_or("-"), 16);
    let owner = record
        .owner
        .as_ref()
        .map(|o| o.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<12}  {:<16}  {:<5}  {:<5}  {:<12}  {}",
        truncate(record.hash.as_str(), 12),
        topic,
        record.is_processing,
        record.requeued,
        owner,
        record.heartbeat_date.format("%Y-%m-%d %H:%M:%S")
    );
}

/// At most `max` characters of `text`, cut on a char boundary.
fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

async fn cmd_listen(config: Config, queue: QueueConfig, remove: bool) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "ddq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let (listener, mut events) =
        Listener::connect(config.database_url.expose_secret(), queue).await?;
    listener.start_listening();
    info!(owner = %listener.owner(), remove, "listening, ctrl-c to stop");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            ListenerEvent::Data(message) => {
                info!(
                    hash = %message.hash(),
                    topic = ?message.topic(),
                    message = message.message(),
                    "received"
                );
                match message.heartbeat().await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(hash = %message.hash(), "lease lost before processing");
                        continue;
                    }
                    Err(e) => {
                        error!(hash = %message.hash(), error = %e, "heartbeat failed");
                        continue;
                    }
                }
                if remove {
                    let hash = message.hash().clone();
                    match message.remove().await {
                        Ok(RemoveOutcome::Removed) => info!(%hash, "removed"),
                        Ok(RemoveOutcome::Released) => info!(%hash, "requeued instead of removed"),
                        Ok(RemoveOutcome::NotOwner) => warn!(%hash, "claim lost, nothing removed"),
                        Err(e) => error!(%hash, error = %e, "remove failed"),
                    }
                }
            }
            ListenerEvent::Error(e) => error!(error = %e, "listener error"),
        }
    }

    listener.disconnect().await?;
    info!("listener stopped");
    Ok(())
}
