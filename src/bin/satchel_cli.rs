use std::sync::Arc;

use clap::{Parser, Subcommand};
use satchel_rs::client::SatchelClient;
use satchel_rs::models::SyncState;
use satchel_rs::store::LocalStore;
use satchel_rs::sync::SyncEngine;
use tracing::{error, info};
use tracing_subscriber;

#[derive(Parser)]
#[command(name = "satchel_cli")]
#[command(about = "Inspect and drive the Satchel offline diary cache")]
struct Args {
    /// Path of the on-disk cache database
    #[arg(short, long, default_value = "satchel.db")]
    db_path: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one pull-then-push cycle against the backend
    Sync,
    /// List cached diary entries for a date and class section
    Diary {
        /// Calendar date, YYYY-MM-DD
        #[arg(short, long)]
        date: String,
        /// Class section id to scope the listing to
        #[arg(short, long)]
        section: String,
    },
    /// Show the cached user profile
    Profile,
    /// Show local changes waiting to be pushed
    Pending,
    /// Show the sync watermark
    Watermark,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("satchel_rs={}", args.log_level))
        .init();

    let store = Arc::new(LocalStore::open(&args.db_path)?);

    match args.command {
        Command::Sync => {
            let api_key = match std::env::var("SATCHEL_API_KEY") {
                Ok(key) => key,
                Err(_) => {
                    error!("SATCHEL_API_KEY environment variable must be set");
                    std::process::exit(1);
                }
            };
            let client = Arc::new(SatchelClient::new(api_key)?);
            let engine = SyncEngine::new(client, store);
            let report = engine.sync().await?;
            info!(
                "sync complete: pulled {}, pushed {}, watermark {}",
                report.pulled, report.pushed, report.watermark
            );
            for (id, reason) in &report.push_failures {
                error!("push failed for {}: {}", id, reason);
            }
            if !report.push_failures.is_empty() {
                std::process::exit(1);
            }
        }
        Command::Diary { date, section } => {
            let entries = store.entries_for(&date, &section)?;
            if entries.is_empty() {
                info!("no cached entries for {} / {}", date, section);
            }
            for entry in entries {
                println!(
                    "{}  [{}]  {}",
                    entry.entry_date,
                    entry.subject_name.as_deref().unwrap_or("-"),
                    entry.title.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Profile => match store.profile()? {
            Some(profile) => {
                let name = profile
                    .display_name
                    .as_deref()
                    .unwrap_or(profile.id.as_str());
                println!("{} ({:?})", name, profile.role);
                if let Some(section) = &profile.class_section_id {
                    println!("section: {}", section);
                }
            }
            None => info!("no cached profile; run sync first"),
        },
        Command::Pending => {
            let pending = store.pending_changes()?;
            if pending.is_empty() {
                info!("nothing staged");
            }
            for entry in pending {
                let verb = match entry.sync_state {
                    SyncState::Created => "create",
                    SyncState::Updated => "update",
                    SyncState::Deleted => "delete",
                    SyncState::Synced => "synced",
                };
                println!(
                    "{}  {}  {}",
                    verb,
                    entry.id,
                    entry.title.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Watermark => {
            let row = store.watermark_row()?;
            println!(
                "last_pulled_at: {} (schema v{})",
                row.last_pulled_at, row.schema_version
            );
        }
    }

    Ok(())
}
