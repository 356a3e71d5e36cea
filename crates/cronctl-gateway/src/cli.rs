//! CLI for the cronctl gateway
//!
//! - `serve`: run the HTTP gateway (default)
//! - `events`: inspect and operate on stored events
//! - `legacy`: export or import the nested cron-array view

use clap::{Args, Parser, Subcommand};
use cronctl_core::{EventKey, EventStatus};
use cronctl_scheduler::LegacyCronArray;
use cronctl_store::Page;

use crate::app::AppState;

/// Cron event control plane
#[derive(Parser, Debug)]
#[command(name = "cronctl-gateway")]
#[command(about = "Event store and execution gateway for an external cron runner")]
#[command(version)]
pub struct Cli {
    /// Config file (falls back to CRONCTL_CONFIG, then ~/.cronctl/cronctl.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway (default)
    Serve,
    /// Inspect and operate on stored events
    #[command(subcommand)]
    Events(EventsCommand),
    /// Nested cron-array view
    #[command(subcommand)]
    Legacy(LegacyCommand),
}

#[derive(Subcommand, Debug)]
pub enum EventsCommand {
    /// List events by status
    List {
        #[arg(long, default_value = "pending")]
        status: String,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete one active event
    Delete(KeyArgs),
    /// Run one event now, ignoring its due time
    Run(KeyArgs),
    /// Release claims whose lease has expired
    Reap,
    /// Remove finished events past the retention period
    Purge,
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    pub timestamp: i64,
    pub action: String,
    pub instance: String,
}

impl KeyArgs {
    fn key(&self) -> EventKey {
        EventKey::new(self.timestamp, self.action.clone(), self.instance.clone())
    }
}

#[derive(Subcommand, Debug)]
pub enum LegacyCommand {
    /// Print the cron array as JSON
    Export,
    /// Replace all user events with the cron array in a JSON file
    Import { path: String },
}

pub async fn run_events(state: &AppState, command: EventsCommand) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp();
    match command {
        EventsCommand::List {
            status,
            page,
            limit,
        } => {
            let status: EventStatus = status.parse().map_err(anyhow::Error::msg)?;
            let events = state.store.list(status, Page::new(page, limit))?;
            if events.is_empty() {
                println!("No {status} events.");
            }
            for e in events {
                let schedule = e
                    .schedule
                    .as_ref()
                    .map(|s| s.name.as_str())
                    .unwrap_or("once");
                println!(
                    "{:>12}  {:<32} {}  {:<10} {}",
                    e.timestamp, e.action, e.instance, schedule, e.status
                );
            }
        }
        EventsCommand::Delete(args) => {
            if state.store.delete(&args.key())? {
                println!("Deleted {}", args.key());
            } else {
                anyhow::bail!("no active event {}", args.key());
            }
        }
        EventsCommand::Run(args) => {
            state.supervisor.ensure_scheduled(now)?;
            let outcome = state.runner.run_event(args.key(), now).await?;
            println!("Executed {}", outcome.event.key());
            if let Some(next) = outcome.next {
                println!("Next run at {}", next.timestamp);
            }
        }
        EventsCommand::Reap => {
            let released = state.runner.locks().reap(now)?;
            println!("Released {released} expired claim(s)");
        }
        EventsCommand::Purge => {
            let cutoff = now - state.config.scheduler.retention_secs;
            let removed = state.store.purge_finished(cutoff)?;
            println!("Purged {removed} finished event(s)");
        }
    }
    Ok(())
}

pub fn run_legacy(state: &AppState, command: LegacyCommand) -> anyhow::Result<()> {
    match command {
        LegacyCommand::Export => {
            let array = state.legacy.read()?;
            println!("{}", serde_json::to_string_pretty(&array.to_json())?);
        }
        LegacyCommand::Import { path } => {
            let raw = std::fs::read_to_string(&path)?;
            let array = LegacyCronArray::from_json(&serde_json::from_str(&raw)?)?;
            let summary = state.legacy.write(&array)?;
            println!(
                "Created {} and deleted {} event(s)",
                summary.created, summary.deleted
            );
        }
    }
    Ok(())
}
