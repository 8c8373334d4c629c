mod app;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use app::{App, Collection};
use gh_mirror::cache::SyncOptions;
use gh_mirror::config::Config;
use gh_mirror::engine::OperationContext;
use gh_mirror::remote::{IssueFilter, ItemState};

#[derive(Parser, Debug)]
#[command(name = "gh-mirror")]
#[command(about = "Local mirror of a GitHub repository's issues, milestones and releases")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./gh-mirror.yaml, then $XDG_CONFIG_HOME/gh-mirror/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Synchronize the mirror with GitHub
  Sync {
    /// Full sync regardless of freshness
    #[arg(long)]
    force: bool,
    #[arg(long, value_enum, default_value = "all")]
    collection: Collection,
  },
  /// Show cache freshness and counters
  Status {
    #[arg(long, value_enum, default_value = "all")]
    collection: Collection,
  },
  /// Wipe mirrored records and sync metadata
  Clear {
    #[arg(long, value_enum, default_value = "all")]
    collection: Collection,
  },
  /// List mirrored issues, newest first
  Issues {
    /// open, closed or all
    #[arg(long, default_value = "open")]
    state: String,
    #[arg(long)]
    label: Option<String>,
    /// Milestone title
    #[arg(long)]
    milestone: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
  },
  Milestones,
  Releases,
  /// Show one issue
  Get { number: u64 },
  /// Drop one issue from the cache
  Invalidate { number: u64 },
  /// Run a workflow operation
  Run {
    operation: String,
    #[arg(long)]
    issue: Option<u64>,
    #[arg(long)]
    comment: Option<String>,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    force: bool,
    /// Extra context as a JSON object
    #[arg(long)]
    context: Option<String>,
  },
  /// List registered workflow operations
  Operations,
  /// Query the GitHub rate limit budget
  RateLimit,
  /// Keep the mirror synced until interrupted
  Watch {
    /// Seconds between syncs
    #[arg(long, default_value_t = 300)]
    interval: u64,
  },
}

/// Log to a daily file so stdout stays machine readable.
fn init_tracing() -> Option<WorkerGuard> {
  let dir = Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&dir).ok()?;

  let appender = tracing_appender::rolling::daily(dir, "gh-mirror.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn parse_state(state: &str) -> Result<Option<ItemState>> {
  match state.to_ascii_lowercase().as_str() {
    "open" => Ok(Some(ItemState::Open)),
    "closed" => Ok(Some(ItemState::Closed)),
    "all" => Ok(None),
    other => Err(eyre!("Unknown state {:?}; use open, closed or all", other)),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let app = App::new(config)?;

  match args.command {
    Command::Sync { force, collection } => {
      let reports = app.sync(collection, SyncOptions { force }).await?;
      print_json(&reports)?;
    }
    Command::Status { collection } => print_json(&app.status(collection)?)?,
    Command::Clear { collection } => print_json(&app.clear(collection)?)?,
    Command::Issues {
      state,
      label,
      milestone,
      limit,
    } => {
      let filter = IssueFilter {
        state: parse_state(&state)?,
        label,
        milestone,
        limit,
      };
      let all = app.issues.all().await?;
      print_json(&all.map(|issues| filter.apply(issues)))?;
    }
    Command::Milestones => print_json(&app.milestones.all().await?)?,
    Command::Releases => print_json(&app.releases.all().await?)?,
    Command::Get { number } => print_json(&app.issues.get(&number.to_string()).await?)?,
    Command::Invalidate { number } => {
      if let Some(removal) = app.issues.invalidate(&number.to_string()) {
        removal.await?;
      }
      print_json(&json!({ "invalidated": number }))?;
    }
    Command::Run {
      operation,
      issue,
      comment,
      label,
      force,
      context,
    } => {
      let mut ctx = match context {
        Some(raw) => {
          let value = serde_json::from_str(&raw).map_err(|e| eyre!("--context is not valid JSON: {}", e))?;
          OperationContext::from_value(value).ok_or_else(|| eyre!("--context must be a JSON object"))?
        }
        None => OperationContext::new(),
      };
      if let Some(issue) = issue {
        ctx.set("issue", json!(issue));
      }
      if let Some(comment) = comment {
        ctx.set("comment", json!(comment));
      }
      if let Some(label) = label {
        ctx.set("label", json!(label));
      }
      if force {
        ctx.set("force", json!(true));
      }

      match app.engine.execute(&operation, ctx).await {
        Ok(outcome) => print_json(&outcome)?,
        Err(err) => {
          print_json(&json!({ "error": err.report() }))?;
          return Err(eyre!(err));
        }
      }
    }
    Command::Operations => print_json(&app.engine.operations())?,
    Command::RateLimit => print_json(&app.client.rate_limit().await?)?,
    Command::Watch { interval } => {
      let _sweepers = app.spawn_sweepers();
      let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
      info!(interval, "watching for changes");
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            match app.sync(Collection::All, SyncOptions::default()).await {
              Ok(reports) => print_json(&reports)?,
              Err(err) => warn!(error = %err, "watch sync failed"),
            }
          }
          _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping watch");
            break;
          }
        }
      }
    }
  }

  Ok(())
}
