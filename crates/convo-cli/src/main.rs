mod config;
mod logging;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{ConvoConfig, DEFAULT_CONFIG_FILE};
use convo_analytics::{default_catalog, StagedExecutor};
use convo_core::RunStatus;
use convo_ingest::{
    poll_incremental, CompletenessVerifier, ConversationSource, IngestOutcome, IngestReport,
    IngestSupervisor, IngestionCoordinator, NdjsonFileSource, PollConfig, ProgressSink,
    RequestedMode, SharedStore, TracingProgress,
};
use convo_storage::{Checkpoint, ChatStore};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "convo", about = "Conversation ingestion and staged analytics")]
struct Args {
    /// Configuration file; `convo.toml` in the working directory by default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `storage.db_path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Newline-delimited JSON export used as the platform source.
    #[arg(long, global = true)]
    source: Option<PathBuf>,
    #[arg(long, global = true, default_value = "export")]
    platform: String,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Historical ingestion from the oldest record onward.
    Backfill {
        conversation: String,
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// One incremental pass per conversation.
    Sync {
        #[arg(required = true)]
        conversations: Vec<String>,
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Repeated incremental sync until interrupted.
    Poll {
        conversation: String,
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        iterations: Option<u64>,
    },
    /// Re-reads a trailing window and stores anything the sync missed.
    Verify {
        conversation: String,
        #[arg(long)]
        window_hours: Option<i64>,
    },
    /// Runs the message, user and chat analytics phases.
    Analyze { conversation: String },
    Status { conversation: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Analytics finished with some metrics failed.
    Partial,
}

impl Outcome {
    fn exit_code(self) -> ExitCode {
        match self {
            Outcome::Success => ExitCode::SUCCESS,
            Outcome::Failure => ExitCode::from(1),
            Outcome::Partial => ExitCode::from(2),
        }
    }
}

struct SourceArgs {
    path: Option<PathBuf>,
    platform: String,
}

impl SourceArgs {
    fn open(&self) -> Result<Arc<dyn ConversationSource>> {
        let Some(path) = self.path.as_ref() else {
            bail!("--source <export.ndjson> is required for this command");
        };
        let source: Arc<dyn ConversationSource> =
            Arc::new(NdjsonFileSource::new(path, self.platform.clone()));
        Ok(source)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let Args {
        config: config_path,
        db,
        source,
        platform,
        log_dir,
        debug,
        command,
    } = Args::parse();

    let (config_path, explicit) = match config_path {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut config = match ConvoConfig::load(&config_path, explicit) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err:#}");
            return ExitCode::from(1);
        }
    };
    if let Some(db) = db {
        config.storage.db_path = db;
    }
    if log_dir.is_some() {
        config.logging.log_dir = log_dir;
    }

    let _log_guard = logging::init_logging(debug, config.logging.log_dir.as_deref());
    let source = SourceArgs {
        path: source,
        platform,
    };

    match run(command, &config, &source).await {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            error!(event = "command_failed", error = %format!("{err:#}"));
            ExitCode::from(1)
        }
    }
}

async fn run(command: Command, config: &ConvoConfig, source: &SourceArgs) -> Result<Outcome> {
    match command {
        Command::Backfill {
            conversation,
            deadline_secs,
        } => {
            ingest(
                config,
                source.open()?,
                &[conversation],
                RequestedMode::Backfill,
                deadline_secs,
            )
            .await
        }
        Command::Sync {
            conversations,
            deadline_secs,
        } => {
            ingest(
                config,
                source.open()?,
                &conversations,
                RequestedMode::Incremental,
                deadline_secs,
            )
            .await
        }
        Command::Poll {
            conversation,
            interval,
            iterations,
        } => poll(config, source.open()?, &conversation, interval, iterations).await,
        Command::Verify {
            conversation,
            window_hours,
        } => verify(config, source.open()?, &conversation, window_hours).await,
        Command::Analyze { conversation } => analyze(config, &conversation).await,
        Command::Status { conversation } => status(config, &conversation),
    }
}

fn open_store(path: &Path) -> Result<ChatStore> {
    ChatStore::open(path).with_context(|| format!("opening store {}", path.display()))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn checkpoint_json(checkpoint: Option<&Checkpoint>) -> Value {
    match checkpoint {
        Some(checkpoint) => json!({
            "last_committed_message_id": checkpoint.last_committed_message_id,
            "messages_processed_count": checkpoint.messages_processed_count,
            "mode": checkpoint.mode.as_str(),
            "last_run_at": checkpoint.last_run_at.to_rfc3339(),
        }),
        None => Value::Null,
    }
}

fn report_json(status: &str, report: &IngestReport) -> Value {
    json!({
        "conversation_id": report.conversation_id,
        "status": status,
        "run_id": report.run_id,
        "mode": report.mode.as_str(),
        "stop": format!("{:?}", report.stop).to_lowercase(),
        "pages": report.pages,
        "fetched": report.fetched,
        "inserted": report.inserted,
        "duplicates": report.duplicates,
        "retries": report.retries,
        "checkpoint": checkpoint_json(report.checkpoint.as_ref()),
    })
}

async fn ingest(
    config: &ConvoConfig,
    source: Arc<dyn ConversationSource>,
    conversations: &[String],
    mode: RequestedMode,
    deadline_secs: Option<u64>,
) -> Result<Outcome> {
    // Migrate once before the pipelines open their own connections.
    drop(open_store(&config.storage.db_path)?);

    let supervisor = IngestSupervisor::new(
        &config.storage.db_path,
        source,
        config.fetcher_config(),
        config.ingestion_config(),
        Arc::new(TracingProgress),
        config.sync.max_workers,
    );
    let deadline = deadline_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    let results = supervisor.run_all(conversations, mode, deadline).await;

    let mut outcome = Outcome::Success;
    let mut rows = Vec::with_capacity(results.len());
    for (conversation_id, result) in results {
        match result {
            Ok(IngestOutcome::Completed(report)) => rows.push(report_json("completed", &report)),
            Ok(IngestOutcome::Superseded(report)) => {
                rows.push(report_json("superseded", &report))
            }
            Ok(IngestOutcome::Locked) => {
                warn!(event = "conversation_locked", conversation_id = %conversation_id);
                rows.push(json!({"conversation_id": conversation_id, "status": "locked"}));
            }
            Err(err) => {
                error!(event = "ingest_failed", conversation_id = %conversation_id, error = %err);
                rows.push(json!({
                    "conversation_id": conversation_id,
                    "status": "failed",
                    "error": err.to_string(),
                }));
                outcome = Outcome::Failure;
            }
        }
    }
    print_json(&Value::Array(rows))?;
    Ok(outcome)
}

async fn poll(
    config: &ConvoConfig,
    source: Arc<dyn ConversationSource>,
    conversation_id: &str,
    interval: Option<u64>,
    iterations: Option<u64>,
) -> Result<Outcome> {
    let store = SharedStore::new(open_store(&config.storage.db_path)?);
    let mut coordinator = IngestionCoordinator::new(
        store,
        source,
        config.fetcher_config(),
        config.ingestion_config(),
        Arc::new(TracingProgress),
    );

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "poll_interrupted");
            let _ = stop.send(true);
        }
    });

    let poll_config = PollConfig {
        interval: Duration::from_secs(interval.unwrap_or(config.sync.poll_interval_secs).max(1)),
        iterations,
    };
    let summary = poll_incremental(&mut coordinator, conversation_id, poll_config, shutdown).await;
    print_json(&json!({
        "conversation_id": conversation_id,
        "iterations": summary.iterations,
        "failures": summary.failures,
        "inserted": summary.inserted,
    }))?;

    if summary.iterations > 0 && summary.failures == summary.iterations {
        return Ok(Outcome::Failure);
    }
    Ok(Outcome::Success)
}

async fn verify(
    config: &ConvoConfig,
    source: Arc<dyn ConversationSource>,
    conversation_id: &str,
    window_hours: Option<i64>,
) -> Result<Outcome> {
    let window_hours = window_hours.unwrap_or(config.verify.window_hours);
    if window_hours <= 0 {
        bail!("--window-hours must be positive");
    }
    let store = SharedStore::new(open_store(&config.storage.db_path)?);
    let mut verifier = CompletenessVerifier::new(
        store,
        source,
        config.fetcher_config(),
        Arc::new(TracingProgress),
        chrono::Duration::hours(window_hours),
        config.fetch.page_size,
    );

    let report = verifier.verify(conversation_id, Utc::now()).await?;
    print_json(&json!({
        "conversation_id": report.conversation_id,
        "skipped": report.skipped,
        "window_from": report.window.from.to_rfc3339(),
        "window_to": report.window.to.to_rfc3339(),
        "pages": report.pages,
        "source_records": report.source_records,
        "missing": report.missing,
        "repaired": report.repaired,
    }))?;
    Ok(Outcome::Success)
}

async fn analyze(config: &ConvoConfig, conversation_id: &str) -> Result<Outcome> {
    let store = open_store(&config.storage.db_path)?;
    let mut executor = StagedExecutor::new(store, default_catalog(), config.analytics_config())
        .with_progress(|event| TracingProgress.emit(event));

    let report = executor.run(conversation_id).await?;
    let failures: Vec<Value> = report
        .failures
        .iter()
        .map(|failure| {
            json!({
                "category": failure.category.as_str(),
                "metric": failure.name,
                "error": failure.error.to_string(),
            })
        })
        .collect();
    let phases: Vec<Value> = report
        .phases
        .iter()
        .map(|phase| {
            json!({
                "category": phase.category.as_str(),
                "succeeded": phase.succeeded,
                "failed": phase.failed,
                "results_written": phase.results_written,
            })
        })
        .collect();
    print_json(&json!({
        "run_id": report.run_id,
        "conversation_id": report.conversation_id,
        "status": report.status.as_str(),
        "messages_analyzed": report.messages_analyzed,
        "users_analyzed": report.users_analyzed,
        "phases": phases,
        "failures": failures,
    }))?;

    Ok(match report.status {
        RunStatus::Failed => Outcome::Partial,
        _ => Outcome::Success,
    })
}

fn status(config: &ConvoConfig, conversation_id: &str) -> Result<Outcome> {
    let store = open_store(&config.storage.db_path)?;
    let checkpoint = store.checkpoint(conversation_id)?;
    let messages = store.message_count(conversation_id)?;
    let conversation = store.conversation(conversation_id)?;
    let last_ingest = store.ingestion_runs(conversation_id)?.pop();
    let last_analytics = store.latest_analytics_run(conversation_id)?;

    print_json(&json!({
        "conversation_id": conversation_id,
        "title": conversation.and_then(|conversation| conversation.title),
        "stored_messages": messages,
        "checkpoint": checkpoint_json(checkpoint.as_ref()),
        "last_ingestion": last_ingest.map(|run| json!({
            "run_id": run.run_id,
            "mode": run.mode.as_str(),
            "status": run.status,
            "messages_processed": run.messages_processed,
            "started_at": run.started_at.to_rfc3339(),
            "error": run.error,
        })),
        "last_analytics": last_analytics.map(|run| json!({
            "run_id": run.run_id,
            "status": run.status.as_str(),
            "messages_analyzed": run.messages_analyzed,
            "users_analyzed": run.users_analyzed,
            "error_detail": run.error_detail,
        })),
    }))?;
    Ok(Outcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let args = Args::try_parse_from([
            "convo",
            "sync",
            "alpha",
            "beta",
            "--source",
            "export.ndjson",
            "--deadline-secs",
            "30",
        ])
        .expect("parse");
        assert_eq!(args.source, Some(PathBuf::from("export.ndjson")));
        match args.command {
            Command::Sync {
                conversations,
                deadline_secs,
            } => {
                assert_eq!(conversations, vec!["alpha".to_string(), "beta".to_string()]);
                assert_eq!(deadline_secs, Some(30));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sync_requires_a_conversation() {
        assert!(Args::try_parse_from(["convo", "sync"]).is_err());
    }

    #[test]
    fn commands_that_fetch_need_a_source() {
        let source = SourceArgs {
            path: None,
            platform: "export".to_string(),
        };
        assert!(source.open().is_err());
    }
}
