use crate::enrichment::EnrichmentQueue;
use crate::fetcher::{FetcherConfig, RateLimitedFetcher};
use crate::lock::ConversationLock;
use crate::progress::ProgressSink;
use crate::source::ConversationSource;
use crate::writer::DeduplicatingWriter;
use crate::{IngestError, SharedStore};
use chrono::Utc;
use convo_core::{IngestMode, MessageId, ProgressEvent, ProgressPhase};
use convo_storage::Checkpoint;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionConfig {
    pub page_size: usize,
    /// Upper bound on pages fetched by one incremental invocation.
    pub max_pages_per_run: usize,
    pub lock_dir: Option<PathBuf>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_pages_per_run: 10,
            lock_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedMode {
    /// Checkpoint presence decides.
    Auto,
    Backfill,
    Incremental,
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub conversation_id: String,
    pub mode: RequestedMode,
    pub deadline: Option<Instant>,
}

impl IngestRequest {
    pub fn new(conversation_id: impl Into<String>, mode: RequestedMode) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            mode,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Drained,
    PageLimit,
    Deadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub run_id: String,
    pub conversation_id: String,
    pub mode: IngestMode,
    pub stop: StopReason,
    pub pages: u64,
    pub fetched: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed(IngestReport),
    /// Another writer advanced the checkpoint first; nothing left to do here.
    Superseded(IngestReport),
    /// The conversation's advisory lock is held elsewhere.
    Locked,
}

impl IngestOutcome {
    pub fn report(&self) -> Option<&IngestReport> {
        match self {
            IngestOutcome::Completed(report) | IngestOutcome::Superseded(report) => Some(report),
            IngestOutcome::Locked => None,
        }
    }
}

/// Chooses the effective mode. A missing checkpoint, or one still marked
/// historical, always means the backfill has not drained yet.
pub fn select_mode(requested: RequestedMode, checkpoint: Option<&Checkpoint>) -> IngestMode {
    match (requested, checkpoint) {
        (RequestedMode::Backfill, _) => IngestMode::Historical,
        (_, None) => IngestMode::Historical,
        (_, Some(checkpoint)) => checkpoint.mode,
    }
}

/// Drives Fetch → Write → Checkpoint for one conversation at a time.
pub struct IngestionCoordinator {
    store: SharedStore,
    fetcher: RateLimitedFetcher,
    writer: DeduplicatingWriter,
    progress: Arc<dyn ProgressSink>,
    enrichment: Option<EnrichmentQueue>,
    config: IngestionConfig,
}

impl IngestionCoordinator {
    pub fn new(
        store: SharedStore,
        source: Arc<dyn ConversationSource>,
        fetch: FetcherConfig,
        config: IngestionConfig,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let writer = DeduplicatingWriter::new(store.clone(), source.platform());
        let fetcher = RateLimitedFetcher::new(source, fetch, Arc::clone(&progress));
        Self {
            store,
            fetcher,
            writer,
            progress,
            enrichment: None,
            config,
        }
    }

    pub fn with_enrichment(mut self, queue: EnrichmentQueue) -> Self {
        self.enrichment = Some(queue);
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn run(&mut self, request: &IngestRequest) -> Result<IngestOutcome, IngestError> {
        let conversation_id = request.conversation_id.as_str();

        let _lock = match self.config.lock_dir.as_deref() {
            Some(lock_dir) => match ConversationLock::try_acquire(lock_dir, conversation_id)? {
                Some(lock) => Some(lock),
                None => {
                    info!(event = "ingest_locked", conversation_id);
                    return Ok(IngestOutcome::Locked);
                }
            },
            None => None,
        };

        let checkpoint = self.store.with(|store| store.checkpoint(conversation_id))?;
        let mode = select_mode(request.mode, checkpoint.as_ref());
        let start_after = checkpoint
            .as_ref()
            .map_or(0, |checkpoint| checkpoint.last_committed_message_id);
        let run_id = Uuid::new_v4().to_string();

        self.store.with(|store| {
            store.begin_ingestion_run(&run_id, conversation_id, mode, start_after, Utc::now())
        })?;
        info!(
            event = "ingest_started",
            conversation_id,
            run_id = %run_id,
            mode = mode.as_str(),
            after_id = start_after
        );

        let total = match mode {
            IngestMode::Historical => self.total_count(conversation_id).await,
            IngestMode::Incremental => None,
        };

        self.fetcher.reset_stats();
        let mut report = IngestReport {
            run_id,
            conversation_id: conversation_id.to_string(),
            mode,
            stop: StopReason::Drained,
            pages: 0,
            fetched: 0,
            inserted: 0,
            duplicates: 0,
            retries: 0,
            checkpoint: checkpoint.clone(),
        };

        let driven = self
            .drive(request, mode, checkpoint, total, &mut report)
            .await;
        report.retries = self.fetcher.stats().retries;

        match driven {
            Ok(Step::Finished) => {
                self.finish_run(&report, "completed", None)?;
                info!(
                    event = "ingest_finished",
                    conversation_id,
                    mode = mode.as_str(),
                    stop = ?report.stop,
                    pages = report.pages,
                    inserted = report.inserted,
                    last_id = ?report.checkpoint.as_ref().map(|c| c.last_committed_message_id)
                );
                Ok(IngestOutcome::Completed(report))
            }
            Ok(Step::Superseded) => {
                self.finish_run(&report, "superseded", None)?;
                info!(event = "ingest_superseded", conversation_id, pages = report.pages);
                Ok(IngestOutcome::Superseded(report))
            }
            Err(err) => {
                warn!(event = "ingest_failed", conversation_id, error = %err);
                if let Err(ledger_err) = self.finish_run(&report, "failed", Some(&err.to_string())) {
                    warn!(event = "ingest_ledger_failed", conversation_id, error = %ledger_err);
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &mut self,
        request: &IngestRequest,
        mode: IngestMode,
        checkpoint: Option<Checkpoint>,
        total: Option<u64>,
        report: &mut IngestReport,
    ) -> Result<Step, IngestError> {
        let conversation_id = request.conversation_id.as_str();
        let mut expected: Option<MessageId> =
            checkpoint.as_ref().map(|checkpoint| checkpoint.last_committed_message_id);
        let mut stored_mode = checkpoint.as_ref().map(|checkpoint| checkpoint.mode);
        let page_size = self.config.page_size.max(1);
        let max_pages = self.config.max_pages_per_run.max(1) as u64;

        let mut cursor = self
            .fetcher
            .cursor(conversation_id, expected.unwrap_or(0), page_size);

        let step = loop {
            if cursor.is_exhausted() {
                report.stop = StopReason::Drained;
                break Step::Finished;
            }
            if mode == IngestMode::Incremental && report.pages >= max_pages {
                report.stop = StopReason::PageLimit;
                break Step::Finished;
            }
            if request
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
            {
                report.stop = StopReason::Deadline;
                info!(event = "ingest_deadline", conversation_id, pages = report.pages);
                break Step::Finished;
            }

            // Pacing and backoff may be abandoned at the deadline; nothing
            // has been written for this page yet.
            let fetched = match request.deadline {
                Some(deadline) => tokio::select! {
                    page = cursor.next_page() => Some(page),
                    _ = sleep_until(deadline) => None,
                },
                None => Some(cursor.next_page().await),
            };
            let Some(fetched) = fetched else {
                report.stop = StopReason::Deadline;
                info!(
                    event = "ingest_deadline",
                    conversation_id,
                    pages = report.pages,
                    during = "fetch"
                );
                break Step::Finished;
            };
            let Some(page) = fetched? else {
                report.stop = StopReason::Drained;
                break Step::Finished;
            };
            report.pages += 1;
            report.fetched += page.records.len() as u64;

            // The last page of a backfill flips the checkpoint to incremental.
            let commit_mode = if page.has_more {
                mode
            } else {
                IngestMode::Incremental
            };

            if page.records.is_empty() && stored_mode == Some(commit_mode) {
                cursor.acknowledge(expected.unwrap_or(0));
                continue;
            }

            let outcome = match self.writer.apply(conversation_id, expected, commit_mode, &page) {
                Ok(outcome) => outcome,
                Err(IngestError::Storage(err)) if err.is_stale_checkpoint() => {
                    warn!(event = "stale_checkpoint", conversation_id, error = %err);
                    break Step::Superseded;
                }
                Err(err) => return Err(err),
            };

            let last_id = outcome.checkpoint.last_committed_message_id;
            cursor.acknowledge(last_id);
            expected = Some(last_id);
            stored_mode = Some(outcome.checkpoint.mode);
            report.inserted += outcome.inserted as u64;
            report.duplicates += outcome.duplicates as u64;

            if let Some(queue) = self.enrichment.as_ref() {
                queue.offer(conversation_id, outcome.inserted_ids.iter().copied());
            }

            self.progress.emit(&ProgressEvent::new(
                ProgressPhase::from(mode),
                conversation_id,
                outcome.checkpoint.messages_processed_count,
                total,
            ));
            report.checkpoint = Some(outcome.checkpoint);
        };

        Ok(step)
    }

    async fn total_count(&self, conversation_id: &str) -> Option<u64> {
        match self.fetcher.source().total_count(conversation_id).await {
            Ok(total) => total,
            Err(err) => {
                warn!(event = "total_count_unavailable", conversation_id, error = %err);
                None
            }
        }
    }

    fn finish_run(
        &self,
        report: &IngestReport,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), IngestError> {
        self.store.with(|store| {
            store.finish_ingestion_run(
                &report.run_id,
                status,
                report
                    .checkpoint
                    .as_ref()
                    .map(|checkpoint| checkpoint.last_committed_message_id),
                report.inserted,
                report.pages,
                error,
                Utc::now(),
            )
        })
    }
}

enum Step {
    Finished,
    Superseded,
}
