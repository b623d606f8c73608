use crate::coordinator::{
    IngestOutcome, IngestRequest, IngestionConfig, IngestionCoordinator, RequestedMode,
};
use crate::enrichment::EnrichmentQueue;
use crate::fetcher::FetcherConfig;
use crate::progress::ProgressSink;
use crate::source::ConversationSource;
use crate::{IngestError, SharedStore};
use convo_storage::ChatStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

/// Runs independent pipelines for several conversations. Every pipeline opens
/// its own store connection; the checkpoint row is the only shared state.
pub struct IngestSupervisor {
    db_path: PathBuf,
    source: Arc<dyn ConversationSource>,
    fetch: FetcherConfig,
    config: IngestionConfig,
    progress: Arc<dyn ProgressSink>,
    enrichment: Option<EnrichmentQueue>,
    max_workers: usize,
}

impl IngestSupervisor {
    pub fn new(
        db_path: impl Into<PathBuf>,
        source: Arc<dyn ConversationSource>,
        fetch: FetcherConfig,
        config: IngestionConfig,
        progress: Arc<dyn ProgressSink>,
        max_workers: usize,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            source,
            fetch,
            config,
            progress,
            enrichment: None,
            max_workers: max_workers.max(1),
        }
    }

    pub fn with_enrichment(mut self, queue: EnrichmentQueue) -> Self {
        self.enrichment = Some(queue);
        self
    }

    /// Results come back in the order the conversations were given.
    pub async fn run_all(
        &self,
        conversation_ids: &[String],
        mode: RequestedMode,
        deadline: Option<Instant>,
    ) -> Vec<(String, Result<IngestOutcome, IngestError>)> {
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for (index, conversation_id) in conversation_ids.iter().enumerate() {
            let permits = Arc::clone(&permits);
            let db_path = self.db_path.clone();
            let source = Arc::clone(&self.source);
            let fetch = self.fetch;
            let config = self.config.clone();
            let progress = Arc::clone(&self.progress);
            let enrichment = self.enrichment.clone();
            let mut request = IngestRequest::new(conversation_id.clone(), mode);
            request.deadline = deadline;

            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        run_pipeline(db_path, source, fetch, config, progress, enrichment, &request)
                            .await
                    }
                    Err(err) => Err(IngestError::Join(err.to_string())),
                };
                (index, request.conversation_id, result)
            });
        }

        let mut slots: Vec<Option<(String, Result<IngestOutcome, IngestError>)>> =
            conversation_ids.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, conversation_id, result)) => {
                    slots[index] = Some((conversation_id, result));
                }
                Err(err) => warn!(event = "ingest_worker_panicked", error = %err),
            }
        }

        slots
            .into_iter()
            .zip(conversation_ids)
            .map(|(slot, conversation_id)| {
                slot.unwrap_or_else(|| {
                    (
                        conversation_id.clone(),
                        Err(IngestError::Join("pipeline task did not complete".to_string())),
                    )
                })
            })
            .collect()
    }
}

async fn run_pipeline(
    db_path: PathBuf,
    source: Arc<dyn ConversationSource>,
    fetch: FetcherConfig,
    config: IngestionConfig,
    progress: Arc<dyn ProgressSink>,
    enrichment: Option<EnrichmentQueue>,
    request: &IngestRequest,
) -> Result<IngestOutcome, IngestError> {
    let store = SharedStore::new(ChatStore::open(&db_path)?);
    let mut coordinator = IngestionCoordinator::new(store, source, fetch, config, progress);
    if let Some(queue) = enrichment {
        coordinator = coordinator.with_enrichment(queue);
    }
    coordinator.run(request).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// `None` polls until shutdown is signaled.
    pub iterations: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub iterations: u64,
    pub failures: u64,
    pub inserted: u64,
}

/// Repeats incremental sync on an interval. Failed iterations are logged and
/// the loop carries on; the next tick resumes from the durable checkpoint.
pub async fn poll_incremental(
    coordinator: &mut IngestionCoordinator,
    conversation_id: &str,
    config: PollConfig,
    mut shutdown: watch::Receiver<bool>,
) -> PollSummary {
    let mut summary = PollSummary::default();
    let mut shutdown_open = true;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let request = IngestRequest::new(conversation_id, RequestedMode::Incremental);
        summary.iterations += 1;
        match coordinator.run(&request).await {
            Ok(outcome) => {
                let inserted = outcome.report().map_or(0, |report| report.inserted);
                summary.inserted += inserted;
                info!(
                    event = "poll_tick",
                    conversation_id,
                    iteration = summary.iterations,
                    inserted
                );
            }
            Err(err) => {
                summary.failures += 1;
                warn!(
                    event = "poll_tick_failed",
                    conversation_id,
                    iteration = summary.iterations,
                    error = %err
                );
            }
        }

        if config
            .iterations
            .is_some_and(|limit| summary.iterations >= limit)
        {
            break;
        }

        if !shutdown_open {
            tokio::time::sleep(config.interval).await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            changed = shutdown.changed() => match changed {
                Ok(()) => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Err(_) => {
                    // Sender gone: nobody can ask us to stop any more.
                    shutdown_open = false;
                    tokio::time::sleep(config.interval).await;
                }
            },
        }
    }

    summary
}
