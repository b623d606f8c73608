pub mod coordinator;
pub mod enrichment;
pub mod fetcher;
pub mod file_source;
pub mod lock;
pub mod memory_source;
pub mod progress;
pub mod source;
pub mod supervisor;
pub mod verify;
pub mod writer;

pub use coordinator::{
    IngestOutcome, IngestReport, IngestRequest, IngestionConfig, IngestionCoordinator,
    select_mode, RequestedMode, StopReason,
};
pub use enrichment::{
    spawn_enrichment_worker, Enricher, EnrichmentKey, EnrichmentQueue, EnrichmentStats,
};
pub use fetcher::{
    BackoffPolicy, FetchError, FetchStats, FetcherConfig, PageCursor, RateLimitedFetcher,
};
pub use file_source::NdjsonFileSource;
pub use lock::ConversationLock;
pub use memory_source::MemorySource;
pub use progress::{ChannelProgress, ProgressSink, RecordingProgress, TracingProgress};
pub use source::{ConversationSource, SourceError, TimeWindow};
pub use supervisor::{poll_incremental, IngestSupervisor, PollConfig, PollSummary};
pub use verify::{CompletenessVerifier, VerifyReport};
pub use writer::DeduplicatingWriter;

use convo_storage::{ChatStore, StorageError};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source unavailable for {conversation_id} after {attempts} attempts: {last_error}")]
    SourceUnavailable {
        conversation_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("fetch error: {0}")]
    Fetch(FetchError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store mutex poisoned")]
    StorePoisoned,
    #[error("worker join error: {0}")]
    Join(String),
}

impl From<FetchError> for IngestError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::SourceUnavailable {
                conversation_id,
                attempts,
                last_error,
            } => IngestError::SourceUnavailable {
                conversation_id,
                attempts,
                last_error,
            },
            other => IngestError::Fetch(other),
        }
    }
}

/// One pipeline's SQLite connection. The mutex is only ever held inside
/// [`SharedStore::with`], never across an await point.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<ChatStore>>,
}

impl SharedStore {
    pub fn new(store: ChatStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut ChatStore) -> Result<R, StorageError>,
    ) -> Result<R, IngestError> {
        let mut guard = self.inner.lock().map_err(|_| IngestError::StorePoisoned)?;
        Ok(f(&mut guard)?)
    }
}
