use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convo_core::{MessageId, SourcePage};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the platform client for a single page request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::Fatal(_))
    }
}

/// Inclusive time range used by completeness verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn trailing(to: DateTime<Utc>, span: chrono::Duration) -> Self {
        Self { from: to - span, to }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts <= self.to
    }
}

/// Platform client. Pages come back in ascending id order starting strictly
/// after `after_id`; a page may carry a pacing hint.
#[async_trait]
pub trait ConversationSource: Send + Sync {
    fn platform(&self) -> &str;

    async fn fetch_page(
        &self,
        conversation_id: &str,
        after_id: MessageId,
        page_size: usize,
    ) -> Result<SourcePage, SourceError>;

    /// Same paging contract as `fetch_page`, restricted to records whose
    /// timestamp falls inside `window`.
    async fn fetch_window(
        &self,
        conversation_id: &str,
        window: TimeWindow,
        after_id: MessageId,
        page_size: usize,
    ) -> Result<SourcePage, SourceError>;

    async fn total_count(&self, _conversation_id: &str) -> Result<Option<u64>, SourceError> {
        Ok(None)
    }
}
