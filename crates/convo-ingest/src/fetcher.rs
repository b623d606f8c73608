use crate::progress::ProgressSink;
use crate::source::{ConversationSource, SourceError, TimeWindow};
use convo_core::{MessageId, ProgressEvent, ProgressPhase, SourcePage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

/// Delay used by the `wait` strategy when the source signals a limit without
/// saying for how long.
const WAIT_FALLBACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Sleep for the signaled duration and retry the same page, at most
    /// `max_retries` times.
    Wait { max_retries: u32 },
    /// Sleep `base * 2^attempt` (capped) between calls; `max_attempts` counts
    /// every call including the first.
    Exponential {
        base_ms: u64,
        cap_ms: u64,
        max_attempts: u32,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 500,
            cap_ms: 30_000,
            max_attempts: 6,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based) after `error`, or `None`
    /// once the policy is exhausted or the error is not retryable.
    pub fn delay_for(&self, retry: u32, error: &SourceError) -> Option<Duration> {
        if !error.is_retryable() || retry == 0 {
            return None;
        }
        let signaled = match error {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };

        match *self {
            BackoffPolicy::Wait { max_retries } => {
                if retry > max_retries {
                    return None;
                }
                Some(signaled.unwrap_or(WAIT_FALLBACK))
            }
            BackoffPolicy::Exponential {
                base_ms,
                cap_ms,
                max_attempts,
            } => {
                if retry >= max_attempts.max(1) {
                    return None;
                }
                let computed = base_ms
                    .saturating_mul(2u64.saturating_pow(retry - 1))
                    .min(cap_ms);
                Some(Duration::from_millis(computed).max(signaled.unwrap_or_default()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherConfig {
    pub min_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(250),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub calls: u64,
    pub pages: u64,
    pub retries: u64,
    pub records: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("source unavailable for {conversation_id} after {attempts} attempts: {last_error}")]
    SourceUnavailable {
        conversation_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("page cursor for {conversation_id} asked for a page before acknowledging the last one")]
    Unacknowledged { conversation_id: String },
}

#[derive(Debug, Clone, Copy)]
enum PageRequest {
    After(MessageId),
    Window(TimeWindow, MessageId),
}

impl PageRequest {
    fn after_id(self) -> MessageId {
        match self {
            PageRequest::After(after_id) | PageRequest::Window(_, after_id) => after_id,
        }
    }
}

/// Pulls pages from a [`ConversationSource`] one at a time, pacing calls and
/// retrying rate-limit and transient failures according to its policy.
pub struct RateLimitedFetcher {
    source: Arc<dyn ConversationSource>,
    config: FetcherConfig,
    progress: Arc<dyn ProgressSink>,
    next_call_at: Option<Instant>,
    stats: FetchStats,
}

impl RateLimitedFetcher {
    pub fn new(
        source: Arc<dyn ConversationSource>,
        config: FetcherConfig,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            source,
            config,
            progress,
            next_call_at: None,
            stats: FetchStats::default(),
        }
    }

    pub fn source(&self) -> &Arc<dyn ConversationSource> {
        &self.source
    }

    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = FetchStats::default();
    }

    pub async fn fetch(
        &mut self,
        conversation_id: &str,
        after_id: MessageId,
        page_size: usize,
    ) -> Result<SourcePage, FetchError> {
        self.request(conversation_id, PageRequest::After(after_id), page_size)
            .await
    }

    pub async fn fetch_window(
        &mut self,
        conversation_id: &str,
        window: TimeWindow,
        after_id: MessageId,
        page_size: usize,
    ) -> Result<SourcePage, FetchError> {
        self.request(conversation_id, PageRequest::Window(window, after_id), page_size)
            .await
    }

    /// Pull-based page stream starting after `after_id`.
    pub fn cursor(
        &mut self,
        conversation_id: impl Into<String>,
        after_id: MessageId,
        page_size: usize,
    ) -> PageCursor<'_> {
        PageCursor {
            fetcher: self,
            conversation_id: conversation_id.into(),
            after_id,
            page_size: page_size.max(1),
            awaiting_ack: false,
            exhausted: false,
        }
    }

    async fn pace(&self) {
        if let Some(at) = self.next_call_at {
            sleep_until(at).await;
        }
    }

    async fn request(
        &mut self,
        conversation_id: &str,
        request: PageRequest,
        page_size: usize,
    ) -> Result<SourcePage, FetchError> {
        let source = Arc::clone(&self.source);
        let mut failures: u32 = 0;

        loop {
            self.pace().await;
            self.stats.calls += 1;
            let result = match request {
                PageRequest::After(after_id) => {
                    source.fetch_page(conversation_id, after_id, page_size).await
                }
                PageRequest::Window(window, after_id) => {
                    source
                        .fetch_window(conversation_id, window, after_id, page_size)
                        .await
                }
            };
            self.next_call_at = Some(Instant::now() + self.config.min_delay);

            let error = match result {
                Ok(mut page) => {
                    if let Some(hint) = page.slow_down {
                        debug!(
                            event = "source_slow_down",
                            conversation_id,
                            hint_ms = hint.as_millis() as u64
                        );
                        self.next_call_at = Some(Instant::now() + hint.max(self.config.min_delay));
                    }
                    let dropped = page.normalize(request.after_id());
                    if dropped > 0 {
                        debug!(event = "page_normalized", conversation_id, dropped);
                    }
                    self.stats.pages += 1;
                    self.stats.records += page.records.len() as u64;
                    self.stats.dropped += dropped as u64;
                    return Ok(page);
                }
                Err(error) => error,
            };

            failures += 1;
            let Some(delay) = self.config.backoff.delay_for(failures, &error) else {
                warn!(
                    event = "source_unavailable",
                    conversation_id,
                    attempts = failures,
                    error = %error
                );
                return Err(FetchError::SourceUnavailable {
                    conversation_id: conversation_id.to_string(),
                    attempts: failures,
                    last_error: error.to_string(),
                });
            };

            self.stats.retries += 1;
            warn!(
                event = "fetch_retry",
                conversation_id,
                retry = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error
            );
            self.progress.emit(&ProgressEvent::new(
                ProgressPhase::Retry,
                conversation_id,
                self.stats.retries,
                None,
            ));
            sleep(delay).await;
        }
    }
}

/// Hands out one page at a time and refuses to fetch the next until the
/// consumer acknowledges what it committed, so at most one page is in flight.
pub struct PageCursor<'a> {
    fetcher: &'a mut RateLimitedFetcher,
    conversation_id: String,
    after_id: MessageId,
    page_size: usize,
    awaiting_ack: bool,
    exhausted: bool,
}

impl PageCursor<'_> {
    pub fn after_id(&self) -> MessageId {
        self.after_id
    }

    /// True once the page with `has_more = false` has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub async fn next_page(&mut self) -> Result<Option<SourcePage>, FetchError> {
        if self.awaiting_ack {
            return Err(FetchError::Unacknowledged {
                conversation_id: self.conversation_id.clone(),
            });
        }
        if self.exhausted {
            return Ok(None);
        }

        let mut page = self
            .fetcher
            .fetch(&self.conversation_id, self.after_id, self.page_size)
            .await?;
        if page.records.is_empty() && page.has_more {
            // Nothing to advance the cursor with; stop instead of spinning.
            warn!(
                event = "empty_page_with_more",
                conversation_id = %self.conversation_id,
                after_id = self.after_id
            );
            page.has_more = false;
        }

        self.exhausted = !page.has_more;
        self.awaiting_ack = true;
        Ok(Some(page))
    }

    /// Records the watermark the consumer durably committed for the last page.
    pub fn acknowledge(&mut self, committed_last_id: MessageId) {
        self.after_id = self.after_id.max(committed_last_id);
        self.awaiting_ack = false;
    }
}
