use crate::fetcher::{FetcherConfig, RateLimitedFetcher};
use crate::progress::ProgressSink;
use crate::source::{ConversationSource, TimeWindow};
use crate::{IngestError, SharedStore};
use chrono::{DateTime, Utc};
use convo_core::{MessageId, ProgressEvent, ProgressPhase, SourceRecord};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub conversation_id: String,
    pub window: TimeWindow,
    pub pages: u64,
    pub source_records: u64,
    pub missing: u64,
    pub repaired: u64,
    /// No checkpoint existed, so there was nothing to compare against.
    pub skipped: bool,
}

/// Re-reads a trailing time window from the source and stores every record
/// in it the store does not hold yet. The watermark is not moved, so records
/// above it are seen again by the next incremental sync as duplicates.
pub struct CompletenessVerifier {
    store: SharedStore,
    fetcher: RateLimitedFetcher,
    progress: Arc<dyn ProgressSink>,
    window: chrono::Duration,
    page_size: usize,
}

impl CompletenessVerifier {
    pub fn new(
        store: SharedStore,
        source: Arc<dyn ConversationSource>,
        fetch: FetcherConfig,
        progress: Arc<dyn ProgressSink>,
        window: chrono::Duration,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            fetcher: RateLimitedFetcher::new(source, fetch, Arc::clone(&progress)),
            progress,
            window,
            page_size: page_size.max(1),
        }
    }

    pub async fn verify(
        &mut self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifyReport, IngestError> {
        let window = TimeWindow::trailing(now, self.window);
        let mut report = VerifyReport {
            conversation_id: conversation_id.to_string(),
            window,
            pages: 0,
            source_records: 0,
            missing: 0,
            repaired: 0,
            skipped: false,
        };

        if self
            .store
            .with(|store| store.checkpoint(conversation_id))?
            .is_none()
        {
            info!(event = "verify_skipped", conversation_id, reason = "no_checkpoint");
            report.skipped = true;
            return Ok(report);
        }

        let stored = self.store.with(|store| {
            store.message_ids_between(conversation_id, window.from, window.to)
        })?;

        let platform = self.fetcher.source().platform().to_string();
        let mut after_id: MessageId = 0;
        loop {
            let page = self
                .fetcher
                .fetch_window(conversation_id, window, after_id, self.page_size)
                .await?;
            report.pages += 1;
            report.source_records += page.records.len() as u64;

            let missing: Vec<SourceRecord> = page
                .records
                .iter()
                .filter(|record| !stored.contains(&record.message_id))
                .cloned()
                .collect();

            if !missing.is_empty() {
                report.missing += missing.len() as u64;
                let inserted = self.store.with(|store| {
                    store.backfill_missing(conversation_id, &platform, &missing, Utc::now())
                })?;
                report.repaired += inserted as u64;
            }
            self.progress.emit(&ProgressEvent::new(
                ProgressPhase::Verify,
                conversation_id,
                report.source_records,
                None,
            ));

            match page.max_message_id() {
                Some(last) if page.has_more => after_id = last,
                _ => break,
            }
        }

        if report.missing > 0 {
            warn!(
                event = "incomplete_source_window",
                conversation_id,
                missing = report.missing,
                repaired = report.repaired,
                from = %window.from,
                to = %window.to
            );
        } else {
            info!(
                event = "verify_clean",
                conversation_id,
                checked = report.source_records
            );
        }

        Ok(report)
    }
}
