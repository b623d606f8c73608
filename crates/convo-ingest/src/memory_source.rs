//! In-process source with scriptable faults. Backs tests and dry runs.

use crate::source::{ConversationSource, SourceError, TimeWindow};
use async_trait::async_trait;
use convo_core::{ConversationInfo, MessageId, SourcePage, SourceRecord};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, BTreeMap<MessageId, SourceRecord>>,
    info: BTreeMap<String, ConversationInfo>,
    faults: BTreeMap<usize, SourceError>,
    persistent_fault: Option<SourceError>,
    slow_down: Option<Duration>,
}

#[derive(Debug)]
pub struct MemorySource {
    platform: String,
    report_total: bool,
    calls: AtomicUsize,
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            report_total: false,
            calls: AtomicUsize::new(0),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_totals(mut self) -> Self {
        self.report_total = true;
        self
    }

    /// Adds (or replaces) records; delivery order is always by id.
    pub fn push_records(&self, conversation_id: &str, records: impl IntoIterator<Item = SourceRecord>) {
        let mut state = self.lock();
        let stored = state.records.entry(conversation_id.to_string()).or_default();
        for record in records {
            stored.insert(record.message_id, record);
        }
    }

    pub fn set_info(&self, info: ConversationInfo) {
        self.lock().info.insert(info.conversation_id.clone(), info);
    }

    /// Makes the `call`-th request (1-based, counted across all conversations)
    /// fail with `error`.
    pub fn fail_on_call(&self, call: usize, error: SourceError) {
        self.lock().faults.insert(call, error);
    }

    pub fn fail_every_call(&self, error: Option<SourceError>) {
        self.lock().persistent_fault = error;
    }

    pub fn set_slow_down(&self, hint: Option<Duration>) {
        self.lock().slow_down = hint;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn page<F>(
        &self,
        conversation_id: &str,
        after_id: MessageId,
        page_size: usize,
        keep: F,
    ) -> Result<SourcePage, SourceError>
    where
        F: Fn(&SourceRecord) -> bool,
    {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.lock();
        if let Some(error) = state.faults.remove(&call) {
            return Err(error);
        }
        if let Some(error) = state.persistent_fault.clone() {
            return Err(error);
        }

        let mut matching = state
            .records
            .get(conversation_id)
            .into_iter()
            .flat_map(|records| records.range(after_id.saturating_add(1)..))
            .map(|(_, record)| record)
            .filter(|record| keep(*record));

        let records: Vec<SourceRecord> = matching.by_ref().take(page_size.max(1)).cloned().collect();
        let has_more = matching.next().is_some();

        Ok(SourcePage {
            records,
            has_more,
            slow_down: state.slow_down,
            conversation: state.info.get(conversation_id).cloned(),
        })
    }
}

#[async_trait]
impl ConversationSource for MemorySource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_page(
        &self,
        conversation_id: &str,
        after_id: MessageId,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        self.page(conversation_id, after_id, page_size, |_| true)
    }

    async fn fetch_window(
        &self,
        conversation_id: &str,
        window: TimeWindow,
        after_id: MessageId,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        self.page(conversation_id, after_id, page_size, |record| {
            window.contains(record.ts)
        })
    }

    async fn total_count(&self, conversation_id: &str) -> Result<Option<u64>, SourceError> {
        if !self.report_total {
            return Ok(None);
        }
        Ok(Some(
            self.lock()
                .records
                .get(conversation_id)
                .map_or(0, |records| records.len() as u64),
        ))
    }
}
