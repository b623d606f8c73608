use crate::{IngestError, SharedStore};
use chrono::Utc;
use convo_core::{IngestMode, MessageId, SourcePage};
use convo_storage::{PageCommitOutcome, PageWrite};
use tracing::{debug, warn};

/// Applies fetched pages to the record store. Each call is one atomic unit:
/// the inserted rows and the advanced checkpoint commit together or not at
/// all, and replays of an applied page change nothing.
#[derive(Clone)]
pub struct DeduplicatingWriter {
    store: SharedStore,
    platform: String,
}

impl DeduplicatingWriter {
    pub fn new(store: SharedStore, platform: impl Into<String>) -> Self {
        Self {
            store,
            platform: platform.into(),
        }
    }

    pub fn apply(
        &self,
        conversation_id: &str,
        expected_last_id: Option<MessageId>,
        mode: IngestMode,
        page: &SourcePage,
    ) -> Result<PageCommitOutcome, IngestError> {
        let write = PageWrite {
            conversation_id,
            platform: &self.platform,
            expected_last_id,
            mode,
            records: &page.records,
            committed_at: Utc::now(),
        };
        let outcome = self.store.with(|store| store.commit_page(&write))?;

        if outcome.duplicates > 0 {
            debug!(
                event = "duplicates_skipped",
                conversation_id,
                duplicates = outcome.duplicates
            );
        }

        if let Some(info) = page.conversation.as_ref() {
            if info.conversation_id == conversation_id {
                self.store
                    .with(|store| store.upsert_conversation(info, Utc::now()))?;
            } else {
                warn!(
                    event = "conversation_info_mismatch",
                    conversation_id,
                    reported = %info.conversation_id
                );
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use convo_core::{ConversationInfo, SourceRecord};
    use convo_storage::ChatStore;

    fn record(message_id: MessageId) -> SourceRecord {
        SourceRecord {
            message_id,
            author_id: message_id % 3,
            author_username: None,
            author_name: None,
            text: format!("m{message_id}"),
            ts: Utc
                .with_ymd_and_hms(2026, 4, 3, 8, message_id as u32, 0)
                .single()
                .expect("valid timestamp"),
            reply_to_id: None,
        }
    }

    fn page(ids: &[MessageId]) -> SourcePage {
        SourcePage {
            records: ids.iter().copied().map(record).collect(),
            has_more: false,
            ..SourcePage::default()
        }
    }

    #[test]
    fn same_page_twice_matches_once() {
        let store = SharedStore::new(ChatStore::open_in_memory().expect("open db"));
        let writer = DeduplicatingWriter::new(store.clone(), "test");
        let batch = page(&[1, 2, 3, 4]);

        let once = writer
            .apply("conv-1", None, IngestMode::Historical, &batch)
            .expect("apply");
        let twice = writer
            .apply(
                "conv-1",
                Some(once.checkpoint.last_committed_message_id),
                IngestMode::Historical,
                &batch,
            )
            .expect("reapply");

        assert_eq!(once.checkpoint.last_committed_message_id, 4);
        assert_eq!(twice.checkpoint.last_committed_message_id, 4);
        assert_eq!(twice.checkpoint.messages_processed_count, 4);
        assert_eq!(twice.inserted, 0);
        assert_eq!(
            store
                .with(|store| store.message_count("conv-1"))
                .expect("count"),
            4
        );
    }

    #[test]
    fn stale_expectation_surfaces_storage_error() {
        let store = SharedStore::new(ChatStore::open_in_memory().expect("open db"));
        let writer = DeduplicatingWriter::new(store, "test");
        writer
            .apply("conv-1", None, IngestMode::Historical, &page(&[1]))
            .expect("apply");

        let err = writer
            .apply("conv-1", None, IngestMode::Historical, &page(&[2]))
            .expect_err("stale");
        assert!(matches!(err, IngestError::Storage(ref inner) if inner.is_stale_checkpoint()));
    }

    #[test]
    fn conversation_info_on_page_refreshes_metadata() {
        let store = SharedStore::new(ChatStore::open_in_memory().expect("open db"));
        let writer = DeduplicatingWriter::new(store.clone(), "test");
        let mut batch = page(&[1]);
        let mut info = ConversationInfo::bare("conv-1", "test");
        info.title = Some("General".to_string());
        info.participants_count = Some(12);
        batch.conversation = Some(info);

        writer
            .apply("conv-1", None, IngestMode::Historical, &batch)
            .expect("apply");

        let stored = store
            .with(|store| store.conversation("conv-1"))
            .expect("read")
            .expect("exists");
        assert_eq!(stored.title.as_deref(), Some("General"));
        assert_eq!(stored.participants_count, Some(12));
    }
}
