//! Newline-delimited JSON export used as a platform source by the CLI.
//!
//! Each line is either a message (`conversation_id` plus the record fields)
//! or a metadata line `{"conversation": {...}}`. The file is rescanned for
//! every page and only `page_size + 1` candidates are kept in memory.

use crate::source::{ConversationSource, SourceError, TimeWindow};
use async_trait::async_trait;
use convo_core::{ConversationInfo, MessageId, SourcePage, SourceRecord};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportLine {
    Conversation { conversation: ConversationInfo },
    Message(ExportMessage),
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    conversation_id: String,
    #[serde(flatten)]
    record: SourceRecord,
}

#[derive(Debug, Clone)]
pub struct NdjsonFileSource {
    path: PathBuf,
    platform: String,
}

#[derive(Debug, Default)]
struct ScanOutcome {
    window: BTreeMap<MessageId, SourceRecord>,
    info: Option<ConversationInfo>,
    matched: u64,
    corrupt_lines: u64,
}

impl NdjsonFileSource {
    pub fn new(path: impl Into<PathBuf>, platform: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            platform: platform.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn scan(
        &self,
        conversation_id: &str,
        after_id: MessageId,
        keep_at_most: usize,
        window: Option<TimeWindow>,
    ) -> Result<ScanOutcome, SourceError> {
        let path = self.path.clone();
        let conversation_id = conversation_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            scan_file(&path, &conversation_id, after_id, keep_at_most, window)
        })
        .await
        .map_err(|err| SourceError::Transient(format!("scan task failed: {err}")))??;

        if outcome.corrupt_lines > 0 {
            warn!(
                event = "export_corrupt_lines",
                path = %self.path.display(),
                skipped = outcome.corrupt_lines
            );
        }
        Ok(outcome)
    }

    async fn page(
        &self,
        conversation_id: &str,
        after_id: MessageId,
        page_size: usize,
        window: Option<TimeWindow>,
    ) -> Result<SourcePage, SourceError> {
        let page_size = page_size.max(1);
        let outcome = self
            .scan(conversation_id, after_id, page_size + 1, window)
            .await?;
        let has_more = outcome.window.len() > page_size;
        let records = outcome.window.into_values().take(page_size).collect();

        Ok(SourcePage {
            records,
            has_more,
            slow_down: None,
            conversation: outcome.info,
        })
    }
}

fn scan_file(
    path: &Path,
    conversation_id: &str,
    after_id: MessageId,
    keep_at_most: usize,
    window: Option<TimeWindow>,
) -> Result<ScanOutcome, SourceError> {
    let file = File::open(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            SourceError::Fatal(format!("export {} not found", path.display()))
        }
        _ => SourceError::Transient(err.to_string()),
    })?;

    let mut outcome = ScanOutcome::default();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| SourceError::Transient(err.to_string()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<ExportLine>(trimmed) {
            Ok(ExportLine::Conversation { conversation }) => {
                if conversation.conversation_id == conversation_id {
                    outcome.info = Some(conversation);
                }
            }
            Ok(ExportLine::Message(message)) => {
                if message.conversation_id != conversation_id {
                    continue;
                }
                outcome.matched += 1;
                let record = message.record;
                if record.message_id <= after_id
                    || window.is_some_and(|window| !window.contains(record.ts))
                {
                    continue;
                }
                outcome.window.entry(record.message_id).or_insert(record);
                if outcome.window.len() > keep_at_most {
                    outcome.window.pop_last();
                }
            }
            Err(_) => outcome.corrupt_lines += 1,
        }
    }
    Ok(outcome)
}

#[async_trait]
impl ConversationSource for NdjsonFileSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_page(
        &self,
        conversation_id: &str,
        after_id: MessageId,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        self.page(conversation_id, after_id, page_size, None).await
    }

    async fn fetch_window(
        &self,
        conversation_id: &str,
        window: TimeWindow,
        after_id: MessageId,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        self.page(conversation_id, after_id, page_size, Some(window))
            .await
    }

    async fn total_count(&self, conversation_id: &str) -> Result<Option<u64>, SourceError> {
        let outcome = self.scan(conversation_id, 0, 0, None).await?;
        Ok(Some(outcome.matched))
    }
}
