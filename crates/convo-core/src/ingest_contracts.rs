use crate::ContractError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Source-assigned message identifier. Monotonic within a conversation but not
/// necessarily contiguous.
pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub message_id: MessageId,
    pub author_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default)]
    pub text: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub conversation_id: String,
    pub platform: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub participants_count: Option<i64>,
}

impl ConversationInfo {
    pub fn bare(conversation_id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            platform: platform.into(),
            title: None,
            kind: None,
            participants_count: None,
        }
    }
}

/// One bounded page handed from the source collaborator to the fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePage {
    pub records: Vec<SourceRecord>,
    pub has_more: bool,
    /// Advisory pacing hint: the source is close to its limit and asks the
    /// caller to wait this long before the next request.
    pub slow_down: Option<Duration>,
    pub conversation: Option<ConversationInfo>,
}

impl SourcePage {
    pub fn max_message_id(&self) -> Option<MessageId> {
        self.records.iter().map(|record| record.message_id).max()
    }

    /// Sorts records ascending, drops anything at or below `after_id` and
    /// collapses repeated ids (first occurrence wins). Returns how many records
    /// were discarded.
    pub fn normalize(&mut self, after_id: MessageId) -> usize {
        let before = self.records.len();
        self.records.sort_by_key(|record| record.message_id);
        let mut seen = BTreeSet::new();
        self.records
            .retain(|record| record.message_id > after_id && seen.insert(record.message_id));
        before - self.records.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    Historical,
    Incremental,
}

impl IngestMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestMode::Historical => "historical",
            IngestMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestMode {
    type Err = ContractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "historical" => Ok(IngestMode::Historical),
            "incremental" => Ok(IngestMode::Incremental),
            other => Err(ContractError::UnknownVariant {
                kind: "ingest mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Backfill,
    Incremental,
    Retry,
    Verify,
    Analytics,
}

impl ProgressPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressPhase::Backfill => "backfill",
            ProgressPhase::Incremental => "incremental",
            ProgressPhase::Retry => "retry",
            ProgressPhase::Verify => "verify",
            ProgressPhase::Analytics => "analytics",
        }
    }
}

impl From<IngestMode> for ProgressPhase {
    fn from(mode: IngestMode) -> Self {
        match mode {
            IngestMode::Historical => ProgressPhase::Backfill,
            IngestMode::Incremental => ProgressPhase::Incremental,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    pub conversation_id: String,
    pub processed_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    pub ts: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        phase: ProgressPhase,
        conversation_id: impl Into<String>,
        processed_count: u64,
        total_count: Option<u64>,
    ) -> Self {
        Self {
            phase,
            conversation_id: conversation_id.into(),
            processed_count,
            total_count,
            ts: Utc::now(),
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self.total_count {
            Some(0) | None => None,
            Some(total) => Some((self.processed_count as f64 / total as f64 * 100.0).min(100.0)),
        }
    }
}
