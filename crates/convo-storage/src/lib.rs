pub mod checkpoint;
pub mod results;

pub use checkpoint::{Checkpoint, CheckpointCommit};
pub use results::{AnalyticsRunRecord, PhaseRecord, StoredMetricResult};

use chrono::{DateTime, SecondsFormat, Utc};
use convo_core::{ConversationInfo, IngestMode, MessageId, SourceRecord};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const CONVO_SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error(
        "stale checkpoint for {conversation_id}: expected {expected:?}, found {found:?}"
    )]
    StaleCheckpoint {
        conversation_id: String,
        expected: Option<MessageId>,
        found: Option<MessageId>,
    },
    #[error("unknown analytics run {0}")]
    UnknownRun(String),
}

impl StorageError {
    pub fn is_stale_checkpoint(&self) -> bool {
        matches!(self, StorageError::StaleCheckpoint { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConversation {
    pub conversation_id: String,
    pub platform: String,
    pub title: Option<String>,
    pub kind: Option<String>,
    pub participants_count: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub conversation_id: String,
    pub message_id: MessageId,
    pub author_id: i64,
    pub text: String,
    pub ts: DateTime<Utc>,
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub conversation_id: String,
    pub user_id: i64,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub message_count: i64,
}

/// A page handed to the store for one atomic insert + checkpoint advance.
#[derive(Debug, Clone)]
pub struct PageWrite<'a> {
    pub conversation_id: &'a str,
    pub platform: &'a str,
    /// Watermark the caller read before fetching; `None` when no checkpoint
    /// existed yet.
    pub expected_last_id: Option<MessageId>,
    pub mode: IngestMode,
    pub records: &'a [SourceRecord],
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCommitOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    /// Ids that were new to the store, in page order.
    pub inserted_ids: Vec<MessageId>,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionRunRecord {
    pub run_id: String,
    pub conversation_id: String,
    pub mode: IngestMode,
    pub start_after_id: MessageId,
    pub end_message_id: Option<MessageId>,
    pub messages_processed: u64,
    pub pages: u64,
    pub status: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageAnnotation {
    pub conversation_id: String,
    pub message_id: MessageId,
    pub provider: String,
    pub input_hash: String,
    pub annotation: Value,
    pub created_at: DateTime<Utc>,
}

pub struct ChatStore {
    conn: Connection,
}

impl ChatStore {
    /// Opens (and migrates) an on-disk store. Each pipeline opens its own
    /// connection; WAL plus a busy timeout lets them share the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(event = "store_open", journal_mode = %journal);
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > CONVO_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CONVO_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_convo_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_analytics_results.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn upsert_conversation(
        &self,
        info: &ConversationInfo,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let seen_at = format_ts(seen_at);
        self.conn.execute(
            "
            INSERT INTO conversations (
                conversation_id,
                platform,
                title,
                kind,
                participants_count,
                first_seen_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(conversation_id) DO UPDATE SET
                title=COALESCE(excluded.title, conversations.title),
                kind=COALESCE(excluded.kind, conversations.kind),
                participants_count=COALESCE(excluded.participants_count, conversations.participants_count),
                updated_at=excluded.updated_at
            ",
            params![
                info.conversation_id,
                info.platform,
                info.title,
                info.kind,
                info.participants_count,
                seen_at,
            ],
        )?;
        Ok(())
    }

    pub fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<StoredConversation>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT conversation_id, platform, title, kind, participants_count,
                       first_seen_at, updated_at
                FROM conversations
                WHERE conversation_id = ?1
                ",
                [conversation_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((conversation_id, platform, title, kind, participants_count, first, updated)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(StoredConversation {
            conversation_id,
            platform,
            title,
            kind,
            participants_count,
            first_seen_at: parse_timestamp(first)?,
            updated_at: parse_timestamp(updated)?,
        }))
    }

    /// Inserts a page and advances the checkpoint in a single immediate
    /// transaction. Already-stored ids are skipped and do not count toward
    /// `messages_processed_count`. A checkpoint that moved since the caller
    /// read it rolls the whole page back with `StaleCheckpoint`.
    pub fn commit_page(&mut self, write: &PageWrite<'_>) -> Result<PageCommitOutcome, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let committed_at = format_ts(write.committed_at);

        tx.execute(
            "
            INSERT OR IGNORE INTO conversations (
                conversation_id, platform, first_seen_at, updated_at
            ) VALUES (?1, ?2, ?3, ?3)
            ",
            params![write.conversation_id, write.platform, committed_at],
        )?;

        let inserted_ids =
            insert_records(&tx, write.conversation_id, write.records, &committed_at)?;
        let inserted = inserted_ids.len();

        let page_max = write.records.iter().map(|record| record.message_id).max();
        let prior = write.expected_last_id.unwrap_or(0);
        let new_last_id = page_max.map_or(prior, |max| max.max(prior));

        let checkpoint = checkpoint::commit_in_tx(
            &tx,
            &CheckpointCommit {
                conversation_id: write.conversation_id.to_string(),
                expected_last_id: write.expected_last_id,
                new_last_id,
                delta_count: inserted as u64,
                mode: write.mode,
                at: write.committed_at,
            },
        )?;

        tx.commit()?;

        Ok(PageCommitOutcome {
            inserted,
            duplicates: write.records.len() - inserted,
            inserted_ids,
            checkpoint,
        })
    }

    /// Stores records found missing by completeness verification. The
    /// watermark is left alone; only the processed count grows.
    pub fn backfill_missing(
        &mut self,
        conversation_id: &str,
        platform: &str,
        records: &[SourceRecord],
        at: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let at = format_ts(at);

        tx.execute(
            "
            INSERT OR IGNORE INTO conversations (
                conversation_id, platform, first_seen_at, updated_at
            ) VALUES (?1, ?2, ?3, ?3)
            ",
            params![conversation_id, platform, at],
        )?;
        let inserted = insert_records(&tx, conversation_id, records, &at)?.len();
        tx.execute(
            "
            UPDATE ingestion_checkpoints
            SET messages_processed_count = messages_processed_count + ?2
            WHERE conversation_id = ?1
            ",
            params![conversation_id, inserted as i64],
        )?;
        tx.commit()?;

        Ok(inserted)
    }

    pub fn message_count(&self, conversation_id: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?)
    }

    pub fn has_message(
        &self,
        conversation_id: &str,
        message_id: MessageId,
    ) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM messages WHERE conversation_id = ?1 AND message_id = ?2",
                params![conversation_id, message_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn message(
        &self,
        conversation_id: &str,
        message_id: MessageId,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT conversation_id, message_id, author_id, text, ts, reply_to_id
                FROM messages
                WHERE conversation_id = ?1 AND message_id = ?2
                ",
                params![conversation_id, message_id],
                map_message_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Ids stored for `conversation_id` with `from <= ts <= to`.
    pub fn message_ids_between(
        &self,
        conversation_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeSet<MessageId>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT message_id
            FROM messages
            WHERE conversation_id = ?1 AND ts >= ?2 AND ts <= ?3
            ",
        )?;
        let rows = stmt.query_map(
            params![conversation_id, format_ts(from), format_ts(to)],
            |row| row.get::<_, i64>(0),
        )?;

        let mut ids = BTreeSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    /// Streams stored messages in id order without materializing the whole
    /// conversation.
    pub fn for_each_message<F>(&self, conversation_id: &str, mut visit: F) -> Result<usize, StorageError>
    where
        F: FnMut(StoredMessage),
    {
        let mut stmt = self.conn.prepare(
            "
            SELECT conversation_id, message_id, author_id, text, ts, reply_to_id
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY message_id ASC
            ",
        )?;
        let rows = stmt.query_map([conversation_id], map_message_row)?;

        let mut visited = 0;
        for row in rows {
            visit(row?);
            visited += 1;
        }
        Ok(visited)
    }

    pub fn latest_message_ts(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(ts) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        latest.map(parse_timestamp).transpose()
    }

    pub fn users(&self, conversation_id: &str) -> Result<Vec<StoredUser>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT conversation_id, user_id, username, display_name,
                   first_seen_at, last_seen_at, message_count
            FROM users
            WHERE conversation_id = ?1
            ORDER BY user_id ASC
            ",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut users = Vec::new();
        for row in rows {
            let (conversation_id, user_id, username, display_name, first, last, message_count) =
                row?;
            users.push(StoredUser {
                conversation_id,
                user_id,
                username,
                display_name,
                first_seen_at: parse_timestamp(first)?,
                last_seen_at: parse_timestamp(last)?,
                message_count,
            });
        }
        Ok(users)
    }

    pub fn begin_ingestion_run(
        &self,
        run_id: &str,
        conversation_id: &str,
        mode: IngestMode,
        start_after_id: MessageId,
        started_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO ingestion_runs (
                run_id, conversation_id, mode, start_after_id, status, started_at
            ) VALUES (?1, ?2, ?3, ?4, 'running', ?5)
            ",
            params![
                run_id,
                conversation_id,
                mode.as_str(),
                start_after_id,
                format_ts(started_at),
            ],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finish_ingestion_run(
        &self,
        run_id: &str,
        status: &str,
        end_message_id: Option<MessageId>,
        messages_processed: u64,
        pages: u64,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE ingestion_runs
            SET status = ?2,
                end_message_id = ?3,
                messages_processed = ?4,
                pages = ?5,
                error = ?6,
                finished_at = ?7
            WHERE run_id = ?1
            ",
            params![
                run_id,
                status,
                end_message_id,
                messages_processed as i64,
                pages as i64,
                error,
                format_ts(finished_at),
            ],
        )?;
        Ok(())
    }

    pub fn ingestion_runs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<IngestionRunRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT run_id, conversation_id, mode, start_after_id, end_message_id,
                   messages_processed, pages, status, error, started_at, finished_at
            FROM ingestion_runs
            WHERE conversation_id = ?1
            ORDER BY started_at ASC, rowid ASC
            ",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            let mode: String = row.get(2)?;
            let mode = mode.parse::<IngestMode>().map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                mode,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (
                run_id,
                conversation_id,
                mode,
                start_after_id,
                end_message_id,
                messages_processed,
                pages,
                status,
                error,
                started_at,
                finished_at,
            ) = row?;
            runs.push(IngestionRunRecord {
                run_id,
                conversation_id,
                mode,
                start_after_id,
                end_message_id,
                messages_processed: messages_processed as u64,
                pages: pages as u64,
                status,
                error,
                started_at: parse_timestamp(started_at)?,
                finished_at: finished_at.map(parse_timestamp).transpose()?,
            });
        }
        Ok(runs)
    }

    /// Returns false when an annotation from the same provider already exists
    /// for the message.
    pub fn insert_annotation(&self, annotation: &MessageAnnotation) -> Result<bool, StorageError> {
        let annotation_json = serde_json::to_string(&annotation.annotation)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let inserted = self.conn.execute(
            "
            INSERT OR IGNORE INTO message_annotations (
                conversation_id, message_id, provider, input_hash, annotation_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                annotation.conversation_id,
                annotation.message_id,
                annotation.provider,
                annotation.input_hash,
                annotation_json,
                format_ts(annotation.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn annotations_for_message(
        &self,
        conversation_id: &str,
        message_id: MessageId,
    ) -> Result<Vec<MessageAnnotation>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT conversation_id, message_id, provider, input_hash, annotation_json, created_at
            FROM message_annotations
            WHERE conversation_id = ?1 AND message_id = ?2
            ORDER BY provider ASC
            ",
        )?;
        let rows = stmt.query_map(params![conversation_id, message_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut annotations = Vec::new();
        for row in rows {
            let (conversation_id, message_id, provider, input_hash, json, created_at) = row?;
            annotations.push(MessageAnnotation {
                conversation_id,
                message_id,
                provider,
                input_hash,
                annotation: serde_json::from_str(&json)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
                created_at: parse_timestamp(created_at)?,
            });
        }
        Ok(annotations)
    }

    pub fn annotation_count(&self, conversation_id: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM message_annotations WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

/// Inserts records with `INSERT OR IGNORE` and refreshes author rows only for
/// the records that were actually new.
fn insert_records(
    tx: &rusqlite::Transaction<'_>,
    conversation_id: &str,
    records: &[SourceRecord],
    ingested_at: &str,
) -> Result<Vec<MessageId>, StorageError> {
    let mut insert_message = tx.prepare_cached(
        "
        INSERT OR IGNORE INTO messages (
            conversation_id, message_id, author_id, text, ts, reply_to_id, ingested_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
    )?;
    let mut upsert_user = tx.prepare_cached(
        "
        INSERT INTO users (
            conversation_id, user_id, username, display_name,
            first_seen_at, last_seen_at, message_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)
        ON CONFLICT(conversation_id, user_id) DO UPDATE SET
            username=COALESCE(excluded.username, users.username),
            display_name=COALESCE(excluded.display_name, users.display_name),
            first_seen_at=MIN(users.first_seen_at, excluded.first_seen_at),
            last_seen_at=MAX(users.last_seen_at, excluded.last_seen_at),
            message_count=users.message_count + 1
        ",
    )?;

    let mut inserted = Vec::new();
    for record in records {
        let ts = format_ts(record.ts);
        let changed = insert_message.execute(params![
            conversation_id,
            record.message_id,
            record.author_id,
            record.text,
            ts,
            record.reply_to_id,
            ingested_at,
        ])?;
        if changed == 0 {
            continue;
        }
        inserted.push(record.message_id);
        upsert_user.execute(params![
            conversation_id,
            record.author_id,
            record.author_username,
            record.author_name,
            ts,
        ])?;
    }
    Ok(inserted)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let ts: String = row.get(4)?;
    let ts = DateTime::parse_from_rfc3339(&ts)
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
        })?
        .with_timezone(&Utc);

    Ok(StoredMessage {
        conversation_id: row.get(0)?,
        message_id: row.get(1)?,
        author_id: row.get(2)?,
        text: row.get(3)?,
        ts,
        reply_to_id: row.get(5)?,
    })
}

/// Fixed-width UTC rendering so stored timestamps compare lexicographically.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
