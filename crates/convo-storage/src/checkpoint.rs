use crate::{format_ts, parse_timestamp, ChatStore, StorageError};
use chrono::{DateTime, Utc};
use convo_core::{IngestMode, MessageId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

/// Durable ingestion watermark for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub conversation_id: String,
    pub last_committed_message_id: MessageId,
    pub messages_processed_count: u64,
    pub last_run_at: DateTime<Utc>,
    pub mode: IngestMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCommit {
    pub conversation_id: String,
    /// Value the caller last observed; `None` asserts that no checkpoint exists.
    pub expected_last_id: Option<MessageId>,
    pub new_last_id: MessageId,
    pub delta_count: u64,
    pub mode: IngestMode,
    pub at: DateTime<Utc>,
}

impl ChatStore {
    pub fn checkpoint(&self, conversation_id: &str) -> Result<Option<Checkpoint>, StorageError> {
        read_checkpoint(&self.conn, conversation_id)
    }

    /// Standalone compare-and-swap, used when a commit carries no records
    /// (mode transitions, empty drains).
    pub fn commit_checkpoint(
        &mut self,
        commit: &CheckpointCommit,
    ) -> Result<Checkpoint, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let checkpoint = commit_in_tx(&tx, commit)?;
        tx.commit()?;
        Ok(checkpoint)
    }
}

/// Applies a checkpoint commit on an open transaction. The watermark never
/// moves backwards; a mismatch between `expected_last_id` and the stored
/// value is reported as `StaleCheckpoint` and leaves the row untouched.
pub(crate) fn commit_in_tx(
    conn: &Connection,
    commit: &CheckpointCommit,
) -> Result<Checkpoint, StorageError> {
    let new_last_id = commit
        .new_last_id
        .max(commit.expected_last_id.unwrap_or(0));
    let at = format_ts(commit.at);

    let changed = match commit.expected_last_id {
        None => conn.execute(
            "
            INSERT INTO ingestion_checkpoints (
                conversation_id,
                last_committed_message_id,
                messages_processed_count,
                last_run_at,
                mode
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(conversation_id) DO NOTHING
            ",
            params![
                commit.conversation_id,
                new_last_id,
                commit.delta_count as i64,
                at,
                commit.mode.as_str(),
            ],
        )?,
        Some(expected) => conn.execute(
            "
            UPDATE ingestion_checkpoints
            SET last_committed_message_id = ?3,
                messages_processed_count = messages_processed_count + ?4,
                last_run_at = ?5,
                mode = ?6
            WHERE conversation_id = ?1 AND last_committed_message_id = ?2
            ",
            params![
                commit.conversation_id,
                expected,
                new_last_id,
                commit.delta_count as i64,
                at,
                commit.mode.as_str(),
            ],
        )?,
    };

    let stored = read_checkpoint(conn, &commit.conversation_id)?;
    if changed == 0 {
        return Err(StorageError::StaleCheckpoint {
            conversation_id: commit.conversation_id.clone(),
            expected: commit.expected_last_id,
            found: stored.map(|checkpoint| checkpoint.last_committed_message_id),
        });
    }

    stored.ok_or_else(|| StorageError::StaleCheckpoint {
        conversation_id: commit.conversation_id.clone(),
        expected: commit.expected_last_id,
        found: None,
    })
}

fn read_checkpoint(
    conn: &Connection,
    conversation_id: &str,
) -> Result<Option<Checkpoint>, StorageError> {
    let row = conn
        .query_row(
            "
            SELECT conversation_id, last_committed_message_id, messages_processed_count,
                   last_run_at, mode
            FROM ingestion_checkpoints
            WHERE conversation_id = ?1
            ",
            [conversation_id],
            |row| {
                let mode: String = row.get(4)?;
                let mode = mode.parse::<IngestMode>().map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    mode,
                ))
            },
        )
        .optional()?;

    let Some((conversation_id, last_committed_message_id, count, last_run_at, mode)) = row else {
        return Ok(None);
    };

    Ok(Some(Checkpoint {
        conversation_id,
        last_committed_message_id,
        messages_processed_count: count as u64,
        last_run_at: parse_timestamp(last_run_at)?,
        mode,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, second)
            .single()
            .expect("valid timestamp")
    }

    fn commit(expected: Option<MessageId>, new_last_id: MessageId, delta: u64) -> CheckpointCommit {
        CheckpointCommit {
            conversation_id: "conv-1".to_string(),
            expected_last_id: expected,
            new_last_id,
            delta_count: delta,
            mode: IngestMode::Historical,
            at: ts(1),
        }
    }

    #[test]
    fn absent_checkpoint_reads_as_none() {
        let db = ChatStore::open_in_memory().expect("open db");
        assert!(db.checkpoint("conv-1").expect("read").is_none());
    }

    #[test]
    fn compare_and_swap_advances_and_accumulates() {
        let mut db = ChatStore::open_in_memory().expect("open db");

        let first = db.commit_checkpoint(&commit(None, 100, 100)).expect("create");
        assert_eq!(first.last_committed_message_id, 100);

        let mut next = commit(Some(100), 180, 80);
        next.mode = IngestMode::Incremental;
        next.at = ts(2);
        let second = db.commit_checkpoint(&next).expect("advance");

        assert_eq!(second.last_committed_message_id, 180);
        assert_eq!(second.messages_processed_count, 180);
        assert_eq!(second.mode, IngestMode::Incremental);
        assert_eq!(second.last_run_at, ts(2));
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut db = ChatStore::open_in_memory().expect("open db");
        db.commit_checkpoint(&commit(None, 50, 50)).expect("create");

        let stored = db
            .commit_checkpoint(&commit(Some(50), 20, 0))
            .expect("lower id commit");
        assert_eq!(stored.last_committed_message_id, 50);
    }

    #[test]
    fn mismatched_expectation_is_stale() {
        let mut db = ChatStore::open_in_memory().expect("open db");
        db.commit_checkpoint(&commit(None, 10, 10)).expect("create");

        let err = db
            .commit_checkpoint(&commit(None, 20, 10))
            .expect_err("second create is stale");
        assert!(matches!(
            err,
            StorageError::StaleCheckpoint {
                expected: None,
                found: Some(10),
                ..
            }
        ));

        let err = db
            .commit_checkpoint(&commit(Some(7), 20, 10))
            .expect_err("wrong expectation");
        assert!(err.is_stale_checkpoint());

        let stored = db.checkpoint("conv-1").expect("read").expect("exists");
        assert_eq!(stored.last_committed_message_id, 10);
        assert_eq!(stored.messages_processed_count, 10);
    }

    #[test]
    fn racing_connections_only_one_wins() {
        let file = NamedTempFile::new().expect("temp file");
        let mut left = ChatStore::open(file.path()).expect("open left");
        let mut right = ChatStore::open(file.path()).expect("open right");

        left.commit_checkpoint(&commit(None, 5, 5)).expect("seed");

        let observed_left = left.checkpoint("conv-1").expect("read").expect("exists");
        let observed_right = right.checkpoint("conv-1").expect("read").expect("exists");

        left.commit_checkpoint(&commit(
            Some(observed_left.last_committed_message_id),
            9,
            4,
        ))
        .expect("left wins");
        let err = right
            .commit_checkpoint(&commit(
                Some(observed_right.last_committed_message_id),
                12,
                7,
            ))
            .expect_err("right is stale");
        assert!(err.is_stale_checkpoint());

        let stored = right.checkpoint("conv-1").expect("read").expect("exists");
        assert_eq!(stored.last_committed_message_id, 9);
        assert_eq!(stored.messages_processed_count, 9);
    }
}
