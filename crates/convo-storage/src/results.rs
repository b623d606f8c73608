//! Analytics run ledger, per-phase ledger and append-only metric results.

use crate::{format_ts, parse_timestamp, ChatStore, StorageError};
use chrono::{DateTime, Utc};
use convo_core::{MetricCategory, MetricValue, RunStatus};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsRunRecord {
    pub run_id: String,
    pub conversation_id: String,
    pub status: RunStatus,
    pub messages_analyzed: i64,
    pub users_analyzed: i64,
    pub error_detail: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub run_id: String,
    pub category: MetricCategory,
    pub succeeded: u32,
    pub failed: u32,
    pub results_written: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMetricResult {
    pub run_id: String,
    pub category: MetricCategory,
    pub subject: Option<String>,
    pub metric_name: String,
    pub value: f64,
    pub detail: Value,
    pub computed_at: DateTime<Utc>,
}

impl ChatStore {
    pub fn create_analytics_run(
        &self,
        run_id: &str,
        conversation_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO analytics_runs (run_id, conversation_id, status, started_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                run_id,
                conversation_id,
                RunStatus::Running.as_str(),
                format_ts(started_at),
            ],
        )?;
        Ok(())
    }

    pub fn finish_analytics_run(
        &self,
        run_id: &str,
        status: RunStatus,
        messages_analyzed: i64,
        users_analyzed: i64,
        error_detail: Option<&Value>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let error_json = error_detail
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let changed = self.conn.execute(
            "
            UPDATE analytics_runs
            SET status = ?2,
                messages_analyzed = ?3,
                users_analyzed = ?4,
                error_detail = ?5,
                finished_at = ?6
            WHERE run_id = ?1
            ",
            params![
                run_id,
                status.as_str(),
                messages_analyzed,
                users_analyzed,
                error_json,
                format_ts(finished_at),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::UnknownRun(run_id.to_string()));
        }
        Ok(())
    }

    pub fn analytics_run(&self, run_id: &str) -> Result<Option<AnalyticsRunRecord>, StorageError> {
        self.query_analytics_run(
            "
            SELECT run_id, conversation_id, status, messages_analyzed, users_analyzed,
                   error_detail, started_at, finished_at
            FROM analytics_runs
            WHERE run_id = ?1
            ",
            run_id,
        )
    }

    pub fn latest_analytics_run(
        &self,
        conversation_id: &str,
    ) -> Result<Option<AnalyticsRunRecord>, StorageError> {
        self.query_analytics_run(
            "
            SELECT run_id, conversation_id, status, messages_analyzed, users_analyzed,
                   error_detail, started_at, finished_at
            FROM analytics_runs
            WHERE conversation_id = ?1
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            ",
            conversation_id,
        )
    }

    fn query_analytics_run(
        &self,
        sql: &str,
        key: &str,
    ) -> Result<Option<AnalyticsRunRecord>, StorageError> {
        let row = self
            .conn
            .query_row(sql, [key], |row| {
                let status: String = row.get(2)?;
                let status = status.parse::<RunStatus>().map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    status,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .optional()?;

        let Some((
            run_id,
            conversation_id,
            status,
            messages_analyzed,
            users_analyzed,
            error_json,
            started_at,
            finished_at,
        )) = row
        else {
            return Ok(None);
        };

        let error_detail = error_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        Ok(Some(AnalyticsRunRecord {
            run_id,
            conversation_id,
            status,
            messages_analyzed,
            users_analyzed,
            error_detail,
            started_at: parse_timestamp(started_at)?,
            finished_at: finished_at.map(parse_timestamp).transpose()?,
        }))
    }

    /// Persists one phase's successful values and its ledger row atomically,
    /// so a later phase only ever starts after these writes are durable.
    pub fn record_phase(
        &mut self,
        phase: &PhaseRecord,
        values: &[MetricValue],
        computed_at: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let computed_at = format_ts(computed_at);

        {
            let mut insert = tx.prepare_cached(
                "
                INSERT INTO metric_results (
                    run_id, category, subject, metric_name, value, detail_json, computed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
            )?;
            for value in values {
                let detail_json = serde_json::to_string(&value.detail)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                insert.execute(params![
                    phase.run_id,
                    phase.category.as_str(),
                    value.subject,
                    value.name,
                    value.value,
                    detail_json,
                    computed_at,
                ])?;
            }
        }

        tx.execute(
            "
            INSERT INTO analytics_phases (
                run_id, category, succeeded, failed, results_written, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                phase.run_id,
                phase.category.as_str(),
                phase.succeeded,
                phase.failed,
                values.len() as i64,
                format_ts(phase.started_at),
                format_ts(phase.finished_at),
            ],
        )?;
        tx.commit()?;

        Ok(values.len())
    }

    pub fn phases_for_run(&self, run_id: &str) -> Result<Vec<PhaseRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT run_id, category, succeeded, failed, results_written, started_at, finished_at
            FROM analytics_phases
            WHERE run_id = ?1
            ORDER BY started_at ASC, rowid ASC
            ",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            let category: String = row.get(1)?;
            let category = category.parse::<MetricCategory>().map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok((
                row.get::<_, String>(0)?,
                category,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut phases = Vec::new();
        for row in rows {
            let (run_id, category, succeeded, failed, results_written, started, finished) = row?;
            phases.push(PhaseRecord {
                run_id,
                category,
                succeeded,
                failed,
                results_written,
                started_at: parse_timestamp(started)?,
                finished_at: parse_timestamp(finished)?,
            });
        }
        Ok(phases)
    }

    pub fn metric_results(&self, run_id: &str) -> Result<Vec<StoredMetricResult>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT run_id, category, subject, metric_name, value, detail_json, computed_at
            FROM metric_results
            WHERE run_id = ?1
            ORDER BY result_id ASC
            ",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            let category: String = row.get(1)?;
            let category = category.parse::<MetricCategory>().map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok((
                row.get::<_, String>(0)?,
                category,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (run_id, category, subject, metric_name, value, detail_json, computed_at) = row?;
            results.push(StoredMetricResult {
                run_id,
                category,
                subject,
                metric_name,
                value,
                detail: serde_json::from_str(&detail_json)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
                computed_at: parse_timestamp(computed_at)?,
            });
        }
        Ok(results)
    }

    pub fn metric_result_count(
        &self,
        run_id: &str,
        category: Option<MetricCategory>,
    ) -> Result<i64, StorageError> {
        let count = match category {
            Some(category) => self.conn.query_row(
                "SELECT COUNT(*) FROM metric_results WHERE run_id = ?1 AND category = ?2",
                params![run_id, category.as_str()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM metric_results WHERE run_id = ?1",
                [run_id],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 5, 12, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn run_lifecycle_records_failure_detail() {
        let db = ChatStore::open_in_memory().expect("open db");
        db.create_analytics_run("run-1", "conv-1", ts(0))
            .expect("create run");

        let running = db.analytics_run("run-1").expect("read").expect("exists");
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.finished_at.is_none());

        let detail = json!({"failed_metrics": [{"phase": "user", "metric": "user_activity"}]});
        db.finish_analytics_run("run-1", RunStatus::Failed, 120, 6, Some(&detail), ts(3))
            .expect("finish run");

        let finished = db
            .latest_analytics_run("conv-1")
            .expect("read")
            .expect("exists");
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.messages_analyzed, 120);
        assert_eq!(finished.users_analyzed, 6);
        assert_eq!(finished.error_detail, Some(detail));
        assert_eq!(finished.finished_at, Some(ts(3)));
    }

    #[test]
    fn finishing_unknown_run_errors() {
        let db = ChatStore::open_in_memory().expect("open db");
        let err = db
            .finish_analytics_run("missing", RunStatus::Completed, 0, 0, None, ts(0))
            .expect_err("unknown run");
        assert!(matches!(err, StorageError::UnknownRun(_)));
    }

    #[test]
    fn phase_results_append_per_run() {
        let mut db = ChatStore::open_in_memory().expect("open db");
        db.create_analytics_run("run-1", "conv-1", ts(0))
            .expect("create run");

        let values = vec![
            MetricValue::for_subject("10", "user_activity", 4.0, json!({"avg_length": 12.5})),
            MetricValue::for_subject("11", "user_activity", 2.0, json!({"avg_length": 3.0})),
        ];
        let phase = PhaseRecord {
            run_id: "run-1".to_string(),
            category: MetricCategory::User,
            succeeded: 1,
            failed: 1,
            results_written: 2,
            started_at: ts(1),
            finished_at: ts(2),
        };
        let written = db.record_phase(&phase, &values, ts(2)).expect("record");
        assert_eq!(written, 2);

        assert_eq!(
            db.metric_result_count("run-1", Some(MetricCategory::User))
                .expect("count"),
            2
        );
        assert_eq!(
            db.metric_result_count("run-1", Some(MetricCategory::Chat))
                .expect("count"),
            0
        );

        let stored = db.metric_results("run-1").expect("results");
        assert_eq!(stored[0].subject.as_deref(), Some("10"));
        assert_eq!(stored[0].detail, json!({"avg_length": 12.5}));
        assert_eq!(db.phases_for_run("run-1").expect("phases"), vec![phase]);
    }
}
