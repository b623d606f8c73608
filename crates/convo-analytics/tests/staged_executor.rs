use chrono::{DateTime, Duration, TimeZone, Utc};
use convo_analytics::{
    default_catalog, AnalyticsConfig, Metric, MetricError, PhaseInput, StagedExecutor,
};
use convo_core::{
    ConversationInfo, IngestMode, MetricCategory, MetricValue, ProgressEvent, ProgressPhase,
    RunStatus, SourceRecord,
};
use convo_storage::{ChatStore, PageWrite};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn ts(day: i64, minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::days(day)
        + Duration::minutes(minute)
}

fn record(message_id: i64, author_id: i64, at: DateTime<Utc>, text: &str) -> SourceRecord {
    SourceRecord {
        message_id,
        author_id,
        author_username: Some(format!("user{author_id}")),
        author_name: None,
        text: text.to_string(),
        ts: at,
        reply_to_id: (message_id % 3 == 0).then_some(message_id - 1),
    }
}

/// One author posting twelve messages over ten days.
fn single_author_store() -> ChatStore {
    let records: Vec<SourceRecord> = (0..12)
        .map(|index| {
            let text = if index % 4 == 0 {
                "anyone around?"
            } else {
                "status update"
            };
            record(index + 1, 1, ts(index.min(9), index * 5), text)
        })
        .collect();
    seeded(&records, None)
}

fn seeded(records: &[SourceRecord], participants: Option<i64>) -> ChatStore {
    let mut store = ChatStore::open_in_memory().expect("open db");
    store
        .commit_page(&PageWrite {
            conversation_id: "conv-1",
            platform: "test",
            expected_last_id: None,
            mode: IngestMode::Historical,
            records,
            committed_at: Utc::now(),
        })
        .expect("seed messages");
    if participants.is_some() {
        store
            .upsert_conversation(
                &ConversationInfo {
                    participants_count: participants,
                    title: Some("Team room".to_string()),
                    ..ConversationInfo::bare("conv-1", "test")
                },
                Utc::now(),
            )
            .expect("conversation info");
    }
    store
}

struct ExplodingUserMetric;

impl Metric for ExplodingUserMetric {
    fn name(&self) -> &'static str {
        "user_reply_ratio"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::User
    }

    fn compute(&self, _input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        panic!("reply ratio divided by zero");
    }
}

struct RejectingChatMetric;

impl Metric for RejectingChatMetric {
    fn name(&self) -> &'static str {
        "chat_sentiment"
    }

    fn category(&self) -> MetricCategory {
        MetricCategory::Chat
    }

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError> {
        input
            .user_context
            .as_ref()
            .ok_or(MetricError::MissingContext("user"))?;
        Err(MetricError::Failed("sentiment provider offline".to_string()))
    }
}

#[tokio::test]
async fn failing_user_metric_keeps_sibling_results_and_fails_the_run() {
    let mut catalog = default_catalog();
    catalog.push(Arc::new(ExplodingUserMetric));
    let mut executor =
        StagedExecutor::new(single_author_store(), catalog, AnalyticsConfig::default());

    let report = executor.run("conv-1").await.expect("run");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name, "user_reply_ratio");
    assert!(matches!(report.failures[0].error, MetricError::Panicked(_)));

    let store = executor.store();
    assert_eq!(
        store
            .metric_result_count(&report.run_id, Some(MetricCategory::User))
            .expect("count"),
        4
    );
    assert!(
        store
            .metric_result_count(&report.run_id, Some(MetricCategory::Chat))
            .expect("count")
            > 0
    );

    let phases = store.phases_for_run(&report.run_id).expect("phases");
    let categories: Vec<_> = phases.iter().map(|phase| phase.category).collect();
    assert_eq!(categories, MetricCategory::ORDERED.to_vec());
    assert_eq!((phases[1].succeeded, phases[1].failed), (4, 1));
    assert_eq!(phases[1].results_written, 4);

    let run = store
        .analytics_run(&report.run_id)
        .expect("read run")
        .expect("run row");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.messages_analyzed, 12);
    assert_eq!(run.users_analyzed, 1);
    let detail = run.error_detail.expect("error detail");
    assert_eq!(detail["failed_metrics"][0]["metric"], json!("user_reply_ratio"));
    assert_eq!(detail["failed_metrics"][0]["category"], json!("user"));
}

#[tokio::test]
async fn chat_metrics_receive_the_published_user_context() {
    let mut catalog = default_catalog();
    catalog.push(Arc::new(RejectingChatMetric));
    let mut executor =
        StagedExecutor::new(single_author_store(), catalog, AnalyticsConfig::default());

    let report = executor.run("conv-1").await.expect("run");

    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        report.failures[0].error,
        MetricError::Failed("sentiment provider offline".to_string())
    );
    assert_eq!(report.phases[2].succeeded, 4);
}

#[tokio::test]
async fn staged_chat_results_equal_inline_computation() {
    let mut records = Vec::new();
    for index in 0..40 {
        let author = index % 4 + 1;
        let text = match index % 5 {
            0 => "what time is the review?",
            1 => "LGTM SHIP IT",
            2 => "looks good!",
            _ => "noted",
        };
        records.push(record(index + 1, author, ts(index / 6, index * 7), text));
    }
    let store = seeded(&records, Some(10));
    let mut executor = StagedExecutor::new(
        store,
        default_catalog(),
        AnalyticsConfig { max_workers: 2 },
    );

    let report = executor.run("conv-1").await.expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.users_analyzed, 4);

    let store = executor.into_store();
    let stored = store.metric_results(&report.run_id).expect("results");
    let inline_input = PhaseInput::load(&store, "conv-1").expect("load input");
    assert!(inline_input.user_context.is_none());

    for metric in default_catalog()
        .into_iter()
        .filter(|metric| metric.category() == MetricCategory::Chat)
    {
        let inline = metric.compute(&inline_input).expect("inline compute");
        let persisted: Vec<_> = stored
            .iter()
            .filter(|result| result.metric_name == metric.name())
            .collect();
        assert_eq!(persisted.len(), inline.len(), "{}", metric.name());
        for (persisted, inline) in persisted.iter().zip(&inline) {
            assert_eq!(persisted.value, inline.value, "{}", metric.name());
            assert_eq!(persisted.detail, inline.detail, "{}", metric.name());
        }
    }

    let participation = stored
        .iter()
        .find(|result| result.metric_name == "participation_rate")
        .expect("participation row");
    assert_eq!(participation.value, 40.0);

    let run = store
        .analytics_run(&report.run_id)
        .expect("read run")
        .expect("run row");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.error_detail.is_none());
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn empty_conversation_completes_without_results() {
    let store = ChatStore::open_in_memory().expect("open db");
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    let mut executor = StagedExecutor::new(store, default_catalog(), AnalyticsConfig::default())
        .with_progress(move |event| {
            if let Ok(mut events) = sink.lock() {
                events.push(event.clone());
            }
        });

    let report = executor.run("nobody-here").await.expect("run");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.messages_analyzed, 0);
    assert!(report.phases[..2]
        .iter()
        .all(|phase| phase.results_written == 0));
    assert_eq!(
        executor
            .store()
            .metric_result_count(&report.run_id, Some(MetricCategory::Message))
            .expect("count"),
        0
    );

    let events = events.lock().expect("events").clone();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|event| event.phase == ProgressPhase::Analytics));
    assert_eq!(events[2].percent(), Some(100.0));
}
