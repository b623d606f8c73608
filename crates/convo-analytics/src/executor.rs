use crate::context::{MessageContext, UserContext};
use crate::facts::PhaseInput;
use crate::metric::{Metric, MetricError};
use crate::AnalyticsError;
use chrono::Utc;
use convo_core::{MetricCategory, MetricValue, ProgressEvent, ProgressPhase, RunStatus};
use convo_storage::{ChatStore, PhaseRecord};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyticsConfig {
    /// Metrics of one phase computed at the same time.
    pub max_workers: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMetric {
    pub category: MetricCategory,
    pub name: String,
    pub error: MetricError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSummary {
    pub category: MetricCategory,
    pub succeeded: u32,
    pub failed: u32,
    pub results_written: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsReport {
    pub run_id: String,
    pub conversation_id: String,
    pub status: RunStatus,
    pub messages_analyzed: usize,
    pub users_analyzed: usize,
    pub phases: Vec<PhaseSummary>,
    pub failures: Vec<FailedMetric>,
}

type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Runs the message, user and chat phases in order over one conversation.
/// Metrics inside a phase run concurrently; a failing metric is recorded and
/// its siblings carry on.
pub struct StagedExecutor {
    store: ChatStore,
    catalog: Vec<Arc<dyn Metric>>,
    config: AnalyticsConfig,
    progress: Option<ProgressCallback>,
}

struct MetricOutcome {
    name: &'static str,
    result: Result<Vec<MetricValue>, MetricError>,
}

impl StagedExecutor {
    pub fn new(store: ChatStore, catalog: Vec<Arc<dyn Metric>>, config: AnalyticsConfig) -> Self {
        Self {
            store,
            catalog,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn into_store(self) -> ChatStore {
        self.store
    }

    pub async fn run(&mut self, conversation_id: &str) -> Result<AnalyticsReport, AnalyticsError> {
        let run_id = Uuid::new_v4().to_string();
        self.store
            .create_analytics_run(&run_id, conversation_id, Utc::now())?;
        info!(event = "analytics_started", conversation_id, run_id = %run_id);

        match self.execute(&run_id, conversation_id).await {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(event = "analytics_aborted", conversation_id, run_id = %run_id, error = %err);
                let detail = json!({"aborted": err.to_string()});
                if let Err(ledger_err) = self.store.finish_analytics_run(
                    &run_id,
                    RunStatus::Failed,
                    0,
                    0,
                    Some(&detail),
                    Utc::now(),
                ) {
                    warn!(event = "analytics_ledger_failed", run_id = %run_id, error = %ledger_err);
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &mut self,
        run_id: &str,
        conversation_id: &str,
    ) -> Result<AnalyticsReport, AnalyticsError> {
        let mut input = PhaseInput::load(&self.store, conversation_id)?;
        let messages_analyzed = input.facts.len();
        let users_analyzed = input.distinct_authors();

        let mut phases = Vec::with_capacity(MetricCategory::ORDERED.len());
        let mut failures = Vec::new();

        for (index, category) in MetricCategory::ORDERED.into_iter().enumerate() {
            let metrics: Vec<Arc<dyn Metric>> = self
                .catalog
                .iter()
                .filter(|metric| metric.category() == category)
                .cloned()
                .collect();

            let started_at = Utc::now();
            let outcomes =
                run_phase(self.config.max_workers, Arc::new(input.clone()), metrics).await;

            let mut values = Vec::new();
            let mut succeeded = 0u32;
            let mut failed = 0u32;
            for outcome in outcomes {
                match outcome.result {
                    Ok(mut produced) => {
                        succeeded += 1;
                        values.append(&mut produced);
                    }
                    Err(error) => {
                        failed += 1;
                        warn!(
                            event = "metric_failed",
                            conversation_id,
                            category = category.as_str(),
                            metric = outcome.name,
                            error = %error
                        );
                        failures.push(FailedMetric {
                            category,
                            name: outcome.name.to_string(),
                            error,
                        });
                    }
                }
            }

            // Durable before the next phase reads its context.
            let phase = PhaseRecord {
                run_id: run_id.to_string(),
                category,
                succeeded,
                failed,
                results_written: u32::try_from(values.len()).unwrap_or(u32::MAX),
                started_at,
                finished_at: Utc::now(),
            };
            self.store.record_phase(&phase, &values, Utc::now())?;
            info!(
                event = "analytics_phase_finished",
                conversation_id,
                category = category.as_str(),
                succeeded,
                failed,
                results = values.len()
            );
            phases.push(PhaseSummary {
                category,
                succeeded,
                failed,
                results_written: phase.results_written,
            });
            self.emit(conversation_id, index as u64 + 1);

            match category {
                MetricCategory::Message => {
                    input.message_context = Some(Arc::new(MessageContext::derive(&input.facts)));
                }
                MetricCategory::User => {
                    input.user_context = Some(Arc::new(UserContext::derive(
                        &input.facts,
                        input.message_context.as_deref(),
                    )));
                }
                MetricCategory::Chat => {}
            }
        }

        let status = if failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let detail = (!failures.is_empty()).then(|| failure_detail(&failures));
        self.store.finish_analytics_run(
            run_id,
            status,
            i64::try_from(messages_analyzed).unwrap_or(i64::MAX),
            i64::try_from(users_analyzed).unwrap_or(i64::MAX),
            detail.as_ref(),
            Utc::now(),
        )?;
        info!(
            event = "analytics_finished",
            conversation_id,
            run_id,
            status = status.as_str(),
            failed_metrics = failures.len()
        );

        Ok(AnalyticsReport {
            run_id: run_id.to_string(),
            conversation_id: conversation_id.to_string(),
            status,
            messages_analyzed,
            users_analyzed,
            phases,
            failures,
        })
    }

    fn emit(&self, conversation_id: &str, phases_done: u64) {
        if let Some(progress) = self.progress.as_ref() {
            progress(&ProgressEvent::new(
                ProgressPhase::Analytics,
                conversation_id,
                phases_done,
                Some(MetricCategory::ORDERED.len() as u64),
            ));
        }
    }
}

/// Outcomes come back in catalog order.
async fn run_phase(
    max_workers: usize,
    input: Arc<PhaseInput>,
    metrics: Vec<Arc<dyn Metric>>,
) -> Vec<MetricOutcome> {
    let permits = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut tasks = JoinSet::new();

    for (index, metric) in metrics.iter().enumerate() {
        let metric = Arc::clone(metric);
        let input = Arc::clone(&input);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => return (index, Err(MetricError::Failed(err.to_string()))),
            };
            let computed =
                tokio::task::spawn_blocking(move || metric.compute(&input)).await;
            let result = match computed {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(MetricError::Panicked(panic_message(err.into_panic())))
                }
                Err(err) => Err(MetricError::Failed(err.to_string())),
            };
            (index, result)
        });
    }

    let mut results: Vec<Option<Result<Vec<MetricValue>, MetricError>>> =
        metrics.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(err) => warn!(event = "metric_task_lost", error = %err),
        }
    }

    metrics
        .iter()
        .zip(results)
        .map(|(metric, result)| MetricOutcome {
            name: metric.name(),
            result: result.unwrap_or_else(|| {
                Err(MetricError::Failed("metric task did not complete".to_string()))
            }),
        })
        .collect()
}

fn failure_detail(failures: &[FailedMetric]) -> Value {
    json!({
        "failed_metrics": failures
            .iter()
            .map(|failure| json!({
                "category": failure.category.as_str(),
                "metric": failure.name,
                "error": failure.error.to_string(),
            }))
            .collect::<Vec<_>>(),
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
