use crate::facts::PhaseInput;
use crate::{chat_metrics, message_metrics, user_metrics};
use convo_core::{MetricCategory, MetricValue};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricError {
    #[error("missing context: {0}")]
    MissingContext(&'static str),
    #[error("metric failed: {0}")]
    Failed(String),
    #[error("metric panicked: {0}")]
    Panicked(String),
}

/// A pure computation over committed data. Implementations keep no state
/// between calls, so a metric can be re-run or tested in isolation.
pub trait Metric: Send + Sync {
    fn name(&self) -> &'static str;

    fn category(&self) -> MetricCategory;

    fn compute(&self, input: &PhaseInput) -> Result<Vec<MetricValue>, MetricError>;
}

pub fn default_catalog() -> Vec<Arc<dyn Metric>> {
    vec![
        Arc::new(message_metrics::MessageLengths),
        Arc::new(message_metrics::HourlyDistribution),
        Arc::new(message_metrics::WeeklyPattern),
        Arc::new(message_metrics::MessageTypes),
        Arc::new(message_metrics::QuestionPatterns),
        Arc::new(message_metrics::MessageVelocity),
        Arc::new(user_metrics::UserActivity),
        Arc::new(user_metrics::UserEngagement),
        Arc::new(user_metrics::UserConsistency),
        Arc::new(user_metrics::UserContentPatterns),
        Arc::new(chat_metrics::ChatHealth),
        Arc::new(chat_metrics::GrowthRate),
        Arc::new(chat_metrics::ParticipationRate),
        Arc::new(chat_metrics::ResponseDynamics),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn catalog_names_are_unique_and_cover_every_phase() {
        let catalog = default_catalog();
        let names: BTreeSet<_> = catalog.iter().map(|metric| metric.name()).collect();
        assert_eq!(names.len(), catalog.len());

        for category in MetricCategory::ORDERED {
            assert!(catalog.iter().any(|metric| metric.category() == category));
        }
        assert_eq!(
            catalog
                .iter()
                .filter(|metric| metric.category() == MetricCategory::User)
                .count(),
            4
        );
    }
}
