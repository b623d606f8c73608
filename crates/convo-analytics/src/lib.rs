pub mod chat_metrics;
pub mod context;
pub mod executor;
pub mod facts;
pub mod message_metrics;
pub mod metric;
pub mod user_metrics;

pub use context::{AuthorTally, MessageContext, UserAggregate, UserContext};
pub use executor::{
    AnalyticsConfig, AnalyticsReport, FailedMetric, PhaseSummary, StagedExecutor,
};
pub use facts::{ConversationSnapshot, MessageFact, MessageKind, PhaseInput};
pub use metric::{default_catalog, Metric, MetricError};

use convo_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
