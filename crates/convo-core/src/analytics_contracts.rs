use crate::ContractError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Message,
    User,
    Chat,
}

impl MetricCategory {
    /// Phase execution order.
    pub const ORDERED: [MetricCategory; 3] =
        [MetricCategory::Message, MetricCategory::User, MetricCategory::Chat];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricCategory::Message => "message",
            MetricCategory::User => "user",
            MetricCategory::Chat => "chat",
        }
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricCategory {
    type Err = ContractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "message" => Ok(MetricCategory::Message),
            "user" => Ok(MetricCategory::User),
            "chat" => Ok(MetricCategory::Chat),
            other => Err(ContractError::UnknownVariant {
                kind: "metric category",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ContractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(ContractError::UnknownVariant {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// A computed value emitted by a metric, before it is bound to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// User id for user-level metrics; absent for chat-wide values.
    pub subject: Option<String>,
    pub name: String,
    pub value: f64,
    pub detail: Value,
}

impl MetricValue {
    pub fn chat_wide(name: impl Into<String>, value: f64, detail: Value) -> Self {
        Self {
            subject: None,
            name: name.into(),
            value,
            detail,
        }
    }

    pub fn for_subject(
        subject: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        detail: Value,
    ) -> Self {
        Self {
            subject: Some(subject.into()),
            name: name.into(),
            value,
            detail,
        }
    }
}
