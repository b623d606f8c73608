pub mod analytics_contracts;
pub mod ingest_contracts;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use analytics_contracts::{MetricCategory, MetricValue, RunStatus};
pub use ingest_contracts::{
    ConversationInfo, IngestMode, MessageId, ProgressEvent, ProgressPhase, SourcePage,
    SourceRecord,
};

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let json =
        serde_json::to_value(value).map_err(|err| ContractError::Serialization(err.to_string()))?;
    serde_json::to_string(&canonicalize_value(json))
        .map_err(|err| ContractError::Serialization(err.to_string()))
}

/// Stable SHA-256 of a serializable payload; object keys are sorted first so
/// logically equal payloads hash identically.
pub fn canonical_payload_hash<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let rendered = canonical_json(value)?;
    Ok(sha256_hex(rendered.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize_value).collect()),
        scalar => scalar,
    }
}
