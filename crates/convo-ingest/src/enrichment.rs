use crate::SharedStore;
use async_trait::async_trait;
use chrono::Utc;
use convo_core::{canonical_payload_hash, MessageId};
use convo_storage::{MessageAnnotation, StoredMessage};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Opaque annotation provider (NLP, LLM, ...). Nothing in ingestion or
/// analytics waits on it.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn provider(&self) -> &str;

    async fn annotate(&self, message: &StoredMessage) -> Result<Value, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentKey {
    pub conversation_id: String,
    pub message_id: MessageId,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub received: u64,
    pub annotated: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Bounded, non-blocking hand-off of committed message keys.
#[derive(Debug, Clone)]
pub struct EnrichmentQueue {
    tx: mpsc::Sender<EnrichmentKey>,
}

impl EnrichmentQueue {
    /// Offers keys without waiting; returns how many were accepted. Keys that
    /// do not fit are dropped.
    pub fn offer(
        &self,
        conversation_id: &str,
        message_ids: impl IntoIterator<Item = MessageId>,
    ) -> usize {
        let mut accepted = 0;
        let mut dropped = 0;
        for message_id in message_ids {
            let key = EnrichmentKey {
                conversation_id: conversation_id.to_string(),
                message_id,
            };
            match self.tx.try_send(key) {
                Ok(()) => accepted += 1,
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            warn!(event = "enrichment_queue_full", conversation_id, dropped);
        }
        accepted
    }
}

/// Starts the background worker. It exits once every queue handle is dropped.
pub fn spawn_enrichment_worker(
    store: SharedStore,
    enricher: Arc<dyn Enricher>,
    capacity: usize,
) -> (EnrichmentQueue, JoinHandle<EnrichmentStats>) {
    let (tx, mut rx) = mpsc::channel::<EnrichmentKey>(capacity.max(1));

    let handle = tokio::spawn(async move {
        let mut stats = EnrichmentStats::default();
        while let Some(key) = rx.recv().await {
            stats.received += 1;
            match enrich_one(&store, enricher.as_ref(), &key).await {
                Ok(true) => stats.annotated += 1,
                Ok(false) => stats.skipped += 1,
                Err(err) => {
                    stats.failed += 1;
                    warn!(
                        event = "enrichment_failed",
                        conversation_id = %key.conversation_id,
                        message_id = key.message_id,
                        provider = enricher.provider(),
                        error = %err
                    );
                }
            }
        }
        debug!(event = "enrichment_worker_stopped", received = stats.received);
        stats
    });

    (EnrichmentQueue { tx }, handle)
}

async fn enrich_one(
    store: &SharedStore,
    enricher: &dyn Enricher,
    key: &EnrichmentKey,
) -> Result<bool, String> {
    let message = store
        .with(|store| store.message(&key.conversation_id, key.message_id))
        .map_err(|err| err.to_string())?;
    let Some(message) = message else {
        return Ok(false);
    };

    let input_hash = canonical_payload_hash(&json!({
        "author_id": message.author_id,
        "text": message.text,
        "ts": message.ts.to_rfc3339(),
        "reply_to_id": message.reply_to_id,
    }))
    .map_err(|err| err.to_string())?;

    let existing = store
        .with(|store| store.annotations_for_message(&key.conversation_id, key.message_id))
        .map_err(|err| err.to_string())?;
    if existing
        .iter()
        .any(|annotation| annotation.provider == enricher.provider())
    {
        return Ok(false);
    }

    let annotation = enricher.annotate(&message).await?;
    let record = MessageAnnotation {
        conversation_id: key.conversation_id.clone(),
        message_id: key.message_id,
        provider: enricher.provider().to_string(),
        input_hash,
        annotation,
        created_at: Utc::now(),
    };
    store
        .with(|store| store.insert_annotation(&record))
        .map_err(|err| err.to_string())
}
