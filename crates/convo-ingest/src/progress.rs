use convo_core::ProgressEvent;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Default sink: one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: &ProgressEvent) {
        match event.percent() {
            Some(percent) => info!(
                event = "ingest_progress",
                phase = event.phase.as_str(),
                conversation_id = %event.conversation_id,
                processed = event.processed_count,
                total = ?event.total_count,
                percent,
            ),
            None => info!(
                event = "ingest_progress",
                phase = event.phase.as_str(),
                conversation_id = %event.conversation_id,
                processed = event.processed_count,
            ),
        }
    }
}

/// Forwards events to an async consumer. A full or closed channel drops the
/// event rather than stalling ingestion.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn emit(&self, event: &ProgressEvent) {
        if let Err(err) = self.tx.try_send(event.clone()) {
            warn!(event = "progress_dropped", conversation_id = %event.conversation_id, error = %err);
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn emit(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
