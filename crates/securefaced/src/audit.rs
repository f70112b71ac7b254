//! Asynchronous access-decision logger.
//!
//! The pipeline hands entries over with a non-blocking send; a tokio worker
//! writes them through an [`AuditSink`], retrying a failed write a bounded
//! number of times before dropping the entry with a warning. A full queue
//! also drops. Neither case ever blocks recognition.

use crate::stats::{bump, EngineStats};
use secureface_core::RecognitionLogEntry;
use secureface_store::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Where finalized decisions are persisted.
pub trait AuditSink: Send + Sync + 'static {
    fn append(&self, entry: &RecognitionLogEntry) -> Result<(), StoreError>;
}

impl AuditSink for Store {
    fn append(&self, entry: &RecognitionLogEntry) -> Result<(), StoreError> {
        self.append_log(entry).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuditPolicy {
    /// Write attempts per entry, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly after that.
    pub backoff: Duration,
    pub queue_capacity: usize,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            queue_capacity: 256,
        }
    }
}

/// Sending side of the audit queue.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<RecognitionLogEntry>,
    stats: Arc<EngineStats>,
}

impl AuditLogger {
    /// A logger and the receiving end of its queue, without a worker.
    pub fn channel(capacity: usize, stats: Arc<EngineStats>) -> (Self, mpsc::Receiver<RecognitionLogEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, stats }, rx)
    }

    /// Start the writer task. It finishes once every logger clone is dropped
    /// and the queue has drained.
    pub fn spawn(sink: Arc<dyn AuditSink>, policy: AuditPolicy, stats: Arc<EngineStats>) -> (Self, JoinHandle<()>) {
        let (logger, rx) = Self::channel(policy.queue_capacity, Arc::clone(&stats));
        let worker = tokio::spawn(run_writer(rx, sink, policy, stats));
        (logger, worker)
    }

    /// Queue one entry. Returns `false` if it was dropped.
    pub fn record(&self, entry: RecognitionLogEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                bump(&self.stats.audit_dropped);
                tracing::warn!(
                    camera_id = entry.camera_id,
                    decision = %entry.decision,
                    "audit queue full; decision not logged"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                bump(&self.stats.audit_dropped);
                tracing::warn!("audit writer gone; decision not logged");
                false
            }
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<RecognitionLogEntry>,
    sink: Arc<dyn AuditSink>,
    policy: AuditPolicy,
    stats: Arc<EngineStats>,
) {
    tracing::info!("audit writer started");
    while let Some(entry) = rx.recv().await {
        if write_with_retry(&sink, &entry, &policy).await {
            bump(&stats.audit_written);
        } else {
            bump(&stats.audit_dropped);
        }
    }
    tracing::info!("audit writer exiting");
}

async fn write_with_retry(sink: &Arc<dyn AuditSink>, entry: &RecognitionLogEntry, policy: &AuditPolicy) -> bool {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let s = Arc::clone(sink);
        let e = entry.clone();
        let outcome = tokio::task::spawn_blocking(move || s.append(&e)).await;

        let err = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => err.to_string(),
            Err(join) => join.to_string(),
        };

        if attempt == attempts {
            tracing::warn!(
                attempts,
                camera_id = entry.camera_id,
                decision = %entry.decision,
                error = %err,
                "audit write failed; entry dropped"
            );
            break;
        }
        tracing::debug!(attempt, error = %err, "audit write failed, retrying");
        tokio::time::sleep(policy.backoff * attempt).await;
    }
    false
}
