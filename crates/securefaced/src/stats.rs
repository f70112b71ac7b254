use secureface_hw::CaptureStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the pipeline and its workers.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub frames_processed: AtomicU64,
    /// Frames taken while processing was disabled.
    pub frames_skipped: AtomicU64,
    pub faces_evaluated: AtomicU64,
    pub detection_failures: AtomicU64,
    pub alignment_failures: AtomicU64,
    pub embedding_failures: AtomicU64,
    pub audit_written: AtomicU64,
    pub audit_dropped: AtomicU64,
    pub debug_written: AtomicU64,
    pub debug_dropped: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub capture_failures: u64,
    pub capture_reopens: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub faces_evaluated: u64,
    pub detection_failures: u64,
    pub alignment_failures: u64,
    pub embedding_failures: u64,
    pub audit_written: u64,
    pub audit_dropped: u64,
    pub debug_written: u64,
    pub debug_dropped: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineStats {
    /// Combine with the acquisition counters and the slot's drop count.
    pub fn snapshot(&self, capture: &CaptureStats, frames_dropped: u64) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: get(&capture.captured),
            frames_dropped,
            capture_failures: get(&capture.failures),
            capture_reopens: get(&capture.reopens),
            frames_processed: get(&self.frames_processed),
            frames_skipped: get(&self.frames_skipped),
            faces_evaluated: get(&self.faces_evaluated),
            detection_failures: get(&self.detection_failures),
            alignment_failures: get(&self.alignment_failures),
            embedding_failures: get(&self.embedding_failures),
            audit_written: get(&self.audit_written),
            audit_dropped: get(&self.audit_dropped),
            debug_written: get(&self.debug_written),
            debug_dropped: get(&self.debug_dropped),
        }
    }
}
