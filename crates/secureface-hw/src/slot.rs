//! Single-frame handoff between acquisition and the pipeline.
//!
//! The slot holds at most one undelivered frame. Pushing while a frame is
//! waiting replaces it and counts the older one as dropped ("freshest wins"),
//! so a slow consumer bounds memory and latency instead of queueing.

use crate::source::CaptureError;
use secureface_core::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Why the slot stopped delivering frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Closed {
    /// Orderly stop.
    Stopped,
    /// The producer gave up.
    Failed(CaptureError),
}

/// Result of waiting on the slot.
#[derive(Debug)]
pub enum Take {
    Frame(Arc<Frame>),
    Timeout,
    Closed(Closed),
}

#[derive(Default)]
struct State {
    frame: Option<Arc<Frame>>,
    closed: Option<Closed>,
}

#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<State>,
    ready: Condvar,
    dropped: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Offer a frame. Returns `true` if an undelivered frame was replaced.
    ///
    /// Frames pushed after close are discarded.
    pub fn push(&self, frame: Arc<Frame>) -> bool {
        let mut state = self.lock();
        if state.closed.is_some() {
            return false;
        }
        let replaced = state.frame.replace(frame).is_some();
        if replaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);
        self.ready.notify_one();
        replaced
    }

    /// Wait up to `timeout` for a frame.
    ///
    /// After close, any frame still waiting is discarded and `Closed` is returned.
    pub fn take(&self, timeout: Duration) -> Take {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(reason) = state.closed.clone() {
                if state.frame.take().is_some() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                return Take::Closed(reason);
            }
            if let Some(frame) = state.frame.take() {
                return Take::Frame(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return Take::Timeout;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Stop delivering frames. The first close reason wins.
    pub fn close(&self, reason: Closed) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Clear the closed state so a restarted producer can deliver again.
    pub fn reopen(&self) {
        let mut state = self.lock();
        state.closed = None;
        state.frame = None;
    }

    pub fn closed(&self) -> Option<Closed> {
        self.lock().closed.clone()
    }

    /// Frames replaced or discarded before delivery.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether a frame is waiting. Never more than one.
    pub fn is_occupied(&self) -> bool {
        self.lock().frame.is_some()
    }
}
