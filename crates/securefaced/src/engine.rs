use crate::pipeline::Pipeline;
use crate::stats::{EngineStats, StatsSnapshot};
use secureface_core::params::CameraSettings;
use secureface_core::ParameterStore;
use secureface_hw::{Acquisition, CaptureError, CaptureStats, Closed, FrameSlot, RetryPolicy, SourceOpener, Take};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// How long the pipeline thread waits on the slot before re-checking stop.
const TAKE_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("pipeline thread panicked")]
    PipelinePanicked,
    #[error("engine is already running")]
    AlreadyRunning,
}

/// Builds a fresh frame-source opener for each (re)start.
pub type OpenerFactory = Box<dyn Fn() -> SourceOpener + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum CaptureState {
    Running,
    Stopped,
    Failed(String),
}

struct Running {
    acquisition: Acquisition,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Pipeline>,
}

/// Owns the acquisition thread and the pipeline thread.
///
/// `stop` signals acquisition first, lets the frame in flight finish, then
/// joins both threads. After a capture failure the engine stays down until
/// [`Engine::restart`].
pub struct Engine {
    params: Arc<ParameterStore>,
    policy: RetryPolicy,
    opener: OpenerFactory,
    slot: Arc<FrameSlot>,
    capture_stats: Arc<CaptureStats>,
    stats: Arc<EngineStats>,
    pipeline: Option<Pipeline>,
    running: Option<Running>,
    last_error: Option<CaptureError>,
}

impl Engine {
    pub fn new(
        pipeline: Pipeline,
        params: Arc<ParameterStore>,
        policy: RetryPolicy,
        opener: OpenerFactory,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            params,
            policy,
            opener,
            slot: Arc::new(FrameSlot::new()),
            capture_stats: Arc::new(CaptureStats::default()),
            stats,
            pipeline: Some(pipeline),
            running: None,
            last_error: None,
        }
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let Some(mut pipeline) = self.pipeline.take() else {
            return Err(EngineError::PipelinePanicked);
        };

        self.slot.reopen();
        self.last_error = None;
        let settings = self.params.snapshot().camera.clone();
        let acquisition = Acquisition::spawn(
            settings.clone(),
            (self.opener)(),
            Arc::clone(&self.slot),
            self.policy,
            Arc::clone(&self.capture_stats),
        );
        let acquisition = match acquisition {
            Ok(a) => a,
            Err(e) => {
                self.pipeline = Some(pipeline);
                return Err(e.into());
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let slot = Arc::clone(&self.slot);
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("secureface-pipeline".into())
            .spawn(move || {
                run_pipeline(&mut pipeline, &slot, &thread_stop);
                pipeline
            })?;

        tracing::info!(source = %settings.source, "engine started");
        self.running = Some(Running {
            acquisition,
            stop,
            thread,
        });
        Ok(())
    }

    /// Stop both threads. Returns the capture error that ended acquisition, if any.
    pub fn stop(&mut self) -> Result<Option<CaptureError>, EngineError> {
        let Some(running) = self.running.take() else {
            return Ok(self.last_error.clone());
        };

        running.stop.store(true, Ordering::SeqCst);
        let capture = running.acquisition.stop();
        let pipeline = running.thread.join().map_err(|_| EngineError::PipelinePanicked)?;
        self.pipeline = Some(pipeline);

        self.last_error = capture.err();
        tracing::info!(error = ?self.last_error, "engine stopped");
        Ok(self.last_error.clone())
    }

    /// Explicit re-open after a capture failure, or to pick up new settings.
    pub fn restart(&mut self) -> Result<(), EngineError> {
        self.stop()?;
        self.start()
    }

    /// Ask the running acquisition to re-open with `settings` at its next boundary.
    pub fn reopen_camera(&self, settings: CameraSettings) {
        if let Some(running) = &self.running {
            running.acquisition.request_reopen(settings);
        }
    }

    pub fn capture_state(&self) -> CaptureState {
        match (&self.running, self.slot.closed()) {
            (Some(_), None) => CaptureState::Running,
            (_, Some(Closed::Failed(e))) => CaptureState::Failed(e.to_string()),
            (None, _) => match &self.last_error {
                Some(e) => CaptureState::Failed(e.to_string()),
                None => CaptureState::Stopped,
            },
            (Some(_), Some(Closed::Stopped)) => CaptureState::Stopped,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.capture_stats, self.slot.dropped())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "engine did not stop cleanly");
        }
    }
}

fn run_pipeline(pipeline: &mut Pipeline, slot: &FrameSlot, stop: &AtomicBool) {
    tracing::info!("pipeline thread started");
    while !stop.load(Ordering::SeqCst) {
        match slot.take(TAKE_POLL) {
            Take::Frame(frame) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                pipeline.process(&frame);
            }
            Take::Timeout => continue,
            Take::Closed(Closed::Stopped) => break,
            Take::Closed(Closed::Failed(e)) => {
                tracing::error!(error = %e, "frame source failed; pipeline stopped until capture restart");
                break;
            }
        }
    }
    tracing::info!("pipeline thread exiting");
}
