//! Control surface: message passing into the thread that owns the engine.
//!
//! Parameter updates, gallery reloads and capture restarts arrive as
//! [`ControlRequest`]s with a oneshot reply. The pipeline never calls back
//! into the control surface.

use crate::engine::{CaptureState, Engine, EngineError};
use crate::stats::StatsSnapshot;
use secureface_core::{ConfigValidationError, GalleryHandle, ParameterStore, PipelineParams};
use secureface_store::{Store, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("control thread exited")]
    ChannelClosed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub capture: CaptureState,
    pub mode: String,
    pub processing_enabled: bool,
    pub gallery_size: usize,
    pub gallery_references: usize,
    pub stats: StatsSnapshot,
}

enum ControlRequest {
    Update {
        field: String,
        value: String,
        reply: oneshot::Sender<Result<Arc<PipelineParams>, ControlError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Arc<PipelineParams>>,
    },
    ReloadGallery {
        reply: oneshot::Sender<Result<usize, ControlError>>,
    },
    RestartCapture {
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the control thread.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ControlRequest) -> Result<T, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ControlError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ControlError::ChannelClosed)
    }

    /// Apply one parameter update. Camera fields re-open the frame source.
    pub async fn update(&self, field: &str, value: &str) -> Result<Arc<PipelineParams>, ControlError> {
        let (field, value) = (field.to_string(), value.to_string());
        self.call(|reply| ControlRequest::Update { field, value, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<Arc<PipelineParams>, ControlError> {
        self.call(|reply| ControlRequest::Snapshot { reply }).await
    }

    /// Re-read enrolled people from the store and publish a new gallery.
    /// Returns the number of entries.
    pub async fn reload_gallery(&self) -> Result<usize, ControlError> {
        self.call(|reply| ControlRequest::ReloadGallery { reply }).await?
    }

    pub async fn restart_capture(&self) -> Result<(), ControlError> {
        self.call(|reply| ControlRequest::RestartCapture { reply }).await?
    }

    pub async fn status(&self) -> Result<StatusReport, ControlError> {
        self.call(|reply| ControlRequest::Status { reply }).await
    }

    /// Stop the engine and end the control thread.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.call(|reply| ControlRequest::Shutdown { reply }).await
    }
}

struct Controller {
    engine: Engine,
    params: Arc<ParameterStore>,
    gallery: GalleryHandle,
    store: Arc<Store>,
}

/// Spawn the control thread. It owns `engine` and the write side of the
/// parameter store and gallery.
pub fn spawn_control(
    engine: Engine,
    params: Arc<ParameterStore>,
    gallery: GalleryHandle,
    store: Arc<Store>,
) -> std::io::Result<(ControlHandle, JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<ControlRequest>(16);
    let mut controller = Controller {
        engine,
        params,
        gallery,
        store,
    };

    let thread = std::thread::Builder::new()
        .name("secureface-control".into())
        .spawn(move || {
            tracing::info!("control thread started");
            while let Some(req) = rx.blocking_recv() {
                if !controller.handle(req) {
                    break;
                }
            }
            if let Err(e) = controller.engine.stop() {
                tracing::warn!(error = %e, "engine stop failed");
            }
            tracing::info!("control thread exiting");
        })?;

    Ok((ControlHandle { tx }, thread))
}

impl Controller {
    /// Returns `false` once the thread should exit.
    fn handle(&mut self, req: ControlRequest) -> bool {
        match req {
            ControlRequest::Update { field, value, reply } => {
                let _ = reply.send(self.update(&field, &value));
            }
            ControlRequest::Snapshot { reply } => {
                let _ = reply.send(self.params.snapshot());
            }
            ControlRequest::ReloadGallery { reply } => {
                let _ = reply.send(self.reload_gallery());
            }
            ControlRequest::RestartCapture { reply } => {
                tracing::info!("capture restart requested");
                let _ = reply.send(self.engine.restart().map_err(ControlError::from));
            }
            ControlRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ControlRequest::Shutdown { reply } => {
                if let Err(e) = self.engine.stop() {
                    tracing::warn!(error = %e, "engine stop failed");
                }
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn update(&mut self, field: &str, value: &str) -> Result<Arc<PipelineParams>, ControlError> {
        let before = self.params.snapshot();
        let next = self.params.update(field, value).map_err(|e| {
            tracing::warn!(field, value, error = %e, "parameter update rejected");
            e
        })?;
        if next.camera != before.camera {
            self.engine.reopen_camera(next.camera.clone());
        }
        Ok(next)
    }

    fn reload_gallery(&mut self) -> Result<usize, ControlError> {
        let gallery = self.store.load_gallery()?;
        let (people, refs) = (gallery.len(), gallery.reference_count());
        self.gallery.replace(gallery);
        tracing::info!(people, references = refs, "gallery reloaded");
        Ok(people)
    }

    fn status(&self) -> StatusReport {
        let params = self.params.snapshot();
        let gallery = self.gallery.snapshot();
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            capture: self.engine.capture_state(),
            mode: params.mode.to_string(),
            processing_enabled: params.processing_enabled,
            gallery_size: gallery.len(),
            gallery_references: gallery.reference_count(),
            stats: self.engine.stats(),
        }
    }
}
