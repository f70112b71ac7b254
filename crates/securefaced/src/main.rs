use anyhow::{Context, Result};
use secureface_core::params::CameraSettings;
use secureface_core::{ArcFaceEmbedder, GalleryHandle, ParameterStore, ScrfdDetector};
use secureface_hw::{open_source, SourceOpener};
use secureface_store::Store;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod audit;
mod config;
mod control;
mod dbus_interface;
mod debug_capture;
mod engine;
mod pipeline;
mod stats;

use audit::AuditLogger;
use config::Config;
use debug_capture::DebugCapture;
use engine::{Engine, OpenerFactory};
use pipeline::Pipeline;
use stats::EngineStats;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("securefaced starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera_id = config.camera_id,
        source = %config.params.camera.source,
        mode = %config.params.mode,
        db = %config.db_path.display(),
        "configuration loaded"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = Arc::new(Store::open(&config.db_path).context("failed to open database")?);
    let gallery = GalleryHandle::new(store.load_gallery()?);
    let snapshot = gallery.snapshot();
    tracing::info!(
        people = snapshot.len(),
        references = snapshot.reference_count(),
        "gallery loaded"
    );

    let detector = ScrfdDetector::load(&config.scrfd_model_path())?;
    tracing::info!(path = %config.scrfd_model_path(), "SCRFD detector loaded");
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path())?;
    tracing::info!(path = %config.arcface_model_path(), "ArcFace embedder loaded");

    let params = Arc::new(ParameterStore::new(config.params.clone())?);
    let stats = Arc::new(EngineStats::default());
    let (audit, audit_worker) = AuditLogger::spawn(store.clone(), config.audit, stats.clone());
    let (debug, debug_worker) = DebugCapture::spawn(config.debug_dir.clone(), config.debug_queue, stats.clone());

    let pipeline = Pipeline::new(
        Box::new(detector),
        Box::new(embedder),
        params.clone(),
        gallery.clone(),
        audit,
        debug,
        stats.clone(),
    );

    let camera_id = config.camera_id;
    let opener: OpenerFactory = Box::new(move || -> SourceOpener {
        Box::new(move |settings: &CameraSettings| open_source(settings, camera_id))
    });
    let mut engine = Engine::new(pipeline, params.clone(), config.capture, opener, stats);
    engine.start()?;

    let (control, control_thread) = control::spawn_control(engine, params, gallery, store)?;

    let service = dbus_interface::SecureFaceService::new(control.clone());
    let conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = dbus_interface::BUS_NAME, "securefaced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("securefaced shutting down");

    control.shutdown().await?;
    drop(conn);
    drop(control);
    tokio::task::spawn_blocking(move || control_thread.join())
        .await?
        .map_err(|_| anyhow::anyhow!("control thread panicked"))?;

    // The pipeline held the last queue senders; both workers drain and exit.
    audit_worker.await?;
    debug_worker.await?;
    tracing::info!("securefaced stopped");

    Ok(())
}
