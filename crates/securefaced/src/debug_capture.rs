//! Best-effort persistence of images that failed a pipeline stage.
//!
//! Each artifact is a PNG plus a `.txt` note sharing one file stem:
//! `cam{camera}_f{sequence}_{face{index}|frame}_{stage}_{timestamp}`.

use crate::stats::{bump, EngineStats};
use chrono::{DateTime, Utc};
use image::RgbImage;
use secureface_core::alignment::swap_red_blue;
use secureface_core::ChannelOrder;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detection,
    Alignment,
    Embedding,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Alignment => "alignment",
            Stage::Embedding => "embedding",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed unit of work.
#[derive(Debug, Clone)]
pub struct DebugArtifact {
    pub camera_id: i64,
    pub frame_sequence: u64,
    /// Detected face index; `None` for whole-frame failures.
    pub face: Option<usize>,
    pub stage: Stage,
    pub error: String,
    pub image: RgbImage,
    pub order: ChannelOrder,
    pub at: DateTime<Utc>,
}

impl DebugArtifact {
    pub fn file_stem(&self) -> String {
        let unit = match self.face {
            Some(i) => format!("face{i}"),
            None => "frame".to_string(),
        };
        format!(
            "cam{}_f{:08}_{}_{}_{}",
            self.camera_id,
            self.frame_sequence,
            unit,
            self.stage,
            self.at.format("%Y%m%dT%H%M%S%.3fZ"),
        )
    }

    fn note(&self) -> String {
        format!(
            "stage: {}\nerror: {}\ntimestamp: {}\ncamera_id: {}\nframe: {}\nface: {}\n",
            self.stage,
            self.error,
            self.at.to_rfc3339(),
            self.camera_id,
            self.frame_sequence,
            self.face.map_or_else(|| "-".to_string(), |i| i.to_string()),
        )
    }

    /// Write the image and its note under `dir`. Returns the image path.
    pub fn write_to(mut self, dir: &Path) -> Result<PathBuf, DebugWriteError> {
        std::fs::create_dir_all(dir)?;
        let stem = self.file_stem();
        if self.order == ChannelOrder::Bgr {
            swap_red_blue(&mut self.image);
        }
        let png = dir.join(format!("{stem}.png"));
        self.image.save(&png)?;
        std::fs::write(dir.join(format!("{stem}.txt")), self.note())?;
        Ok(png)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DebugWriteError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

/// Sending side of the debug-capture queue.
#[derive(Clone)]
pub struct DebugCapture {
    tx: mpsc::Sender<DebugArtifact>,
    stats: Arc<EngineStats>,
}

impl DebugCapture {
    pub fn channel(capacity: usize, stats: Arc<EngineStats>) -> (Self, mpsc::Receiver<DebugArtifact>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, stats }, rx)
    }

    pub fn spawn(dir: PathBuf, capacity: usize, stats: Arc<EngineStats>) -> (Self, JoinHandle<()>) {
        let (capture, rx) = Self::channel(capacity, Arc::clone(&stats));
        let worker = tokio::spawn(run_writer(rx, dir, stats));
        (capture, worker)
    }

    /// Queue an artifact; dropped silently apart from a counter when the queue is full.
    pub fn capture(&self, artifact: DebugArtifact) {
        if self.tx.try_send(artifact).is_err() {
            bump(&self.stats.debug_dropped);
            tracing::debug!("debug capture queue full; artifact dropped");
        }
    }
}

async fn run_writer(mut rx: mpsc::Receiver<DebugArtifact>, dir: PathBuf, stats: Arc<EngineStats>) {
    while let Some(artifact) = rx.recv().await {
        let dir = dir.clone();
        match tokio::task::spawn_blocking(move || artifact.write_to(&dir)).await {
            Ok(Ok(path)) => {
                bump(&stats.debug_written);
                tracing::debug!(path = %path.display(), "debug artifact written");
            }
            Ok(Err(e)) => {
                bump(&stats.debug_dropped);
                tracing::warn!(error = %e, "failed to write debug artifact");
            }
            Err(e) => {
                bump(&stats.debug_dropped);
                tracing::warn!(error = %e, "debug writer task failed");
            }
        }
    }
}
