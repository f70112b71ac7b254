//! A directory of still images standing in for a camera.
//!
//! Files are read in lexical order and cycled forever. Unreadable files are
//! reported as capture failures so the retry policy sees them.

use crate::frame::load_image_bgr;
use crate::source::{CaptureError, FrameSource};
use chrono::Utc;
use secureface_core::{ChannelOrder, Frame};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "ppm"];

/// Image files directly inside `dir`, in lexical order.
pub fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

pub struct ImageSequenceSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    camera_id: i64,
    sequence: u64,
    /// Pacing between frames, derived from the configured frame rate.
    interval: Duration,
    last: Option<Instant>,
}

impl ImageSequenceSource {
    pub fn open(dir: impl AsRef<Path>, camera_id: i64, fps: u32) -> Result<Self, CaptureError> {
        let dir = dir.as_ref().to_path_buf();
        let files = list_images(&dir)
            .map_err(|e| CaptureError::DeviceNotFound(format!("{}: {e}", dir.display())))?;
        if files.is_empty() {
            return Err(CaptureError::DeviceNotFound(format!(
                "{}: no image files",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), files = files.len(), "opened still-image source");
        Ok(Self {
            dir,
            files,
            next: 0,
            camera_id,
            sequence: 0,
            interval: Duration::from_secs(1) / fps.max(1),
            last: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        if let Some(last) = self.last {
            let due = last + self.interval;
            let now = Instant::now();
            if due > now {
                if due - now > timeout {
                    std::thread::sleep(timeout);
                    return Err(CaptureError::Timeout(timeout));
                }
                std::thread::sleep(due - now);
            }
        }
        self.last = Some(Instant::now());

        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();

        let image = load_image_bgr(path).map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        self.sequence += 1;
        Ok(Frame {
            image,
            order: ChannelOrder::Bgr,
            camera_id: self.camera_id,
            sequence: self.sequence,
            captured_at: Utc::now(),
        })
    }

    fn describe(&self) -> String {
        format!("{} ({} images)", self.dir.display(), self.files.len())
    }
}
