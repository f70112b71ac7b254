//! The frame source abstraction and the capture error taxonomy.

use crate::camera::Camera;
use crate::still::ImageSequenceSource;
use secureface_core::params::CameraSettings;
use secureface_core::Frame;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("source exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl From<crate::frame::FrameError> for CaptureError {
    fn from(e: crate::frame::FrameError) -> Self {
        CaptureError::CaptureFailed(e.to_string())
    }
}

/// Something that produces frames. Restartable only by opening a new one.
pub trait FrameSource: Send {
    /// Block for the next frame, up to `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// Open the source named by `settings.source`: a directory of still images
/// or a V4L2 device path.
pub fn open_source(settings: &CameraSettings, camera_id: i64) -> Result<Box<dyn FrameSource>, CaptureError> {
    if Path::new(&settings.source).is_dir() {
        Ok(Box::new(ImageSequenceSource::open(&settings.source, camera_id, settings.fps)?))
    } else {
        Ok(Box::new(Camera::open(settings, camera_id)?))
    }
}
