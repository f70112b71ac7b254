//! V4L2 camera capture via the `v4l` crate.

use crate::frame;
use crate::source::{CaptureError, FrameSource};
use chrono::Utc;
use secureface_core::params::CameraSettings;
use secureface_core::{ChannelOrder, Frame};
use std::io;
use std::path::Path;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one compressed image per buffer.
    Mjpg,
    /// 8-bit grayscale (1 byte/pixel, typical of IR sensors).
    Grey,
    /// Packed 24-bit RGB.
    Rgb3,
    /// Packed 24-bit BGR.
    Bgr3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"GREY" => Some(PixelFormat::Grey),
            b"RGB3" => Some(PixelFormat::Rgb3),
            b"BGR3" => Some(PixelFormat::Bgr3),
            _ => None,
        }
    }
}

/// V4L2 camera device handle with a running mmap stream.
pub struct Camera {
    // Dropped before `device`.
    stream: MmapStream<'static>,
    #[allow(dead_code)]
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    camera_id: i64,
    sequence: u64,
    timeout: Option<Duration>,
}

fn map_open_error(device_path: &str, e: io::Error) -> CaptureError {
    if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
        CaptureError::DeviceBusy
    } else {
        CaptureError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

/// Convert a raw buffer to a 3-channel image based on the negotiated format.
fn decode(
    format: PixelFormat,
    width: u32,
    height: u32,
    buf: &[u8],
) -> Result<(image::RgbImage, ChannelOrder), CaptureError> {
    let decoded = match format {
        PixelFormat::Yuyv => (frame::yuyv_to_bgr(buf, width, height)?, ChannelOrder::Bgr),
        PixelFormat::Grey => (frame::grey_to_bgr(buf, width, height)?, ChannelOrder::Bgr),
        PixelFormat::Bgr3 => (frame::packed24(buf, width, height)?, ChannelOrder::Bgr),
        PixelFormat::Rgb3 => (frame::rgb24_to_bgr(buf, width, height)?, ChannelOrder::Bgr),
        PixelFormat::Mjpg => (frame::mjpeg_to_bgr(buf)?, ChannelOrder::Bgr),
    };
    Ok(decoded)
}

impl Camera {
    /// Open a V4L2 camera device and start streaming at the requested format.
    pub fn open(settings: &CameraSettings, camera_id: i64) -> Result<Self, CaptureError> {
        let device_path = settings.source.as_str();
        if !Path::new(device_path).exists() {
            return Err(CaptureError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| map_open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::StreamingNotSupported);
        }

        // Ask for YUYV at the configured size; accept whatever supported
        // format the driver settles on.
        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CaptureError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc} (need YUYV, MJPG, GREY, RGB3 or BGR3)"
            ))
        })?;

        if let Err(e) = device.set_params(&Parameters::with_fps(settings.fps)) {
            tracing::warn!(fps = settings.fps, error = %e, "frame rate not applied");
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        Ok(Self {
            stream,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            camera_id,
            sequence: 0,
            timeout: None,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        if self.timeout != Some(timeout) {
            self.stream.set_timeout(timeout);
            self.timeout = Some(timeout);
        }

        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(CaptureError::Timeout(timeout)),
            Err(e) => return Err(CaptureError::CaptureFailed(format!("failed to dequeue buffer: {e}"))),
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let buf = if used > 0 { &buf[..used] } else { buf };
        let (image, order) = decode(self.pixel_format, self.width, self.height, buf)?;

        self.sequence += 1;
        tracing::trace!(device = %self.device_path, driver_seq = meta.sequence, seq = self.sequence, "frame");

        Ok(Frame {
            image,
            order,
            camera_id: self.camera_id,
            sequence: self.sequence,
            captured_at: Utc::now(),
        })
    }

    fn describe(&self) -> String {
        format!("{} ({}x{} {})", self.device_path, self.width, self.height, self.fourcc)
    }
}
