//! secureface-hw: frame acquisition.
//!
//! V4L2 cameras and still-image directories behind one [`FrameSource`]
//! trait, a freshest-wins [`FrameSlot`], and the acquisition thread that
//! connects them with bounded retry.

pub mod acquisition;
pub mod camera;
pub mod frame;
pub mod slot;
pub mod source;
pub mod still;

pub use acquisition::{Acquisition, CaptureStats, RetryPolicy, SourceOpener};
pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use slot::{Closed, FrameSlot, Take};
pub use source::{open_source, CaptureError, FrameSource};
pub use still::{list_images, ImageSequenceSource};
