//! secureface-core: face detection, alignment, embedding and access decisions.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime for CPU inference. Matching, the gallery and the
//! live parameter store are backend-independent.

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod params;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use alignment::AlignmentError;
pub use detector::{DetectionSettings, DetectorError, FaceDetector, ScrfdDetector};
pub use gallery::{Gallery, GalleryEntry, GalleryHandle, Role};
pub use matcher::{CosineMatcher, MatchEngine, Matcher};
pub use params::{ConfigValidationError, ParameterStore, PipelineParams, ProcessingMode};
pub use recognizer::{ArcFaceEmbedder, EmbeddingError, FaceEmbedder};
pub use types::{
    AlignedFace, BoundingBox, ChannelOrder, Decision, DetectedFace, Embedding, Frame, MatchResult,
    RecognitionLogEntry, EMBEDDING_DIM,
};

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const EMBEDDER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Where model files live when no directory is configured.
///
/// `$XDG_DATA_HOME/secureface/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("secureface/models")
}
