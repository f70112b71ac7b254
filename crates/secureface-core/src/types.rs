use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dimension of every embedding in the system (ArcFace w600k_r50 output).
pub const EMBEDDING_DIM: usize = 512;

/// Channel order of the interleaved 3-channel pixel data in a [`Frame`] or [`AlignedFace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// A captured camera frame.
///
/// Produced by a frame source and shared read-only downstream behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Interleaved 3-channel pixels; the channel meaning is given by `order`.
    pub image: RgbImage,
    pub order: ChannelOrder,
    pub camera_id: i64,
    /// Monotonic per-source sequence number.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Grow the box symmetrically by `margin_ratio` of its size (split evenly
    /// between both sides) and clamp it to the frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn expand(&self, margin_ratio: f32, frame_width: u32, frame_height: u32) -> Option<CropRegion> {
        let pad_x = self.width * margin_ratio / 2.0;
        let pad_y = self.height * margin_ratio / 2.0;

        let x0 = (self.x - pad_x).floor().max(0.0);
        let y0 = (self.y - pad_y).floor().max(0.0);
        let x1 = (self.x + self.width + pad_x).ceil().min(frame_width as f32);
        let y1 = (self.y + self.height + pad_y).ceil().min(frame_height as f32);

        if !(x0.is_finite() && y0.is_finite() && x1.is_finite() && y1.is_finite()) {
            return None;
        }
        if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
            return None;
        }

        Some(CropRegion {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Integer pixel rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One face located by the detection stage.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Position in the frame's detection order.
    pub index: usize,
    /// Raw detection, in frame coordinates.
    pub detection: BoundingBox,
    /// Margin-expanded region handed to the crop stage.
    pub region: CropRegion,
    /// Sequence number of the owning frame.
    pub frame_sequence: u64,
}

/// What an [`AlignedFace`] was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceOrigin {
    /// The detected face with this index in its frame.
    Detected(usize),
    /// The whole frame (pass-through and full-frame modes).
    WholeFrame,
}

/// How an [`AlignedFace`] was produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlignmentKind {
    /// 2×3 similarity transform `[a, -b, tx, b, a, ty]` mapped landmarks to the reference.
    Similarity([f32; 6]),
    /// The frame was taken to already hold one aligned face.
    PassThrough,
    /// The whole frame was forwarded without any face localization.
    FullFrame,
}

/// A normalized face image ready for the embedding stage.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub image: RgbImage,
    pub order: ChannelOrder,
    pub origin: FaceOrigin,
    pub kind: AlignmentKind,
}

/// Face embedding vector (512-dimensional for ArcFace), L2-normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Build an embedding from raw model output, scaling it to unit length.
    ///
    /// A zero vector is kept as-is; it has similarity 0 to everything.
    pub fn from_raw(raw: Vec<f32>, model_version: Option<String>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values, model_version }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Zero vectors score 0.0. Dimensions beyond the shorter vector are ignored.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Access decision for one evaluated face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allowed,
    Blocked,
    Unknown,
}

impl Decision {
    /// Persisted form: `ALLOWED`, `BLOCKED` or `UNKNOWN`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allowed => "ALLOWED",
            Decision::Blocked => "BLOCKED",
            Decision::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOWED" => Ok(Decision::Allowed),
            "BLOCKED" => Ok(Decision::Blocked),
            "UNKNOWN" => Ok(Decision::Unknown),
            other => Err(format!("unknown recognition result: {other}")),
        }
    }
}

/// Round a similarity to the 4-decimal fixed point used in the audit log.
pub fn round_score(similarity: f32) -> f64 {
    (similarity as f64 * 10_000.0).round() / 10_000.0
}

/// Outcome of evaluating one face against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub decision: Decision,
    /// Matched person, set for ALLOWED and BLOCKED only.
    pub person_id: Option<i64>,
    pub display_name: Option<String>,
    /// Best similarity, absent when no embedding could be produced.
    pub similarity: Option<f32>,
}

impl MatchResult {
    /// The result for a face whose embedding could not be produced.
    pub fn no_embedding() -> Self {
        Self {
            decision: Decision::Unknown,
            person_id: None,
            display_name: None,
            similarity: None,
        }
    }

    /// Similarity rounded to 4 decimal places, as recorded in the log.
    pub fn score(&self) -> Option<f64> {
        self.similarity.map(round_score)
    }
}

/// Append-only audit record of one finalized access decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionLogEntry {
    pub person_id: Option<i64>,
    pub camera_id: i64,
    pub decision: Decision,
    /// Confidence with 4 decimal places; `None` when no embedding was produced.
    pub confidence: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl RecognitionLogEntry {
    pub fn from_match(result: &MatchResult, camera_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            person_id: result.person_id,
            camera_id,
            decision: result.decision,
            confidence: result.score(),
            timestamp,
        }
    }
}
