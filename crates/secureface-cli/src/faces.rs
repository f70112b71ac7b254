//! Still images through the daemon's detect → align → finalize → embed stages.

use anyhow::{Context, Result};
use chrono::Utc;
use image::RgbImage;
use secureface_core::alignment;
use secureface_core::detector::detect_faces;
use secureface_core::{
    ArcFaceEmbedder, ChannelOrder, DetectionSettings, Embedding, FaceDetector, FaceEmbedder, Frame,
    PipelineParams, ScrfdDetector,
};
use secureface_hw::frame::load_image_bgr;
use std::path::Path;

/// Face models loaded once per CLI run.
pub struct Models {
    /// Absent when inputs are pre-aligned crops.
    detector: Option<ScrfdDetector>,
    embedder: ArcFaceEmbedder,
}

impl Models {
    pub fn load(model_dir: &Path, aligned: bool) -> Result<Self> {
        let detector = if aligned {
            None
        } else {
            let path = model_dir.join(secureface_core::DETECTOR_MODEL_FILE);
            Some(ScrfdDetector::load(&path.to_string_lossy())?)
        };
        let path = model_dir.join(secureface_core::EMBEDDER_MODEL_FILE);
        let embedder = ArcFaceEmbedder::load(&path.to_string_lossy())?;
        Ok(Self { detector, embedder })
    }

    pub fn embed_file(&mut self, path: &Path, params: &PipelineParams) -> Result<FaceEmbedding> {
        let image = load_image_bgr(path)?;
        embed_image(
            image,
            params,
            self.detector.as_mut().map(|d| d as &mut dyn FaceDetector),
            &mut self.embedder,
        )
        .with_context(|| path.display().to_string())
    }
}

pub struct FaceEmbedding {
    pub embedding: Embedding,
    /// Confidence of the chosen face; `None` for pre-aligned input.
    pub detection_confidence: Option<f32>,
}

/// Embed the highest-confidence face in a BGR `image`, or the whole image
/// when no detector is given.
pub fn embed_image(
    image: RgbImage,
    params: &PipelineParams,
    detector: Option<&mut dyn FaceDetector>,
    embedder: &mut dyn FaceEmbedder,
) -> Result<FaceEmbedding> {
    let frame = Frame {
        image,
        order: ChannelOrder::Bgr,
        camera_id: 0,
        sequence: 0,
        captured_at: Utc::now(),
    };

    let (face, detection_confidence) = match detector {
        None => (alignment::pass_through(&frame)?, None),
        Some(detector) => {
            let settings = DetectionSettings {
                min_confidence: params.min_detection_confidence,
                nms_threshold: params.nms_threshold,
                margin_ratio: params.margin_ratio,
            };
            let faces = detect_faces(detector, &frame, &settings)?;
            if faces.len() > 1 {
                tracing::info!(faces = faces.len(), "several faces found; using the most confident");
            }
            // Ordered by confidence.
            let best = faces.first().context("no face detected in image")?;
            (alignment::align_detected(&frame, best)?, Some(best.detection.confidence))
        }
    };

    let face = alignment::finalize(face, params.convert_to_rgb, params.target_size);
    Ok(FaceEmbedding {
        embedding: embedder.embed(&face)?,
        detection_confidence,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use secureface_core::{AlignedFace, BoundingBox, DetectorError, EmbeddingError, EMBEDDING_DIM};

    pub struct Fixed(pub Vec<BoundingBox>);

    impl FaceDetector for Fixed {
        fn detect(&mut self, _frame: &Frame, _min: f32) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// What the embedder was handed, and a fixed unit output.
    #[derive(Default)]
    pub struct Recorder {
        pub seen: Vec<AlignedFace>,
        pub axis: usize,
    }

    impl FaceEmbedder for Recorder {
        fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbeddingError> {
            self.seen.push(face.clone());
            let mut v = vec![0.0; EMBEDDING_DIM];
            v[self.axis] = 1.0;
            Ok(Embedding::from_raw(v, Some("w600k_r50".into())))
        }
    }

    /// A 112-pixel box at (`x`, 20) whose landmarks sit on the reference
    /// positions shifted by `shift` pixels to the left of the box.
    pub fn face(x: f32, confidence: f32, shift: f32) -> BoundingBox {
        let reference = [(38.3, 51.7), (73.5, 51.5), (56.0, 71.7), (41.5, 92.4), (70.7, 92.2)];
        BoundingBox {
            x,
            y: 20.0,
            width: 112.0,
            height: 112.0,
            confidence,
            landmarks: Some(reference.map(|(lx, ly): (f32, f32)| (lx + x - shift, ly + 20.0))),
        }
    }
}
