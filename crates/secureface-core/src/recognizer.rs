//! ArcFace face embedder via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from normalized face images,
//! using the w600k_r50 ArcFace model.

use crate::types::{AlignedFace, Embedding, EMBEDDING_DIM};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0: ArcFace uses symmetric normalization
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("model file not found: {0}; download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("empty face image")]
    EmptyInput,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a normalized face image to an L2-normalized embedding.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbeddingError>;
}

/// ArcFace-based face embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbeddingError> {
        if !Path::new(model_path).exists() {
            return Err(EmbeddingError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a face image into a 112x112 NCHW float tensor.
    ///
    /// Buffer channels map to planes 0/1/2 as stored; the RGB flag is applied
    /// earlier, in [`crate::alignment::finalize`].
    fn preprocess(face: &AlignedFace) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let resized: RgbImage;
        let image = if face.image.dimensions() == (size as u32, size as u32) {
            &face.image
        } else {
            resized = imageops::resize(&face.image, size as u32, size as u32, FilterType::Triangle);
            &resized
        };

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, px) in image.enumerate_pixels() {
            for (plane, &value) in px.0.iter().enumerate() {
                tensor[[0, plane, y as usize, x as usize]] = (value as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbeddingError> {
        if face.image.width() == 0 || face.image.height() == 0 {
            return Err(EmbeddingError::EmptyInput);
        }

        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::DimensionMismatch { expected: EMBEDDING_DIM, got: raw.len() });
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InferenceFailed("non-finite embedding value".into()));
        }

        Ok(Embedding::from_raw(raw, Some(ARCFACE_MODEL_VERSION.to_string())))
    }
}
