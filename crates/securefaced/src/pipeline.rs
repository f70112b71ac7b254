//! Per-frame processing: detect → align → embed → match → log.
//!
//! One parameter snapshot and one gallery snapshot are taken per frame and
//! used for every face in it. Stage failures never escape [`Pipeline::process`];
//! they are logged, sent to debug capture and degrade to a skipped face or an
//! UNKNOWN decision.

use crate::audit::AuditLogger;
use crate::debug_capture::{DebugArtifact, DebugCapture, Stage};
use crate::stats::{bump, EngineStats};
use chrono::Utc;
use image::RgbImage;
use secureface_core::alignment::{self, AlignmentError};
use secureface_core::types::FaceOrigin;
use secureface_core::{
    AlignedFace, ChannelOrder, DetectionSettings, FaceDetector, FaceEmbedder, Frame, GalleryHandle,
    MatchEngine, ParameterStore, PipelineParams, ProcessingMode, RecognitionLogEntry,
};
use std::sync::Arc;
use std::time::Instant;

pub struct Pipeline {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
    engine: MatchEngine,
    params: Arc<ParameterStore>,
    gallery: GalleryHandle,
    audit: AuditLogger,
    debug: DebugCapture,
    stats: Arc<EngineStats>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detector: Box<dyn FaceDetector>,
        embedder: Box<dyn FaceEmbedder>,
        params: Arc<ParameterStore>,
        gallery: GalleryHandle,
        audit: AuditLogger,
        debug: DebugCapture,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            detector,
            embedder,
            engine: MatchEngine::default(),
            params,
            gallery,
            audit,
            debug,
            stats,
        }
    }

    /// Run one frame through every stage its mode selects.
    ///
    /// Returns the decisions handed to the audit logger, in detection order.
    pub fn process(&mut self, frame: &Frame) -> Vec<RecognitionLogEntry> {
        let params = self.params.snapshot();
        if !params.processing_enabled {
            bump(&self.stats.frames_skipped);
            return Vec::new();
        }
        let started = Instant::now();
        let gallery = self.gallery.snapshot();
        let required_level = params.required_level(frame.camera_id);

        let units = match params.mode {
            ProcessingMode::Normal => self.detect_and_align(frame, &params),
            ProcessingMode::AlignedFace => self.whole_frame(frame, alignment::pass_through(frame)),
            ProcessingMode::FullFrame => self.whole_frame(frame, alignment::full_frame(frame)),
        };

        let mut entries = Vec::with_capacity(units.len());
        for face in units {
            let face = alignment::finalize(face, params.convert_to_rgb, params.target_size);
            let embedding = match self.embedder.embed(&face) {
                Ok(e) => Some(e),
                Err(e) => {
                    bump(&self.stats.embedding_failures);
                    tracing::warn!(
                        camera_id = frame.camera_id,
                        frame = frame.sequence,
                        face = ?face.origin,
                        error = %e,
                        "embedding failed; face marked UNKNOWN"
                    );
                    let index = face_index(face.origin);
                    self.capture(frame, index, Stage::Embedding, e.to_string(), face.image, face.order);
                    None
                }
            };

            let result = self.engine.evaluate(
                embedding.as_ref(),
                &gallery,
                params.similarity_threshold,
                required_level,
            );
            tracing::debug!(
                camera_id = frame.camera_id,
                frame = frame.sequence,
                decision = %result.decision,
                person_id = ?result.person_id,
                similarity = ?result.similarity,
                mode = %params.mode,
                "face evaluated"
            );
            bump(&self.stats.faces_evaluated);

            let entry = RecognitionLogEntry::from_match(&result, frame.camera_id, Utc::now());
            self.audit.record(entry.clone());
            entries.push(entry);
        }

        bump(&self.stats.frames_processed);
        tracing::debug!(
            frame = frame.sequence,
            faces = entries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "frame processed"
        );
        entries
    }

    fn detect_and_align(&mut self, frame: &Frame, params: &PipelineParams) -> Vec<AlignedFace> {
        let settings = DetectionSettings {
            min_confidence: params.min_detection_confidence,
            nms_threshold: params.nms_threshold,
            margin_ratio: params.margin_ratio,
        };
        let faces = match secureface_core::detector::detect_faces(self.detector.as_mut(), frame, &settings) {
            Ok(faces) => faces,
            Err(e) => {
                bump(&self.stats.detection_failures);
                tracing::warn!(camera_id = frame.camera_id, frame = frame.sequence, error = %e, "detection failed");
                self.capture(frame, None, Stage::Detection, e.to_string(), frame.image.clone(), frame.order);
                return Vec::new();
            }
        };

        let mut aligned = Vec::with_capacity(faces.len());
        for face in &faces {
            match alignment::align_detected(frame, face) {
                Ok(a) => aligned.push(a),
                Err(e) => {
                    bump(&self.stats.alignment_failures);
                    tracing::warn!(
                        camera_id = frame.camera_id,
                        frame = frame.sequence,
                        face = face.index,
                        error = %e,
                        "alignment failed; face skipped"
                    );
                    let image = alignment::crop_region(frame, face).unwrap_or_else(|_| frame.image.clone());
                    self.capture(frame, Some(face.index), Stage::Alignment, e.to_string(), image, frame.order);
                }
            }
        }
        aligned
    }

    fn whole_frame(&mut self, frame: &Frame, unit: Result<AlignedFace, AlignmentError>) -> Vec<AlignedFace> {
        match unit {
            Ok(face) => vec![face],
            Err(e) => {
                bump(&self.stats.alignment_failures);
                tracing::warn!(camera_id = frame.camera_id, frame = frame.sequence, error = %e, "frame unusable");
                self.capture(frame, None, Stage::Alignment, e.to_string(), frame.image.clone(), frame.order);
                Vec::new()
            }
        }
    }

    fn capture(
        &self,
        frame: &Frame,
        face: Option<usize>,
        stage: Stage,
        error: String,
        image: RgbImage,
        order: ChannelOrder,
    ) {
        self.debug.capture(DebugArtifact {
            camera_id: frame.camera_id,
            frame_sequence: frame.sequence,
            face,
            stage,
            error,
            image,
            order,
            at: Utc::now(),
        });
    }
}

fn face_index(origin: FaceOrigin) -> Option<usize> {
    match origin {
        FaceOrigin::Detected(i) => Some(i),
        FaceOrigin::WholeFrame => None,
    }
}
