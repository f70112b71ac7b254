//! Live-tunable pipeline parameters with per-frame snapshot isolation.
//!
//! The [`ParameterStore`] holds one immutable [`PipelineParams`] behind an
//! `Arc`. The pipeline takes a [`snapshot`](ParameterStore::snapshot) once per
//! frame; an [`update`](ParameterStore::update) builds a new value, validates
//! it and swaps the pointer, so a frame never observes a half-applied change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    #[error("unknown parameter: {0}")]
    UnknownField(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigValidationError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Field names accepted by [`PipelineParams::with_field`].
pub const FIELDS: &[&str] = &[
    "camera_source",
    "width",
    "height",
    "fps",
    "face_margin_ratio",
    "face_rect_thickness",
    "landmark_radius",
    "convert_to_rgb",
    "target_width",
    "target_height",
    "processing_mode",
    "recognition_threshold",
    "min_detection_confidence",
    "nms_threshold",
    "required_access_level",
    "processing_enabled",
];

/// Which stages run for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// Detect, align by landmarks, embed.
    #[default]
    Normal,
    /// Each frame already holds one aligned face; detection is skipped.
    AlignedFace,
    /// Experimental: the whole frame is embedded, no detection or alignment.
    FullFrame,
}

impl ProcessingMode {
    pub fn runs_detection(&self) -> bool {
        matches!(self, ProcessingMode::Normal)
    }

    pub fn runs_alignment(&self) -> bool {
        !matches!(self, ProcessingMode::FullFrame)
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessingMode::Normal => "Normal",
            ProcessingMode::AlignedFace => "AlignedFace",
            ProcessingMode::FullFrame => "FullFrame",
        })
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(ProcessingMode::Normal),
            "alignedface" | "aligned_face" | "aligned" => Ok(ProcessingMode::AlignedFace),
            "fullframe" | "full_frame" => Ok(ProcessingMode::FullFrame),
            other => Err(format!("expected Normal, AlignedFace or FullFrame, got {other:?}")),
        }
    }
}

/// Camera acquisition settings. Changing any of them requires a source re-open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// V4L2 device path or a directory of still images.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// Overlay parameters for display consumers. Never read by inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawingParams {
    pub rect_thickness: u32,
    pub landmark_radius: u32,
}

impl Default for DrawingParams {
    fn default() -> Self {
        Self {
            rect_thickness: 2,
            landmark_radius: 2,
        }
    }
}

/// One immutable configuration visible to a frame's whole traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub camera: CameraSettings,
    /// Fraction of the box size added around each detection before cropping.
    pub margin_ratio: f32,
    pub drawing: DrawingParams,
    /// Swap BGR frames to RGB immediately before embedding.
    pub convert_to_rgb: bool,
    /// (width, height) of the image handed to the embedding stage.
    pub target_size: (u32, u32),
    pub mode: ProcessingMode,
    pub similarity_threshold: f32,
    pub min_detection_confidence: f32,
    /// IoU above which a lower-confidence duplicate detection is suppressed.
    pub nms_threshold: f32,
    /// Required access level for cameras without an explicit entry.
    pub default_required_level: i32,
    /// Required access level per camera identifier.
    pub required_access_levels: BTreeMap<i64, i32>,
    pub processing_enabled: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            camera: CameraSettings::default(),
            margin_ratio: 0.8,
            drawing: DrawingParams::default(),
            convert_to_rgb: true,
            target_size: (112, 112),
            mode: ProcessingMode::Normal,
            similarity_threshold: 0.60,
            min_detection_confidence: 0.5,
            nms_threshold: 0.4,
            default_required_level: 0,
            required_access_levels: BTreeMap::new(),
            processing_enabled: true,
        }
    }
}

impl PipelineParams {
    /// Access level a matched person needs at `camera_id`.
    pub fn required_level(&self, camera_id: i64) -> i32 {
        self.required_access_levels
            .get(&camera_id)
            .copied()
            .unwrap_or(self.default_required_level)
    }

    /// Check every field; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.camera.source.trim().is_empty() {
            return Err(ConfigValidationError::invalid("camera_source", "must not be empty"));
        }
        for (field, v) in [
            ("width", self.camera.width),
            ("height", self.camera.height),
            ("fps", self.camera.fps),
            ("target_width", self.target_size.0),
            ("target_height", self.target_size.1),
        ] {
            if v == 0 {
                return Err(ConfigValidationError::invalid(field, "must be positive"));
            }
        }
        if !(0.0..=4.0).contains(&self.margin_ratio) {
            return Err(ConfigValidationError::invalid(
                "face_margin_ratio",
                format!("{} not in [0, 4]", self.margin_ratio),
            ));
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigValidationError::invalid(
                "recognition_threshold",
                format!("{} not in [-1, 1]", self.similarity_threshold),
            ));
        }
        for (field, v) in [
            ("min_detection_confidence", self.min_detection_confidence),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigValidationError::invalid(field, format!("{v} not in [0, 1]")));
            }
        }
        Ok(())
    }

    /// Apply one control-surface field update to a copy of these parameters.
    ///
    /// The returned value has not been validated as a whole yet.
    pub fn with_field(&self, field: &str, value: &str) -> Result<Self, ConfigValidationError> {
        let mut next = self.clone();
        let value = value.trim();
        match field {
            "camera_source" => next.camera.source = value.to_string(),
            "width" => next.camera.width = parse(field, value)?,
            "height" => next.camera.height = parse(field, value)?,
            "fps" => next.camera.fps = parse(field, value)?,
            "face_margin_ratio" => next.margin_ratio = parse(field, value)?,
            "face_rect_thickness" => next.drawing.rect_thickness = parse(field, value)?,
            "landmark_radius" => next.drawing.landmark_radius = parse(field, value)?,
            "convert_to_rgb" => next.convert_to_rgb = parse_bool(field, value)?,
            "target_width" => next.target_size.0 = parse(field, value)?,
            "target_height" => next.target_size.1 = parse(field, value)?,
            "processing_mode" => {
                next.mode = value
                    .parse()
                    .map_err(|e: String| ConfigValidationError::invalid(field, e))?
            }
            "recognition_threshold" => next.similarity_threshold = parse(field, value)?,
            "min_detection_confidence" => next.min_detection_confidence = parse(field, value)?,
            "nms_threshold" => next.nms_threshold = parse(field, value)?,
            "required_access_level" => match value.split_once('=') {
                Some((camera, level)) => {
                    let camera: i64 = parse(field, camera.trim())?;
                    let level: i32 = parse(field, level.trim())?;
                    next.required_access_levels.insert(camera, level);
                }
                None => next.default_required_level = parse(field, value)?,
            },
            "processing_enabled" => next.processing_enabled = parse_bool(field, value)?,
            other => return Err(ConfigValidationError::UnknownField(other.to_string())),
        }
        Ok(next)
    }
}

fn parse<T>(field: &str, value: &str) -> Result<T, ConfigValidationError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| ConfigValidationError::invalid(field, format!("{value:?}: {e}")))
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigValidationError::invalid(field, format!("{value:?} is not a boolean"))),
    }
}

/// Defaults, then a `[params]` table, then `SECUREFACE_<FIELD>` variables.
///
/// Every entry goes through [`PipelineParams::with_field`], so a file or
/// environment value is validated exactly like a live update. Shared by the
/// daemon and by CLI commands that must embed faces the way the daemon does.
pub fn layered<F>(table: Option<&toml::Table>, env: F) -> Result<PipelineParams, ConfigValidationError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut params = PipelineParams::default();
    for (field, value) in table.into_iter().flatten() {
        for v in toml_values(field, value)? {
            params = params.with_field(field, &v)?;
        }
    }
    for field in FIELDS {
        let key = format!("SECUREFACE_{}", field.to_ascii_uppercase());
        if let Some(v) = env(&key) {
            params = params.with_field(field, &v)?;
        }
    }
    params.validate()?;
    Ok(params)
}

/// Render one `[params]` entry as the strings `with_field` takes.
///
/// A table under `required_access_level` expands to one `camera=level`
/// update per key.
fn toml_values(field: &str, value: &toml::Value) -> Result<Vec<String>, ConfigValidationError> {
    let scalar = |v: &toml::Value| match v {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    };
    let unsupported = || ConfigValidationError::invalid(field, "unsupported TOML value");

    match value {
        toml::Value::Table(table) if field == "required_access_level" => table
            .iter()
            .map(|(camera, level)| {
                scalar(level)
                    .map(|level| format!("{camera}={level}"))
                    .ok_or_else(unsupported)
            })
            .collect(),
        other => scalar(other).map(|v| vec![v]).ok_or_else(unsupported),
    }
}

/// Holder of the current [`PipelineParams`] snapshot.
pub struct ParameterStore {
    current: RwLock<Arc<PipelineParams>>,
}

impl ParameterStore {
    /// Create a store from an initial configuration, which must be valid.
    pub fn new(initial: PipelineParams) -> Result<Self, ConfigValidationError> {
        initial.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(initial)),
        })
    }

    /// Immutable copy of the current parameters, unaffected by later updates.
    pub fn snapshot(&self) -> Arc<PipelineParams> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Apply one field update. On rejection the previous configuration stays in force.
    pub fn update(&self, field: &str, value: &str) -> Result<Arc<PipelineParams>, ConfigValidationError> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = guard.with_field(field, value)?;
        next.validate()?;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        tracing::info!(field, value, "parameter updated");
        Ok(next)
    }

    /// Replace the whole configuration at once (validated).
    pub fn replace(&self, params: PipelineParams) -> Result<Arc<PipelineParams>, ConfigValidationError> {
        params.validate()?;
        let next = Arc::new(params);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::clone(&next);
        Ok(next)
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(PipelineParams::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> toml::Table {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_layered_table_then_env() {
        let t = table(
            r#"
            convert_to_rgb = false
            face_margin_ratio = 0.5
            recognition_threshold = 0.7
            required_access_level = { "2" = 40 }
            "#,
        );
        let env = |key: &str| (key == "SECUREFACE_RECOGNITION_THRESHOLD").then(|| "0.65".to_string());
        let p = layered(Some(&t), env).unwrap();
        assert!(!p.convert_to_rgb);
        assert!((p.margin_ratio - 0.5).abs() < 1e-6);
        assert!((p.similarity_threshold - 0.65).abs() < 1e-6);
        assert_eq!(p.required_level(2), 40);
    }

    #[test]
    fn test_layered_rejects_bad_entries() {
        let none = |_: &str| None;
        assert!(matches!(
            layered(Some(&table("brightness = 3")), none),
            Err(ConfigValidationError::UnknownField(_))
        ));
        assert!(layered(Some(&table("width = [1, 2]")), none).is_err());
        assert!(layered(Some(&table("target_height = 0")), none).is_err());
        assert_eq!(layered(None, none).unwrap(), PipelineParams::default());
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(PipelineParams::default().validate().is_ok());
    }

    #[test]
    fn test_update_applies() {
        let store = ParameterStore::default();
        store.update("recognition_threshold", "0.72").unwrap();
        store.update("processing_mode", "aligned").unwrap();
        let snap = store.snapshot();
        assert!((snap.similarity_threshold - 0.72).abs() < 1e-6);
        assert_eq!(snap.mode, ProcessingMode::AlignedFace);
    }

    #[test]
    fn test_rejected_update_keeps_previous() {
        let store = ParameterStore::default();
        store.update("target_width", "160").unwrap();
        let err = store.update("target_width", "0").unwrap_err();
        assert!(matches!(err, ConfigValidationError::InvalidValue { ref field, .. } if field == "target_width"));
        assert_eq!(store.snapshot().target_size, (160, 112));

        assert!(store.update("target_height", "-5").is_err());
        assert!(store.update("processing_mode", "sideways").is_err());
        assert!(store.update("face_margin_ratio", "9").is_err());
        assert_eq!(
            store.update("no_such_field", "1").unwrap_err(),
            ConfigValidationError::UnknownField("no_such_field".into())
        );
        assert_eq!(store.snapshot().target_size, (160, 112));
    }

    #[test]
    fn test_snapshot_isolated_from_later_update() {
        let store = ParameterStore::default();
        let frame_snapshot = store.snapshot();
        store.update("face_margin_ratio", "0.1").unwrap();
        store.update("processing_mode", "fullframe").unwrap();
        store.update("recognition_threshold", "0.9").unwrap();

        assert!((frame_snapshot.margin_ratio - 0.8).abs() < 1e-6);
        assert_eq!(frame_snapshot.mode, ProcessingMode::Normal);
        assert!((frame_snapshot.similarity_threshold - 0.60).abs() < 1e-6);

        let now = store.snapshot();
        assert_eq!(now.mode, ProcessingMode::FullFrame);
    }

    #[test]
    fn test_required_access_level_per_camera() {
        let store = ParameterStore::default();
        store.update("required_access_level", "2=50").unwrap();
        store.update("required_access_level", "20").unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.required_level(2), 50);
        assert_eq!(snap.required_level(9), 20);
        assert!(store.update("required_access_level", "x=1").is_err());
    }

    #[test]
    fn test_bool_fields() {
        let store = ParameterStore::default();
        store.update("convert_to_rgb", "false").unwrap();
        store.update("processing_enabled", "0").unwrap();
        let snap = store.snapshot();
        assert!(!snap.convert_to_rgb);
        assert!(!snap.processing_enabled);
        assert!(store.update("convert_to_rgb", "maybe").is_err());
    }

    #[test]
    fn test_drawing_params_do_not_touch_inference_fields() {
        let store = ParameterStore::default();
        let before = store.snapshot();
        store.update("face_rect_thickness", "5").unwrap();
        store.update("landmark_radius", "4").unwrap();
        let after = store.snapshot();
        assert_eq!(after.drawing.rect_thickness, 5);
        assert_eq!(after.margin_ratio, before.margin_ratio);
        assert_eq!(after.target_size, before.target_size);
        assert_eq!(after.mode, before.mode);
    }

    #[test]
    fn test_mode_stage_selection() {
        assert!(ProcessingMode::Normal.runs_detection());
        assert!(!ProcessingMode::AlignedFace.runs_detection());
        assert!(ProcessingMode::AlignedFace.runs_alignment());
        assert!(!ProcessingMode::FullFrame.runs_detection());
        assert!(!ProcessingMode::FullFrame.runs_alignment());
    }

    #[test]
    fn test_every_listed_field_is_accepted() {
        let params = PipelineParams::default();
        for field in FIELDS {
            if let Err(ConfigValidationError::UnknownField(f)) = params.with_field(field, "") {
                panic!("{f} listed but not handled");
            }
        }
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Normal".parse::<ProcessingMode>().unwrap(), ProcessingMode::Normal);
        assert_eq!("FullFrame".parse::<ProcessingMode>().unwrap(), ProcessingMode::FullFrame);
        assert_eq!("aligned_face".parse::<ProcessingMode>().unwrap(), ProcessingMode::AlignedFace);
    }
}
