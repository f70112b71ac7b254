use secureface_core::params::{self, ConfigValidationError, PipelineParams};
use secureface_hw::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::audit::AuditPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigValidationError),
    #[error("invalid value for {key}: {value:?}")]
    Env { key: String, value: String },
}

/// Daemon configuration: defaults, then the TOML file named by
/// `SECUREFACE_CONFIG`, then `SECUREFACE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier recorded with every decision from this daemon's camera.
    pub camera_id: i64,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where debug artifacts are written.
    pub debug_dir: PathBuf,
    pub capture: RetryPolicy,
    pub audit: AuditPolicy,
    /// Pending debug artifacts kept before new ones are dropped.
    pub debug_queue: usize,
    /// Initial live-tunable parameters.
    pub params: PipelineParams,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_id: Option<i64>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    debug_dir: Option<PathBuf>,
    capture: CaptureSection,
    audit: AuditSection,
    debug: DebugSection,
    params: toml::Table,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CaptureSection {
    max_attempts: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    frame_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AuditSection {
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DebugSection {
    queue_capacity: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_id: 0,
            model_dir: secureface_core::default_model_dir(),
            db_path: data_dir.join("secureface.db"),
            debug_dir: data_dir.join("debug"),
            capture: RetryPolicy::default(),
            audit: AuditPolicy::default(),
            debug_queue: 32,
            params: PipelineParams::default(),
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("SECUREFACE_CONFIG") {
            Ok(path) => Some(read_file(Path::new(&path))?),
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Layer an optional TOML document and an environment lookup over the defaults.
    pub fn from_sources<F>(toml_text: Option<&str>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let mut table = None;
        if let Some(text) = toml_text {
            let mut file: FileConfig = toml::from_str(text)?;
            table = Some(std::mem::take(&mut file.params));
            config.apply_file(file)?;
        }
        config.apply_env(&env)?;
        config.params = params::layered(table.as_ref(), &env)?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(v) = file.camera_id {
            self.camera_id = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.debug_dir {
            self.debug_dir = v;
        }

        let c = file.capture;
        if let Some(v) = c.max_attempts {
            self.capture.max_attempts = v;
        }
        if let Some(v) = c.base_backoff_ms {
            self.capture.base_backoff = Duration::from_millis(v);
        }
        if let Some(v) = c.max_backoff_ms {
            self.capture.max_backoff = Duration::from_millis(v);
        }
        if let Some(v) = c.frame_timeout_ms {
            self.capture.frame_timeout = Duration::from_millis(v);
        }

        let a = file.audit;
        if let Some(v) = a.max_attempts {
            self.audit.max_attempts = v;
        }
        if let Some(v) = a.backoff_ms {
            self.audit.backoff = Duration::from_millis(v);
        }
        if let Some(v) = a.queue_capacity {
            self.audit.queue_capacity = v;
        }
        if let Some(v) = file.debug.queue_capacity {
            self.debug_queue = v;
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("SECUREFACE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("SECUREFACE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("SECUREFACE_DEBUG_DIR") {
            self.debug_dir = PathBuf::from(v);
        }
        env_parse(env, "SECUREFACE_CAMERA_ID", &mut self.camera_id)?;
        env_parse(env, "SECUREFACE_CAPTURE_MAX_ATTEMPTS", &mut self.capture.max_attempts)?;
        env_millis(env, "SECUREFACE_CAPTURE_TIMEOUT_MS", &mut self.capture.frame_timeout)?;
        env_parse(env, "SECUREFACE_AUDIT_MAX_ATTEMPTS", &mut self.audit.max_attempts)?;
        env_millis(env, "SECUREFACE_AUDIT_BACKOFF_MS", &mut self.audit.backoff)?;
        env_parse(env, "SECUREFACE_AUDIT_QUEUE", &mut self.audit.queue_capacity)?;
        env_parse(env, "SECUREFACE_DEBUG_QUEUE", &mut self.debug_queue)?;
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(secureface_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(secureface_core::EMBEDDER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("secureface")
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn env_parse<F, T>(env: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(v) = env(key) {
        *slot = v.trim().parse().map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value: v.clone(),
        })?;
    }
    Ok(())
}

fn env_millis<F>(env: &F, key: &str, slot: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut ms = slot.as_millis() as u64;
    env_parse(env, key, &mut ms)?;
    *slot = Duration::from_millis(ms);
    Ok(())
}
