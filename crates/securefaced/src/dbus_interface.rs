use crate::control::{ControlError, ControlHandle};
use zbus::interface;

pub const BUS_NAME: &str = "org.secureface.Control1";
pub const OBJECT_PATH: &str = "/org/secureface/Control1";

/// D-Bus control surface of the SecureFace daemon.
///
/// Bus name: org.secureface.Control1
/// Object path: /org/secureface/Control1
pub struct SecureFaceService {
    control: ControlHandle,
}

impl SecureFaceService {
    pub fn new(control: ControlHandle) -> Self {
        Self { control }
    }
}

fn to_fdo(e: ControlError) -> zbus::fdo::Error {
    match e {
        ControlError::Config(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.secureface.Control1")]
impl SecureFaceService {
    /// Update one live parameter. Returns the resulting parameters as JSON.
    async fn set_parameter(&self, field: &str, value: &str) -> zbus::fdo::Result<String> {
        tracing::info!(field, value, "set_parameter requested");
        let params = self.control.update(field, value).await.map_err(to_fdo)?;
        to_json(&*params)
    }

    /// Current parameters as JSON.
    async fn get_parameters(&self) -> zbus::fdo::Result<String> {
        let params = self.control.snapshot().await.map_err(to_fdo)?;
        to_json(&*params)
    }

    /// Daemon status and counters as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.control.status().await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// Re-read enrolled people from the database. Returns the gallery size.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload_gallery requested");
        let n = self.control.reload_gallery().await.map_err(to_fdo)?;
        Ok(n as u32)
    }

    /// Re-open the frame source, e.g. after the camera was reconnected.
    async fn restart_capture(&self) -> zbus::fdo::Result<()> {
        tracing::info!("restart_capture requested");
        self.control.restart_capture().await.map_err(to_fdo)
    }
}
