//! Error types for the plugin layer

use driverbox_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Connector not found: {0}")]
    ConnectorNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Point not found: {device}.{point}")]
    PointNotFound { device: String, point: String },

    #[error("Point {device}.{point} is not writable")]
    PointNotWritable { device: String, point: String },

    #[error("Point {device}.{point} is not readable")]
    PointNotReadable { device: String, point: String },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin does not support connector lookup")]
    NotSupportGetConnector,

    #[error("Encode is not supported: {0}")]
    NotSupportEncode(String),

    #[error("Decode is not supported: {0}")]
    NotSupportDecode(String),

    #[error("Unsupported write register type: {0}")]
    UnsupportedWriteCommandRegisterType(String),

    #[error("Protocol data format error: {0}")]
    ProtocolDataFormat(String),

    #[error("Protocol timeout")]
    ProtocolTimeout,

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Remote gateway rejected the request: {0}")]
    Remote(String),

    #[error("Invalid connection config: {0}")]
    InvalidConnection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl PluginError {
    /// Errors recovered by retrying and counted toward offline detection
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProtocolTimeout | Self::Io(_))
    }

    /// Errors that end a connector's collection loop
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportClosed(_))
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::ProtocolDataFormat(e.to_string())
    }
}
