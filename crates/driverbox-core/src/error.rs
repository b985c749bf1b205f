//! Error types for the runtime kernel

use thiserror::Error;

/// Errors raised by the config store, core cache and device shadow
#[derive(Error, Debug)]
pub enum CoreError {
    /// Unrecoverable read/parse/validate error while loading plugin configs
    #[error("Load core config failed: {0}")]
    LoadCoreConfig(String),

    /// Device is not registered in the shadow
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Device is not present in the core cache
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Model is not present in the core cache
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Point is not defined by the device's model
    #[error("Point not found: {device}.{point}")]
    PointNotFound { device: String, point: String },

    /// Connection key does not resolve
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Plugin config key does not resolve
    #[error("Plugin config not found: {0}")]
    PluginNotFound(String),

    /// A device was re-registered under a different model
    #[error("Conflict model for device [{id}]: {requested} -> {existing}")]
    ConflictModel {
        id: String,
        requested: String,
        existing: String,
    },

    /// A declarative config failed validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A point value could not be coerced to the point's value type
    #[error("Invalid point value for {point}: {reason}")]
    InvalidPointValue { point: String, reason: String },

    /// Environment setting could not be parsed
    #[error("Invalid setting {name}: {value}")]
    InvalidSetting { name: String, value: String },

    /// Crontab spec is neither a duration nor a cron expression
    #[error("Invalid schedule spec: {0}")]
    InvalidSchedule(String),

    /// A point write dispatched through the plugin layer failed
    #[error("Write to {device} failed: {reason}")]
    Write { device: String, reason: String },

    /// An export rejected an event
    #[error("Export {export} failed: {reason}")]
    Export { export: String, reason: String },

    /// IO error (persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
