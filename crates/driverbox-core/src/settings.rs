//! Runtime settings read from the environment

use crate::error::CoreError;
use std::path::PathBuf;

pub const ENV_RESOURCE_PATH: &str = "DRIVERBOX_RESOURCE_PATH";
pub const ENV_HTTP_LISTEN: &str = "DRIVERBOX_HTTP_LISTEN";
pub const ENV_UDP_DISCOVER_LISTEN: &str = "DRIVERBOX_UDP_DISCOVER_LISTEN";
pub const ENV_LOG_PATH: &str = "DRIVERBOX_LOG_PATH";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_VIRTUAL: &str = "DRIVERBOX_VIRTUAL";
pub const ENV_MIRROR_ENABLED: &str = "EXPORT_MIRROR_ENABLED";
pub const ENV_DISCOVER_ENABLED: &str = "EXPORT_DISCOVER_ENABLED";
pub const ENV_LINKEDGE_CONFIG_PATH: &str = "EXPORT_LINKEDGE_CONFIG_PATH";
pub const ENV_GATEWAY_MASTER_URL: &str = "EXPORT_GATEWAY_MASTER_URL";

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

/// Process settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub resource_path: PathBuf,
    pub http_listen: u16,
    pub udp_discover_listen: u16,
    pub log_path: Option<PathBuf>,
    pub log_level: String,
    pub virtual_mode: bool,
    pub mirror_enabled: bool,
    /// Device auto-discovery; on unless explicitly set to `false`
    pub discover_enabled: bool,
    /// Master gateway socket to federate into, e.g. `ws://10.0.0.2:8081/ws/gateway-export`
    pub gateway_master_url: Option<String>,
    linkedge_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resource_path: PathBuf::from("./res"),
            http_listen: 8081,
            udp_discover_listen: 9090,
            log_path: None,
            log_level: "info".to_string(),
            virtual_mode: false,
            mirror_enabled: false,
            discover_enabled: true,
            gateway_master_url: None,
            linkedge_path: None,
        }
    }
}

impl Settings {
    /// Read settings from process environment variables
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let log_level = match read(ENV_LOG_LEVEL) {
            Some(level) => {
                let level = level.to_ascii_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(invalid(ENV_LOG_LEVEL, &level));
                }
                level
            }
            None => defaults.log_level,
        };

        Ok(Self {
            resource_path: read(ENV_RESOURCE_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.resource_path),
            http_listen: read_port(read(ENV_HTTP_LISTEN), ENV_HTTP_LISTEN, defaults.http_listen)?,
            udp_discover_listen: read_port(
                read(ENV_UDP_DISCOVER_LISTEN),
                ENV_UDP_DISCOVER_LISTEN,
                defaults.udp_discover_listen,
            )?,
            log_path: read(ENV_LOG_PATH).map(PathBuf::from),
            log_level,
            virtual_mode: read_bool(read(ENV_VIRTUAL)),
            mirror_enabled: read_bool(read(ENV_MIRROR_ENABLED)),
            discover_enabled: read(ENV_DISCOVER_ENABLED)
                .map_or(defaults.discover_enabled, |v| !v.trim().eq_ignore_ascii_case("false")),
            gateway_master_url: read(ENV_GATEWAY_MASTER_URL).map(|v| v.trim().to_string()),
            linkedge_path: read(ENV_LINKEDGE_CONFIG_PATH).map(PathBuf::from),
        })
    }

    /// `<root>/driver`
    #[must_use]
    pub fn driver_dir(&self) -> PathBuf {
        self.resource_path.join("driver")
    }

    /// `<root>/library`
    #[must_use]
    pub fn library_dir(&self) -> PathBuf {
        self.resource_path.join("library")
    }

    /// Scene rules directory, `<root>/linkedge` unless overridden
    #[must_use]
    pub fn linkedge_dir(&self) -> PathBuf {
        self.linkedge_path
            .clone()
            .unwrap_or_else(|| self.resource_path.join("linkedge"))
    }

    /// `<root>/.driverbox_serial_no`
    #[must_use]
    pub fn serial_file(&self) -> PathBuf {
        self.resource_path.join(".driverbox_serial_no")
    }
}

fn invalid(name: &str, value: &str) -> CoreError {
    CoreError::InvalidSetting {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Accepts `8081`, `:8081` or `0.0.0.0:8081`
fn read_port(value: Option<String>, name: &str, default: u16) -> Result<u16, CoreError> {
    let Some(value) = value else {
        return Ok(default);
    };
    let port = value.rsplit(':').next().unwrap_or(&value).trim();
    port.parse::<u16>().map_err(|_| invalid(name, &value))
}

fn read_bool(value: Option<String>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on"))
}
