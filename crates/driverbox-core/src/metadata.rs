//! Gateway identity announced over UDP discovery and federation

use crate::error::CoreError;
use crate::persistence;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PRODUCT: &str = "driver-box";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub serial_no: String,
    pub product: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
}

/// Reply to a UDP discovery request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponse {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub http_port: u16,
}

impl Metadata {
    /// Read the serial number file, generating one when missing
    pub async fn load(serial_file: &Path) -> Result<Self, CoreError> {
        let serial_no = match persistence::read_optional(serial_file).await? {
            Some(serial) => serial.trim().to_string(),
            None => {
                let serial = uuid::Uuid::new_v4().simple().to_string();
                persistence::write_synced(serial_file, serial.as_bytes()).await?;
                tracing::info!("Generated gateway serial number {}", serial);
                serial
            }
        };
        Ok(Self {
            serial_no,
            product: PRODUCT.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host_name: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
        })
    }

    #[must_use]
    pub fn discovery(&self, http_port: u16) -> DiscoveryResponse {
        DiscoveryResponse {
            metadata: self.clone(),
            http_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serial_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".driverbox_serial_no");
        let first = Metadata::load(&path).await.unwrap();
        let second = Metadata::load(&path).await.unwrap();
        assert_eq!(first.serial_no.len(), 32);
        assert_eq!(first.serial_no, second.serial_no);

        let json = serde_json::to_value(first.discovery(8081)).unwrap();
        assert_eq!(json["httpPort"], 8081);
        assert_eq!(json["product"], PRODUCT);
        assert_eq!(json["serialNo"], first.serial_no);
    }
}
