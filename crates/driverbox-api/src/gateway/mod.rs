//! Gateway federation over `/ws/gateway-export`
//!
//! Subordinate gateways connect to this process, register under their serial
//! number and push their models, devices, shadow and live reports. Their
//! devices appear locally as `<key>/<id>` on the `gateway` plugin, whose
//! connector turns point writes into `control` frames. With a master url
//! configured, this process also federates itself upstream as a subordinate.

mod export;
mod hub;
mod plugin;
mod session;

pub use export::GatewayExport;
pub use hub::{ws_handler, GatewayHub};
pub use plugin::{GatewayPlugin, GATEWAY_PLUGIN};
pub use session::{GatewaySessions, Session};

use driverbox_core::{Device, DeviceData, DeviceModel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const WS_PATH: &str = "/ws/gateway-export";

/// Frame type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PayloadType {
    Register = 1,
    RegisterRes,
    Unregister,
    UnregisterRes,
    Ping,
    Pong,
    Report,
    ReportRes,
    Control,
    ControlRes,
    SyncModels,
    SyncModelsRes,
    SyncDevices,
    SyncDevicesRes,
    SyncShadow,
    SyncShadowRes,
}

impl From<PayloadType> for u8 {
    fn from(kind: PayloadType) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use PayloadType::*;
        let kind = match code {
            1 => Register,
            2 => RegisterRes,
            3 => Unregister,
            4 => UnregisterRes,
            5 => Ping,
            6 => Pong,
            7 => Report,
            8 => ReportRes,
            9 => Control,
            10 => ControlRes,
            11 => SyncModels,
            12 => SyncModelsRes,
            13 => SyncDevices,
            14 => SyncDevicesRes,
            15 => SyncShadow,
            16 => SyncShadowRes,
            other => return Err(format!("unknown gateway payload type {other}")),
        };
        Ok(kind)
    }
}

/// Shadow state of one subordinate device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedDevice {
    pub id: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub points: BTreeMap<String, SyncedPoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncedPoint {
    #[serde(default)]
    pub value: Value,
}

/// One federation frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    #[serde(rename = "type")]
    pub kind: PayloadType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_data: Option<DeviceData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<DeviceModel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shadow: Vec<SyncedDevice>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl GatewayPayload {
    #[must_use]
    pub fn new(kind: PayloadType) -> Self {
        Self {
            kind,
            gateway_key: String::new(),
            device_data: None,
            models: Vec::new(),
            devices: Vec::new(),
            shadow: Vec::new(),
            error: String::new(),
        }
    }

    /// Response frame carrying an optional error
    #[must_use]
    pub fn reply<E: ToString>(kind: PayloadType, result: Result<(), E>) -> Self {
        let mut payload = Self::new(kind);
        if let Err(e) = result {
            payload.error = e.to_string();
        }
        payload
    }
}

/// Prefix a subordinate identifier with its gateway key, once
#[must_use]
pub fn namespaced(gateway_key: &str, id: &str) -> String {
    let prefix = format!("{gateway_key}/");
    if id.starts_with(&prefix) {
        id.to_string()
    } else {
        format!("{prefix}{id}")
    }
}

/// Gateway key of a namespaced identifier
#[must_use]
pub fn gateway_of(id: &str) -> Option<&str> {
    id.split_once('/').map(|(key, _)| key).filter(|k| !k.is_empty())
}
