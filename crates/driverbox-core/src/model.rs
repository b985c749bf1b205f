//! Declarative device configuration: connections, models, points, devices

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Default shadow TTL applied when a device does not declare one
pub const DEFAULT_DEVICE_TTL: &str = "24h";

/// Point value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    String,
}

/// Point access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadWrite {
    #[serde(rename = "R")]
    Read,
    #[serde(rename = "W")]
    Write,
    #[serde(rename = "RW")]
    ReadWrite,
}

/// When decoded values are forwarded to exports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportMode {
    /// Every sample is exported
    #[default]
    RealTime,
    /// Only samples that differ from the shadow are exported
    Change,
}

/// A named attribute of a device model
///
/// The recognized fields are typed; anything else (register addresses,
/// object types, collection durations...) is kept in `extends` and written
/// back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_write: Option<ReadWrite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_mode: Option<ReportMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enums: Vec<Value>,
    /// Protocol-specific extensions
    #[serde(flatten)]
    pub extends: Map<String, Value>,
}

impl Point {
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType, read_write: ReadWrite) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            value_type: Some(value_type),
            read_write: Some(read_write),
            report_mode: None,
            units: None,
            scale: None,
            decimals: None,
            enums: Vec::new(),
            extends: Map::new(),
        }
    }

    /// Attach a protocol-specific extension
    #[must_use]
    pub fn with_extend(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extends.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn readable(&self) -> bool {
        matches!(self.read_write, Some(ReadWrite::Read | ReadWrite::ReadWrite))
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        matches!(self.read_write, Some(ReadWrite::Write | ReadWrite::ReadWrite))
    }

    #[must_use]
    pub fn report_mode(&self) -> ReportMode {
        self.report_mode.unwrap_or_default()
    }

    /// Non-zero scale factor, if any
    #[must_use]
    pub fn scale(&self) -> Option<f64> {
        self.scale.filter(|s| *s != 0.0)
    }

    /// Decimal places kept for float values (2 unless declared)
    #[must_use]
    pub fn decimals(&self) -> u32 {
        match (self.decimals, self.value_type) {
            (Some(d), _) => d,
            (None, Some(ValueType::Float)) => 2,
            (None, _) => 0,
        }
    }

    /// Read an extension as an unsigned integer (numbers or numeric strings)
    #[must_use]
    pub fn extend_u64(&self, key: &str) -> Option<u64> {
        match self.extends.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn extend_str(&self, key: &str) -> Option<&str> {
        self.extends.get(key).and_then(Value::as_str)
    }

    fn validate(&self, model: &str) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "model {model} has a point without name"
            )));
        }
        let Some(value_type) = self.value_type else {
            return Err(CoreError::InvalidConfig(format!(
                "point {model}.{} has no valueType",
                self.name
            )));
        };
        if self.read_write.is_none() {
            return Err(CoreError::InvalidConfig(format!(
                "point {model}.{} has no readWrite",
                self.name
            )));
        }
        if self.scale().is_some() && value_type != ValueType::Float {
            return Err(CoreError::InvalidConfig(format!(
                "point {model}.{} declares a scale but is not a float",
                self.name
            )));
        }
        Ok(())
    }
}

/// A configured device instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub model_name: String,
    pub connection_key: String,
    #[serde(default)]
    pub description: String,
    /// Shadow TTL override ("30s", "10m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub driver_key: String,
}

impl Device {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        model_name: impl Into<String>,
        connection_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            connection_key: connection_key.into(),
            description: String::new(),
            ttl: None,
            tags: Vec::new(),
            properties: BTreeMap::new(),
            driver_key: String::new(),
        }
    }

    /// Parsed shadow TTL, falling back to the 24h default
    pub fn ttl(&self) -> Result<std::time::Duration, CoreError> {
        let spec = self.ttl.as_deref().unwrap_or(DEFAULT_DEVICE_TTL);
        humantime::parse_duration(spec)
            .map_err(|e| CoreError::InvalidConfig(format!("device {} ttl {spec}: {e}", self.id)))
    }
}

/// A device model: point definitions plus the devices built from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub name: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub device_points: Vec<Point>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl DeviceModel {
    #[must_use]
    pub fn new(name: impl Into<String>, device_points: Vec<Point>) -> Self {
        Self {
            name: name.into(),
            model_id: String::new(),
            description: String::new(),
            attributes: Map::new(),
            device_points,
            devices: Vec::new(),
        }
    }

    #[must_use]
    pub fn point(&self, name: &str) -> Option<&Point> {
        self.device_points.iter().find(|p| p.name == name)
    }

    /// Overlay points by name and devices by id
    fn merge(&mut self, other: DeviceModel) {
        for point in other.device_points {
            match self.device_points.iter_mut().find(|p| p.name == point.name) {
                Some(existing) => *existing = point,
                None => self.device_points.push(point),
            }
        }
        for device in other.devices {
            match self.devices.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => *existing = device,
                None => self.devices.push(device),
            }
        }
    }
}

/// Per-plugin declarative configuration (`config.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(default)]
    pub device_models: Vec<DeviceModel>,
    #[serde(default)]
    pub connections: BTreeMap<String, Value>,
    #[serde(default)]
    pub protocol_name: String,
}

impl DeviceConfig {
    #[must_use]
    pub fn model(&self, name: &str) -> Option<&DeviceModel> {
        self.device_models.iter().find(|m| m.name == name)
    }

    pub fn model_mut(&mut self, name: &str) -> Option<&mut DeviceModel> {
        self.device_models.iter_mut().find(|m| m.name == name)
    }

    #[must_use]
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices().find(|d| d.id == id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.device_models.iter().flat_map(|m| m.devices.iter())
    }

    /// Fill each nested device's model name from its enclosing model
    pub fn normalize(&mut self) {
        for model in &mut self.device_models {
            for device in &mut model.devices {
                if device.model_name.is_empty() {
                    device.model_name.clone_from(&model.name);
                }
                if device.description.is_empty() {
                    device.description.clone_from(&device.id);
                }
            }
        }
    }

    /// Check structural invariants of the config
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.protocol_name.is_empty() {
            return Err(CoreError::InvalidConfig("protocolName is empty".to_string()));
        }
        let mut models = HashSet::new();
        for model in &self.device_models {
            if model.name.is_empty() {
                return Err(CoreError::InvalidConfig("model without name".to_string()));
            }
            if !models.insert(model.name.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "model {} declared twice",
                    model.name
                )));
            }
            let mut points = HashSet::new();
            for point in &model.device_points {
                point.validate(&model.name)?;
                if !points.insert(point.name.as_str()) {
                    return Err(CoreError::InvalidConfig(format!(
                        "point {}.{} declared twice",
                        model.name, point.name
                    )));
                }
            }
            for device in &model.devices {
                if device.id.is_empty() {
                    return Err(CoreError::InvalidConfig(format!(
                        "model {} has a device without id",
                        model.name
                    )));
                }
                if device.model_name != model.name {
                    return Err(CoreError::InvalidConfig(format!(
                        "device {} references model {} but is declared under {}",
                        device.id, device.model_name, model.name
                    )));
                }
                if !self.connections.contains_key(&device.connection_key) {
                    return Err(CoreError::ConnectionNotFound(device.connection_key.clone()));
                }
                device.ttl()?;
            }
        }
        Ok(())
    }

    /// Union `other` into this config: models by name, connections by key
    pub fn merge(&mut self, other: DeviceConfig) {
        for model in other.device_models {
            match self.model_mut(&model.name) {
                Some(existing) => existing.merge(model),
                None => self.device_models.push(model),
            }
        }
        self.connections.extend(other.connections);
    }

    /// Compacted form stored by `add_config`: models without devices and
    /// connections no kept device references are dropped (connections flagged
    /// `discover` stay)
    #[must_use]
    pub fn optimized(&self) -> DeviceConfig {
        let device_models: Vec<DeviceModel> = self
            .device_models
            .iter()
            .filter(|m| !m.devices.is_empty())
            .cloned()
            .collect();
        let referenced: HashSet<&str> = device_models
            .iter()
            .flat_map(|m| m.devices.iter().map(|d| d.connection_key.as_str()))
            .collect();
        let connections = self
            .connections
            .iter()
            .filter(|(key, value)| {
                referenced.contains(key.as_str())
                    || value.get("discover").and_then(Value::as_bool) == Some(true)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        DeviceConfig {
            device_models,
            connections,
            protocol_name: self.protocol_name.clone(),
        }
    }
}
