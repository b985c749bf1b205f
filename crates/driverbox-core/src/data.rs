//! Normalized telemetry exchanged between codecs, the shadow and exports

use crate::event::EventCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointData {
    /// Point name as declared in the device model
    pub name: String,
    /// Point value
    pub value: Value,
}

impl PointData {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An event raised by a device alongside its values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub code: EventCode,
    #[serde(default)]
    pub value: Value,
}

/// Decoded output of a connector: values and events for one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    /// Device ID
    pub id: String,
    #[serde(default)]
    pub values: Vec<PointData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventData>,
}

impl DeviceData {
    pub fn new(id: impl Into<String>, values: Vec<PointData>) -> Self {
        Self {
            id: id.into(),
            values,
            events: Vec::new(),
        }
    }

    /// Look up the value reported for a point
    #[must_use]
    pub fn value(&self, point: &str) -> Option<&Value> {
        self.values.iter().find(|p| p.name == point).map(|p| &p.value)
    }
}
