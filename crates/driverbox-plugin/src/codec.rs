//! Codec bridge between normalized point data and raw frames

use crate::error::PluginError;
use bytes::Bytes;
use driverbox_core::{DeviceData, PointData};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Purpose of an encoded request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EncodeMode {
    Read,
    Write,
    BatchRead,
}

/// A raw request or response on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Bytes(Bytes),
    Json(Value),
}

impl Frame {
    /// View the frame as JSON, parsing raw bytes when needed
    pub fn into_json(self) -> Result<Value, PluginError> {
        match self {
            Self::Json(value) => Ok(value),
            Self::Bytes(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }
}

/// Protocol-specific encode/decode, treated as a black box by the scheduler
pub trait Codec: Send + Sync {
    /// Build a request for a device; reads carry point names with null values
    fn encode(
        &self,
        device_id: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Frame, PluginError>;

    /// Turn a response into normalized device data
    fn decode(&self, raw: Frame) -> Result<Vec<DeviceData>, PluginError>;
}

/// Identity codec: requests and responses are `DeviceData` shaped JSON
///
/// Request: `{"id": .., "mode": "read"|"write"|"batchRead", "values": [{name, value}]}`.
/// Response: one `DeviceData` object or an array of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(
        &self,
        device_id: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Frame, PluginError> {
        if points.is_empty() {
            return Err(PluginError::NotSupportEncode(format!(
                "empty {mode:?} request for {device_id}"
            )));
        }
        Ok(Frame::Json(json!({
            "id": device_id,
            "mode": mode,
            "values": points,
        })))
    }

    fn decode(&self, raw: Frame) -> Result<Vec<DeviceData>, PluginError> {
        let value = raw.into_json()?;
        match value {
            Value::Array(_) => Ok(serde_json::from_value(value)?),
            Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
            other => Err(PluginError::ProtocolDataFormat(format!(
                "unexpected frame {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_coalesces_points() {
        let frame = JsonCodec
            .encode(
                "dev1",
                EncodeMode::Write,
                &[PointData::new("a", 1), PointData::new("b", 2)],
            )
            .unwrap();
        let Frame::Json(value) = frame else {
            panic!("expected json frame");
        };
        assert_eq!(value["mode"], "write");
        assert_eq!(value["values"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_decode_object_array_and_bytes() {
        let one = JsonCodec
            .decode(Frame::Json(json!({"id": "d", "values": [{"name": "p", "value": 1}]})))
            .unwrap();
        assert_eq!(one[0].value("p"), Some(&json!(1)));

        let many = JsonCodec
            .decode(Frame::Bytes(Bytes::from_static(
                br#"[{"id": "a", "values": []}, {"id": "b", "values": []}]"#,
            )))
            .unwrap();
        assert_eq!(many.len(), 2);

        assert!(matches!(
            JsonCodec.decode(Frame::Json(json!(42))),
            Err(PluginError::ProtocolDataFormat(_))
        ));
        assert!(JsonCodec.decode(Frame::Bytes(Bytes::from_static(b"{oops"))).is_err());
    }
}
