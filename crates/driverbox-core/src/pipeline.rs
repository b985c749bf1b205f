//! Ingest pipeline: decoded device data -> shadow -> exports

use crate::bus::EventBus;
use crate::cache::CoreCache;
use crate::data::{DeviceData, PointData};
use crate::event::EventCode;
use crate::model::{Point, ReportMode, ValueType};
use serde_json::{Number, Value};
use std::sync::Arc;

/// Coerce a raw value to a point's value type
pub fn convert_value(value: &Value, value_type: ValueType) -> Result<Value, String> {
    match value_type {
        ValueType::Int => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(Value::from)
                .ok_or_else(|| format!("{n} is not an integer")),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .or_else(|_| s.parse::<f64>().map(|f| f.trunc() as i64))
                    .map(Value::from)
                    .map_err(|e| format!("{s:?}: {e}"))
            }
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            other => Err(format!("cannot convert {other} to int")),
        },
        ValueType::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("{n} is not a float")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("{s:?} is not a float")),
            Value::Bool(b) => Ok(Value::from(if *b { 1.0 } else { 0.0 })),
            other => Err(format!("cannot convert {other} to float")),
        },
        ValueType::String => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Null => Err("null value".to_string()),
            other => Ok(Value::String(other.to_string())),
        },
    }
}

/// Truncate toward zero at `decimals` places
#[must_use]
pub fn truncate(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let rounded = scaled.round();
    // absorb representation error such as 25.67 * 100 = 2566.9999...
    let kept = if (scaled - rounded).abs() < 1e-6 {
        rounded
    } else {
        scaled.trunc()
    };
    kept / factor
}

/// Full normalization of a sampled value: type, scale, decimals
pub fn normalize_value(point: &Point, raw: &Value) -> Result<Value, String> {
    let Some(value_type) = point.value_type else {
        return Err(format!("point {} has no valueType", point.name));
    };
    let value = convert_value(raw, value_type)?;
    if value_type != ValueType::Float {
        return Ok(value);
    }
    let mut number = value.as_f64().unwrap_or_default();
    if let Some(scale) = point.scale() {
        number *= scale;
    }
    Number::from_f64(truncate(number, point.decimals()))
        .map(Value::Number)
        .ok_or_else(|| format!("{number} is not finite"))
}

/// Route decoded frames into the shadow and the event bus
pub struct Pipeline {
    cache: Arc<CoreCache>,
    bus: Arc<EventBus>,
}

impl Pipeline {
    #[must_use]
    pub fn new(cache: Arc<CoreCache>, bus: Arc<EventBus>) -> Self {
        Self { cache, bus }
    }

    /// Handle decoded records
    pub fn export_to(&self, records: Vec<DeviceData>) {
        for record in records {
            self.export_one(record);
        }
    }

    fn export_one(&self, record: DeviceData) {
        for event in &record.events {
            self.bus
                .trigger_events(event.code, &record.id, event.value.clone());
        }
        if record.values.is_empty() {
            return;
        }

        let Some(device) = self.cache.get_device(&record.id) else {
            tracing::warn!("Dropping data for unknown device {}", record.id);
            return;
        };
        let shadow = self.cache.shadow();

        let mut exported = Vec::with_capacity(record.values.len());
        for sample in &record.values {
            let Some(point) = self.cache.get_point_by_model(&device.model_name, &sample.name) else {
                tracing::warn!("Device {} has no point {}", record.id, sample.name);
                continue;
            };
            let value = match normalize_value(&point, &sample.value) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Dropping {}.{}: {}", record.id, sample.name, e);
                    continue;
                }
            };

            let unchanged = point.report_mode() == ReportMode::Change
                && shadow
                    .get_device_point(&record.id, &sample.name)
                    .ok()
                    .flatten()
                    .as_ref()
                    == Some(&value);

            if let Err(e) = shadow.set_device_point(&record.id, &sample.name, value.clone()) {
                tracing::warn!("Shadow update failed for {}: {}", record.id, e);
                continue;
            }
            if !unchanged {
                exported.push(PointData::new(sample.name.clone(), value));
            }
        }

        let original = serde_json::to_value(&record).unwrap_or(Value::Null);
        self.bus
            .trigger_events(EventCode::Exporting, &record.id, original);
        if !exported.is_empty() {
            self.bus
                .export_to(&DeviceData::new(record.id.clone(), exported));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::data::EventData;
    use crate::model::{DeviceConfig, ReadWrite};
    use crate::shadow::DeviceShadow;
    use crate::store::ConfigStore;
    use serde_json::json;

    #[test]
    fn test_convert_value() {
        assert_eq!(convert_value(&json!("42"), ValueType::Int).unwrap(), json!(42));
        assert_eq!(convert_value(&json!(3.9), ValueType::Int).unwrap(), json!(3));
        assert_eq!(convert_value(&json!("1.5"), ValueType::Float).unwrap(), json!(1.5));
        assert_eq!(convert_value(&json!(7), ValueType::String).unwrap(), json!("7"));
        assert!(convert_value(&json!("abc"), ValueType::Int).is_err());
        assert!(convert_value(&json!([1]), ValueType::Float).is_err());
    }

    #[test]
    fn test_scale_and_decimals() {
        let mut point = Point::new("temp", ValueType::Float, ReadWrite::Read);
        point.scale = Some(0.1);
        assert_eq!(normalize_value(&point, &json!(256)).unwrap(), json!(25.6));

        point.scale = None;
        point.decimals = Some(1);
        assert_eq!(normalize_value(&point, &json!(25.67)).unwrap(), json!(25.6));
        assert_eq!(truncate(25.67, 2), 25.67);
        assert_eq!(truncate(-1.239, 2), -1.23);
    }

    async fn fixture() -> (Pipeline, Arc<CoreCache>, Arc<EventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(CoreCache::new(
            ConfigStore::new(dir.path()),
            Arc::new(DeviceShadow::new()),
            bus.clone(),
        ));
        let config: DeviceConfig = serde_json::from_value(json!({
            "protocolName": "virtual",
            "connections": {"c1": {}},
            "deviceModels": [{
                "name": "meter",
                "devicePoints": [
                    {"name": "power", "valueType": "float", "readWrite": "R", "scale": 0.5},
                    {"name": "state", "valueType": "int", "readWrite": "RW", "reportMode": "change"}
                ],
                "devices": [{"id": "m1", "connectionKey": "c1"}]
            }]
        }))
        .unwrap();
        cache.add_config(config).await.unwrap();
        (Pipeline::new(cache.clone(), bus.clone()), cache, bus, dir)
    }

    fn exported(rx: &mut tokio::sync::broadcast::Receiver<BusMessage>) -> Vec<DeviceData> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let BusMessage::Data(data) = message {
                out.push(data);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_pipeline_updates_shadow_and_exports() {
        let (pipeline, cache, bus, _dir) = fixture().await;
        let mut rx = bus.subscribe();

        pipeline.export_to(vec![DeviceData::new(
            "m1",
            vec![
                PointData::new("power", "100"),
                PointData::new("state", 1),
                PointData::new("unknown", 1),
            ],
        )]);

        let shadow = cache.shadow();
        assert_eq!(shadow.get_device_point("m1", "power").unwrap(), Some(json!(50.0)));
        assert!(shadow.get_device_status("m1").unwrap());
        let data = exported(&mut rx);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].values.len(), 2);
    }

    #[tokio::test]
    async fn test_change_mode_drops_repeated_values() {
        let (pipeline, cache, bus, _dir) = fixture().await;
        pipeline.export_to(vec![DeviceData::new("m1", vec![PointData::new("state", 1)])]);
        let mut rx = bus.subscribe();

        pipeline.export_to(vec![DeviceData::new("m1", vec![PointData::new("state", 1)])]);
        assert!(exported(&mut rx).is_empty());

        pipeline.export_to(vec![DeviceData::new("m1", vec![PointData::new("state", 2)])]);
        let data = exported(&mut rx);
        assert_eq!(data[0].value("state"), Some(&json!(2)));
        assert_eq!(cache.shadow().get_device_point("m1", "state").unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_device_events_are_published() {
        let (pipeline, _cache, bus, _dir) = fixture().await;
        let mut rx = bus.subscribe();
        pipeline.export_to(vec![DeviceData {
            id: "m1".into(),
            values: Vec::new(),
            events: vec![EventData {
                code: EventCode::DeviceOnOff,
                value: json!(true),
            }],
        }]);

        match rx.try_recv().unwrap() {
            BusMessage::Event(event) => {
                assert_eq!(event.code, EventCode::DeviceOnOff);
                assert_eq!(event.key, "m1");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
