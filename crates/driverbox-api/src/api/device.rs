//! `device/*`: configured devices and point access

use super::{param, Params};
use crate::response::{ok, ApiResult};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
};
use driverbox_core::{CoreError, Device, DeviceConfig, DeviceData, Point, PointData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct DeviceWithPoints {
    #[serde(flatten)]
    device: Device,
    points: Vec<Point>,
}

/// Plugin config plus driver scripts keyed by driver key
#[derive(Deserialize)]
struct AddDeviceRequest {
    #[serde(flatten)]
    config: DeviceConfig,
    #[serde(default)]
    drivers: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDevicesRequest {
    #[serde(default)]
    device_ids: Vec<String>,
}

pub async fn write_point(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let id = param(&params, "id")?;
    let point = param(&params, "point")?;
    let value = params.get("value").cloned().unwrap_or_default();
    state
        .plugins
        .write_point(id, PointData::new(point, Value::String(value)))
        .await?;
    ok(Value::Null)
}

pub async fn write_points(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let data: DeviceData = serde_json::from_slice(&body)?;
    state.plugins.write_points(&data.id, data.values).await?;
    ok(Value::Null)
}

/// Force a read, then answer from the shadow
pub async fn read_point(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let id = param(&params, "id")?;
    let point = param(&params, "point")?;
    state.plugins.read_points(id, &[point.to_string()]).await?;
    ok(state.cache.shadow().get_device_point(id, point)?)
}

pub async fn list(State(state): State<AppState>) -> ApiResult {
    let devices: Vec<DeviceWithPoints> = state
        .cache
        .devices()
        .into_iter()
        .map(|device| {
            let points = state
                .cache
                .get_model(&device.model_name)
                .map(|m| m.device_points)
                .unwrap_or_default();
            DeviceWithPoints { device, points }
        })
        .collect();
    ok(devices)
}

pub async fn get(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let id = param(&params, "id")?;
    let device = state
        .cache
        .get_device(id)
        .ok_or_else(|| CoreError::DeviceNotFound(id.to_string()))?;
    ok(device)
}

/// Store driver scripts, merge the config and restart plugins
pub async fn add(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: AddDeviceRequest = serde_json::from_slice(&body)?;
    for (key, content) in &request.drivers {
        state.library.save_driver(key, content).await?;
    }
    let plugin_key = state.cache.add_config(request.config).await?;
    let running = state.plugins.reload().await?;
    tracing::info!("Added devices to {}, {} plugins running", plugin_key, running);
    ok(true)
}

pub async fn delete(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: DeleteDevicesRequest = serde_json::from_slice(&body)?;
    state.cache.batch_remove_device(&request.device_ids).await?;
    state.plugins.reload().await?;
    ok(Value::Null)
}
