//! `shadow/*`

use super::{param, Params};
use crate::response::{ok, ApiResult};
use crate::state::AppState;
use axum::extract::{Query, State};
use driverbox_core::CoreError;

pub async fn all(State(state): State<AppState>) -> ApiResult {
    ok(state.cache.shadow().get_devices())
}

pub async fn device(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let id = param(&params, "id")?;
    ok(state.cache.shadow().get_device(id)?)
}

pub async fn device_point(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let id = param(&params, "id")?;
    let point = param(&params, "point")?;
    let details = state
        .cache
        .shadow()
        .get_device_point_details(id, point)?
        .ok_or_else(|| CoreError::PointNotFound {
            device: id.to_string(),
            point: point.to_string(),
        })?;
    ok(details)
}
