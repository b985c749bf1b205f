//! REST surface under `/api/v1/`

mod device;
mod linkedge;
mod shadow;
mod system;

use crate::gateway::{ws_handler, WS_PATH};
use crate::response::ApiError;
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub type Params = HashMap<String, String>;

/// A non-empty query parameter
pub fn param<'a>(params: &'a Params, name: &str) -> Result<&'a str, ApiError> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{name} is required")))
}

async fn not_found() -> ApiError {
    ApiError::not_found("route not found")
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ok", get(system::alive))
        .route("/api/v1/plugin/cache/get", get(system::cache_get))
        .route("/api/v1/plugin/cache/set", post(system::cache_set))
        .route("/api/v1/library/model/get", get(system::library_model))
        // Shadow
        .route("/api/v1/shadow/all", get(shadow::all))
        .route("/api/v1/shadow/device", get(shadow::device))
        .route("/api/v1/shadow/devicePoint", get(shadow::device_point))
        // Devices
        .route("/api/v1/device/writePoint", post(device::write_point))
        .route("/api/v1/device/writePoints", post(device::write_points))
        .route("/api/v1/device/readPoint", get(device::read_point))
        .route("/api/v1/device/list", get(device::list))
        .route("/api/v1/device/get", get(device::get))
        .route("/api/v1/device/add", post(device::add))
        .route("/api/v1/device/delete", post(device::delete))
        // Scenes
        .route("/api/v1/linkedge/create", post(linkedge::create))
        .route("/api/v1/linkedge/update", post(linkedge::update))
        .route("/api/v1/linkedge/delete", post(linkedge::delete))
        .route("/api/v1/linkedge/trigger", post(linkedge::trigger))
        .route("/api/v1/linkedge/try", post(linkedge::preview))
        .route("/api/v1/linkedge/status", post(linkedge::status))
        .route("/api/v1/linkedge/list", get(linkedge::list))
        .route("/api/v1/linkedge/get", get(linkedge::get))
        .route("/api/v1/linkedge/getLast", get(linkedge::get_last))
        // Federation
        .route(WS_PATH, get(ws_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
