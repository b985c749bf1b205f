//! Liveness, the plugin key/value cache and the resource library

use super::{param, Params};
use crate::response::{ok, ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
};
use serde_json::{Map, Value};

pub async fn alive() -> ApiResult {
    ok(true)
}

/// `{key: value}`, with an empty string for unknown keys
pub async fn cache_get(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let key = param(&params, "key")?;
    let value = state
        .plugin_cache
        .get(key)
        .map(|v| v.clone())
        .unwrap_or_else(|| Value::String(String::new()));
    let mut result = Map::new();
    result.insert(key.to_string(), value);
    ok(result)
}

/// Store every pair of a JSON object
pub async fn cache_set(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let pairs: Map<String, Value> = serde_json::from_slice(&body)?;
    for (key, value) in pairs {
        state.plugin_cache.insert(key, value);
    }
    ok(Value::Null)
}

pub async fn library_model(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let key = param(&params, "key")?;
    let model = state
        .library
        .model(key)
        .await?
        .ok_or_else(|| ApiError::bad_request(format!("library model {key} not found")))?;
    ok(model)
}
