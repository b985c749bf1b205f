//! `linkedge/*`: scene CRUD and manual firing

use super::{param, Params};
use crate::response::{ok, ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
};
use linkedge_engine::LinkEdgeConfig;

pub async fn create(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let rule: LinkEdgeConfig = serde_json::from_slice(&body)?;
    ok(state.linkedge.create(rule).await?)
}

pub async fn update(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let rule: LinkEdgeConfig = serde_json::from_slice(&body)?;
    ok(state.linkedge.update(rule).await?)
}

pub async fn delete(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    state.linkedge.delete(param(&params, "id")?).await?;
    ok(true)
}

pub async fn trigger(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let id = param(&params, "id")?;
    tracing::info!(
        "Trigger linkEdge {} from {}",
        id,
        params.get("source").map_or("rest", String::as_str)
    );
    state.linkedge.trigger(id).await?;
    ok(true)
}

/// Dry-run an unsaved rule
pub async fn preview(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let rule: LinkEdgeConfig = serde_json::from_slice(&body)?;
    state.linkedge.preview(rule).await?;
    ok(true)
}

pub async fn status(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let id = param(&params, "id")?;
    let enable = match param(&params, "enable")? {
        "true" => true,
        "false" => false,
        _ => return Err(ApiError::bad_request("enable must be true or false")),
    };
    ok(state.linkedge.set_enable(id, enable).await?)
}

pub async fn list(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    let tag = params.get("tag").map(String::as_str).filter(|t| !t.is_empty());
    ok(state.linkedge.list(tag))
}

pub async fn get(State(state): State<AppState>, Query(params): Query<Params>) -> ApiResult {
    ok(state.linkedge.get(param(&params, "id")?)?)
}

pub async fn get_last(State(state): State<AppState>) -> ApiResult {
    ok(state.linkedge.get_last())
}
