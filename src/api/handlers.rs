// src/api/handlers.rs

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::api::AppState;
use crate::error::AdxError;
use crate::openrtb::request::BidRequest;

/// 处理 CTV pod 竞价请求。无任何 bid 且无 pod 扩展时返回 204
pub async fn handle_openrtb_request(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, AdxError> {
    let mut raw = body.to_vec();
    let bid_request: BidRequest =
        simd_json::serde::from_slice(&mut raw).map_err(|e| AdxError::InvalidRequest(e.to_string()))?;
    let request_id = bid_request.id.clone();

    let response = state
        .engine
        .process_bid_request(bid_request)
        .await
        .inspect_err(|e| warn!(request_id = %request_id, status = %e.status(), error = %e, "bid request failed"))?;

    if response.seatbid.is_empty() && response.ext.is_none() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok((StatusCode::OK, Json(response)).into_response())
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cache = state.engine.resolver().cache();
    Json(json!({
        "status": "ok",
        "feature_reloader": state.features.is_running(),
        "regex_cache_entries": cache.len(),
        "regex_compilations": cache.compilations(),
    }))
}
