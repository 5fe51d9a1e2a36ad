//! Operator endpoints for inspecting and steering the control plane.
//!
//! - `GET /api/v1/system/cache/stats`
//! - `POST /api/v1/system/cache/invalidate`
//! - `GET /api/v1/system/breakers`

use axum::{extract::State, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    performance::{CacheStats, TtlCache},
    resilience::{CircuitBreakerRegistry, CircuitBreakerStats},
};

#[derive(Clone)]
pub struct ControlState {
    pub cache: Arc<TtlCache<Value>>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

pub fn routes(state: ControlState) -> Router {
    Router::new()
        .route("/api/v1/system/cache/stats", get(cache_stats))
        .route("/api/v1/system/cache/invalidate", post(invalidate_cache))
        .route("/api/v1/system/breakers", get(breakers))
        .with_state(state)
}

pub async fn cache_stats(State(state): State<ControlState>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

/// Remove every cache key equal to, prefixed by, or suffixed by `pattern`.
/// An empty pattern would match everything and is refused.
pub async fn invalidate_cache(
    State(state): State<ControlState>,
    Json(payload): Json<InvalidateRequest>,
) -> ApiResult<Json<InvalidateResponse>> {
    if payload.pattern.is_empty() {
        return Err(ApiError::BadRequest("pattern must not be empty".to_string()));
    }

    let removed = state.cache.invalidate_by_pattern(&payload.pattern).await;
    tracing::info!(pattern = %payload.pattern, removed, "Cache invalidated");

    Ok(Json(InvalidateResponse { removed }))
}

pub async fn breakers(State(state): State<ControlState>) -> Json<Vec<CircuitBreakerStats>> {
    Json(state.breakers.snapshot())
}
