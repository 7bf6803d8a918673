// Plain HTTP listener for liveness, readiness and counters.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{ErrorCode, RelayError};
use crate::metrics::global_metrics;
use crate::ws::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now().to_rfc3339() }))
}

async fn ready(State(state): State<RelayState>) -> Response {
    let ready = !state.shutdown.is_draining();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ready": ready, "timestamp": Utc::now().to_rfc3339() }))).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

async fn metrics(Query(query): Query<MetricsQuery>, headers: HeaderMap) -> Response {
    let metrics = global_metrics();
    let wants_text = match query.format.as_deref() {
        Some("prometheus") | Some("text") => true,
        Some(_) => false,
        None => headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|accept| accept.starts_with("text/plain")),
    };

    if wants_text {
        (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.render_prometheus(),
        )
            .into_response()
    } else {
        Json(metrics.snapshot()).into_response()
    }
}

async fn not_found() -> RelayError {
    RelayError::from_code(ErrorCode::NotFound)
}
