use axum::{
    body::Bytes,
    extract::{State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{json, Value};
use sol_relay_core::{
    handle_client_connection, native::HttpRpcForwarder, protocol::ErrorReply, RelayHandle,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct ApiState {
    pub relay: RelayHandle,
    pub forwarder: Arc<HttpRpcForwarder>,
    pub started_at: DateTime<Utc>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/relay/status", get(status_handler))
        .route("/relay/reconnect", post(reconnect_handler))
        .route("/rpc", post(rpc_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn ws_handler(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_client_connection(socket, state.relay))
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);
    match state.relay.status().await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "timestamp": Utc::now().to_rfc3339(),
                "uptime_secs": uptime_secs,
                "upstream": status.state,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "message": e.to_string() })),
        ),
    }
}

async fn status_handler(State(state): State<ApiState>) -> Response {
    match state.relay.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "message": e.to_string() })),
        )
            .into_response(),
    }
}

async fn reconnect_handler(State(state): State<ApiState>) -> impl IntoResponse {
    match state.relay.force_reconnect() {
        Ok(()) => {
            info!("Manual upstream reconnect requested via API");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "reconnecting" })),
            )
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "message": e.to_string() })),
        ),
    }
}

async fn rpc_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    match state.forwarder.forward(body.to_vec()).await {
        Ok(forwarded) => {
            let status = StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = forwarded
                .content_type
                .unwrap_or_else(|| "application/json".to_string());
            (status, [(header::CONTENT_TYPE, content_type)], forwarded.body).into_response()
        }
        Err(e) => {
            warn!("HTTP RPC passthrough failed: {}", e);
            let id = serde_json::from_slice::<Value>(&body)
                .ok()
                .and_then(|v| v.get("id").cloned())
                .unwrap_or(Value::Null);
            (
                StatusCode::BAD_GATEWAY,
                [(header::CONTENT_TYPE, "application/json".to_string())],
                ErrorReply::upstream_unavailable(id).to_text(),
            )
                .into_response()
        }
    }
}
