//! Request handlers and routing.

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use scopesync_engine::{SyncPeer, SYNC_PATH};
use scopesync_protocol::RequestFrame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Path of the health endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Open peer sessions.
    pub sessions: usize,
}

/// Create the application router.
pub fn create_router(peer: Arc<SyncPeer>, max_body_bytes: usize) -> Router {
    Router::new()
        .route(SYNC_PATH, post(sync))
        .route(HEALTH_PATH, get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(peer)
}

async fn sync(State(peer): State<Arc<SyncPeer>>, body: Bytes) -> Result<Response, ApiError> {
    let frame = RequestFrame::from_json(&body)?;
    let session_id = frame.header.session_id;
    let step = frame.step();
    tracing::debug!(session_id = %session_id, %step, bytes = body.len(), "sync request");

    let response = peer.handle_frame(frame).await?;
    let bytes = response.to_json()?;
    Ok(([(header::CONTENT_TYPE, "application/json")], bytes).into_response())
}

async fn health(State(peer): State<Arc<SyncPeer>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: peer.session_count(),
    })
}
