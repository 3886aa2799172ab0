//! HTTP ingress handlers
//!
//! One fallback route accepts the upload POST on any path (the URI is
//! preserved verbatim when the backend URL is built), plus the usual
//! health and metrics endpoints.

use crate::config::Config;
use crate::forward::InboundMeta;
use crate::metrics::Metrics;
use crate::pipeline::UploadPipeline;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Application state shared across handlers
pub struct AppState {
    pub pipeline: UploadPipeline,
    pub config: Arc<Config>,
    pub metrics: Option<Arc<Metrics>>,
}

/// Upload handler, mounted as the router fallback.
/// POST <any path> with a multipart/form-data body.
pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    if request.method() != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [("Allow", "POST")],
            "only POST uploads are accepted\n",
        )
            .into_response();
    }

    let request_uri = request.uri().to_string();
    debug!(uri = %request_uri, peer = %peer, "upload request received");

    let (parts, body) = request.into_parts();
    let meta = InboundMeta {
        request_uri,
        headers: parts.headers,
        peer_ip: peer.ip(),
        listen_port: state.config.listen_addr.port(),
        scheme: "http",
    };

    state.pipeline.handle(meta, body).await
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// ICAP circuit breaker state
    pub icap: &'static str,
    /// Backend circuit breaker state
    pub backend: &'static str,
}

/// Health check handler
/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let [(_, icap), (_, backend)] = state.pipeline.breaker_states();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        icap: icap.label(),
        backend: backend.label(),
    })
}
