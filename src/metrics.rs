//! Prometheus metrics for the scangate proxy.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based
//! collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    Opts, Registry, TextEncoder, TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;
use crate::pipeline::breaker::BreakerState;

/// All Prometheus metrics for the proxy.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,

    // -- Upload pipeline --
    pub uploads_total: IntCounterVec,
    pub upload_bytes: Histogram,
    pub phase_duration_seconds: HistogramVec,
    pub scan_verdicts_total: IntCounterVec,
    pub buffer_spills_total: IntCounter,

    // -- Circuit breakers --
    pub breaker_state: GaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // -- Process & Build --
        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("scangate_build_info", "Build information"),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        // Register standard process metrics (RSS, CPU, open FDs on Linux)
        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        // -- HTTP Requests --
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "scangate_http_requests_total",
                "Total HTTP requests by method, status, and operation",
            ),
            &["method", "status", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "scangate_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        // -- Upload pipeline --
        let uploads_total = IntCounterVec::new(
            Opts::new(
                "scangate_uploads_total",
                "Upload requests by terminal outcome",
            ),
            &["outcome"],
        )
        .unwrap();
        registry.register(Box::new(uploads_total.clone())).unwrap();

        // [4KB, 64KB, 1MB, 16MB, 256MB, 4GB]
        let upload_size_buckets = prometheus::exponential_buckets(4096.0, 16.0, 6).unwrap();
        let upload_bytes = Histogram::with_opts(
            HistogramOpts::new("scangate_upload_bytes", "Uploaded file size in bytes")
                .buckets(upload_size_buckets),
        )
        .unwrap();
        registry.register(Box::new(upload_bytes.clone())).unwrap();

        let phase_buckets = vec![
            0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0,
        ];
        let phase_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "scangate_phase_duration_seconds",
                "Pipeline phase duration in seconds",
            )
            .buckets(phase_buckets),
            &["phase"],
        )
        .unwrap();
        registry
            .register(Box::new(phase_duration_seconds.clone()))
            .unwrap();

        let scan_verdicts_total = IntCounterVec::new(
            Opts::new("scangate_scan_verdicts_total", "Scanner verdicts by kind"),
            &["verdict"],
        )
        .unwrap();
        registry
            .register(Box::new(scan_verdicts_total.clone()))
            .unwrap();

        let buffer_spills_total = IntCounter::new(
            "scangate_buffer_spills_total",
            "Uploads that crossed the memory threshold and spilled to disk",
        )
        .unwrap();
        registry
            .register(Box::new(buffer_spills_total.clone()))
            .unwrap();

        // -- Circuit breakers --
        let breaker_state = GaugeVec::new(
            Opts::new(
                "scangate_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open), updated on scrape",
            ),
            &["service"],
        )
        .unwrap();
        registry.register(Box::new(breaker_state.clone())).unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            build_info,
            http_requests_total,
            http_request_duration_seconds,
            uploads_total,
            upload_bytes,
            phase_duration_seconds,
            scan_verdicts_total,
            buffer_spills_total,
            breaker_state,
        }
    }
}

/// Classify a request into a bounded operation label.
pub fn classify_operation(method: &str, path: &str) -> &'static str {
    match path {
        "/health" => return "health",
        "/metrics" => return "metrics",
        _ => {}
    }
    match method {
        "POST" => "upload",
        _ => "other",
    }
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => return next.run(request).await,
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let operation = classify_operation(&method, &path);

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    metrics
        .http_requests_total
        .with_label_values(&[&method, &status, operation])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, operation])
        .observe(duration);

    response
}

/// Handler for GET /metrics, returning Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => {
            return (StatusCode::NOT_FOUND, "Metrics not enabled").into_response();
        }
    };

    // Update on-demand gauges (all O(1) atomic reads)
    for (service, breaker) in state.pipeline.breaker_states() {
        let value = match breaker {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        };
        metrics.breaker_state.with_label_values(&[service]).set(value);
    }

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}
