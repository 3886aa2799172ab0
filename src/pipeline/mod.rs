//! Upload pipeline orchestrator
//!
//! Drives one request through the linear phase machine:
//! upload_init -> upload_stream -> upload_validate -> mime_validate ->
//! icap_scan -> backend_forward -> response. Each phase has its own
//! deadline; the scan and forward phases stretch theirs for large payloads,
//! and a global per-request deadline is checked between phases. Cleanup
//! tasks registered along the way run on every terminal outcome.

pub mod breaker;
pub mod cleanup;

use crate::api::errors::GateError;
use crate::buffer::{BufferMode, SpoolBuffer};
use crate::config::{Config, LimitsExceededBehaviour, LARGE_PAYLOAD_BYTES};
use crate::forward::{relay_response, BackendForwarder, InboundMeta};
use crate::icap::{IcapClient, IcapVerdict};
use crate::metrics::Metrics;
use crate::multipart::{boundary_from_content_type, MultipartEvent, MultipartParser, PartHeaders};
use crate::sniff::{self, MimeDetector};
use axum::body::Body;
use axum::http::HeaderValue;
use axum::response::Response;
use breaker::{BreakerState, CircuitBreaker};
use cleanup::{CleanupStack, ResourceKind, ResourceTracker};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const UPLOAD_VALIDATE_TIMEOUT: Duration = Duration::from_secs(1);
const MIME_VALIDATE_TIMEOUT: Duration = Duration::from_secs(3);
const SCAN_FORWARD_TIMEOUT: Duration = Duration::from_secs(60);
const SCAN_FORWARD_TIMEOUT_LARGE: Duration = Duration::from_secs(300);

/// Deadline for the size-aware phases (icap_scan, backend_forward).
fn phase_io_timeout(payload_bytes: u64) -> Duration {
    if payload_bytes > LARGE_PAYLOAD_BYTES {
        SCAN_FORWARD_TIMEOUT_LARGE
    } else {
        SCAN_FORWARD_TIMEOUT
    }
}

/// Per-request bookkeeping threaded through all phases.
pub struct RequestContext {
    pub request_id: String,
    pub phase: &'static str,
    pub started: Instant,
    pub bytes_processed: u64,
    pub op_count: u64,
    pub cleanup: CleanupStack,
    pub tracker: ResourceTracker,
    phase_started: Instant,
    metrics: Option<Arc<Metrics>>,
}

impl RequestContext {
    fn new(metrics: Option<Arc<Metrics>>) -> Self {
        let now = Instant::now();
        Self {
            request_id: Uuid::new_v4().to_string(),
            phase: "upload_init",
            started: now,
            bytes_processed: 0,
            op_count: 0,
            cleanup: CleanupStack::new(),
            tracker: ResourceTracker::new(),
            phase_started: now,
            metrics,
        }
    }

    fn enter_phase(&mut self, name: &'static str) {
        self.finish_phase();
        debug!(request_id = %self.request_id, phase = name, "entering phase");
        self.phase = name;
        self.phase_started = Instant::now();
    }

    fn finish_phase(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics
                .phase_duration_seconds
                .with_label_values(&[self.phase])
                .observe(self.phase_started.elapsed().as_secs_f64());
        }
    }
}

/// The per-request pipeline plus the process-wide pieces it shares:
/// configuration, the two circuit breakers, and metrics.
pub struct UploadPipeline {
    config: Arc<Config>,
    detector: MimeDetector,
    icap: IcapClient,
    forwarder: BackendForwarder,
    icap_breaker: CircuitBreaker,
    backend_breaker: CircuitBreaker,
    metrics: Option<Arc<Metrics>>,
}

impl UploadPipeline {
    pub fn new(config: Arc<Config>, metrics: Option<Arc<Metrics>>) -> Result<Self, GateError> {
        let detector = MimeDetector::new(&config.upload.temp_dir);
        let icap = IcapClient::new(
            &config.icap,
            config.socket_timeout(),
            config.log_icap_traffic,
        );
        let forwarder = BackendForwarder::new(
            &config.backend,
            config.socket_timeout(),
            SCAN_FORWARD_TIMEOUT,
        )?;
        let icap_breaker = CircuitBreaker::new("icap", &config.icap_breaker);
        let backend_breaker = CircuitBreaker::new("backend", &config.backend_breaker);

        Ok(Self {
            config,
            detector,
            icap,
            forwarder,
            icap_breaker,
            backend_breaker,
            metrics,
        })
    }

    /// Breaker states for the health endpoint and metrics scrapes.
    pub fn breaker_states(&self) -> [(&'static str, BreakerState); 2] {
        [
            ("icap", self.icap_breaker.state()),
            ("backend", self.backend_breaker.state()),
        ]
    }

    /// Run one upload request to a terminal outcome. Always runs cleanup and
    /// emits exactly one terminal log line.
    #[instrument(skip(self, meta, body), fields(uri = %meta.request_uri))]
    pub async fn handle(&self, meta: InboundMeta, body: Body) -> Response {
        let mut ctx = RequestContext::new(self.metrics.clone());
        let request_id = ctx.request_id.clone();

        let result = self.run(&mut ctx, &meta, body).await;

        ctx.finish_phase();
        let cleanup_errors = ctx.cleanup.run_all().await;
        let leftover = ctx.tracker.release_all();
        if leftover > 0 {
            debug!(request_id = %request_id, leftover, "resources swept at request end");
        }

        let duration_ms = ctx.started.elapsed().as_millis() as u64;
        let stats = ctx.tracker.stats();

        if let Some(metrics) = &self.metrics {
            metrics
                .upload_bytes
                .observe(ctx.bytes_processed as f64);
        }

        match result {
            Ok(mut response) => {
                if let Ok(value) = HeaderValue::from_str(&request_id) {
                    response.headers_mut().insert("x-request-id", value);
                }
                response
                    .headers_mut()
                    .insert("x-scan-status", HeaderValue::from_static("clean"));

                info!(
                    request_id = %request_id,
                    phase = ctx.phase,
                    duration_ms,
                    bytes = ctx.bytes_processed,
                    operations = ctx.op_count,
                    peak_memory = stats.peak_memory,
                    "upload relayed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.uploads_total.with_label_values(&["success"]).inc();
                }
                response
            }
            Err(err) => {
                error!(
                    request_id = %request_id,
                    phase = ctx.phase,
                    error_kind = err.kind(),
                    duration_ms,
                    bytes = ctx.bytes_processed,
                    operations = ctx.op_count,
                    cleanup_errors,
                    "upload failed: {err}"
                );
                if let Some(metrics) = &self.metrics {
                    metrics
                        .uploads_total
                        .with_label_values(&[err.kind()])
                        .inc();
                }
                err.into_response_with_id(&request_id)
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        meta: &InboundMeta,
        body: Body,
    ) -> Result<Response, GateError> {
        // --- upload_init ---
        let content_type = meta
            .headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                GateError::Validation("request must be multipart/form-data".to_string())
            })?;
        let boundary = boundary_from_content_type(content_type)?;

        let buffer = Arc::new(Mutex::new(SpoolBuffer::new(
            self.config.upload.memory_threshold,
            self.config.upload.max_file_size,
            &self.config.upload.temp_dir,
        )));
        let buffer_res = ctx.tracker.register(ResourceKind::Buffer, 0);
        {
            let buffer = buffer.clone();
            ctx.cleanup.register("clear_buffer", 95, move || async move {
                buffer.lock().await.clear().await;
                Ok(())
            });
        }

        // --- upload_stream ---
        ctx.enter_phase("upload_stream");
        let part = self
            .ingest_body(ctx, body, &boundary, &buffer, buffer_res)
            .await?;

        let total = buffer.lock().await.total_size();
        self.check_deadline(ctx, total)?;

        // --- upload_validate ---
        ctx.enter_phase("upload_validate");
        let filename = timeout(UPLOAD_VALIDATE_TIMEOUT, async {
            let part = part.as_ref().ok_or_else(|| {
                GateError::Validation("multipart body carries no file part".to_string())
            })?;
            let filename = part
                .filename
                .clone()
                .expect("file part always has a filename");
            if total == 0 {
                return Err(GateError::Validation("uploaded file is empty".to_string()));
            }
            if !self.config.extension_allowed(&filename) {
                return Err(GateError::Extension(format!(
                    "extension of {filename:?} is not in the allowlist"
                )));
            }
            let mut buf = buffer.lock().await;
            buf.filename = Some(filename.clone());
            buf.declared_mime = part.content_type.clone();
            Ok(filename)
        })
        .await
        .map_err(|_| GateError::Timeout("upload_validate phase exceeded 1s".to_string()))??;
        let part = part.expect("validated above");

        // --- mime_validate ---
        ctx.enter_phase("mime_validate");
        let detection = timeout(MIME_VALIDATE_TIMEOUT, async {
            let mut buf = buffer.lock().await;
            let preview = buf.preview(crate::sniff::magic::MAGIC_SCAN_LIMIT).await?;
            let spill = buf.spill_path().map(|p| p.to_path_buf());
            drop(buf);
            let detection = self
                .detector
                .sniff(&preview, Some(&filename), true, spill.as_deref())
                .await;
            Ok::<_, GateError>(detection)
        })
        .await
        .map_err(|_| GateError::Timeout("mime_validate phase exceeded 3s".to_string()))??;

        debug!(
            request_id = %ctx.request_id,
            mime = %detection.mime,
            method = detection.method.label(),
            "content type detected"
        );
        {
            let mut buf = buffer.lock().await;
            buf.detected_mime = Some(detection.mime.clone());
            buf.detection_method = Some(detection.method.label().to_string());
        }

        if self.config.check_mime_type {
            if let Some(declared) = &part.content_type {
                let verdict = sniff::validate(&detection.mime, declared);
                if !verdict.ok {
                    return Err(GateError::Mime(format!(
                        "detected {} does not match declared {} ({})",
                        detection.mime, declared, verdict.reason
                    )));
                }
                debug!(request_id = %ctx.request_id, reason = verdict.reason, "declared type accepted");
            }
        }

        self.check_deadline(ctx, total)?;

        // --- icap_scan ---
        ctx.enter_phase("icap_scan");
        if self.icap_breaker.check().is_err() {
            return Err(GateError::ServiceUnavailable(
                "virus scanner circuit breaker is open".to_string(),
            ));
        }

        let socket_res = ctx.tracker.register(ResourceKind::Socket, 0);
        let scan_result = {
            let mut buf = buffer.lock().await;
            timeout(phase_io_timeout(total), self.icap.scan(&mut buf)).await
        };
        // One connection per scan, closed when the exchange returns.
        ctx.tracker.release(socket_res);
        let verdict = match scan_result {
            Err(_) => {
                self.icap_breaker.record_failure();
                return Err(GateError::Timeout("icap_scan phase timed out".to_string()));
            }
            Ok(Err(e)) => {
                self.icap_breaker.record_failure();
                return Err(e.into());
            }
            Ok(Ok(verdict)) => {
                self.icap_breaker.record_success();
                verdict
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .scan_verdicts_total
                .with_label_values(&[verdict.label()])
                .inc();
        }

        match verdict {
            IcapVerdict::Clean => {}
            IcapVerdict::Blocked {
                is_size_limit: true,
                ..
            } if self.config.limits_exceeded_behaviour == LimitsExceededBehaviour::Allow => {
                warn!(
                    request_id = %ctx.request_id,
                    bytes = total,
                    "scanner size limit exceeded, passing through per configuration"
                );
            }
            IcapVerdict::Blocked {
                http_code, message, ..
            } => {
                return Err(GateError::IcapScan(format!(
                    "{message} (scanner code {http_code})"
                )));
            }
            IcapVerdict::ProtocolError { detail } => {
                // Conservative: an answer we cannot parse blocks the upload.
                return Err(GateError::IcapScan(format!(
                    "unintelligible scanner response: {detail}"
                )));
            }
        }

        self.check_deadline(ctx, total)?;

        // --- backend_forward ---
        ctx.enter_phase("backend_forward");
        if self.backend_breaker.check().is_err() {
            return Err(GateError::ServiceUnavailable(
                "backend circuit breaker is open".to_string(),
            ));
        }

        // Single shot: the upstream treats the upload as a single-use token.
        let backend_res = ctx.tracker.register(ResourceKind::Socket, 0);
        let forward_result = {
            let mut buf = buffer.lock().await;
            self.forwarder.forward(meta, &part, &mut buf).await
        };
        ctx.tracker.release(backend_res);
        let backend_response = match forward_result {
            Err(e) => {
                self.backend_breaker.record_failure();
                return Err(e.into());
            }
            Ok(response) => {
                self.backend_breaker.record_success();
                response
            }
        };

        // --- response ---
        ctx.enter_phase("response");
        debug!(
            request_id = %ctx.request_id,
            status = backend_response.status().as_u16(),
            "relaying backend response"
        );
        Ok(relay_response(backend_response))
    }

    /// Stream the client body through the multipart parser into the buffer.
    /// Returns the captured file part headers, if any part carried a file.
    async fn ingest_body(
        &self,
        ctx: &mut RequestContext,
        body: Body,
        boundary: &str,
        buffer: &Arc<Mutex<SpoolBuffer>>,
        buffer_res: u64,
    ) -> Result<Option<PartHeaders>, GateError> {
        let mut parser = MultipartParser::new(boundary);
        let mut stream = body.into_data_stream();
        let upload_timeout = self.config.upload_timeout();
        let chunk_size = self.config.upload.chunk_size.max(1);

        let mut part: Option<PartHeaders> = None;
        let mut in_file_part = false;
        let mut file_complete = false;

        loop {
            let next = timeout(upload_timeout, stream.next())
                .await
                .map_err(|_| GateError::Timeout("client body read timed out".to_string()))?;
            let chunk = match next {
                None => break,
                Some(Err(e)) => {
                    return Err(GateError::Upload(format!("client body read failed: {e}")))
                }
                Some(Ok(chunk)) => chunk,
            };

            for piece in chunk.chunks(chunk_size) {
                ctx.op_count += 1;
                for event in parser.feed(piece)? {
                    match event {
                        MultipartEvent::PartHeaders(headers) => {
                            if part.is_none() && headers.is_file() {
                                in_file_part = true;
                                part = Some(headers);
                            } else {
                                // Non-file fields and extra parts are drained
                                // but never buffered.
                                in_file_part = false;
                            }
                        }
                        MultipartEvent::PartData(data) => {
                            if in_file_part && !file_complete {
                                let mut buf = buffer.lock().await;
                                let was_memory = buf.mode() == BufferMode::Memory;
                                buf.append(data).await?;
                                if was_memory && buf.mode() == BufferMode::Hybrid {
                                    info!(
                                        request_id = %ctx.request_id,
                                        bytes = buf.total_size(),
                                        "buffer switched to disk spill"
                                    );
                                    if let Some(metrics) = &self.metrics {
                                        metrics.buffer_spills_total.inc();
                                    }
                                }
                                ctx.bytes_processed = buf.total_size();
                                ctx.tracker.touch(buffer_res, buf.stats().memory_size);
                            }
                        }
                        MultipartEvent::PartEnd => {
                            if in_file_part {
                                in_file_part = false;
                                file_complete = true;
                            }
                        }
                        MultipartEvent::Finished => {}
                    }
                }
            }
        }
        parser.finish()?;

        Ok(part)
    }

    /// Global per-request deadline, widened alongside the size-aware phases.
    fn check_deadline(&self, ctx: &RequestContext, payload_bytes: u64) -> Result<(), GateError> {
        let limit = self.config.request_timeout_for(payload_bytes);
        if ctx.started.elapsed() >= limit {
            return Err(GateError::Timeout(format!(
                "request exceeded the global {}s deadline",
                limit.as_secs()
            )));
        }
        Ok(())
    }
}
