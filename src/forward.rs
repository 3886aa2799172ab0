//! Backend forwarder
//!
//! After a clean verdict the buffered file is re-wrapped in a freshly
//! generated multipart envelope and streamed to the backend as a chunked
//! request: one chunk for the preamble (boundary + the captured part
//! headers, verbatim), one chunk per 128 KiB of file data, one chunk for
//! the postamble. The backend response is relayed to the client with
//! hop-by-hop headers stripped.

use crate::buffer::{BufferReader, SpoolBuffer};
use crate::config::{BackendConfig, LARGE_PAYLOAD_BYTES};
use crate::multipart::PartHeaders;
use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from the backend leg
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid backend request: {0}")]
    Request(String),

    #[error("backend connect failed: {0}")]
    Connect(reqwest::Error),

    #[error("backend request failed: {0}")]
    Http(reqwest::Error),

    #[error("backend request timed out")]
    Timeout,

    #[error("buffer error during forward: {0}")]
    Buffer(#[from] crate::buffer::BufferError),
}

impl ForwardError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout
        } else if e.is_builder() {
            ForwardError::Request(e.to_string())
        } else if e.is_connect() {
            ForwardError::Connect(e)
        } else {
            ForwardError::Http(e)
        }
    }

    /// Parameter errors are never worth retrying.
    fn is_parameter(&self) -> bool {
        matches!(self, ForwardError::Request(_))
    }

    fn is_connect(&self) -> bool {
        matches!(self, ForwardError::Connect(_))
    }
}

/// Inbound connection context re-expressed as forwarding headers.
#[derive(Debug, Clone)]
pub struct InboundMeta {
    /// Request URI, preserved verbatim in the backend URL
    pub request_uri: String,
    /// Original request headers
    pub headers: HeaderMap,
    /// Client peer address
    pub peer_ip: IpAddr,
    /// Port this proxy accepted the connection on
    pub listen_port: u16,
    /// Scheme the client used to reach the proxy
    pub scheme: &'static str,
}

/// Inbound headers that must not be copied onto the backend request.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "content-type", "transfer-encoding"];

/// Hop-by-hop response headers never relayed to the client.
const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "content-length"];

/// Forwards approved uploads to the configured backend.
pub struct BackendForwarder {
    client: reqwest::Client,
    backend: BackendConfig,
    base_timeout: Duration,
}

impl BackendForwarder {
    pub fn new(
        backend: &BackendConfig,
        connect_timeout: Duration,
        base_timeout: Duration,
    ) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ForwardError::Request(e.to_string()))?;
        Ok(Self {
            client,
            backend: backend.clone(),
            base_timeout,
        })
    }

    /// Deadline for this payload size (5x for large payloads).
    fn timeout_for(&self, payload_bytes: u64) -> Duration {
        if payload_bytes > LARGE_PAYLOAD_BYTES {
            self.base_timeout * 5
        } else {
            self.base_timeout
        }
    }

    /// Single-shot forward. The orchestrator uses exactly this: the
    /// upstream treats the upload as a single-use token, so no retries.
    pub async fn forward(
        &self,
        meta: &InboundMeta,
        part: &PartHeaders,
        buffer: &mut SpoolBuffer,
    ) -> Result<reqwest::Response, ForwardError> {
        let url = self.backend.url_for(&meta.request_uri);
        let total = buffer.total_size();
        let boundary = generate_boundary();

        let headers = self.build_headers(meta, &boundary)?;
        let reader = buffer.reader(0).await?;
        let body = reqwest::Body::wrap_stream(envelope_stream(&boundary, part, reader));

        debug!(url = %url, bytes = total, boundary = %boundary, "forwarding to backend");

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .timeout(self.timeout_for(total))
            .body(body)
            .send()
            .await
            .map_err(ForwardError::from_reqwest)?;

        Ok(response)
    }

    /// Retry wrapper with quadratic backoff (1s, 4s, 9s...). Not used on the
    /// upload path; kept for callers whose upstream tolerates replays.
    /// Parameter errors never retry; connection errors for large payloads
    /// don't either, since replaying >100 MiB on a flaky link compounds the
    /// outage.
    pub async fn forward_with_retry(
        &self,
        meta: &InboundMeta,
        part: &PartHeaders,
        buffer: &mut SpoolBuffer,
        max_attempts: u32,
    ) -> Result<reqwest::Response, ForwardError> {
        let total = buffer.total_size();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.forward(meta, part, buffer).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) if e.is_parameter() => return Err(e),
                Err(e) if e.is_connect() && total > LARGE_PAYLOAD_BYTES => return Err(e),
                Err(e) => {
                    let backoff = Duration::from_secs(u64::from(attempt * attempt));
                    warn!(attempt, error = %e, backoff_s = backoff.as_secs(), "backend forward failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Copy inbound headers minus the ones we own, then add the forwarding
    /// set derived from the connection context.
    fn build_headers(
        &self,
        meta: &InboundMeta,
        boundary: &str,
    ) -> Result<HeaderMap, ForwardError> {
        let mut headers = HeaderMap::new();
        for (name, value) in meta.headers.iter() {
            if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let content_type = format!("multipart/form-data; boundary={boundary}");
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_str(&content_type)
                .map_err(|e| ForwardError::Request(e.to_string()))?,
        );

        let peer = meta.peer_ip.to_string();
        let forwarded_for = match meta.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {peer}"),
            None => peer.clone(),
        };
        set_header(&mut headers, "x-forwarded-for", &forwarded_for)?;
        set_header(&mut headers, "x-real-ip", &peer)?;
        set_header(&mut headers, "x-forwarded-proto", meta.scheme)?;
        let forwarded_host = meta
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&self.backend.host)
            .to_string();
        set_header(&mut headers, "x-forwarded-host", &forwarded_host)?;
        set_header(&mut headers, "x-forwarded-port", &meta.listen_port.to_string())?;

        Ok(headers)
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), ForwardError> {
    let value =
        HeaderValue::from_str(value).map_err(|e| ForwardError::Request(e.to_string()))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Fresh browser-style boundary: fixed prefix plus 16 random alphanumerics.
pub fn generate_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("----WebKitFormBoundary{suffix}")
}

/// The three-phase body: preamble, file chunks, postamble. Each stream item
/// becomes one HTTP chunk on the wire.
fn envelope_stream(
    boundary: &str,
    part: &PartHeaders,
    reader: BufferReader,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let mut preamble = String::new();
    preamble.push_str("--");
    preamble.push_str(boundary);
    preamble.push_str("\r\n");
    for line in &part.raw {
        preamble.push_str(line);
        preamble.push_str("\r\n");
    }
    preamble.push_str("\r\n");

    enum Phase {
        Preamble,
        File,
        Postamble,
        Done,
    }

    struct BodyState {
        phase: Phase,
        preamble: Bytes,
        postamble: Bytes,
        reader: BufferReader,
    }

    let state = BodyState {
        phase: Phase::Preamble,
        preamble: Bytes::from(preamble),
        postamble: Bytes::from(format!("\r\n--{boundary}--\r\n")),
        reader,
    };

    // Every yielded item is non-empty; an empty item would end the chunked
    // encoding before the postamble.
    futures::stream::unfold(state, |mut st| async move {
        loop {
            match st.phase {
                Phase::Preamble => {
                    st.phase = Phase::File;
                    return Some((Ok(st.preamble.clone()), st));
                }
                Phase::File => match st.reader.next_chunk().await {
                    Ok(Some(chunk)) => return Some((Ok(chunk), st)),
                    Ok(None) => {
                        st.phase = Phase::Postamble;
                    }
                    Err(e) => {
                        st.phase = Phase::Done;
                        return Some((Err(e), st));
                    }
                },
                Phase::Postamble => {
                    st.phase = Phase::Done;
                    return Some((Ok(st.postamble.clone()), st));
                }
                Phase::Done => return None,
            }
        }
    })
}

/// Build the client response from the backend's: status and headers copied,
/// hop-by-hop headers dropped, body streamed through unchanged.
pub fn relay_response(backend: reqwest::Response) -> Response {
    let status = backend.status();
    let mut headers = HeaderMap::new();
    for (name, value) in backend.headers().iter() {
        if HOP_BY_HOP_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let body = Body::from_stream(backend.bytes_stream());
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
