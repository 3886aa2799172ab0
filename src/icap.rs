//! ICAP REQMOD client with Preview
//!
//! One TCP connection per scan. The exchange sends a fixed encapsulated
//! HTTP request head plus the first `preview_size` bytes as a single
//! chunked-encoding chunk, then follows the server's lead: `204` is a clean
//! verdict, `100 Continue` asks for the rest of the body (terminated with
//! the literal `0; ieof` sequence), anything else is a block. Wire details
//! are deliberately conservative: CRLF line endings everywhere, uppercase
//! hex chunk sizes, no connection reuse.

use crate::buffer::SpoolBuffer;
use crate::config::{IcapConfig, LARGE_PAYLOAD_BYTES};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Header substring the scanner emits when its own size limit was hit.
const SIZE_LIMIT_MARKER: &str = "Heuristics.Limits.Exceeded.MaxFileSize";

/// Errors from the ICAP exchange
#[derive(Debug, Error)]
pub enum IcapError {
    #[error("ICAP connect to {authority} failed: {source}")]
    Connect {
        authority: String,
        source: std::io::Error,
    },

    #[error("ICAP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ICAP operation timed out")]
    Timeout,

    #[error("buffer error during scan: {0}")]
    Buffer(#[from] crate::buffer::BufferError),
}

/// Scan outcome, produced exactly once per attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcapVerdict {
    /// Scanner answered 204; content passes unmodified.
    Clean,
    /// Scanner refused the content.
    Blocked {
        http_code: u16,
        message: String,
        is_size_limit: bool,
        raw_headers: Vec<String>,
    },
    /// The response could not be understood. Treated as a block by callers.
    ProtocolError { detail: String },
}

impl IcapVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            IcapVerdict::Clean => "clean",
            IcapVerdict::Blocked { .. } => "blocked",
            IcapVerdict::ProtocolError { .. } => "protocol_error",
        }
    }
}

/// REQMOD client for one configured scanner service.
pub struct IcapClient {
    host: String,
    port: u16,
    service: String,
    preview_size: usize,
    base_timeout: Duration,
    log_traffic: bool,
}

impl IcapClient {
    pub fn new(icap: &IcapConfig, base_timeout: Duration, log_traffic: bool) -> Self {
        Self {
            host: icap.host.clone(),
            port: icap.port,
            service: icap.service.clone(),
            preview_size: icap.preview_size,
            base_timeout,
            log_traffic,
        }
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Socket deadline for this payload size (5x for large payloads).
    fn io_timeout(&self, payload_bytes: u64) -> Duration {
        if payload_bytes > LARGE_PAYLOAD_BYTES {
            self.base_timeout * 5
        } else {
            self.base_timeout
        }
    }

    /// Run one REQMOD exchange over the buffered upload.
    pub async fn scan(&self, buffer: &mut SpoolBuffer) -> Result<IcapVerdict, IcapError> {
        let total = buffer.total_size();
        let deadline = self.io_timeout(total);
        let authority = self.authority();

        let stream = timeout(deadline, TcpStream::connect(&authority))
            .await
            .map_err(|_| IcapError::Timeout)?
            .map_err(|source| IcapError::Connect {
                authority: authority.clone(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let preview = buffer.preview(self.preview_size).await?;
        let preview_len = preview.len() as u64;

        // Encapsulated HTTP request head is fixed; only Content-Length varies.
        let http_head = format!(
            "POST / HTTP/1.1\r\nHost: example.com\r\nContent-Length: {total}\r\n\r\n"
        );
        let icap_head = format!(
            "REQMOD icap://{authority}/{service} ICAP/1.0\r\n\
             Host: {host}\r\n\
             Allow: 204\r\n\
             Preview: {preview_len}\r\n\
             Encapsulated: req-hdr=0, req-body={body_offset}\r\n\r\n",
            service = self.service,
            host = self.host,
            body_offset = http_head.len(),
        );

        if self.log_traffic {
            for line in icap_head.split("\r\n").filter(|l| !l.is_empty()) {
                debug!(direction = "send", line, "icap");
            }
        }

        let mut request = Vec::with_capacity(icap_head.len() + http_head.len() + preview.len() + 32);
        request.extend_from_slice(icap_head.as_bytes());
        request.extend_from_slice(http_head.as_bytes());
        if !preview.is_empty() {
            request.extend_from_slice(format!("{:X}\r\n", preview.len()).as_bytes());
            request.extend_from_slice(&preview);
            request.extend_from_slice(b"\r\n");
        }
        request.extend_from_slice(b"0\r\n\r\n");

        timeout(deadline, write_half.write_all(&request))
            .await
            .map_err(|_| IcapError::Timeout)??;
        timeout(deadline, write_half.flush())
            .await
            .map_err(|_| IcapError::Timeout)??;

        let status = match self.read_line(&mut reader, deadline).await? {
            Some(line) => line,
            None => {
                return Ok(IcapVerdict::ProtocolError {
                    detail: "connection closed before any response".to_string(),
                })
            }
        };

        let code = match parse_icap_status(&status) {
            Some(code) => code,
            None => {
                return Ok(IcapVerdict::ProtocolError {
                    detail: format!("unparseable status line: {status:?}"),
                })
            }
        };

        match code {
            204 => Ok(IcapVerdict::Clean),
            100 => {
                self.send_remaining(&mut write_half, buffer, preview_len, deadline)
                    .await?;

                // The 100 response's terminating blank line is still pending.
                let _ = self.read_line(&mut reader, deadline).await?;
                let final_status = match self.read_line(&mut reader, deadline).await? {
                    Some(line) => line,
                    None => {
                        return Ok(IcapVerdict::ProtocolError {
                            detail: "connection closed after body transfer".to_string(),
                        })
                    }
                };
                match parse_icap_status(&final_status) {
                    Some(204) => Ok(IcapVerdict::Clean),
                    Some(code) => {
                        self.read_blocked(&mut reader, code, &final_status, deadline)
                            .await
                    }
                    None => Ok(IcapVerdict::ProtocolError {
                        detail: format!("unparseable final status line: {final_status:?}"),
                    }),
                }
            }
            other => self.read_blocked(&mut reader, other, &status, deadline).await,
        }
    }

    /// After a 100 Continue: stream the rest of the buffer as one chunk and
    /// terminate with the exact `0; ieof` sequence. A file that fit inside
    /// the preview sends only the terminator.
    async fn send_remaining(
        &self,
        write_half: &mut OwnedWriteHalf,
        buffer: &mut SpoolBuffer,
        preview_len: u64,
        deadline: Duration,
    ) -> Result<(), IcapError> {
        let remaining = buffer.total_size() - preview_len;
        if remaining > 0 {
            timeout(
                deadline,
                write_half.write_all(format!("{remaining:X}\r\n").as_bytes()),
            )
            .await
            .map_err(|_| IcapError::Timeout)??;

            let mut reader = buffer.reader(preview_len).await?;
            while let Some(chunk) = reader.next_chunk().await? {
                timeout(deadline, write_half.write_all(&chunk))
                    .await
                    .map_err(|_| IcapError::Timeout)??;
            }
            timeout(deadline, write_half.write_all(b"\r\n"))
                .await
                .map_err(|_| IcapError::Timeout)??;
        }
        timeout(deadline, write_half.write_all(b"0; ieof\r\n\r\n"))
            .await
            .map_err(|_| IcapError::Timeout)??;
        timeout(deadline, write_half.flush())
            .await
            .map_err(|_| IcapError::Timeout)??;
        Ok(())
    }

    /// Harvest the blocked response: ICAP headers up to the blank line, then
    /// possibly one embedded HTTP status line.
    async fn read_blocked(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        icap_code: u16,
        status_line: &str,
        deadline: Duration,
    ) -> Result<IcapVerdict, IcapError> {
        let mut raw_headers = Vec::new();
        loop {
            match self.read_line(reader, deadline).await? {
                Some(line) if line.is_empty() => break,
                Some(line) => raw_headers.push(line),
                None => break,
            }
        }

        // One more line may carry the embedded HTTP status.
        let mut http_code = icap_code;
        if let Ok(Some(line)) = self.read_line(reader, deadline).await {
            if !line.is_empty() {
                if let Some(code) = parse_http_status(&line) {
                    http_code = code;
                }
                raw_headers.push(line);
            }
        }

        let is_size_limit = raw_headers.iter().any(|h| h.contains(SIZE_LIMIT_MARKER));
        let message = status_line
            .splitn(3, ' ')
            .nth(2)
            .unwrap_or("blocked")
            .to_string();

        if is_size_limit {
            warn!(icap_code, "scanner reported its file-size limit exceeded");
        }

        Ok(IcapVerdict::Blocked {
            http_code,
            message,
            is_size_limit,
            raw_headers,
        })
    }

    /// Read one CRLF line under the deadline. `Ok(None)` on clean EOF.
    async fn read_line(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        deadline: Duration,
    ) -> Result<Option<String>, IcapError> {
        let mut line = String::new();
        let n = timeout(deadline, reader.read_line(&mut line))
            .await
            .map_err(|_| IcapError::Timeout)??;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        if self.log_traffic {
            debug!(direction = "recv", line = %line, "icap");
        }
        Ok(Some(line))
    }
}

/// `ICAP/1.0 204 No Content` -> 204
fn parse_icap_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let proto = parts.next()?;
    if !proto.starts_with("ICAP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// `HTTP/1.1 403 Forbidden` -> 403
fn parse_http_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let proto = parts.next()?;
    if !proto.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
