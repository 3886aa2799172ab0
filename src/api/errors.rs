//! Error taxonomy and HTTP response mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Gate errors surfaced to the client
#[derive(Debug, Clone, Error)]
pub enum GateError {
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("request validation failed: {0}")]
    Validation(String),

    #[error("content type check failed: {0}")]
    Mime(String),

    #[error("file extension not allowed: {0}")]
    Extension(String),

    #[error("file too large: {0}")]
    Memory(String),

    #[error("scanner connection failed: {0}")]
    IcapConnection(String),

    #[error("upload blocked by scanner: {0}")]
    IcapScan(String),

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("service temporarily unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Stable error kind, surfaced in the X-Error-Type header and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::Upload(_) => "UPLOAD_ERROR",
            GateError::Validation(_) => "VALIDATION_ERROR",
            GateError::Mime(_) => "MIME_ERROR",
            GateError::Extension(_) => "EXTENSION_ERROR",
            GateError::Memory(_) => "MEMORY_ERROR",
            GateError::IcapConnection(_) => "ICAP_CONNECTION_ERROR",
            GateError::IcapScan(_) => "ICAP_SCAN_ERROR",
            GateError::Backend(_) => "BACKEND_ERROR",
            GateError::Timeout(_) => "TIMEOUT_ERROR",
            GateError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            GateError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Fixed HTTP status per error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::Upload(_)
            | GateError::Validation(_)
            | GateError::Mime(_)
            | GateError::Extension(_) => StatusCode::BAD_REQUEST,
            GateError::Memory(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GateError::IcapScan(_) => StatusCode::FORBIDDEN,
            GateError::IcapConnection(_) | GateError::Backend(_) => StatusCode::BAD_GATEWAY,
            GateError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            GateError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error response: plain text body, request id and kind as headers.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        (
            self.status_code(),
            [
                ("Content-Type", "text/plain"),
                ("X-Request-ID", request_id),
                ("X-Error-Type", self.kind()),
            ],
            self.to_string(),
        )
            .into_response()
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.into_response_with_id(&request_id)
    }
}

impl From<crate::buffer::BufferError> for GateError {
    fn from(err: crate::buffer::BufferError) -> Self {
        match err {
            crate::buffer::BufferError::FileTooLarge { size, max } => GateError::Memory(format!(
                "upload of {size} bytes exceeds the {max} byte limit"
            )),
            crate::buffer::BufferError::Io(e) => GateError::Internal(format!("buffer I/O: {e}")),
        }
    }
}

impl From<crate::multipart::MultipartError> for GateError {
    fn from(err: crate::multipart::MultipartError) -> Self {
        match err {
            crate::multipart::MultipartError::MissingBoundary => {
                GateError::Validation(err.to_string())
            }
            other => GateError::Upload(other.to_string()),
        }
    }
}

impl From<crate::icap::IcapError> for GateError {
    fn from(err: crate::icap::IcapError) -> Self {
        match err {
            crate::icap::IcapError::Connect { .. } => GateError::IcapConnection(err.to_string()),
            crate::icap::IcapError::Io(_) => GateError::IcapConnection(err.to_string()),
            crate::icap::IcapError::Timeout => GateError::Timeout(err.to_string()),
            crate::icap::IcapError::Buffer(inner) => inner.into(),
        }
    }
}

impl From<crate::forward::ForwardError> for GateError {
    fn from(err: crate::forward::ForwardError) -> Self {
        match err {
            crate::forward::ForwardError::Timeout => GateError::Timeout(err.to_string()),
            crate::forward::ForwardError::Request(msg) => GateError::Internal(msg),
            crate::forward::ForwardError::Buffer(inner) => inner.into(),
            other => GateError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GateError::Upload("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(GateError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(GateError::Mime("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(GateError::Extension("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GateError::Memory("x".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(GateError::IcapScan("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            GateError::IcapConnection("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GateError::Backend("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GateError::Timeout("x".into()).status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            GateError::ServiceUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GateError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_headers() {
        let response = GateError::Extension("evil.exe".into()).into_response_with_id("req-123");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get("X-Request-ID").unwrap(), "req-123");
        assert_eq!(
            response.headers().get("X-Error-Type").unwrap(),
            "EXTENSION_ERROR"
        );
        assert_eq!(response.headers().get("Content-Type").unwrap(), "text/plain");
    }

    #[test]
    fn test_file_too_large_conversion() {
        let err: GateError = crate::buffer::BufferError::FileTooLarge { size: 11, max: 10 }.into();
        assert_eq!(err.kind(), "MEMORY_ERROR");
    }
}
