//! Incremental multipart/form-data parser
//!
//! Fed raw body chunks as they arrive from the client, emits events as soon
//! as they can be decided: the part's verbatim header lines (re-emitted into
//! the backend request later), body data slices, part end, stream end. No
//! internal copy of the part body is kept; data flows straight into the
//! spool buffer.
//!
//! ```text
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="file"; filename="a.png"\r\n
//! Content-Type: image/png\r\n
//! \r\n
//! <part bytes>\r\n
//! --<boundary>--\r\n
//! ```

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Part header blocks larger than this are rejected.
const MAX_HEADER_BLOCK: usize = 16 * 1024;

/// Errors from multipart parsing
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("missing or invalid multipart boundary in Content-Type")]
    MissingBoundary,

    #[error("malformed multipart stream: {0}")]
    Malformed(&'static str),

    #[error("part header block is not valid UTF-8")]
    HeaderEncoding,
}

/// Headers of one part, captured verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeaders {
    /// Raw header lines in arrival order, without the trailing CRLFs
    pub raw: Vec<String>,
    /// `filename` from Content-Disposition, if present
    pub filename: Option<String>,
    /// Declared Content-Type, if present
    pub content_type: Option<String>,
}

impl PartHeaders {
    /// True when this part carries an uploaded file.
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

/// Parse events, emitted in stream order
#[derive(Debug, PartialEq, Eq)]
pub enum MultipartEvent {
    PartHeaders(PartHeaders),
    PartData(Bytes),
    PartEnd,
    Finished,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Preamble,
    Headers,
    Body,
    Epilogue,
}

/// Incremental parser. Feed it chunks with [`feed`](Self::feed), then call
/// [`finish`](Self::finish) at end of input.
pub struct MultipartParser {
    /// `\r\n--<boundary>`; the virtual CRLF prefix in `buf` makes the first
    /// boundary line match the same pattern as every later one.
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: State,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\r\n");

        Self {
            delimiter,
            buf,
            state: State::Preamble,
        }
    }

    /// Feed one chunk of body bytes; returns every event decidable so far.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<MultipartEvent>, MultipartError> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            match self.state {
                State::Preamble => {
                    match find(&self.buf, &self.delimiter) {
                        Some(pos) => {
                            self.buf.advance(pos + self.delimiter.len());
                            if !self.after_delimiter(&mut events)? {
                                return Ok(events);
                            }
                        }
                        None => {
                            // Keep only a possible delimiter prefix.
                            let keep = self.delimiter.len().saturating_sub(1);
                            if self.buf.len() > keep {
                                self.buf.advance(self.buf.len() - keep);
                            }
                            return Ok(events);
                        }
                    }
                }
                State::Headers => match find(&self.buf, b"\r\n\r\n") {
                    Some(pos) => {
                        let block = self.buf.split_to(pos);
                        self.buf.advance(4);
                        events.push(MultipartEvent::PartHeaders(parse_header_block(&block)?));
                        self.state = State::Body;
                    }
                    None => {
                        if self.buf.len() > MAX_HEADER_BLOCK {
                            return Err(MultipartError::Malformed("part header block too large"));
                        }
                        return Ok(events);
                    }
                },
                State::Body => match find(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        if pos > 0 {
                            events.push(MultipartEvent::PartData(
                                self.buf.split_to(pos).freeze(),
                            ));
                        }
                        self.buf.advance(self.delimiter.len());
                        events.push(MultipartEvent::PartEnd);
                        if !self.after_delimiter(&mut events)? {
                            return Ok(events);
                        }
                    }
                    None => {
                        // Everything except a possible partial delimiter at
                        // the tail is settled body data.
                        let keep = self.delimiter.len().saturating_sub(1);
                        if self.buf.len() > keep {
                            let data = self.buf.split_to(self.buf.len() - keep).freeze();
                            events.push(MultipartEvent::PartData(data));
                        }
                        return Ok(events);
                    }
                },
                State::Epilogue => {
                    self.buf.clear();
                    return Ok(events);
                }
            }
        }
    }

    /// Signal end of input. Errors if the closing boundary never arrived.
    pub fn finish(&mut self) -> Result<(), MultipartError> {
        if self.state == State::Epilogue {
            Ok(())
        } else {
            Err(MultipartError::Malformed("truncated multipart body"))
        }
    }

    /// Decide what follows a matched delimiter: `--` closes the stream, CRLF
    /// opens the next part's headers. Transport padding (SP/HT) before the
    /// CRLF is tolerated. Returns false when more input is needed; the
    /// delimiter has already been consumed, so re-entry lands here via the
    /// zero-length match.
    fn after_delimiter(&mut self, events: &mut Vec<MultipartEvent>) -> Result<bool, MultipartError> {
        let mut skip = 0;
        while skip < self.buf.len() && (self.buf[skip] == b' ' || self.buf[skip] == b'\t') {
            skip += 1;
        }
        if self.buf.len() < skip + 2 {
            // Re-synthesize the delimiter so the next feed re-matches at 0.
            let mut rebuilt = BytesMut::with_capacity(self.delimiter.len() + self.buf.len());
            rebuilt.extend_from_slice(&self.delimiter);
            rebuilt.extend_from_slice(&self.buf);
            self.buf = rebuilt;
            // Undo the PartEnd if one was just pushed: not yet decided.
            if matches!(events.last(), Some(MultipartEvent::PartEnd)) {
                events.pop();
            }
            return Ok(false);
        }

        match &self.buf[skip..skip + 2] {
            b"--" => {
                self.buf.advance(skip + 2);
                self.state = State::Epilogue;
                events.push(MultipartEvent::Finished);
                Ok(true)
            }
            b"\r\n" => {
                self.buf.advance(skip + 2);
                self.state = State::Headers;
                Ok(true)
            }
            _ => Err(MultipartError::Malformed(
                "boundary delimiter not followed by CRLF or '--'",
            )),
        }
    }
}

/// Extract the boundary parameter from a Content-Type header value.
pub fn boundary_from_content_type(content_type: &str) -> Result<String, MultipartError> {
    let lower = content_type.to_ascii_lowercase();
    if !lower.trim_start().starts_with("multipart/form-data") {
        return Err(MultipartError::MissingBoundary);
    }
    let idx = lower.find("boundary=").ok_or(MultipartError::MissingBoundary)?;
    let raw = &content_type[idx + "boundary=".len()..];
    let raw = raw.split(';').next().unwrap_or("").trim();
    let boundary = raw.trim_matches('"');
    if boundary.is_empty() {
        return Err(MultipartError::MissingBoundary);
    }
    Ok(boundary.to_string())
}

/// Split a raw header block into verbatim lines and pull out the
/// Content-Disposition filename and the declared Content-Type.
fn parse_header_block(block: &[u8]) -> Result<PartHeaders, MultipartError> {
    let text = std::str::from_utf8(block).map_err(|_| MultipartError::HeaderEncoding)?;
    let raw: Vec<String> = text
        .split("\r\n")
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect();

    let mut filename = None;
    let mut content_type = None;
    for line in &raw {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            filename = disposition_param(value, "filename");
        } else if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }

    Ok(PartHeaders {
        raw,
        filename,
        content_type,
    })
}

/// Pull one parameter out of a Content-Disposition value, unquoting if needed.
fn disposition_param(value: &str, param: &str) -> Option<String> {
    for piece in value.split(';') {
        let piece = piece.trim();
        let Some((key, val)) = piece.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case(param) {
            continue;
        }
        let val = val.trim();
        let val = val.strip_prefix('"').unwrap_or(val);
        let val = val.strip_suffix('"').unwrap_or(val);
        return Some(val.to_string());
    }
    None
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
