//! MIME detection and declared-type validation
//!
//! Detection tiers, in order: external detector (when allowed and enough
//! bytes are present), text-content heuristic, magic-number table, filename
//! extension, `application/octet-stream`. The content tiers are pure
//! functions of the preview bytes, so re-running them on the same input
//! always returns the same answer.

pub mod external;
pub mod magic;

use std::path::{Path, PathBuf};
use tracing::debug;

/// Final fallback when nothing matches.
pub const FALLBACK_MIME: &str = "application/octet-stream";

/// Window for the text-content heuristic.
const TEXT_SCAN_WINDOW: usize = 512;

/// The external tier needs at least this many bytes to be worth asking.
const EXTERNAL_MIN_BYTES: usize = 32;

/// Which tier produced the detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    External,
    TextHeuristic,
    Magic,
    Extension,
    Fallback,
}

impl DetectionMethod {
    pub fn label(&self) -> &'static str {
        match self {
            DetectionMethod::External => "external",
            DetectionMethod::TextHeuristic => "text_heuristic",
            DetectionMethod::Magic => "magic",
            DetectionMethod::Extension => "extension",
            DetectionMethod::Fallback => "fallback",
        }
    }
}

/// A sniffed MIME type and how it was found
#[derive(Debug, Clone)]
pub struct Detection {
    pub mime: String,
    pub method: DetectionMethod,
    /// Tier-specific context, e.g. the extension that picked a text subtype
    pub detail: Option<String>,
}

/// Outcome of detected-vs-declared validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,
    pub reason: &'static str,
}

/// Content-type detector. Holds the scratch directory used when the
/// external tool needs bytes staged on disk.
pub struct MimeDetector {
    temp_dir: PathBuf,
}

impl MimeDetector {
    pub fn new(temp_dir: &Path) -> Self {
        Self {
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    /// Detect the MIME type of the buffered upload. `spill_path` points at
    /// the buffer's temp file when it has one; otherwise the preview bytes
    /// are staged for the external tool.
    pub async fn sniff(
        &self,
        preview: &[u8],
        filename: Option<&str>,
        allow_external: bool,
        spill_path: Option<&Path>,
    ) -> Detection {
        if allow_external && preview.len() >= EXTERNAL_MIN_BYTES {
            let found = match spill_path {
                Some(path) => external::detect_path(path).await,
                None => external::detect_bytes(preview, &self.temp_dir).await,
            };
            if let Some(mime) = found {
                debug!(mime = %mime, "external detector matched");
                return Detection {
                    mime,
                    method: DetectionMethod::External,
                    detail: spill_path.map(|p| p.display().to_string()),
                };
            }
        }

        sniff_content(preview, filename)
    }
}

/// Deterministic content tiers: text heuristic, magic table, extension
/// table, octet-stream fallback.
pub fn sniff_content(preview: &[u8], filename: Option<&str>) -> Detection {
    if !preview.is_empty() && looks_like_text(preview) {
        let subtype = filename.and_then(text_subtype_for);
        let detail = subtype.is_some().then(|| extension_of(filename));
        let mime = subtype.unwrap_or_else(|| "text/plain".to_string());
        return Detection {
            mime,
            method: DetectionMethod::TextHeuristic,
            detail: detail.flatten(),
        };
    }

    if let Some(mime) = magic::match_magic(preview) {
        return Detection {
            mime: mime.to_string(),
            method: DetectionMethod::Magic,
            detail: None,
        };
    }

    if let Some(mime) = filename.and_then(text_subtype_for) {
        return Detection {
            mime,
            method: DetectionMethod::Extension,
            detail: extension_of(filename),
        };
    }

    Detection {
        mime: FALLBACK_MIME.to_string(),
        method: DetectionMethod::Fallback,
        detail: None,
    }
}

fn extension_of(filename: Option<&str>) -> Option<String> {
    let (_, ext) = filename?.rsplit_once('.')?;
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// Text-content heuristic over the first 512 bytes: almost no NULs, few
/// non-whitespace control bytes, and a dominant share of printable/UTF-8
/// bytes.
fn looks_like_text(preview: &[u8]) -> bool {
    let window = &preview[..preview.len().min(TEXT_SCAN_WINDOW)];
    let n = window.len() as f64;

    let mut nulls = 0usize;
    let mut controls = 0usize;
    let mut texty = 0usize;
    for &b in window {
        match b {
            0x00 => nulls += 1,
            b'\t' | b'\n' | b'\r' => texty += 1,
            0x01..=0x1F | 0x7F => controls += 1,
            0x20..=0x7E => texty += 1,
            _ => texty += 1, // UTF-8 multibyte lead/continuation
        }
    }

    nulls as f64 / n <= 0.01 && controls as f64 / n <= 0.10 && texty as f64 / n >= 0.90
}

/// Fixed text-extension table. Extensions outside the table fall back to
/// mime_guess when it reports a text type.
fn text_subtype_for(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    let mapped = match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "ts" => "application/typescript",
        "py" => "text/x-python",
        "sh" => "text/x-shellscript",
        "sql" => "application/sql",
        "csv" => "text/csv",
        "yaml" | "yml" => "application/yaml",
        _ => {
            let guess = mime_guess::from_path(filename).first()?;
            if guess.type_() == mime_guess::mime::TEXT {
                return Some(guess.essence_str().to_string());
            }
            return None;
        }
    };
    Some(mapped.to_string())
}

/// Declared Content-Type values that carry no information.
const GENERIC_DECLARED: &[&str] = &[
    "application/octet-stream",
    "application/binary",
    "binary/octet-stream",
];

/// Types that may legitimately be declared as each other.
const ALIAS_GROUPS: &[&[&str]] = &[
    &["image/jpeg", "image/jpg", "image/pjpeg"],
    &["application/javascript", "text/javascript"],
    &["application/x-sh", "text/x-shellscript"],
    &["application/xml", "text/xml"],
    &["text/markdown", "text/x-markdown"],
    &["audio/mpeg", "audio/mp3"],
    &["application/x-msdownload", "application/x-dosexec"],
    &["application/x-rar-compressed", "application/vnd.rar"],
    &["application/zip", "application/x-zip-compressed"],
    &["text/x-python", "application/x-python-code", "text/x-script.python"],
    // The legacy compound container is shared by the whole Office family.
    &[
        "application/msword",
        "application/vnd.ms-excel",
        "application/vnd.ms-powerpoint",
        "application/x-ole-storage",
    ],
    // OOXML documents are ZIP containers and are often declared as such.
    &[
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/zip",
    ],
    &[
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "application/zip",
    ],
    &[
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "application/zip",
    ],
    &["application/java-archive", "application/zip"],
];

/// Compare detected and declared MIME types.
pub fn validate(detected: &str, declared: &str) -> Validation {
    let declared_norm = normalize(declared);
    if GENERIC_DECLARED.contains(&declared_norm.as_str()) {
        return Validation {
            ok: true,
            reason: "generic_header_override",
        };
    }

    let detected_norm = normalize(detected);
    if detected_norm == declared_norm {
        return Validation {
            ok: true,
            reason: "exact_match",
        };
    }

    let aliased = ALIAS_GROUPS.iter().any(|group| {
        group.contains(&detected_norm.as_str()) && group.contains(&declared_norm.as_str())
    });
    if aliased {
        return Validation {
            ok: true,
            reason: "alias_match",
        };
    }

    Validation {
        ok: false,
        reason: "mime_mismatch",
    }
}

/// Lowercase and strip parameters (`; charset=...`).
fn normalize(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}
