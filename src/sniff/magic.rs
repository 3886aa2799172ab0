//! Magic-number table for content sniffing
//!
//! Checks run in declared priority order: more specific patterns before
//! generic ones, container office formats before bare ZIP. Matches look at
//! the first KiB at most.

/// How many leading bytes the table may inspect.
pub const MAGIC_SCAN_LIMIT: usize = 1024;

/// Match `data` against the magic table; `None` when nothing matches.
pub fn match_magic(data: &[u8]) -> Option<&'static str> {
    let data = &data[..data.len().min(MAGIC_SCAN_LIMIT)];
    if data.is_empty() {
        return None;
    }

    // Documents
    if data.starts_with(b"%PDF") {
        return Some("application/pdf");
    }
    if data.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        // Legacy MS Office compound file (doc/xls/ppt share it)
        return Some("application/msword");
    }
    if data.starts_with(b"PK\x03\x04") {
        if let Some(mime) = zip_container(data) {
            return Some(mime);
        }
    }

    // Images
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if riff_form(data, b"WEBP") {
        return Some("image/webp");
    }
    if data.starts_with(b"BM") && data.len() >= 14 {
        return Some("image/bmp");
    }
    if data.starts_with(b"II*\x00") || data.starts_with(b"MM\x00*") {
        return Some("image/tiff");
    }

    // Archives
    if data.starts_with(b"PK\x03\x04")
        || data.starts_with(b"PK\x05\x06")
        || data.starts_with(b"PK\x07\x08")
    {
        return Some("application/zip");
    }
    if data.starts_with(b"Rar!\x1A\x07") {
        return Some("application/x-rar-compressed");
    }
    if data.starts_with(&[0x1F, 0x8B]) {
        return Some("application/gzip");
    }
    if data.starts_with(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]) {
        return Some("application/x-7z-compressed");
    }
    if data.starts_with(b"BZh") {
        return Some("application/x-bzip2");
    }
    if data.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
        return Some("application/x-xz");
    }

    // Audio
    if data.starts_with(b"ID3") || mp3_sync_frame(data) {
        return Some("audio/mpeg");
    }
    if data.starts_with(b"OggS") {
        return Some("audio/ogg");
    }
    if riff_form(data, b"WAVE") {
        return Some("audio/wav");
    }
    if data.starts_with(b"fLaC") {
        return Some("audio/flac");
    }
    if ftyp_brand(data, &[b"M4A "]) {
        return Some("audio/mp4");
    }

    // Video
    if ftyp_brand(
        data,
        &[b"isom", b"iso2", b"mp41", b"mp42", b"avc1", b"dash", b"M4V "],
    ) {
        return Some("video/mp4");
    }
    if riff_form(data, b"AVI ") {
        return Some("video/x-msvideo");
    }
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("video/webm");
    }
    if data.starts_with(&[0x00, 0x00, 0x01, 0xBA]) {
        return Some("video/mpeg");
    }

    // Markup and structured text
    if let Some(mime) = markup(data) {
        return Some(mime);
    }

    // Executables
    if data.starts_with(b"MZ") {
        return Some("application/x-msdownload");
    }
    if data.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        return Some("application/x-executable");
    }
    if data.starts_with(&[0xCA, 0xFE, 0xBA, 0xBE]) {
        return Some("application/java-vm");
    }
    if data.starts_with(&[0xFE, 0xED, 0xFA, 0xCE])
        || data.starts_with(&[0xCE, 0xFA, 0xED, 0xFE])
        || data.starts_with(&[0xFE, 0xED, 0xFA, 0xCF])
        || data.starts_with(&[0xCF, 0xFA, 0xED, 0xFE])
    {
        return Some("application/x-mach-binary");
    }

    // Fonts
    if data.starts_with(&[0x00, 0x01, 0x00, 0x00]) {
        return Some("font/ttf");
    }
    if data.starts_with(b"OTTO") {
        return Some("font/otf");
    }
    if data.starts_with(b"wOFF") {
        return Some("font/woff");
    }
    if data.starts_with(b"wOF2") {
        return Some("font/woff2");
    }

    if ico_header(data) {
        return Some("image/x-icon");
    }

    None
}

/// ZIP-container office formats, distinguished by the well-known inner
/// paths that appear near the start of the archive.
fn zip_container(data: &[u8]) -> Option<&'static str> {
    if contains(data, b"word/document.xml") || contains(data, b"word/") {
        return Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document");
    }
    if contains(data, b"xl/workbook.xml") || contains(data, b"xl/") {
        return Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet");
    }
    if contains(data, b"ppt/presentation.xml") || contains(data, b"ppt/") {
        return Some("application/vnd.openxmlformats-officedocument.presentationml.presentation");
    }
    if contains(data, b"META-INF/MANIFEST.MF") {
        return Some("application/java-archive");
    }
    None
}

/// RIFF container with the given four-byte form type at offset 8.
fn riff_form(data: &[u8], form: &[u8; 4]) -> bool {
    data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == form
}

/// ISO base-media `ftyp` box with one of the given major brands.
fn ftyp_brand(data: &[u8], brands: &[&[u8; 4]]) -> bool {
    if data.len() < 12 || &data[4..8] != b"ftyp" {
        return false;
    }
    let brand = &data[8..12];
    brands.iter().any(|b| brand == &b[..])
}

/// MPEG audio sync frame: 11 set bits, then a valid version and layer.
fn mp3_sync_frame(data: &[u8]) -> bool {
    data.len() >= 2
        && data[0] == 0xFF
        && (data[1] & 0xE0) == 0xE0
        && (data[1] & 0x18) != 0x08
        && (data[1] & 0x06) != 0x00
}

/// HTML / XML / JSON sniffing after skipping leading whitespace. HTML and
/// XML checks are case-insensitive.
fn markup(data: &[u8]) -> Option<&'static str> {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let data = &data[start..];

    if starts_with_ignore_case(data, b"<!doctype html")
        || starts_with_ignore_case(data, b"<html")
    {
        return Some("text/html");
    }
    if starts_with_ignore_case(data, b"<?xml") {
        return Some("application/xml");
    }
    if data.starts_with(b"{\"")
        || data.starts_with(b"[{")
        || data.starts_with(b"[\"")
        || data == b"{}"
        || data == b"[]"
    {
        return Some("application/json");
    }
    None
}

/// ICO header with the secondary-byte sanity checks: reserved word zero,
/// type exactly 1, at least one image, and a sane first directory entry.
/// Plain `00 00 01 00` prefixes are common in unrelated binary formats.
fn ico_header(data: &[u8]) -> bool {
    if data.len() < 16 || !data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return false;
    }
    let count = u16::from_le_bytes([data[4], data[5]]);
    if count == 0 || count > 64 {
        return false;
    }
    // First ICONDIRENTRY: reserved byte must be zero, planes 0 or 1.
    data[9] == 0 && data[10] <= 1 && data[11] == 0
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len().min(haystack.len() + 1))
        .any(|w| w == needle)
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len()
        && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}
