//! Scangate Proxy - antivirus-gating upload proxy
//!
//! This library provides the core functionality for the scangate upload
//! proxy: multipart ingest into a hybrid memory/disk buffer, MIME sniffing,
//! ICAP REQMOD scanning with Preview, and the gated forward to the backend.

pub mod api;
pub mod buffer;
pub mod config;
pub mod forward;
pub mod icap;
pub mod metrics;
pub mod multipart;
pub mod pipeline;
pub mod sniff;
