//! Configuration for the scangate upload proxy

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Payloads above this size get the extended (5x) I/O deadlines.
pub const LARGE_PAYLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// ICAP scanner connection settings
    #[serde(default)]
    pub icap: IcapConfig,

    /// Backend application the clean upload is forwarded to
    #[serde(default)]
    pub backend: BackendConfig,

    /// Upload ingest settings (chunking, buffering, size caps)
    #[serde(default)]
    pub upload: UploadConfig,

    /// Base socket deadline for ICAP and backend I/O, in milliseconds
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Global per-request deadline, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// When false, only ERR-level logs are emitted
    #[serde(default)]
    pub log_icap_traffic: bool,

    /// Enables strict detected-vs-declared MIME validation
    #[serde(default = "default_true")]
    pub check_mime_type: bool,

    /// Lowercased extension allowlist (".pdf", ".docx"); empty = allow all
    #[serde(default)]
    pub allowed_extensions: Vec<String>,

    /// What to do when the scanner reports its own size limit exceeded
    #[serde(default)]
    pub limits_exceeded_behaviour: LimitsExceededBehaviour,

    /// ICAP circuit breaker tuning
    #[serde(default = "default_icap_breaker")]
    pub icap_breaker: BreakerConfig,

    /// Backend circuit breaker tuning
    #[serde(default = "default_backend_breaker")]
    pub backend_breaker: BreakerConfig,
}

/// ICAP scanner connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcapConfig {
    /// ICAP host
    #[serde(default = "default_icap_host")]
    pub host: String,

    /// ICAP port
    #[serde(default = "default_icap_port")]
    pub port: u16,

    /// ICAP service path segment (icap://host:port/<service>)
    #[serde(default = "default_icap_service")]
    pub service: String,

    /// Bytes sent in the preview chunk
    #[serde(default = "default_preview_size")]
    pub preview_size: usize,
}

/// Backend application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `http` or `https`
    #[serde(default = "default_backend_protocol")]
    pub protocol: String,

    /// Backend host
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Backend port
    #[serde(default = "default_backend_port")]
    pub port: u16,
}

/// Upload ingest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Multipart parser read size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Per client-read deadline, in milliseconds
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,

    /// Buffer switches from memory to disk spill past this many bytes
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: u64,

    /// Absolute upload cap in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Directory for spill files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

/// Behaviour when the scanner's own file-size limit is exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitsExceededBehaviour {
    /// Treat the verdict as blocked (403)
    #[default]
    Block,
    /// Pass the upload through to the backend unscanned
    Allow,
}

/// Circuit breaker tuning for one external service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// How long the breaker stays open before a half-open probe, in milliseconds
    pub recovery_timeout_ms: u64,
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8440".parse().unwrap()
}

fn default_icap_host() -> String {
    "clamcap".to_string()
}

fn default_icap_port() -> u16 {
    1344
}

fn default_icap_service() -> String {
    "avscan".to_string()
}

fn default_preview_size() -> usize {
    1024
}

fn default_backend_protocol() -> String {
    "http".to_string()
}

fn default_backend_host() -> String {
    "dms".to_string()
}

fn default_backend_port() -> u16 {
    8080
}

fn default_chunk_size() -> usize {
    4096
}

fn default_upload_timeout_ms() -> u64 {
    5000
}

fn default_socket_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_memory_threshold() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_max_file_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_true() -> bool {
    true
}

fn default_icap_breaker() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 5,
        recovery_timeout_ms: 60_000,
    }
}

fn default_backend_breaker() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        recovery_timeout_ms: 30_000,
    }
}

impl Default for IcapConfig {
    fn default() -> Self {
        Self {
            host: default_icap_host(),
            port: default_icap_port(),
            service: default_icap_service(),
            preview_size: default_preview_size(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            protocol: default_backend_protocol(),
            host: default_backend_host(),
            port: default_backend_port(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            upload_timeout_ms: default_upload_timeout_ms(),
            memory_threshold: default_memory_threshold(),
            max_file_size: default_max_file_size(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            icap: IcapConfig::default(),
            backend: BackendConfig::default(),
            upload: UploadConfig::default(),
            socket_timeout_ms: default_socket_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            log_icap_traffic: false,
            check_mime_type: default_true(),
            allowed_extensions: Vec::new(),
            limits_exceeded_behaviour: LimitsExceededBehaviour::default(),
            icap_breaker: default_icap_breaker(),
            backend_breaker: default_backend_breaker(),
        }
    }
}

impl BackendConfig {
    /// Authority for the Host header and backend URLs; elides the default
    /// port for the protocol.
    pub fn authority(&self) -> String {
        let default_port = match self.protocol.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Backend URL preserving the inbound request URI verbatim.
    pub fn url_for(&self, request_uri: &str) -> String {
        format!("{}://{}{}", self.protocol, self.authority(), request_uri)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse("SGP_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(host) = std::env::var("ICAP_SERVER_HOST") {
            config.icap.host = host;
        }
        if let Some(port) = env_parse("ICAP_SERVER_PORT") {
            config.icap.port = port;
        }
        if let Ok(service) = std::env::var("ICAP_SERVICE_NAME") {
            config.icap.service = service;
        }
        if let Some(size) = env_parse("ICAP_PREVIEW_SIZE") {
            config.icap.preview_size = size;
        }

        if let Ok(protocol) = std::env::var("BACKEND_PROTOCOL") {
            config.backend.protocol = protocol;
        }
        if let Ok(host) = std::env::var("BACKEND_HOST") {
            config.backend.host = host;
        }
        if let Some(port) = env_parse("BACKEND_PORT") {
            config.backend.port = port;
        }

        if let Some(size) = env_parse("UPLOAD_CHUNK_SIZE") {
            config.upload.chunk_size = size;
        }
        if let Some(ms) = env_parse("UPLOAD_TIMEOUT") {
            config.upload.upload_timeout_ms = ms;
        }
        if let Some(bytes) = env_parse("SGP_MEMORY_THRESHOLD") {
            config.upload.memory_threshold = bytes;
        }
        if let Some(bytes) = env_parse("SGP_MAX_FILE_SIZE") {
            config.upload.max_file_size = bytes;
        }
        if let Ok(dir) = std::env::var("SGP_TEMP_DIR") {
            config.upload.temp_dir = PathBuf::from(dir);
        }

        if let Some(ms) = env_parse("SOCKET_TIMEOUT") {
            config.socket_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("SGP_REQUEST_TIMEOUT") {
            config.request_timeout_ms = ms;
        }

        if let Ok(v) = std::env::var("LOG_ICAP_TRAFFIC") {
            config.log_icap_traffic = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CHECK_MIME_TYPE") {
            config.check_mime_type = v == "true" || v == "1";
        }
        if let Ok(list) = std::env::var("ALLOWED_EXTENSIONS") {
            config.allowed_extensions = parse_extension_list(&list);
        }
        if let Ok(v) = std::env::var("LIMITS_EXCEEDED_BEHAVIOUR") {
            if v.eq_ignore_ascii_case("allow") {
                config.limits_exceeded_behaviour = LimitsExceededBehaviour::Allow;
            }
        }

        if let Some(n) = env_parse("SGP_ICAP_FAILURE_THRESHOLD") {
            config.icap_breaker.failure_threshold = n;
        }
        if let Some(ms) = env_parse("SGP_ICAP_RECOVERY_MS") {
            config.icap_breaker.recovery_timeout_ms = ms;
        }
        if let Some(n) = env_parse("SGP_BACKEND_FAILURE_THRESHOLD") {
            config.backend_breaker.failure_threshold = n;
        }
        if let Some(ms) = env_parse("SGP_BACKEND_RECOVERY_MS") {
            config.backend_breaker.recovery_timeout_ms = ms;
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SGP_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        for path in &["scangate_proxy.toml", "/etc/scangate_proxy/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        Self::from_env()
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload.upload_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Base socket deadline, extended 5x for large payloads.
    pub fn io_timeout_for(&self, payload_bytes: u64) -> Duration {
        let base = self.socket_timeout();
        if payload_bytes > LARGE_PAYLOAD_BYTES {
            base * 5
        } else {
            base
        }
    }

    /// Global per-request deadline, widened when a file-size-aware phase
    /// extends its own timeout.
    pub fn request_timeout_for(&self, payload_bytes: u64) -> Duration {
        let base = Duration::from_millis(self.request_timeout_ms);
        if payload_bytes > LARGE_PAYLOAD_BYTES {
            base * 5
        } else {
            base
        }
    }

    /// Check a filename against the extension allowlist. Empty list allows all.
    pub fn extension_allowed(&self, filename: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        let lower = filename.to_ascii_lowercase();
        self.allowed_extensions
            .iter()
            .any(|ext| lower.ends_with(ext.as_str()))
    }
}

/// Parse a comma list of extensions, lowercased, with a guaranteed leading dot.
fn parse_extension_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.starts_with('.') {
                s
            } else {
                format!(".{s}")
            }
        })
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
