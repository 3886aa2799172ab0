//! Shared test infrastructure for integration tests
//!
//! Provides TestServer (spawns the real proxy binary), a scripted ICAP stub,
//! a recording backend stub, and data generators.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::http::HeaderMap;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Port counter to avoid conflicts between tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(18500);

/// Test server wrapper that spawns a real scangate_proxy binary
pub struct TestServer {
    process: Child,
    port: u16,
    temp_dir: TempDir,
}

impl TestServer {
    /// Start the proxy pointed at the given ICAP and backend stubs, with
    /// extra environment overrides on top.
    pub async fn start(
        icap_addr: SocketAddr,
        backend_addr: SocketAddr,
        extra_env: &[(&str, String)],
    ) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let mut command = Command::new(env!("CARGO_BIN_EXE_scangate_proxy"));
        command
            .env("SGP_LISTEN_ADDR", format!("127.0.0.1:{}", port))
            .env("ICAP_SERVER_HOST", icap_addr.ip().to_string())
            .env("ICAP_SERVER_PORT", icap_addr.port().to_string())
            .env("BACKEND_PROTOCOL", "http")
            .env("BACKEND_HOST", backend_addr.ip().to_string())
            .env("BACKEND_PORT", backend_addr.port().to_string())
            .env("SGP_TEMP_DIR", temp_dir.path())
            .env("RUST_LOG", "scangate_proxy=warn");
        for (key, value) in extra_env {
            command.env(key, value);
        }

        let process = command.spawn().expect("Failed to start server");

        let mut server = Self {
            process,
            port,
            temp_dir,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(100)).await;
                return;
            }

            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("Server exited before becoming ready: {}", status);
            }

            sleep(Duration::from_millis(100)).await;
        }

        let _ = self.process.kill();
        panic!("Timed out waiting for server on {}", addr);
    }

    /// Get the HTTP endpoint URL
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Spill directory the server was configured with
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Files currently present in the spill directory
    pub fn temp_file_count(&self) -> usize {
        std::fs::read_dir(self.temp_dir.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

// === ICAP stub ===

/// Scripted behavior for the ICAP stub
#[derive(Debug, Clone, Copy)]
pub enum IcapScript {
    /// Respond 204 to the preview.
    CleanOnPreview,
    /// Send 100 Continue after the preview, expect the rest of the body and
    /// the `0; ieof` terminator, then respond 204.
    ContinueThenClean,
    /// Respond 403 with an infection header to the preview.
    BlockedInfection,
    /// Respond 403 with the scanner's size-limit marker header.
    BlockedSizeLimit,
    /// Accept the connection and never answer.
    HangAfterAccept,
}

/// Running ICAP stub with per-connection transcripts
pub struct IcapStub {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    /// Bytes received after the preview phase, one entry per 100-Continue
    /// exchange.
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl IcapStub {
    pub async fn spawn(script: IcapScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));

        {
            let connections = connections.clone();
            let bodies = bodies.clone();
            tokio::spawn(async move {
                loop {
                    let (mut stream, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => return,
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let bodies = bodies.clone();
                    tokio::spawn(async move {
                        match script {
                            IcapScript::HangAfterAccept => {
                                // Hold the socket open until the peer gives up.
                                let mut sink = [0u8; 1024];
                                while let Ok(n) = stream.read(&mut sink).await {
                                    if n == 0 {
                                        return;
                                    }
                                }
                            }
                            IcapScript::CleanOnPreview => {
                                read_until(&mut stream, b"0\r\n\r\n").await;
                                let _ = stream
                                    .write_all(b"ICAP/1.0 204 No Content\r\n\r\n")
                                    .await;
                            }
                            IcapScript::ContinueThenClean => {
                                read_until(&mut stream, b"0\r\n\r\n").await;
                                let _ = stream
                                    .write_all(b"ICAP/1.0 100 Continue\r\n\r\n")
                                    .await;
                                let body = read_until(&mut stream, b"0; ieof\r\n\r\n").await;
                                bodies.lock().unwrap().push(body);
                                let _ = stream
                                    .write_all(b"ICAP/1.0 204 No Content\r\n\r\n")
                                    .await;
                            }
                            IcapScript::BlockedInfection => {
                                read_until(&mut stream, b"0\r\n\r\n").await;
                                let _ = stream
                                    .write_all(
                                        b"ICAP/1.0 403 Forbidden\r\n\
                                          X-Infection-Found: Type=0; Resolution=2; Threat=EICAR-Test-Signature;\r\n\
                                          Encapsulated: res-hdr=0\r\n\
                                          \r\n\
                                          HTTP/1.1 403 Forbidden\r\n",
                                    )
                                    .await;
                            }
                            IcapScript::BlockedSizeLimit => {
                                read_until(&mut stream, b"0\r\n\r\n").await;
                                let _ = stream
                                    .write_all(
                                        b"ICAP/1.0 403 Forbidden\r\n\
                                          X-Infection-Found: Type=2; Resolution=2; Threat=Heuristics.Limits.Exceeded.MaxFileSize;\r\n\
                                          \r\n",
                                    )
                                    .await;
                            }
                        }
                    });
                }
            });
        }

        Self {
            addr,
            connections,
            bodies,
        }
    }

    /// Address of a port that refuses connections (nothing listens on it).
    pub async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Post-preview transcripts from ContinueThenClean exchanges.
    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }
}

async fn read_until(stream: &mut tokio::net::TcpStream, marker: &[u8]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return seen,
            Ok(n) => n,
        };
        seen.extend_from_slice(&chunk[..n]);
        if seen.windows(marker.len()).any(|w| w == marker) {
            return seen;
        }
    }
}

// === Backend stub ===

/// One request the backend stub received
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Recording backend stub
pub struct BackendStub {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl BackendStub {
    /// Spawn a backend answering every POST with the given status and body.
    pub async fn spawn(status: u16, response_body: &'static str) -> Self {
        use axum::extract::Request;

        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        let app = axum::Router::new().fallback(move |request: Request| {
            let recorded = recorded.clone();
            async move {
                let uri = request.uri().to_string();
                let headers = request.headers().clone();
                let body = axum::body::to_bytes(request.into_body(), usize::MAX)
                    .await
                    .unwrap_or_default();
                recorded.lock().unwrap().push(RecordedRequest { uri, headers, body });
                (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    response_body,
                )
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self { addr, requests }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

// === Data generators ===

/// Generate deterministic binary data
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}

/// A small PNG-looking payload: real signature, deterministic tail.
pub fn png_payload(total_size: usize) -> Vec<u8> {
    let mut data = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend(generate_binary(total_size.saturating_sub(8), 42));
    data.truncate(total_size);
    data
}
