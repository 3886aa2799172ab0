//! End-to-end flows through the real binary against scripted ICAP and
//! backend stubs.

mod common;

use common::{BackendStub, IcapScript, IcapStub, TestServer};
use std::time::Duration;
use tokio::time::sleep;

async fn upload(
    endpoint: &str,
    path: &str,
    filename: &str,
    mime: &str,
    content: Vec<u8>,
) -> reqwest::Response {
    let part = reqwest::multipart::Part::bytes(content)
        .file_name(filename.to_string())
        .mime_str(mime)
        .unwrap();
    let form = reqwest::multipart::Form::new().part("file", part);
    reqwest::Client::new()
        .post(format!("{endpoint}{path}"))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_clean_png_stays_in_memory() {
    let icap = IcapStub::spawn(IcapScript::CleanOnPreview).await;
    let backend = BackendStub::spawn(201, "{\"ok\":true}").await;
    let server = TestServer::start(icap.addr, backend.addr, &[]).await;

    let payload = common::png_payload(2048);
    let response = upload(
        &server.endpoint(),
        "/api/files",
        "shot.png",
        "image/png",
        payload.clone(),
    )
    .await;

    assert_eq!(response.status(), 201);
    assert_eq!(
        response.headers().get("x-scan-status").unwrap(),
        "clean"
    );
    assert!(response.headers().get("x-request-id").is_some());
    assert_eq!(response.text().await.unwrap(), "{\"ok\":true}");

    // Backend saw exactly one forward, re-wrapped with a fresh boundary.
    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].uri, "/api/files");
    let content_type = requests[0]
        .headers
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary=----WebKitFormBoundary"));
    assert!(requests[0].headers.get("x-forwarded-for").is_some());
    assert!(requests[0].headers.get("x-real-ip").is_some());
    let body = &requests[0].body;
    assert!(body
        .windows(payload.len())
        .any(|w| w == &payload[..]));
    assert!(body
        .windows(b"filename=\"shot.png\"".len())
        .any(|w| w == b"filename=\"shot.png\""));

    // Small upload: nothing ever spilled, nothing left behind.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(server.temp_file_count(), 0);
}

#[tokio::test]
async fn test_large_upload_spills_and_streams_full_body() {
    let icap = IcapStub::spawn(IcapScript::ContinueThenClean).await;
    let backend = BackendStub::spawn(201, "stored").await;
    // Lowered threshold exercises the same spill path as a 150 MiB upload
    // without the suite cost.
    let server = TestServer::start(
        icap.addr,
        backend.addr,
        &[("SGP_MEMORY_THRESHOLD", "65536".to_string())],
    )
    .await;

    let total: usize = 256 * 1024;
    let payload = vec![0xABu8; total];
    let response = upload(
        &server.endpoint(),
        "/bulk",
        "dump.bin",
        "application/octet-stream",
        payload.clone(),
    )
    .await;
    assert_eq!(response.status(), 201);

    // The scanner saw exactly total - preview bytes after its 100 Continue,
    // framed as one chunk and closed with the ieof terminator.
    let bodies = icap.bodies();
    assert_eq!(bodies.len(), 1);
    let transcript = &bodies[0];
    let expected_remaining = total - 1024;
    let size_line = format!("{expected_remaining:X}\r\n");
    assert!(transcript.starts_with(size_line.as_bytes()));
    let expected_len = size_line.len() + expected_remaining + 2 + b"0; ieof\r\n\r\n".len();
    assert_eq!(transcript.len(), expected_len);
    assert!(transcript.ends_with(b"0; ieof\r\n\r\n"));

    // Backend got the whole file back out of the spill file.
    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0]
        .body
        .windows(total)
        .any(|w| w.iter().all(|&b| b == 0xAB)));

    // Spill file unlinked at request end.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(server.temp_file_count(), 0);
}

#[tokio::test]
async fn test_blocked_payload_never_reaches_backend() {
    let icap = IcapStub::spawn(IcapScript::BlockedInfection).await;
    let backend = BackendStub::spawn(201, "should never be seen").await;
    let server = TestServer::start(
        icap.addr,
        backend.addr,
        &[("CHECK_MIME_TYPE", "false".to_string())],
    )
    .await;

    let response = upload(
        &server.endpoint(),
        "/api/files",
        "eicar.com",
        "application/octet-stream",
        b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*".to_vec(),
    )
    .await;

    assert_eq!(response.status(), 403);
    assert_eq!(
        response.headers().get("x-error-type").unwrap(),
        "ICAP_SCAN_ERROR"
    );
    assert!(response.headers().get("x-request-id").is_some());

    assert_eq!(backend.request_count(), 0);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(server.temp_file_count(), 0);
}

#[tokio::test]
async fn test_size_limit_verdict_with_allow_passes_through() {
    let icap = IcapStub::spawn(IcapScript::BlockedSizeLimit).await;
    let backend = BackendStub::spawn(200, "accepted anyway").await;
    let server = TestServer::start(
        icap.addr,
        backend.addr,
        &[("LIMITS_EXCEEDED_BEHAVIOUR", "allow".to_string())],
    )
    .await;

    let response = upload(
        &server.endpoint(),
        "/big",
        "huge.bin",
        "application/octet-stream",
        common::generate_binary(4096, 7),
    )
    .await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "accepted anyway");
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn test_size_limit_verdict_blocks_by_default() {
    let icap = IcapStub::spawn(IcapScript::BlockedSizeLimit).await;
    let backend = BackendStub::spawn(200, "unreached").await;
    let server = TestServer::start(icap.addr, backend.addr, &[]).await;

    let response = upload(
        &server.endpoint(),
        "/big",
        "huge.bin",
        "application/octet-stream",
        common::generate_binary(4096, 7),
    )
    .await;

    assert_eq!(response.status(), 403);
    assert_eq!(
        response.headers().get("x-error-type").unwrap(),
        "ICAP_SCAN_ERROR"
    );
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn test_extension_denial_short_circuits() {
    let icap = IcapStub::spawn(IcapScript::CleanOnPreview).await;
    let backend = BackendStub::spawn(201, "unreached").await;
    let server = TestServer::start(
        icap.addr,
        backend.addr,
        &[("ALLOWED_EXTENSIONS", ".pdf,.docx".to_string())],
    )
    .await;

    let response = upload(
        &server.endpoint(),
        "/api/files",
        "evil.exe",
        "application/octet-stream",
        b"MZ\x90\x00 not really a program".to_vec(),
    )
    .await;

    assert_eq!(response.status(), 400);
    assert_eq!(
        response.headers().get("x-error-type").unwrap(),
        "EXTENSION_ERROR"
    );

    // Neither upstream was contacted.
    assert_eq!(icap.connection_count(), 0);
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn test_icap_circuit_breaker_lifecycle() {
    let icap = IcapStub::spawn(IcapScript::HangAfterAccept).await;
    let backend = BackendStub::spawn(201, "unreached").await;
    let server = TestServer::start(
        icap.addr,
        backend.addr,
        &[
            ("SOCKET_TIMEOUT", "300".to_string()),
            ("SGP_ICAP_FAILURE_THRESHOLD", "5".to_string()),
            ("SGP_ICAP_RECOVERY_MS", "800".to_string()),
            ("CHECK_MIME_TYPE", "false".to_string()),
        ],
    )
    .await;

    // Five hung scans trip the breaker.
    for _ in 0..5 {
        let response = upload(
            &server.endpoint(),
            "/f",
            "a.bin",
            "application/octet-stream",
            vec![1u8; 128],
        )
        .await;
        assert_eq!(response.status(), 408);
        assert_eq!(
            response.headers().get("x-error-type").unwrap(),
            "TIMEOUT_ERROR"
        );
    }
    assert_eq!(icap.connection_count(), 5);

    // Breaker open: fail fast without dialing the scanner.
    let response = upload(
        &server.endpoint(),
        "/f",
        "a.bin",
        "application/octet-stream",
        vec![1u8; 128],
    )
    .await;
    assert_eq!(response.status(), 503);
    assert_eq!(
        response.headers().get("x-error-type").unwrap(),
        "SERVICE_UNAVAILABLE"
    );
    assert_eq!(icap.connection_count(), 5);

    // After the recovery timeout a half-open probe dials the scanner again.
    sleep(Duration::from_millis(1000)).await;
    let response = upload(
        &server.endpoint(),
        "/f",
        "a.bin",
        "application/octet-stream",
        vec![1u8; 128],
    )
    .await;
    assert_eq!(response.status(), 408);
    assert_eq!(icap.connection_count(), 6);

    // Failed probe re-opened the breaker.
    let response = upload(
        &server.endpoint(),
        "/f",
        "a.bin",
        "application/octet-stream",
        vec![1u8; 128],
    )
    .await;
    assert_eq!(response.status(), 503);
    assert_eq!(icap.connection_count(), 6);
}

#[tokio::test]
async fn test_mime_mismatch_rejected_end_to_end() {
    let icap = IcapStub::spawn(IcapScript::CleanOnPreview).await;
    let backend = BackendStub::spawn(201, "unreached").await;
    let server = TestServer::start(icap.addr, backend.addr, &[]).await;

    // An executable dressed up as an image.
    let response = upload(
        &server.endpoint(),
        "/api/files",
        "totally-a-picture.png",
        "image/png",
        b"MZ\x90\x00\x03\x00\x00\x00\x04\x00\x00\x00\xFF\xFF rest of the pe header".to_vec(),
    )
    .await;

    assert_eq!(response.status(), 400);
    assert_eq!(response.headers().get("x-error-type").unwrap(), "MIME_ERROR");
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn test_health_and_non_post_routing() {
    let icap = IcapStub::spawn(IcapScript::CleanOnPreview).await;
    let backend = BackendStub::spawn(201, "ok").await;
    let server = TestServer::start(icap.addr, backend.addr, &[]).await;

    let client = reqwest::Client::new();

    let health = client
        .get(format!("{}/health", server.endpoint()))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    let body: serde_json::Value = health.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["icap"], "closed");
    assert_eq!(body["backend"], "closed");

    let get_upload = client
        .get(format!("{}/api/files", server.endpoint()))
        .send()
        .await
        .unwrap();
    assert_eq!(get_upload.status(), 405);

    let metrics = client
        .get(format!("{}/metrics", server.endpoint()))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), 200);
    assert!(metrics
        .text()
        .await
        .unwrap()
        .contains("scangate_breaker_state"));
}
