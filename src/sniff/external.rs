//! External MIME detector bridge
//!
//! Shells out to `file --mime-type -b` under a hard 2-second wall clock so a
//! wedged detector can never stall the request. Memory-mode buffers have no
//! path on disk yet; their preview is written to a scratch file first.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Wall-clock cap on the external detector.
const EXTERNAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Results the external tool reports when it has nothing specific to say.
const UNINFORMATIVE: &[&str] = &["application/octet-stream", "data", "inode/x-empty"];

/// Run the external detector against a file already on disk. Returns a
/// specific MIME type, or `None` on timeout, failure, or an uninformative
/// answer.
pub async fn detect_path(path: &Path) -> Option<String> {
    let run = Command::new("file")
        .arg("--mime-type")
        .arg("-b")
        .arg(path)
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(EXTERNAL_TIMEOUT, run).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!(error = %e, "external MIME detector failed to start");
            return None;
        }
        Err(_) => {
            debug!("external MIME detector timed out");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }

    let mime = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if mime.is_empty() || UNINFORMATIVE.contains(&mime.as_str()) {
        return None;
    }
    Some(mime)
}

/// Run the external detector against preview bytes that only exist in
/// memory: spill them to a scratch file, detect, unlink.
pub async fn detect_bytes(preview: &[u8], temp_dir: &Path) -> Option<String> {
    let path = scratch_path(temp_dir);

    let written: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(preview).await?;
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = written {
        debug!(error = %e, "failed to stage preview for external detection");
        let _ = tokio::fs::remove_file(&path).await;
        return None;
    }

    let result = detect_path(&path).await;
    let _ = tokio::fs::remove_file(&path).await;
    result
}

fn scratch_path(temp_dir: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    temp_dir.join(format!(
        "sgp-sniff-{}-{}-{:08x}",
        std::process::id(),
        nanos,
        rand::random::<u32>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_cmd_available() -> bool {
        std::process::Command::new("file")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_detect_bytes_png() {
        if !file_cmd_available() {
            eprintln!("file(1) not available, skipping test");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let mut png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&[0u8; 64]);

        let detected = detect_bytes(&png, tmp.path()).await;
        assert_eq!(detected.as_deref(), Some("image/png"));

        // Scratch file cleaned up.
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_uninformative_result_is_none() {
        if !file_cmd_available() {
            eprintln!("file(1) not available, skipping test");
            return;
        }
        let tmp = TempDir::new().unwrap();
        // Random-ish bytes the tool can only call "data".
        let noise = [0x13u8, 0x37, 0x00, 0x42, 0x99, 0xAB, 0x01, 0xFE];
        let detected = detect_bytes(&noise, tmp.path()).await;
        assert_eq!(detected, None);
    }

    #[tokio::test]
    async fn test_missing_path_is_none() {
        let detected = detect_path(Path::new("/nonexistent/sgp-test-void")).await;
        assert_eq!(detected, None);
    }
}
