//! Hybrid memory/disk spool for in-flight uploads
//!
//! Small uploads stay in memory as a chunk list; once the configured
//! threshold is crossed the buffer spills to a temp file and all further
//! appends go to disk. The transition is one-way. Readers get independent
//! cursors so the ICAP preview, the full scan body, and the backend forward
//! can each walk the same bytes without disturbing the append position.

use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Chunk size handed out by [`BufferReader`].
pub const READ_CHUNK_SIZE: usize = 128 * 1024;

/// In hybrid mode, flush to disk after this many unflushed bytes.
const FLUSH_INTERVAL: u64 = 10 * 1024 * 1024;

/// Errors from buffer operations
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("file exceeds maximum allowed size: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("buffer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the buffered bytes currently live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Memory,
    Hybrid,
}

impl BufferMode {
    pub fn label(&self) -> &'static str {
        match self {
            BufferMode::Memory => "memory",
            BufferMode::Hybrid => "hybrid",
        }
    }
}

/// Snapshot of buffer bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub mode: BufferMode,
    pub total_size: u64,
    pub memory_size: u64,
    pub disk_size: u64,
}

/// Append-only upload spool with a one-way memory -> hybrid transition.
pub struct SpoolBuffer {
    mode: BufferMode,
    chunks: Vec<Bytes>,
    total_size: u64,
    memory_size: u64,
    disk_size: u64,
    spill_path: Option<PathBuf>,
    spill_file: Option<File>,
    unflushed: u64,
    memory_threshold: u64,
    max_file_size: u64,
    temp_dir: PathBuf,

    /// MIME type chosen by the detector, once sniffed
    pub detected_mime: Option<String>,
    /// Which detection tier produced `detected_mime`
    pub detection_method: Option<String>,
    /// Content-Type declared in the multipart part header
    pub declared_mime: Option<String>,
    /// Filename from Content-Disposition
    pub filename: Option<String>,
}

impl SpoolBuffer {
    pub fn new(memory_threshold: u64, max_file_size: u64, temp_dir: &Path) -> Self {
        Self {
            mode: BufferMode::Memory,
            chunks: Vec::new(),
            total_size: 0,
            memory_size: 0,
            disk_size: 0,
            spill_path: None,
            spill_file: None,
            unflushed: 0,
            memory_threshold,
            max_file_size,
            temp_dir: temp_dir.to_path_buf(),
            detected_mime: None,
            detection_method: None,
            declared_mime: None,
            filename: None,
        }
    }

    /// Append bytes. Checks the absolute size cap before touching any state,
    /// and switches to hybrid mode first if this append would cross the
    /// memory threshold.
    pub async fn append(&mut self, data: Bytes) -> Result<(), BufferError> {
        let new_total = self.total_size + data.len() as u64;
        if new_total > self.max_file_size {
            return Err(BufferError::FileTooLarge {
                size: new_total,
                max: self.max_file_size,
            });
        }

        if self.mode == BufferMode::Memory && new_total > self.memory_threshold {
            self.spill_to_disk().await?;
        }

        match self.mode {
            BufferMode::Memory => {
                self.memory_size += data.len() as u64;
                self.total_size = new_total;
                self.chunks.push(data);
            }
            BufferMode::Hybrid => {
                let file = self
                    .spill_file
                    .as_mut()
                    .expect("hybrid buffer has an open spill file");
                file.write_all(&data).await?;
                self.unflushed += data.len() as u64;
                if self.unflushed >= FLUSH_INTERVAL {
                    file.flush().await?;
                    self.unflushed = 0;
                }
                self.disk_size = new_total;
                self.total_size = new_total;
            }
        }
        Ok(())
    }

    /// One-way memory -> hybrid transition: write all in-memory chunks to a
    /// fresh temp file, then discard them. On any failure the buffer is left
    /// in memory mode with unchanged contents.
    async fn spill_to_disk(&mut self) -> Result<(), BufferError> {
        let path = self.temp_dir.join(spill_file_name());

        let result: Result<File, std::io::Error> = async {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await?;
            for chunk in &self.chunks {
                file.write_all(chunk).await?;
            }
            file.flush().await?;
            Ok(file)
        }
        .await;

        match result {
            Ok(file) => {
                debug!(
                    path = %path.display(),
                    bytes = self.total_size,
                    "buffer spilled to disk"
                );
                self.spill_file = Some(file);
                self.spill_path = Some(path);
                self.mode = BufferMode::Hybrid;
                self.disk_size = self.total_size;
                self.memory_size = 0;
                self.unflushed = 0;
                self.chunks = Vec::new();
                Ok(())
            }
            Err(e) => {
                // Partial file must not leak; the buffer stays in memory mode.
                let _ = tokio::fs::remove_file(&path).await;
                Err(e.into())
            }
        }
    }

    /// First `min(n, total_size)` bytes. Does not disturb the append cursor.
    pub async fn preview(&mut self, n: usize) -> Result<Bytes, BufferError> {
        let want = n.min(self.total_size as usize);
        match self.mode {
            BufferMode::Memory => {
                let mut out = BytesMut::with_capacity(want);
                for chunk in &self.chunks {
                    if out.len() >= want {
                        break;
                    }
                    let take = (want - out.len()).min(chunk.len());
                    out.extend_from_slice(&chunk[..take]);
                }
                Ok(out.freeze())
            }
            BufferMode::Hybrid => {
                if let Some(file) = self.spill_file.as_mut() {
                    file.flush().await?;
                    self.unflushed = 0;
                }
                let path = self
                    .spill_path
                    .as_ref()
                    .expect("hybrid buffer has a spill path");
                let mut file = File::open(path).await?;
                let mut out = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut out[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                out.truncate(filled);
                Ok(Bytes::from(out))
            }
        }
    }

    /// Fresh, independent cursor over the buffered bytes from `start_offset`.
    pub async fn reader(&mut self, start_offset: u64) -> Result<BufferReader, BufferError> {
        let start = start_offset.min(self.total_size);
        match self.mode {
            BufferMode::Memory => Ok(BufferReader {
                inner: ReaderInner::Memory {
                    chunks: self.chunks.clone(),
                    index: 0,
                    skip: start,
                },
            }),
            BufferMode::Hybrid => {
                if let Some(file) = self.spill_file.as_mut() {
                    file.flush().await?;
                    self.unflushed = 0;
                }
                let path = self
                    .spill_path
                    .as_ref()
                    .expect("hybrid buffer has a spill path");
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                let remaining = self.total_size - start;
                Ok(BufferReader {
                    inner: ReaderInner::Disk { file, remaining },
                })
            }
        }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            mode: self.mode,
            total_size: self.total_size,
            memory_size: self.memory_size,
            disk_size: self.disk_size,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Path of the spill file, if the buffer has transitioned.
    pub fn spill_path(&self) -> Option<&Path> {
        self.spill_path.as_deref()
    }

    /// Release memory chunks; close and unlink the spill file. Idempotent.
    pub async fn clear(&mut self) {
        self.chunks = Vec::new();
        self.memory_size = 0;

        // Close before unlink.
        if let Some(mut file) = self.spill_file.take() {
            let _ = file.flush().await;
            drop(file);
        }
        if let Some(path) = self.spill_path.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to unlink spill file");
            }
        }
        self.disk_size = 0;
        self.total_size = 0;
    }
}

/// Spill-file name: pid + timestamp + random component, collision-safe
/// within a shared temp directory.
fn spill_file_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!(
        "sgp-{}-{}-{:08x}.spill",
        std::process::id(),
        nanos,
        rand::random::<u32>()
    )
}

enum ReaderInner {
    Memory {
        chunks: Vec<Bytes>,
        index: usize,
        skip: u64,
    },
    Disk {
        file: File,
        remaining: u64,
    },
}

/// Sequential cursor over a [`SpoolBuffer`] snapshot, yielding chunks of up
/// to [`READ_CHUNK_SIZE`] bytes.
pub struct BufferReader {
    inner: ReaderInner,
}

impl BufferReader {
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, std::io::Error> {
        match &mut self.inner {
            ReaderInner::Memory { chunks, index, skip } => {
                while *index < chunks.len() {
                    let chunk = &chunks[*index];
                    if *skip >= chunk.len() as u64 {
                        *skip -= chunk.len() as u64;
                        *index += 1;
                        continue;
                    }
                    let start = *skip as usize;
                    let end = (start + READ_CHUNK_SIZE).min(chunk.len());
                    let out = chunk.slice(start..end);
                    if end == chunk.len() {
                        *skip = 0;
                        *index += 1;
                    } else {
                        *skip = end as u64;
                    }
                    return Ok(Some(out));
                }
                Ok(None)
            }
            ReaderInner::Disk { file, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let want = (*remaining).min(READ_CHUNK_SIZE as u64) as usize;
                let mut out = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut out[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                out.truncate(filled);
                if filled == 0 {
                    *remaining = 0;
                    return Ok(None);
                }
                *remaining -= filled as u64;
                Ok(Some(Bytes::from(out)))
            }
        }
    }

    /// Drain the cursor into one contiguous byte string. Test and
    /// small-payload helper.
    pub async fn read_to_end(mut self) -> Result<Bytes, std::io::Error> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_buffer(threshold: u64, max: u64, dir: &TempDir) -> SpoolBuffer {
        SpoolBuffer::new(threshold, max, dir.path())
    }

    #[tokio::test]
    async fn test_memory_append_and_read() {
        let tmp = TempDir::new().unwrap();
        let mut buf = make_buffer(1024, 4096, &tmp);

        buf.append(Bytes::from_static(b"hello ")).await.unwrap();
        buf.append(Bytes::from_static(b"world")).await.unwrap();

        let stats = buf.stats();
        assert_eq!(stats.mode, BufferMode::Memory);
        assert_eq!(stats.total_size, 11);
        assert_eq!(stats.memory_size, 11);
        assert_eq!(stats.disk_size, 0);

        let all = buf.reader(0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(&all[..], b"hello world");
        buf.clear().await;
    }

    #[tokio::test]
    async fn test_mode_transition_at_threshold() {
        let tmp = TempDir::new().unwrap();
        let mut buf = make_buffer(100, 10_000, &tmp);

        buf.append(Bytes::from(vec![1u8; 60])).await.unwrap();
        assert_eq!(buf.mode(), BufferMode::Memory);

        // Crossing the threshold spills, then appends to disk.
        buf.append(Bytes::from(vec![2u8; 60])).await.unwrap();
        let stats = buf.stats();
        assert_eq!(stats.mode, BufferMode::Hybrid);
        assert_eq!(stats.total_size, 120);
        assert_eq!(stats.memory_size, 0);
        assert_eq!(stats.disk_size, 120);
        assert!(buf.spill_path().is_some());

        let all = buf.reader(0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(all.len(), 120);
        assert_eq!(&all[..60], &[1u8; 60][..]);
        assert_eq!(&all[60..], &[2u8; 60][..]);
        buf.clear().await;
    }

    #[tokio::test]
    async fn test_preview_matches_reader_across_modes() {
        let tmp = TempDir::new().unwrap();
        let mut buf = make_buffer(50, 10_000, &tmp);

        let data: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(37) {
            buf.append(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        assert_eq!(buf.mode(), BufferMode::Hybrid);

        let preview = buf.preview(64).await.unwrap();
        assert_eq!(&preview[..], &data[..64]);

        // Preview is idempotent.
        let again = buf.preview(64).await.unwrap();
        assert_eq!(preview, again);

        let full = buf.reader(0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(&full[..], &data[..]);
        buf.clear().await;
    }

    #[tokio::test]
    async fn test_preview_clamps_to_total_size() {
        let tmp = TempDir::new().unwrap();
        let mut buf = make_buffer(1024, 4096, &tmp);
        buf.append(Bytes::from_static(b"short")).await.unwrap();

        let preview = buf.preview(1000).await.unwrap();
        assert_eq!(&preview[..], b"short");
        buf.clear().await;
    }

    #[tokio::test]
    async fn test_reader_with_offset_crossing_chunks() {
        let tmp = TempDir::new().unwrap();
        let mut buf = make_buffer(10_000, 10_000, &tmp);
        buf.append(Bytes::from_static(b"aaaa")).await.unwrap();
        buf.append(Bytes::from_static(b"bbbb")).await.unwrap();
        buf.append(Bytes::from_static(b"cccc")).await.unwrap();

        let rest = buf.reader(6).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(&rest[..], b"bbcccc");
        buf.clear().await;
    }

    #[tokio::test]
    async fn test_too_large_rejected_without_mutation() {
        let tmp = TempDir::new().unwrap();
        let mut buf = make_buffer(1024, 10, &tmp);
        buf.append(Bytes::from_static(b"12345678")).await.unwrap();

        let err = buf.append(Bytes::from_static(b"9999")).await.unwrap_err();
        assert!(matches!(err, BufferError::FileTooLarge { size: 12, max: 10 }));

        // Rejected append left the contents untouched.
        assert_eq!(buf.total_size(), 8);
        let all = buf.reader(0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(&all[..], b"12345678");
        buf.clear().await;
    }

    #[tokio::test]
    async fn test_clear_removes_spill_file() {
        let tmp = TempDir::new().unwrap();
        let mut buf = make_buffer(10, 10_000, &tmp);
        buf.append(Bytes::from(vec![0u8; 100])).await.unwrap();

        let path = buf.spill_path().unwrap().to_path_buf();
        assert!(path.exists());

        buf.clear().await;
        assert!(!path.exists());
        assert_eq!(buf.total_size(), 0);

        // Idempotent.
        buf.clear().await;
    }

    #[tokio::test]
    async fn test_independent_readers() {
        let tmp = TempDir::new().unwrap();
        let mut buf = make_buffer(10, 10_000, &tmp);
        buf.append(Bytes::from(vec![7u8; 300])).await.unwrap();

        let mut r1 = buf.reader(0).await.unwrap();
        let mut r2 = buf.reader(0).await.unwrap();
        let c1 = r1.next_chunk().await.unwrap().unwrap();
        let c2 = r2.next_chunk().await.unwrap().unwrap();
        assert_eq!(c1, c2);
        buf.clear().await;
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // A full read of reader(0) yields exactly the concatenation of
            // appends, regardless of where the mode transition lands.
            #[test]
            fn append_read_roundtrip(
                chunks in prop::collection::vec(
                    prop::collection::vec(any::<u8>(), 0..200),
                    0..20,
                ),
                threshold in 1u64..500,
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let tmp = TempDir::new().unwrap();
                    let mut buf = SpoolBuffer::new(threshold, 1 << 20, tmp.path());
                    let mut expected = Vec::new();
                    for chunk in &chunks {
                        expected.extend_from_slice(chunk);
                        buf.append(Bytes::copy_from_slice(chunk)).await.unwrap();
                    }
                    assert_eq!(buf.total_size(), expected.len() as u64);

                    let all = buf.reader(0).await.unwrap().read_to_end().await.unwrap();
                    assert_eq!(&all[..], &expected[..]);

                    let preview = buf.preview(64).await.unwrap();
                    let want = 64.min(expected.len());
                    assert_eq!(&preview[..], &expected[..want]);

                    buf.clear().await;
                });
            }
        }
    }
}
