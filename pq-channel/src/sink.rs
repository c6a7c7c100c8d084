//! Destinations for received plaintext.
//!
//! Chunks are written as they verify, but nothing is visible to the caller
//! until [`ChunkSink::commit`]; a failed transfer calls
//! [`ChunkSink::discard`] instead.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use zeroize::Zeroize;

#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;

    /// Publish everything written so far.
    async fn commit(&mut self) -> io::Result<()>;

    /// Throw away everything written so far.
    async fn discard(&mut self) -> io::Result<()>;
}

/// Buffers the payload in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pending: Vec<u8>,
    committed: Option<Vec<u8>>,
    discarded: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The payload, once committed.
    pub fn committed(&self) -> Option<&[u8]> {
        self.committed.as_deref()
    }

    pub fn into_committed(self) -> Option<Vec<u8>> {
        self.committed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn was_discarded(&self) -> bool {
        self.discarded
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(data);
        Ok(())
    }

    async fn commit(&mut self) -> io::Result<()> {
        self.committed = Some(std::mem::take(&mut self.pending));
        Ok(())
    }

    async fn discard(&mut self) -> io::Result<()> {
        self.pending.zeroize();
        self.discarded = true;
        Ok(())
    }
}

/// Writes to a hidden temporary file next to the destination and renames
/// it into place on commit.
#[derive(Debug)]
pub struct FileSink {
    destination: PathBuf,
    partial: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub async fn create(destination: impl AsRef<Path>) -> io::Result<Self> {
        let destination = destination.as_ref().to_path_buf();
        let name = destination
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?
            .to_string_lossy()
            .into_owned();
        let partial = destination.with_file_name(format!(".{name}.partial"));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .await?;
        Ok(Self {
            destination,
            partial,
            file: Some(file),
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "sink already finished"))
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.file()?.write_all(data).await
    }

    async fn commit(&mut self) -> io::Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "sink already finished"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&self.partial, &self.destination).await
    }

    async fn discard(&mut self) -> io::Result<()> {
        if self.file.take().is_none() {
            return Ok(());
        }
        match fs::remove_file(&self.partial).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for FileSink {
    // A cancelled receive never reaches `discard`.
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_sink_commits() {
        let mut sink = MemorySink::new();
        sink.write_chunk(b"hello ").await.unwrap();
        sink.write_chunk(b"world").await.unwrap();
        assert!(sink.committed().is_none());
        sink.commit().await.unwrap();
        assert_eq!(sink.committed(), Some(&b"hello world"[..]));
    }

    #[tokio::test]
    async fn memory_sink_discard_leaves_nothing() {
        let mut sink = MemorySink::new();
        sink.write_chunk(b"secret").await.unwrap();
        sink.discard().await.unwrap();
        assert!(sink.committed().is_none());
        assert!(sink.was_discarded());
    }

    #[tokio::test]
    async fn file_sink_renames_on_commit() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let mut sink = FileSink::create(&dest).await.unwrap();
        assert!(sink.partial_path().exists());
        assert!(!dest.exists());

        sink.write_chunk(b"abc").await.unwrap();
        sink.commit().await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
        assert!(!sink.partial_path().exists());
    }

    #[tokio::test]
    async fn file_sink_discard_removes_partial() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let mut sink = FileSink::create(&dest).await.unwrap();
        sink.write_chunk(b"partial").await.unwrap();
        sink.discard().await.unwrap();
        assert!(!sink.partial_path().exists());
        assert!(!dest.exists());
        assert!(sink.write_chunk(b"more").await.is_err());
    }

    #[tokio::test]
    async fn dropped_file_sink_leaves_nothing() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let sink = FileSink::create(&dest).await.unwrap();
        let partial = sink.partial_path().to_path_buf();
        drop(sink);
        assert!(!partial.exists());
        assert!(!dest.exists());
    }
}
