//! Thin, injectable wrapper over the POSIX-ish operations
//! [`crate::store::RecordStore`] needs: read a whole file, write a whole
//! file (truncating), rewrite a byte range in place, remove a file, and get
//! a file's size. Every real filesystem interaction in this crate routes
//! through the [`PosixIo`] trait so tests can substitute a fault-injecting
//! implementation instead of touching disk.
//!
//! `RecordStore` never holds a file descriptor across operations: each call
//! here opens, acts, and closes (or fsyncs and closes, for writes) within a
//! single method.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[async_trait]
pub trait PosixIo: Send + Sync {
    /// Reads the entire contents of `path`.
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Reads up to `len` bytes from the start of `path`, without reading
    /// the rest of the file. Used by operations that only need the header
    /// (`touch`, `lock`, `unlock`) so they don't pull a potentially large
    /// payload into memory just to flip a flag.
    async fn read_prefix(&self, path: &Path, len: usize) -> io::Result<Vec<u8>>;

    /// Writes `data` to `path`, truncating any existing file, and fsyncs
    /// before returning.
    async fn write_all_truncating(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Overwrites `data` at `offset` within an existing file, without
    /// touching any other bytes, and fsyncs before returning. Used to
    /// rewrite the header in place after a `touch`/`lock`/`unlock`.
    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()>;

    async fn remove_file(&self, path: &Path) -> io::Result<()>;

    async fn file_size(&self, path: &Path) -> io::Result<u64>;
}

/// The real, disk-backed [`PosixIo`] implementation, built on `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealPosixIo;

#[async_trait]
impl PosixIo for RealPosixIo {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn read_prefix(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; len];
        let read = file.read(&mut buf).await?;
        buf.truncate(read);
        Ok(buf)
    }

    async fn write_all_truncating(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn file_size(&self, path: &Path) -> io::Result<u64> {
        tokio::fs::metadata(path).await.map(|m| m.len())
    }
}
