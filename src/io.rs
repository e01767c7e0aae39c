//! I/O primitives for moving segment bytes between the remote source and
//! the local cache directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

/// Size of one download chunk pulled from the remote source (64 KiB).
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunk buffers kept in the pool.
pub const CHUNK_POOL_CAPACITY: usize = 64;

/// A resumable byte source backing a logical file.
///
/// Supplied by the caller when it first acquires the downloader role; a
/// segment may cache the reader for reuse across chunks and downloader
/// handoffs.
pub trait RemoteReader: Send {
    /// Repositions the source at an absolute offset.
    fn seek(&mut self, offset: u64) -> io::Result<()>;

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; `Ok(0)` means end of stream.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl RemoteReader for File {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        Seek::seek(self, SeekFrom::Start(offset)).map(|_| ())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        RemoteReader::seek(self, offset)?;
        Read::read(self, buf)
    }
}

/// Append-only writer for a segment's backing file.
///
/// Owned by the segment once created; at most one thread (the downloader)
/// writes through it. Fsync discipline lives here: `flush` maps to
/// `sync_data`.
pub struct LocalWriter {
    file: File,
    written: u64,
}

impl LocalWriter {
    /// Opens the backing file for appending, creating parent directories as
    /// needed. An existing file is continued, which is how a resumed
    /// download picks up where the previous downloader stopped.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self { file, written })
    }

    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Bytes in the backing file, including any recovered from a previous
    /// downloader.
    pub fn size(&self) -> u64 {
        self.written
    }
}

/// Pool of reusable download chunk buffers.
pub struct ChunkPool {
    buffers: ArrayQueue<BytesMut>,
    chunk_size: usize,
}

impl ChunkPool {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(CHUNK_POOL_CAPACITY, DOWNLOAD_CHUNK_SIZE)
    }

    pub fn with_capacity(chunks: usize, chunk_size: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            buffers: ArrayQueue::new(chunks),
            chunk_size,
        });

        for _ in 0..chunks {
            let _ = pool.buffers.push(BytesMut::with_capacity(chunk_size));
        }

        pool
    }

    pub fn get(&self) -> BytesMut {
        self.buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.chunk_size))
    }

    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.buffers.push(buf);
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn available(&self) -> usize {
        self.buffers.len()
    }
}
