//! Read-through access: serve a byte range from the cache, populating
//! missing segments from the remote source along the way.
//!
//! This is the caller side of the segment protocol. For each segment of the
//! requested range the reader either becomes the downloader and pulls bytes
//! from the remote in reserved chunks, or waits on the incumbent downloader
//! and consumes bytes as they land. Bytes the cache cannot take (denied
//! reservation, terminal partial segments, detachment) are read directly
//! from the remote instead, so the returned data is always complete.

use std::fs::File;
use std::io::{self, Read, SeekFrom};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::cache::BlobCache;
use crate::downloader::CallerId;
use crate::error::CacheError;
use crate::io::{ChunkPool, RemoteReader};
use crate::range::{FileKey, Range};
use crate::segment::Segment;
use crate::state::SegmentState;

/// Reads `range` of the file identified by `key`, caching whatever the
/// budget allows.
pub fn read_through(
    cache: &Arc<BlobCache>,
    key: FileKey,
    range: Range,
    remote: &mut dyn RemoteReader,
    pool: &ChunkPool,
) -> Result<Bytes, CacheError> {
    let holder = cache.get_or_set(key, range.left(), range.size())?;
    let mut out = BytesMut::with_capacity(range.size() as usize);
    for segment in holder.iter() {
        let want = Range::new(
            range.left().max(segment.range().left()),
            range.right().min(segment.range().right()),
        );
        read_segment(segment, want, remote, pool, &mut out)?;
    }
    Ok(out.freeze())
}

fn read_segment(
    segment: &Arc<Segment>,
    want: Range,
    remote: &mut dyn RemoteReader,
    pool: &ChunkPool,
    out: &mut BytesMut,
) -> Result<(), CacheError> {
    loop {
        if segment.is_downloaded() {
            return read_local(segment, want, out);
        }
        if segment.is_detached() || segment.state().is_terminal() {
            return read_mixed(segment, want, remote, out);
        }

        let downloader = match segment.get_or_set_downloader() {
            Ok(id) => id,
            Err(CacheError::Detached(_)) => return read_mixed(segment, want, remote, out),
            Err(e) => return Err(e),
        };
        if downloader == CallerId::current() {
            return download_and_serve(segment, want, remote, pool, out);
        }

        let observed = segment.wait();
        if observed == SegmentState::Downloading {
            // Timed out or made partial progress; serve early if the bytes
            // we need are already on disk.
            let available_end = segment.range().left() + segment.downloaded_size();
            if available_end > want.right() {
                return read_local(segment, want, out);
            }
        }
        // Re-evaluate: the downloader may have finished, failed, or handed
        // the role back.
    }
}

/// Downloads the rest of the segment as its downloader, then serves the
/// wanted bytes.
fn download_and_serve(
    segment: &Arc<Segment>,
    want: Range,
    remote: &mut dyn RemoteReader,
    pool: &ChunkPool,
    out: &mut BytesMut,
) -> Result<(), CacheError> {
    let seg_range = segment.range();
    let mut buf = pool.get();
    let mut capped = false;

    loop {
        let offset = segment.download_offset();
        if offset > seg_range.right() {
            break;
        }
        let n = ((seg_range.right() - offset + 1) as usize).min(pool.chunk_size());
        buf.resize(n, 0);
        if let Err(e) = read_full(remote, offset, &mut buf[..n]) {
            pool.put(buf);
            return Err(e.into());
        }
        if !segment.reserve(n as u64)? {
            capped = true;
            break;
        }
        segment.write(&buf[..n], offset)?;
    }
    pool.put(buf);

    if capped {
        read_mixed(segment, want, remote, out)
    } else {
        segment.complete(SegmentState::Downloaded)?;
        read_local(segment, want, out)
    }
}

/// Serves the cached prefix from the backing file and the remainder from
/// the remote.
fn read_mixed(
    segment: &Arc<Segment>,
    want: Range,
    remote: &mut dyn RemoteReader,
    out: &mut BytesMut,
) -> Result<(), CacheError> {
    let downloaded = segment.downloaded_size();
    let seg_left = segment.range().left();
    if downloaded > 0 && want.left() < seg_left + downloaded {
        let cached_right = want.right().min(seg_left + downloaded - 1);
        read_local(segment, Range::new(want.left(), cached_right), out)?;
        if cached_right == want.right() {
            return Ok(());
        }
        read_remote(remote, Range::new(cached_right + 1, want.right()), out)
    } else {
        read_remote(remote, want, out)
    }
}

/// Reads bytes the downloader already put on disk. Callers must not ask
/// past the observed downloaded size.
fn read_local(
    segment: &Arc<Segment>,
    want: Range,
    out: &mut BytesMut,
) -> Result<(), CacheError> {
    let mut file = File::open(segment.path())?;
    std::io::Seek::seek(&mut file, SeekFrom::Start(want.left() - segment.range().left()))?;
    let start = out.len();
    out.resize(start + want.size() as usize, 0);
    file.read_exact(&mut out[start..])?;
    Ok(())
}

fn read_remote(
    remote: &mut dyn RemoteReader,
    want: Range,
    out: &mut BytesMut,
) -> Result<(), CacheError> {
    let start = out.len();
    out.resize(start + want.size() as usize, 0);
    read_full(remote, want.left(), &mut out[start..])?;
    Ok(())
}

fn read_full(remote: &mut dyn RemoteReader, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match remote.read_at(offset + filled as u64, &mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "remote source ended before the requested range",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
