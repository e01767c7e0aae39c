//! The stateful unit of caching: one contiguous byte range of one logical
//! file, with single-downloader write coordination.
//!
//! A segment guards its mutable state with two locks plus the cache-wide
//! lock owned by [`BlobCache`](crate::cache::BlobCache). The lock order is
//! total: cache lock, then segment lock, then download lock. Operations that
//! need the cache lock take `&mut CacheShared`, which can only be produced
//! by holding the cache mutex, so calling them without the outer lock is a
//! type error. The download lock pairs the file append with the
//! `downloaded_size` bump so waiters never observe a size the file does not
//! yet have.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::cache::{BlobCache, CacheShared};
use crate::downloader::CallerId;
use crate::error::CacheError;
use crate::io::{LocalWriter, RemoteReader};
use crate::range::{FileKey, Range};
use crate::state::SegmentState;

/// One cached byte range of one logical file.
pub struct Segment {
    key: FileKey,
    range: Range,
    path: PathBuf,
    wait_timeout: Duration,
    cache: Weak<BlobCache>,

    inner: Mutex<SegmentInner>,
    cond: Condvar,
    download: Mutex<DownloadProgress>,

    /// Lock-free mirror of `state == Downloaded`; authoritative decisions
    /// re-check under the segment lock.
    is_downloaded: AtomicBool,
    hits_count: AtomicU64,
    ref_count: AtomicU64,
}

struct SegmentInner {
    state: SegmentState,
    downloader: Option<CallerId>,
    reserved_size: u64,
    reservation_failed: bool,
    write_failed: bool,
    detached: bool,
    remote_reader: Option<Box<dyn RemoteReader>>,
    deferred: Option<Bytes>,
    deferred_finalized: bool,
}

struct DownloadProgress {
    downloaded_size: u64,
    writer: Option<LocalWriter>,
}

impl Segment {
    /// Creates a segment owned by `cache`. New segments start `Empty`;
    /// recovery creates them `Downloaded` with the full range on disk.
    pub(crate) fn new(
        cache: Weak<BlobCache>,
        key: FileKey,
        range: Range,
        state: SegmentState,
        path: PathBuf,
        wait_timeout: Duration,
    ) -> Arc<Self> {
        debug_assert!(matches!(
            state,
            SegmentState::Empty | SegmentState::Downloaded
        ));
        let downloaded = match state {
            SegmentState::Downloaded => range.size(),
            _ => 0,
        };
        Arc::new(Self {
            key,
            range,
            path,
            wait_timeout,
            cache,
            inner: Mutex::new(SegmentInner {
                state,
                downloader: None,
                reserved_size: downloaded,
                reservation_failed: false,
                write_failed: false,
                detached: false,
                remote_reader: None,
                deferred: None,
                deferred_finalized: false,
            }),
            cond: Condvar::new(),
            download: Mutex::new(DownloadProgress {
                downloaded_size: downloaded,
                writer: None,
            }),
            is_downloaded: AtomicBool::new(state == SegmentState::Downloaded),
            hits_count: AtomicU64::new(0),
            ref_count: AtomicU64::new(0),
        })
    }

    pub fn key(&self) -> FileKey {
        self.key
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn offset(&self) -> u64 {
        self.range.left()
    }

    /// Path of the backing file under the cache directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SegmentState {
        self.inner.lock().state
    }

    pub fn is_detached(&self) -> bool {
        self.inner.lock().detached
    }

    /// Lock-free hint; see `state()` for the authoritative answer.
    pub fn is_downloaded(&self) -> bool {
        self.is_downloaded.load(Ordering::Relaxed)
    }

    pub fn downloaded_size(&self) -> u64 {
        self.download.lock().downloaded_size
    }

    pub fn reserved_size(&self) -> u64 {
        self.inner.lock().reserved_size
    }

    /// The next byte offset a downloader must produce.
    pub fn download_offset(&self) -> u64 {
        self.range.left() + self.downloaded_size()
    }

    pub fn hits_count(&self) -> u64 {
        self.hits_count.load(Ordering::Relaxed)
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_hits(&self) {
        self.hits_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn acquire_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_ref(&self) {
        self.ref_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Atomically takes the downloader role if the segment is open for it.
    ///
    /// Returns the identity of whoever holds the role after the call: the
    /// caller's own id on success, the incumbent's id while the segment is
    /// downloading, or the `"None"` sentinel on a terminal segment. Never
    /// blocks; only the returned-own-id case authorizes `reserve`, `write`
    /// and `complete`.
    pub fn get_or_set_downloader(&self) -> Result<CallerId, CacheError> {
        let mut inner = self.inner.lock();
        self.check_not_detached(&inner)?;
        if inner.state.can_acquire_downloader() {
            let id = CallerId::current();
            inner.state = SegmentState::Downloading;
            inner.downloader = Some(id.clone());
            return Ok(id);
        }
        Ok(inner.downloader.clone().unwrap_or_else(CallerId::none))
    }

    pub fn get_downloader(&self) -> CallerId {
        self.inner
            .lock()
            .downloader
            .clone()
            .unwrap_or_else(CallerId::none)
    }

    pub fn is_downloader(&self) -> bool {
        let caller = CallerId::current();
        self.inner.lock().downloader.as_ref() == Some(&caller)
    }

    /// Gives up the downloader role so waiters may race for it.
    ///
    /// A fully written range finalizes to `Downloaded`; anything else drops
    /// back to `PartiallyDownloaded` for another caller to resume.
    pub fn reset_downloader(&self) -> Result<(), CacheError> {
        let caller = CallerId::current();
        let mut inner = self.inner.lock();
        self.check_not_detached(&inner)?;
        self.check_downloader(&inner, &caller)?;
        self.finish_download_round(&mut inner);
        Ok(())
    }

    /// Completes the current write batch and releases the downloader role
    /// without finalizing the segment, for callers that interleave cache
    /// writes with other work.
    pub fn complete_batch(&self) -> Result<(), CacheError> {
        let caller = CallerId::current();
        let mut inner = self.inner.lock();
        self.check_not_detached(&inner)?;
        self.check_downloader(&inner, &caller)?;
        self.finish_download_round(&mut inner);
        Ok(())
    }

    /// Extends this segment's reserved budget so that at least `size` bytes
    /// can be written beyond what is already downloaded.
    ///
    /// Returns whether the full amount is now available. Denial is not an
    /// error: the downloader stops caching and the next completion settles
    /// the segment into `PartiallyDownloadedNoContinuation` or `SkipCache`.
    pub fn reserve(&self, size: u64) -> Result<bool, CacheError> {
        if size == 0 {
            return Err(CacheError::IllegalState(
                "zero-byte reservation is not allowed".to_string(),
            ));
        }
        let caller = CallerId::current();
        let needed = {
            let inner = self.inner.lock();
            self.check_not_detached(&inner)?;
            self.check_downloader(&inner, &caller)?;
            if inner.reservation_failed {
                return Ok(false);
            }
            let available = inner.reserved_size - self.downloaded_size();
            if size <= available {
                return Ok(true);
            }
            size - available
        };

        // The cache lock is outermost, so the segment lock must be released
        // before asking the cache for budget.
        let cache = self.cache()?;
        let granted = cache.reserve_for_segment(&self.key, self.range.left(), needed);

        let mut inner = self.inner.lock();
        if inner.detached {
            let info = self.describe_locked(&inner);
            drop(inner);
            if granted {
                cache.release_reservation(needed);
            }
            return Err(CacheError::Detached(info));
        }
        if granted {
            inner.reserved_size += needed;
        } else {
            inner.reservation_failed = true;
        }
        Ok(granted)
    }

    /// Appends `data` at `offset`, which must equal the current download
    /// offset, within previously reserved space.
    ///
    /// The file append runs under the download lock only, so waiters can
    /// still inspect the segment while bytes hit the disk; the size bump and
    /// broadcast happen afterwards under both segment and download locks.
    pub fn write(&self, data: &[u8], offset: u64) -> Result<(), CacheError> {
        let caller = CallerId::current();
        {
            let inner = self.inner.lock();
            self.check_not_detached(&inner)?;
            self.check_downloader(&inner, &caller)?;
            if data.is_empty() {
                return Err(CacheError::IllegalState(
                    "zero-byte write is not allowed".to_string(),
                ));
            }
            let downloaded = self.downloaded_size();
            let available = inner.reserved_size - downloaded;
            if data.len() as u64 > available {
                return Err(CacheError::ReservationExceeded {
                    requested: data.len() as u64,
                    available,
                });
            }
            let expected = self.range.left() + downloaded;
            if offset != expected {
                return Err(CacheError::IllegalState(format!(
                    "write at offset {offset}, expected {expected}"
                )));
            }
        }

        let result = {
            let mut progress = self.download.lock();
            self.append_locked(&mut progress, data)
        };

        match result {
            Ok(()) => {
                let inner = self.inner.lock();
                {
                    let mut progress = self.download.lock();
                    progress.downloaded_size += data.len() as u64;
                }
                self.cond.notify_all();
                drop(inner);
                Ok(())
            }
            Err(source) => {
                let mut inner = self.inner.lock();
                let info = self.describe_locked(&inner);
                self.set_download_failed(&mut inner);
                self.cond.notify_all();
                Err(CacheError::WriteFailed { info, source })
            }
        }
    }

    /// Stages a single-shot buffered write for a background flusher.
    ///
    /// Space must already be reserved; the bytes count against the budget
    /// from reservation time. Staging twice is an error.
    pub fn write_in_memory(&self, data: Bytes) -> Result<(), CacheError> {
        let caller = CallerId::current();
        let mut inner = self.inner.lock();
        self.check_not_detached(&inner)?;
        self.check_downloader(&inner, &caller)?;
        if inner.deferred.is_some() || inner.deferred_finalized {
            return Err(CacheError::IllegalState(
                "a deferred write was already staged".to_string(),
            ));
        }
        if data.is_empty() {
            return Err(CacheError::IllegalState(
                "zero-byte write is not allowed".to_string(),
            ));
        }
        if self.downloaded_size() > 0 {
            return Err(CacheError::IllegalState(
                "deferred write on a segment with incremental writes".to_string(),
            ));
        }
        if data.len() as u64 > inner.reserved_size {
            return Err(CacheError::ReservationExceeded {
                requested: data.len() as u64,
                available: inner.reserved_size,
            });
        }
        inner.deferred = Some(data);
        Ok(())
    }

    /// Flushes the bytes staged by `write_in_memory` to the backing file.
    /// Purely a durability boundary; returns the number of bytes written.
    pub fn finalize_write(&self) -> Result<u64, CacheError> {
        let caller = CallerId::current();
        let data = {
            let mut inner = self.inner.lock();
            self.check_not_detached(&inner)?;
            self.check_downloader(&inner, &caller)?;
            match inner.deferred.take() {
                Some(data) => data,
                None if inner.deferred_finalized => {
                    return Err(CacheError::IllegalState(
                        "deferred write was already finalized".to_string(),
                    ));
                }
                None => {
                    return Err(CacheError::IllegalState(
                        "no deferred write staged".to_string(),
                    ));
                }
            }
        };

        let result = {
            let mut progress = self.download.lock();
            self.append_locked(&mut progress, &data)
                .and_then(|()| match progress.writer.as_mut() {
                    Some(writer) => writer.flush(),
                    None => Ok(()),
                })
        };

        match result {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.deferred_finalized = true;
                {
                    let mut progress = self.download.lock();
                    progress.downloaded_size += data.len() as u64;
                }
                self.cond.notify_all();
                Ok(data.len() as u64)
            }
            Err(source) => {
                let mut inner = self.inner.lock();
                let info = self.describe_locked(&inner);
                self.set_download_failed(&mut inner);
                self.cond.notify_all();
                Err(CacheError::WriteFailed { info, source })
            }
        }
    }

    /// Blocks until the downloader makes progress or the segment leaves
    /// `Downloading`, bounded by the configured timeout. Returns the state
    /// observed on wakeup; a timeout simply returns `Downloading`.
    pub fn wait(&self) -> SegmentState {
        let mut inner = self.inner.lock();
        if inner.detached || inner.state != SegmentState::Downloading {
            return inner.state;
        }
        let before = self.downloaded_size();
        if before == self.range.size() {
            return inner.state;
        }
        let deadline = Instant::now() + self.wait_timeout;
        while inner.state == SegmentState::Downloading && self.downloaded_size() == before {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.state
    }

    /// Explicitly completes the segment to a terminal state. Authoritative,
    /// downloader-only; the implicit holder-drop path exists to recover from
    /// abandoned downloaders.
    pub fn complete(&self, target: SegmentState) -> Result<(), CacheError> {
        let caller = CallerId::current();
        let cache = self.cache()?;
        let mut shared = cache.lock_shared();

        let mut inner = self.inner.lock();
        self.check_not_detached(&inner)?;
        self.check_downloader(&inner, &caller)?;
        let old = inner.state;
        match target {
            SegmentState::Downloaded => {
                let downloaded = self.downloaded_size();
                if downloaded != self.range.size() {
                    return Err(CacheError::IllegalState(format!(
                        "cannot complete to DOWNLOADED with {downloaded}/{} bytes",
                        self.range.size()
                    )));
                }
                self.set_downloaded(&mut inner);
            }
            SegmentState::PartiallyDownloadedNoContinuation => {
                if !(inner.reservation_failed || inner.write_failed) {
                    return Err(CacheError::IllegalState(
                        "PARTIALLY_DOWNLOADED_NO_CONTINUATION requires a failed reservation"
                            .to_string(),
                    ));
                }
                inner.state = SegmentState::PartiallyDownloadedNoContinuation;
                self.close_writer();
            }
            other => {
                return Err(CacheError::IllegalState(format!(
                    "cannot explicitly complete to {other}"
                )));
            }
        }
        inner.downloader = None;
        self.release_unused_reservation(&mut inner, &mut shared);
        shared.segment_state_changed(&self.key, self.range.left(), old, inner.state);
        self.cond.notify_all();
        Ok(())
    }

    /// The implicit completion path run for each segment when a holder is
    /// dropped. Must be called under the cache lock so that the last-holder
    /// decision and any index removal are atomic.
    pub(crate) fn complete_for_holder(
        &self,
        shared: &mut CacheShared,
    ) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        let is_last = self.ref_count.load(Ordering::SeqCst) <= 1;
        let old = inner.state;

        if inner.detached {
            self.cond.notify_all();
            if is_last {
                self.close_writer();
                self.delete_backing_file()?;
            }
            return Ok(());
        }

        let caller = CallerId::current();
        let is_downloader = inner.downloader.as_ref() == Some(&caller);

        if inner.state == SegmentState::Downloading && is_downloader {
            let downloaded = self.downloaded_size();
            if downloaded == self.range.size() {
                self.set_downloaded(&mut inner);
            } else if inner.reservation_failed || inner.write_failed {
                if downloaded == 0 {
                    inner.state = SegmentState::SkipCache;
                } else {
                    inner.state = SegmentState::PartiallyDownloadedNoContinuation;
                }
                self.close_writer();
            } else {
                inner.state = SegmentState::PartiallyDownloaded;
                self.close_writer();
            }
            inner.downloader = None;
            self.release_unused_reservation(&mut inner, shared);
        }

        if is_last && inner.state != SegmentState::Downloading {
            self.release_unused_reservation(&mut inner, shared);
            if matches!(inner.state, SegmentState::Empty | SegmentState::SkipCache) {
                shared.remove_segment(&self.key, self.range.left());
            }
        }

        if old != inner.state {
            shared.segment_state_changed(&self.key, self.range.left(), old, inner.state);
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Marks the segment as no longer owned by the cache index. Sticky; the
    /// current state is frozen and every subsequent mutation fails with
    /// `Detached`. The backing file is deleted now if nobody holds the
    /// segment, otherwise when the last holder drops.
    pub(crate) fn detach(&self, shared: &mut CacheShared) {
        let mut inner = self.inner.lock();
        if inner.detached {
            return;
        }
        inner.detached = true;
        let reserved = inner.reserved_size;
        shared.release_reservation(reserved);
        tracing::debug!(key = %self.key, range = %self.range, state = %inner.state, "segment detached");
        if self.ref_count.load(Ordering::SeqCst) == 0 {
            self.close_writer();
            if let Err(e) = self.delete_backing_file() {
                tracing::warn!(key = %self.key, range = %self.range, error = %e, "failed to delete detached segment file");
            }
        }
        self.cond.notify_all();
    }

    /// An immutable copy of the externally visible state for diagnostics.
    /// The snapshot is a segment detached from birth and never participates
    /// in the index.
    pub(crate) fn snapshot(&self, _shared: &CacheShared) -> Arc<Segment> {
        let inner = self.inner.lock();
        let downloaded = self.downloaded_size();
        Arc::new(Segment {
            key: self.key,
            range: self.range,
            path: self.path.clone(),
            wait_timeout: self.wait_timeout,
            cache: Weak::new(),
            inner: Mutex::new(SegmentInner {
                state: inner.state,
                downloader: inner.downloader.clone(),
                reserved_size: inner.reserved_size,
                reservation_failed: inner.reservation_failed,
                write_failed: inner.write_failed,
                detached: true,
                remote_reader: None,
                deferred: None,
                deferred_finalized: false,
            }),
            cond: Condvar::new(),
            download: Mutex::new(DownloadProgress {
                downloaded_size: downloaded,
                writer: None,
            }),
            is_downloaded: AtomicBool::new(self.is_downloaded.load(Ordering::Relaxed)),
            hits_count: AtomicU64::new(self.hits_count.load(Ordering::Relaxed)),
            ref_count: AtomicU64::new(self.ref_count.load(Ordering::SeqCst)),
        })
    }

    /// Takes the cached remote reader, if a previous downloader left one
    /// positioned at the download offset.
    pub fn take_remote_reader(&self) -> Option<Box<dyn RemoteReader>> {
        self.inner.lock().remote_reader.take()
    }

    pub fn set_remote_reader(&self, reader: Box<dyn RemoteReader>) {
        self.inner.lock().remote_reader = Some(reader);
    }

    pub fn reset_remote_reader(&self) {
        self.inner.lock().remote_reader = None;
    }

    /// Validates the cross-field invariants. Called by the cache when
    /// handing out segments and by tests after every operation.
    pub fn assert_correctness(&self) {
        let inner = self.inner.lock();
        let downloaded = self.downloaded_size();
        assert!(
            inner.reserved_size >= downloaded,
            "reserved {} < downloaded {}",
            inner.reserved_size,
            downloaded
        );
        assert!(
            downloaded <= self.range.size(),
            "downloaded {} exceeds range {}",
            downloaded,
            self.range
        );
        assert_eq!(
            inner.state == SegmentState::Downloading,
            inner.downloader.is_some(),
            "downloader id must be set exactly in DOWNLOADING"
        );
        if inner.state == SegmentState::Downloaded {
            assert_eq!(downloaded, self.range.size());
            assert!(self.is_downloaded.load(Ordering::Relaxed));
        }
        if self.is_downloaded.load(Ordering::Relaxed) {
            assert_eq!(inner.state, SegmentState::Downloaded);
        }
        if inner.state == SegmentState::SkipCache {
            assert_eq!(inner.reserved_size, 0);
        }
    }

    fn cache(&self) -> Result<Arc<BlobCache>, CacheError> {
        self.cache.upgrade().ok_or_else(|| {
            CacheError::Detached(format!(
                "key={}, range={}: cache was dropped",
                self.key, self.range
            ))
        })
    }

    fn check_not_detached(&self, inner: &SegmentInner) -> Result<(), CacheError> {
        if inner.detached {
            Err(CacheError::Detached(self.describe_locked(inner)))
        } else {
            Ok(())
        }
    }

    fn check_downloader(
        &self,
        inner: &SegmentInner,
        caller: &CallerId,
    ) -> Result<(), CacheError> {
        match &inner.downloader {
            Some(id) if id == caller => Ok(()),
            other => Err(CacheError::NotDownloader {
                caller: caller.clone(),
                downloader: other.clone().unwrap_or_else(CallerId::none),
            }),
        }
    }

    fn append_locked(&self, progress: &mut DownloadProgress, data: &[u8]) -> io::Result<()> {
        let writer = match progress.writer.as_mut() {
            Some(writer) => writer,
            None => progress.writer.insert(LocalWriter::open(&self.path)?),
        };
        writer.append(data)
    }

    fn finish_download_round(&self, inner: &mut SegmentInner) {
        if self.downloaded_size() == self.range.size() {
            self.set_downloaded(inner);
        } else {
            inner.state = SegmentState::PartiallyDownloaded;
            self.close_writer();
        }
        inner.downloader = None;
        self.cond.notify_all();
    }

    fn set_downloaded(&self, inner: &mut SegmentInner) {
        inner.state = SegmentState::Downloaded;
        self.is_downloaded.store(true, Ordering::Relaxed);
        self.close_writer();
    }

    fn set_download_failed(&self, inner: &mut SegmentInner) {
        inner.state = SegmentState::PartiallyDownloadedNoContinuation;
        inner.write_failed = true;
        inner.downloader = None;
        self.close_writer();
    }

    fn release_unused_reservation(&self, inner: &mut SegmentInner, shared: &mut CacheShared) {
        let downloaded = self.downloaded_size();
        let unused = inner.reserved_size.saturating_sub(downloaded);
        if unused > 0 {
            inner.reserved_size = downloaded;
            shared.release_reservation(unused);
        }
    }

    fn close_writer(&self) {
        let mut progress = self.download.lock();
        if let Some(mut writer) = progress.writer.take() {
            let _ = writer.flush();
        }
    }

    fn delete_backing_file(&self) -> Result<(), CacheError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(key = %self.key, range = %self.range, "deleted backing file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    fn describe_locked(&self, inner: &SegmentInner) -> String {
        format!(
            "key={}, range={}, state={}, downloader={}, downloaded={}/{}",
            self.key,
            self.range,
            inner.state,
            inner.downloader.clone().unwrap_or_else(CallerId::none),
            self.downloaded_size(),
            self.range.size()
        )
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.write_str(&self.describe_locked(&inner))
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({self})")
    }
}
