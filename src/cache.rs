//! The cache core: a single mutex over the segment index and the space
//! budget, plus the narrow surface segments consume from it.
//!
//! `CacheShared` is the datum behind the cache-wide mutex; holding a
//! `&mut CacheShared` is the proof that the cache lock is held, and every
//! operation that the lock-order discipline places under the cache lock
//! takes one.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::budget::SpaceBudget;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::holder::SegmentHolder;
use crate::range::{FileKey, Range};
use crate::segment::Segment;
use crate::state::SegmentState;

/// Index and budget state guarded by the cache-wide mutex.
pub struct CacheShared {
    index: HashMap<FileKey, BTreeMap<u64, Arc<Segment>>>,
    budget: SpaceBudget,
}

impl CacheShared {
    pub(crate) fn release_reservation(&mut self, bytes: u64) {
        self.budget.release(bytes);
    }

    pub(crate) fn remove_segment(&mut self, key: &FileKey, offset: u64) -> Option<Arc<Segment>> {
        let segments = self.index.get_mut(key)?;
        let removed = segments.remove(&offset);
        if segments.is_empty() {
            self.index.remove(key);
        }
        removed
    }

    /// Hook invoked under both the cache and segment locks whenever a
    /// segment changes state, so the cache can relocate it between its
    /// internal structures.
    pub(crate) fn segment_state_changed(
        &mut self,
        key: &FileKey,
        offset: u64,
        old: SegmentState,
        new: SegmentState,
    ) {
        tracing::trace!(%key, offset, from = %old, to = %new, "segment state changed");
    }
}

/// A local disk cache fronting a remote object store.
///
/// The cache partitions each logical file into fixed-range byte segments
/// and coordinates concurrent readers racing to populate missing segments;
/// see [`Segment`] for the per-segment protocol.
pub struct BlobCache {
    config: CacheConfig,
    shared: Mutex<CacheShared>,
}

impl BlobCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let budget = SpaceBudget::new(config.capacity);
        Arc::new(Self {
            config,
            shared: Mutex::new(CacheShared {
                index: HashMap::new(),
                budget,
            }),
        })
    }

    /// Returns the segments covering `[offset, offset + size)` as a holder,
    /// in ascending range order.
    ///
    /// Indexed segments are reused (counting a hit); uncovered gaps are
    /// filled with fresh `EMPTY` segments of at most `max_segment_size`
    /// bytes each. The caller drives each segment through the downloader
    /// protocol; dropping the holder finalizes whatever was left unfinished.
    pub fn get_or_set(
        self: &Arc<Self>,
        key: FileKey,
        offset: u64,
        size: u64,
    ) -> Result<SegmentHolder, CacheError> {
        if size == 0 {
            return Err(CacheError::IllegalState(
                "cannot request a zero-byte range".to_string(),
            ));
        }
        let range = Range::new(offset, offset + size - 1);
        let mut shared = self.shared.lock();

        let existing: Vec<Arc<Segment>> = shared
            .index
            .get(&key)
            .map(|segments| {
                segments
                    .range(..=range.right())
                    .map(|(_, segment)| segment.clone())
                    .filter(|segment| segment.range().right() >= range.left())
                    .collect()
            })
            .unwrap_or_default();

        let mut out: Vec<Arc<Segment>> = Vec::new();
        let mut cursor = range.left();
        for segment in existing {
            let seg_range = segment.range();
            if seg_range.left() > cursor {
                self.fill_gap(&mut shared, &key, cursor, seg_range.left() - 1, &mut out);
            }
            segment.increment_hits();
            segment.assert_correctness();
            out.push(segment);
            cursor = seg_range.right() + 1;
            if cursor > range.right() {
                break;
            }
        }
        if cursor <= range.right() {
            self.fill_gap(&mut shared, &key, cursor, range.right(), &mut out);
        }

        for segment in &out {
            segment.acquire_ref();
        }
        Ok(SegmentHolder::new(Arc::downgrade(self), out))
    }

    fn fill_gap(
        self: &Arc<Self>,
        shared: &mut CacheShared,
        key: &FileKey,
        left: u64,
        right: u64,
        out: &mut Vec<Arc<Segment>>,
    ) {
        let mut start = left;
        while start <= right {
            let end = right.min(start + self.config.max_segment_size - 1);
            let segment = Segment::new(
                Arc::downgrade(self),
                *key,
                Range::new(start, end),
                SegmentState::Empty,
                self.segment_path(key, start),
                self.config.wait_timeout,
            );
            shared
                .index
                .entry(*key)
                .or_default()
                .insert(start, segment.clone());
            out.push(segment);
            start = end + 1;
        }
    }

    /// Re-populates the index from the on-disk layout: one directory per
    /// key, one file per offset, file length determining the downloaded
    /// size. Files restore as `DOWNLOADED` segments covering exactly the
    /// bytes present. Returns the number of segments restored.
    pub fn restore(self: &Arc<Self>) -> Result<usize, CacheError> {
        if !self.config.base_dir.exists() {
            return Ok(0);
        }
        let mut restored = 0;
        let mut shared = self.shared.lock();
        for entry in fs::read_dir(&self.config.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name();
            let key = match FileKey::from_hex(&dir_name.to_string_lossy()) {
                Some(key) => key,
                None => {
                    tracing::warn!(dir = %dir_name.to_string_lossy(), "skipping unrecognized cache directory");
                    continue;
                }
            };
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if !file.file_type()?.is_file() {
                    continue;
                }
                let file_name = file.file_name();
                let offset = match file_name.to_string_lossy().parse::<u64>() {
                    Ok(offset) => offset,
                    Err(_) => {
                        tracing::warn!(file = %file_name.to_string_lossy(), "skipping unrecognized cache file");
                        continue;
                    }
                };
                let len = file.metadata()?.len();
                if len == 0 {
                    continue;
                }
                let key_entry = shared.index.entry(key).or_default();
                if key_entry.contains_key(&offset) {
                    continue;
                }
                let segment = Segment::new(
                    Arc::downgrade(self),
                    key,
                    Range::new(offset, offset + len - 1),
                    SegmentState::Downloaded,
                    file.path(),
                    self.config.wait_timeout,
                );
                key_entry.insert(offset, segment);
                shared.budget.charge(len);
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::debug!(
                restored,
                used = shared.budget.used(),
                "cache index restored from disk"
            );
        }
        Ok(restored)
    }

    /// Detaches the segment at `(key, offset)` and removes it from the
    /// index, freeing its budget. The backing file disappears immediately if
    /// the segment is unreferenced, otherwise when its last holder drops.
    pub fn remove(&self, key: FileKey, offset: u64) -> bool {
        let mut shared = self.shared.lock();
        let segment = match shared.index.get(&key).and_then(|m| m.get(&offset)) {
            Some(segment) => segment.clone(),
            None => return false,
        };
        segment.detach(&mut shared);
        shared.remove_segment(&key, offset);
        true
    }

    /// Detached snapshot copies of every indexed segment, for diagnostics.
    pub fn snapshots(&self) -> Vec<Arc<Segment>> {
        let shared = self.shared.lock();
        let mut out = Vec::new();
        for segments in shared.index.values() {
            for segment in segments.values() {
                out.push(segment.snapshot(&shared));
            }
        }
        out
    }

    pub fn used_space(&self) -> u64 {
        self.shared.lock().budget.used()
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    pub fn segment_count(&self) -> usize {
        self.shared.lock().index.values().map(BTreeMap::len).sum()
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.config.base_dir
    }

    pub(crate) fn lock_shared(&self) -> MutexGuard<'_, CacheShared> {
        self.shared.lock()
    }

    /// Budget grant for one segment's incremental reservation; pass/fail
    /// only. Called with no segment lock held, per the lock order.
    pub(crate) fn reserve_for_segment(&self, key: &FileKey, offset: u64, extra: u64) -> bool {
        let mut shared = self.shared.lock();
        let granted = shared.budget.try_reserve(extra);
        if !granted {
            tracing::debug!(
                %key,
                offset,
                extra,
                used = shared.budget.used(),
                limit = shared.budget.limit(),
                "reservation denied"
            );
        }
        granted
    }

    pub(crate) fn release_reservation(&self, bytes: u64) {
        self.shared.lock().budget.release(bytes);
    }

    fn segment_path(&self, key: &FileKey, offset: u64) -> PathBuf {
        self.config
            .base_dir
            .join(key.to_string())
            .join(offset.to_string())
    }
}
