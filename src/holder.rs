use std::fmt;
use std::sync::{Arc, Weak};

use crate::cache::BlobCache;
use crate::segment::Segment;

/// A scoped, move-only collection of segment handles covering a requested
/// byte range, in ascending `range.left` order.
///
/// Dropping the holder runs the implicit completion path for every segment
/// it still owns, under the cache lock, so abandoned downloads settle into a
/// resumable or terminal state. Completion errors during drop are logged and
/// swallowed; destruction never fails.
pub struct SegmentHolder {
    cache: Weak<BlobCache>,
    segments: Vec<Arc<Segment>>,
}

impl SegmentHolder {
    pub(crate) fn new(cache: Weak<BlobCache>, segments: Vec<Arc<Segment>>) -> Self {
        Self { cache, segments }
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Segment>> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for SegmentHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl Drop for SegmentHolder {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            let mut shared = cache.lock_shared();
            for segment in &self.segments {
                if let Err(e) = segment.complete_for_holder(&mut shared) {
                    tracing::warn!(segment = %segment, error = %e, "segment completion failed during holder drop");
                }
                segment.release_ref();
            }
        } else {
            for segment in &self.segments {
                segment.release_ref();
            }
        }
    }
}
