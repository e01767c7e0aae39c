use std::path::PathBuf;
use std::time::Duration;

/// Default cache capacity (10 GiB).
pub const DEFAULT_CAPACITY: u64 = 10 * 1024 * 1024 * 1024;

/// Default upper bound on the byte range covered by a single segment (4 MiB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// Default bound on a single `wait` park on a downloading segment.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cache-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one subdirectory per file key.
    pub base_dir: PathBuf,
    /// Global byte budget for cached data.
    pub capacity: u64,
    /// Maximum size of a single segment; larger requested ranges are split.
    pub max_segment_size: u64,
    /// Upper bound on one condition-variable park in `Segment::wait`.
    pub wait_timeout: Duration,
}

impl CacheConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            capacity: DEFAULT_CAPACITY,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_segment_size(mut self, max_segment_size: u64) -> Self {
        self.max_segment_size = max_segment_size;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }
}
