//! blobcache - a local disk cache for remote object stores
//!
//! This library caches byte ranges of remote files on local disk. Each
//! logical file is partitioned into fixed-range segments; concurrent readers
//! racing to populate a missing segment elect a single downloader, while the
//! others wait on the segment's condition variable and consume bytes as they
//! land, or fall back to direct remote reads when the cache is out of space.
//!
//! # Modules
//!
//! - [`cache`] - The cache core: segment index, space budget, holder handout
//! - [`segment`] - Per-segment state machine and download coordination
//! - [`holder`] - Scoped ownership of a set of segments
//! - [`fetch`] - Read-through access that populates the cache on the way
//! - [`io`] - Remote reader trait, local writer, chunk buffer pool
//! - [`budget`] - Global space budget
//! - [`range`] - File keys and byte ranges
//! - [`state`] - Segment lifecycle states
//! - [`downloader`] - Caller identities for downloader election
//! - [`config`] - Cache configuration
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```no_run
//! use blobcache::{BlobCache, CacheConfig, FileKey, SegmentState};
//!
//! # fn main() -> Result<(), blobcache::CacheError> {
//! let cache = BlobCache::new(CacheConfig::new("./cache"));
//! let key = FileKey::new(0x00c0_ffee);
//!
//! let holder = cache.get_or_set(key, 0, 100)?;
//! let segment = &holder.segments()[0];
//!
//! // Race for the downloader role; the winner reserves space and writes.
//! segment.get_or_set_downloader()?;
//! if segment.is_downloader() && segment.reserve(100)? {
//!     segment.write(&[0u8; 100], 0)?;
//!     segment.complete(SegmentState::Downloaded)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fetch;
pub mod holder;
pub mod io;
pub mod range;
pub mod segment;
pub mod state;

pub use budget::SpaceBudget;
pub use cache::BlobCache;
pub use config::CacheConfig;
pub use downloader::CallerId;
pub use error::CacheError;
pub use fetch::read_through;
pub use holder::SegmentHolder;
pub use io::{ChunkPool, LocalWriter, RemoteReader};
pub use range::{FileKey, Range};
pub use segment::Segment;
pub use state::SegmentState;
