use std::fmt;

/// Lifecycle state of a cached file segment.
///
/// A segment starts `Empty` (or `Downloaded` when recovered from disk) and
/// moves through `Downloading` under a single downloader at a time. The
/// detached flag is orthogonal to this state and sticky once set.
///
/// - `Empty`: created and handed out, no bytes cached yet.
/// - `Downloading`: exactly one caller holds the downloader role and is
///   allowed to reserve space and append bytes.
/// - `Downloaded`: the full range is on disk. Terminal.
/// - `PartiallyDownloaded`: a downloader abandoned the segment with a byte
///   prefix cached; another caller may resume from that offset.
/// - `PartiallyDownloadedNoContinuation`: the download stopped because the
///   cache denied further space (or a write failed); the cached prefix stays
///   readable but nobody may resume. Terminal.
/// - `SkipCache`: the very first space reservation failed, the segment is
///   out of cache scope and owns no bytes. Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Empty,
    Downloading,
    Downloaded,
    PartiallyDownloaded,
    PartiallyDownloadedNoContinuation,
    SkipCache,
}

impl SegmentState {
    /// Terminal states are final for this segment's identity; the cache may
    /// only evict and replace the segment with a fresh one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SegmentState::Downloaded
                | SegmentState::PartiallyDownloadedNoContinuation
                | SegmentState::SkipCache
        )
    }

    /// States from which a caller may take over the downloader role.
    pub fn can_acquire_downloader(self) -> bool {
        matches!(
            self,
            SegmentState::Empty | SegmentState::PartiallyDownloaded
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SegmentState::Empty => "EMPTY",
            SegmentState::Downloading => "DOWNLOADING",
            SegmentState::Downloaded => "DOWNLOADED",
            SegmentState::PartiallyDownloaded => "PARTIALLY_DOWNLOADED",
            SegmentState::PartiallyDownloadedNoContinuation => {
                "PARTIALLY_DOWNLOADED_NO_CONTINUATION"
            }
            SegmentState::SkipCache => "SKIP_CACHE",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SegmentState::Downloaded.is_terminal());
        assert!(SegmentState::PartiallyDownloadedNoContinuation.is_terminal());
        assert!(SegmentState::SkipCache.is_terminal());
        assert!(!SegmentState::Empty.is_terminal());
        assert!(!SegmentState::Downloading.is_terminal());
        assert!(!SegmentState::PartiallyDownloaded.is_terminal());
    }

    #[test]
    fn test_downloader_acquisition_states() {
        assert!(SegmentState::Empty.can_acquire_downloader());
        assert!(SegmentState::PartiallyDownloaded.can_acquire_downloader());
        assert!(!SegmentState::Downloading.can_acquire_downloader());
        assert!(!SegmentState::Downloaded.can_acquire_downloader());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SegmentState::Empty.to_string(), "EMPTY");
        assert_eq!(
            SegmentState::PartiallyDownloadedNoContinuation.to_string(),
            "PARTIALLY_DOWNLOADED_NO_CONTINUATION"
        );
    }
}
