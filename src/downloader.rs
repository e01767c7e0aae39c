use std::cell::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Sequence numbers make caller identities unique even when the OS reuses
/// thread ids across holder lifetimes.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CALLER: OnceCell<CallerId> = const { OnceCell::new() };
}

/// Stable identity of a caller competing for the downloader role.
///
/// The textual form is `threadId:sequenceNumber`, minted once per thread and
/// unchanged for as long as the thread lives, so a downloader's identity
/// stays valid across every segment it touches. The `"None"` sentinel stands
/// for "no downloader".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId(String);

impl CallerId {
    /// Returns the identity of the calling thread.
    pub fn current() -> Self {
        CURRENT_CALLER.with(|cell| {
            cell.get_or_init(|| {
                let tid = format!("{:?}", thread::current().id());
                let tid = tid
                    .trim_start_matches("ThreadId(")
                    .trim_end_matches(')');
                let seq = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
                CallerId(format!("{tid}:{seq}"))
            })
            .clone()
        })
    }

    /// The sentinel returned when a segment has no downloader.
    pub fn none() -> Self {
        CallerId("None".to_string())
    }

    pub fn is_none(&self) -> bool {
        self.0 == "None"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
