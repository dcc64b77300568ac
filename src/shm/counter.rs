/// The region-wide monotonic counter used to mint unique IDs across every
/// process sharing the region. Falls back to a process-local counter when
/// called before a region has been mapped, since some callers (e.g. the
/// CLI) want a unique tag even outside of a live session.
use std::sync::atomic::{AtomicU64, Ordering};

use super::region::Region;

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next(region: Option<&Region>) -> u64 {
    match region {
        Some(region) => region
            .globals()
            .monotonic_counter
            .0
            .fetch_add(1, Ordering::Relaxed),
        None => FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed),
    }
}
