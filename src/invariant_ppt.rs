//! PPT Invariant System: runtime invariant enforcement with contract tracking.
//!
//! Chunk and queue code calls `assert_invariant` at the points where the
//! ownership protocol can break. A failed invariant panics; a passed one is
//! recorded so [`contract_test`] can later prove the check actually ran.
//!
//! Chunk and queue operations run per frame on many threads. Recording an
//! invariant that was already recorded is a single atomic load; the log
//! mutex is only taken the first time an id passes. Callers never assert
//! while holding a queue or chunk lock.
//!
//! Only contract checks are public; asserting stays inside the crate:
//!
//! ```compile_fail
//! framequeue::invariant_ppt::assert_invariant(1, true, "outside", None);
//! ```

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;
#[cfg(feature = "ppt")]
use std::sync::atomic::{AtomicU64, Ordering};

// Invariant constants for contract tracking.
pub const CHUNK_STARTS_REFERENCED: u32 = 1;
pub const REFCOUNT_NON_NEGATIVE: u32 = 2;
pub const RELEASE_HOOK_ONCE: u32 = 3;
pub const ADD_REF_REQUIRES_LIVE: u32 = 4;
pub const QUEUE_CAPACITY_BOUND: u32 = 5;
pub const CLOSED_QUEUE_REJECTS: u32 = 6;
pub const CLOSE_DRAINS_QUEUE: u32 = 7;
pub const DROP_OLDEST_EVICTS_HEAD: u32 = 8;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

// One bit per id below 64, set once the id is in INVARIANT_LOG.
#[cfg(feature = "ppt")]
static RECORDED: AtomicU64 = AtomicU64::new(0);

#[cfg(feature = "ppt")]
fn record(id: u32) {
    let Some(bit) = 1u64.checked_shl(id) else {
        INVARIANT_LOG.lock().insert(id);
        return;
    };
    if RECORDED.load(Ordering::Acquire) & bit != 0 {
        return;
    }
    INVARIANT_LOG.lock().insert(id);
    RECORDED.fetch_or(bit, Ordering::Release);
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = if let Some(ctx) = context {
            format!("Invariant {} failed: {} (context: {})", id, message, ctx)
        } else {
            format!("Invariant {} failed: {}", id, message)
        };
        tracing::error!("{}", full_message);
        panic!("{}", full_message);
    }
    record(id);
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub(crate) fn assert_invariant(_id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        match context {
            Some(ctx) => panic!("Invariant failed: {} (context: {})", message, ctx),
            None => panic!("Invariant failed: {}", message),
        }
    }
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let log = INVARIANT_LOG.lock();
    let missing: Vec<u32> = required_invariants
        .iter()
        .copied()
        .filter(|inv| !log.contains(inv))
        .collect();
    drop(log); // Drop the lock before panicking
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name,
            missing.iter().map(|&id| invariant_name(id)).collect::<Vec<_>>()
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    let mut log = INVARIANT_LOG.lock();
    log.clear();
    RECORDED.store(0, Ordering::Release);
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u32) -> &'static str {
    match id {
        CHUNK_STARTS_REFERENCED => "CHUNK_STARTS_REFERENCED",
        REFCOUNT_NON_NEGATIVE => "REFCOUNT_NON_NEGATIVE",
        RELEASE_HOOK_ONCE => "RELEASE_HOOK_ONCE",
        ADD_REF_REQUIRES_LIVE => "ADD_REF_REQUIRES_LIVE",
        QUEUE_CAPACITY_BOUND => "QUEUE_CAPACITY_BOUND",
        CLOSED_QUEUE_REJECTS => "CLOSED_QUEUE_REJECTS",
        CLOSE_DRAINS_QUEUE => "CLOSE_DRAINS_QUEUE",
        DROP_OLDEST_EVICTS_HEAD => "DROP_OLDEST_EVICTS_HEAD",
        _ => "UNKNOWN",
    }
}
