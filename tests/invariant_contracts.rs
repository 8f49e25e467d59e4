//! Contract tests for the chunk and queue invariants.
//!
//! Each test drives the public API through a path that must check a given
//! invariant, then verifies the check was recorded.

use framequeue::invariant_ppt::{
    contract_test, ADD_REF_REQUIRES_LIVE, CHUNK_STARTS_REFERENCED, CLOSED_QUEUE_REJECTS,
    CLOSE_DRAINS_QUEUE, DROP_OLDEST_EVICTS_HEAD, QUEUE_CAPACITY_BOUND, REFCOUNT_NON_NEGATIVE,
    RELEASE_HOOK_ONCE,
};
use framequeue::{ByteBuffer, DropPolicy, LeakRegistry, MemoryChunk, SafeQueue};

fn chunk(registry: &LeakRegistry, timestamp: i64) -> MemoryChunk {
    let chunk = MemoryChunk::with_registry(ByteBuffer::zeroed(16), registry);
    chunk.set_timestamp(timestamp);
    chunk
}

#[test]
fn chunk_lifecycle_contracts() {
    let registry = LeakRegistry::new();
    let first = chunk(&registry, 1);
    let second = first.add_ref();
    second.release();
    first.release();

    contract_test(
        "chunk lifecycle",
        &[
            CHUNK_STARTS_REFERENCED,
            ADD_REF_REQUIRES_LIVE,
            REFCOUNT_NON_NEGATIVE,
            RELEASE_HOOK_ONCE,
        ],
    );
}

#[test]
fn blocking_queue_contracts() {
    let registry = LeakRegistry::new();
    let queue = SafeQueue::with_capacity("contracts", 2, DropPolicy::Block).unwrap();
    queue.enqueue(chunk(&registry, 1));
    queue.enqueue(chunk(&registry, 2));
    queue.close();
    assert!(!queue.enqueue(chunk(&registry, 3)));

    contract_test(
        "blocking queue",
        &[QUEUE_CAPACITY_BOUND, CLOSE_DRAINS_QUEUE, CLOSED_QUEUE_REJECTS],
    );
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn drop_oldest_contracts() {
    let registry = LeakRegistry::new();
    let queue = SafeQueue::with_capacity("lossy-contracts", 1, DropPolicy::DropOldest).unwrap();
    queue.enqueue(chunk(&registry, 1));
    queue.enqueue(chunk(&registry, 2));
    queue.close();
    assert!(!queue.enqueue(chunk(&registry, 3)));

    contract_test(
        "drop oldest queue",
        &[DROP_OLDEST_EVICTS_HEAD, QUEUE_CAPACITY_BOUND, CLOSED_QUEUE_REJECTS],
    );
    assert_eq!(registry.live_count(), 0);
}

#[test]
#[should_panic(expected = "use after free")]
fn add_ref_after_release_panics() {
    let registry = LeakRegistry::new();
    let frame = chunk(&registry, 1);
    frame.release();
    let _ = frame.add_ref();
}
