use framequeue::{ByteBuffer, DropPolicy, LeakRegistry, MemoryChunk, SafeQueue, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn frame(registry: &LeakRegistry, timestamp: Timestamp) -> MemoryChunk {
    let chunk = MemoryChunk::with_registry(ByteBuffer::zeroed(64), registry);
    chunk.set_timestamp(timestamp);
    chunk
}

#[test]
fn block_policy_backpressure() {
    init_tracing();
    let registry = LeakRegistry::new();
    let queue = Arc::new(SafeQueue::with_capacity("backpressure", 2, DropPolicy::Block).unwrap());

    assert!(queue.enqueue(frame(&registry, 100)));
    assert!(queue.enqueue(frame(&registry, 200)));
    assert!(!queue.can_enqueue());

    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let queue = queue.clone();
        let done = done.clone();
        let c = frame(&registry, 300);
        thread::spawn(move || {
            let ok = queue.enqueue(c);
            done.store(true, Ordering::SeqCst);
            ok
        })
    };

    // The third enqueue has to wait for the consumer.
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(queue.count(), 2);

    let a = queue.dequeue().unwrap();
    assert_eq!(a.timestamp(), 100);
    a.release();

    assert!(producer.join().unwrap());
    assert_eq!(queue.count(), 2);
    assert_eq!(queue.latest_timestamp(), 300);
    assert_eq!(queue.queued_duration(), Duration::from_millis(200));

    for expected in [200, 300] {
        let chunk = queue.dequeue().unwrap();
        assert_eq!(chunk.timestamp(), expected);
        chunk.release();
    }
    queue.close();
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn close_releases_unconsumed_frames() {
    init_tracing();
    let registry = LeakRegistry::new();
    let queue = SafeQueue::with_capacity("close", 2, DropPolicy::Block).unwrap();
    let a = frame(&registry, 1);
    let b = frame(&registry, 2);
    let (a_id, b_id) = (a.instance_id(), b.instance_id());
    queue.enqueue(a);
    queue.enqueue(b);
    assert_eq!(registry.live_count(), 2);

    queue.close();
    assert!(!registry.contains(a_id));
    assert!(!registry.contains(b_id));
    assert_eq!(registry.live_count(), 0);

    // Enqueue after close frees the frame and leaves the queue empty.
    assert!(!queue.enqueue(frame(&registry, 3)));
    assert_eq!(queue.count(), 0);
    assert_eq!(registry.live_count(), 0);

    let stats = queue.stats();
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.discarded, 2);
    assert_eq!(stats.rejected, 1);
}

#[test]
fn drop_oldest_keeps_newest() {
    init_tracing();
    let registry = LeakRegistry::new();
    let queue = SafeQueue::with_capacity("lossy", 1, DropPolicy::DropOldest).unwrap();
    let a = frame(&registry, 10);
    let a_id = a.instance_id();
    let b = frame(&registry, 20);
    let b_id = b.instance_id();

    assert!(queue.enqueue(a));
    assert!(queue.enqueue(b));
    assert!(!registry.contains(a_id));
    assert!(registry.contains(b_id));
    assert_eq!(queue.count(), 1);
    assert_eq!(queue.stats().dropped, 1);

    let head = queue.dequeue().unwrap();
    assert_eq!(head.instance_id(), b_id);
    assert_eq!(head.timestamp(), 20);
    head.release();
    queue.close();
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn close_wakes_blocked_consumer() {
    let queue = Arc::new(SafeQueue::with_capacity("idle", 2, DropPolicy::Block).unwrap());
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.dequeue().is_none())
    };
    thread::sleep(Duration::from_millis(20));
    queue.close();
    assert!(consumer.join().unwrap());
}

#[test]
fn close_wakes_blocked_producer() {
    let registry = LeakRegistry::new();
    let queue = Arc::new(SafeQueue::with_capacity("stalled", 1, DropPolicy::Block).unwrap());
    queue.enqueue(frame(&registry, 1));
    let producer = {
        let queue = queue.clone();
        let blocked = frame(&registry, 2);
        thread::spawn(move || queue.enqueue(blocked))
    };
    thread::sleep(Duration::from_millis(20));
    queue.close();
    assert!(!producer.join().unwrap());
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn try_dequeue_waits_for_late_frame() {
    let registry = LeakRegistry::new();
    let queue = Arc::new(SafeQueue::with_capacity("late", 2, DropPolicy::Block).unwrap());
    let producer = {
        let queue = queue.clone();
        let late = frame(&registry, 77);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            queue.enqueue(late)
        })
    };
    let chunk = queue.try_dequeue(Duration::from_secs(5)).unwrap();
    assert_eq!(chunk.timestamp(), 77);
    chunk.release();
    assert!(producer.join().unwrap());
    queue.close();
}

#[test]
fn shared_frame_outlives_queue() {
    let registry = LeakRegistry::new();
    let queue = SafeQueue::with_capacity("fanout", 2, DropPolicy::Block).unwrap();
    let chunk = frame(&registry, 5);
    let kept = chunk.add_ref();
    queue.enqueue(chunk);
    queue.close();

    // The queue released its reference; ours is still good.
    assert_eq!(kept.ref_count(), 1);
    assert!(kept.pointer().is_ok());
    assert_eq!(kept.release(), 0);
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn drop_oldest_under_concurrent_consumer() {
    init_tracing();
    let registry = LeakRegistry::new();
    let queue = Arc::new(SafeQueue::with_capacity("lossy-stress", 2, DropPolicy::DropOldest).unwrap());
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            let mut last = 0;
            let mut taken = 0u64;
            while let Some(chunk) = queue.dequeue() {
                assert!(chunk.timestamp() > last, "frames came out of order");
                last = chunk.timestamp();
                taken += 1;
                chunk.release();
            }
            taken
        })
    };

    for ts in 1..=2000 {
        assert!(queue.enqueue(frame(&registry, ts)));
    }
    queue.close();
    let taken = consumer.join().unwrap();

    let stats = queue.stats();
    assert_eq!(stats.enqueued, 2000);
    assert_eq!(stats.dequeued, taken);
    assert_eq!(stats.dequeued + stats.dropped + stats.discarded, 2000);
    assert_eq!(registry.live_count(), 0);
}
