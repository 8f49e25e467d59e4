//! Bounded, closeable queue of frames between a producer and a consumer thread.
//!
//! Enqueueing a chunk hands the caller's reference to the queue; dequeueing
//! hands it on to the consumer. Whatever the queue has to throw away (on
//! close, on drop, or when evicting under [`DropPolicy::DropOldest`]) it
//! releases itself, so a reference is never lost or released twice.
//!
//! Release hooks always run after the queue lock has been let go.

use crate::chunk::MemoryChunk;
use crate::error::{Error, Result};
use crate::invariant_ppt::{
    assert_invariant, CLOSED_QUEUE_REJECTS, CLOSE_DRAINS_QUEUE, DROP_OLDEST_EVICTS_HEAD,
    QUEUE_CAPACITY_BOUND,
};
use crate::Timestamp;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 2;

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Wait until the consumer makes room (backpressure).
    #[default]
    Block,
    /// Release the oldest queued frame to make room.
    DropOldest,
}

/// Queue construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Label used in log messages.
    pub name: String,
    /// Maximum number of queued frames. Must be non-zero.
    pub capacity: usize,
    pub drop_policy: DropPolicy,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn drop_policy(mut self, drop_policy: DropPolicy) -> Self {
        self.drop_policy = drop_policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidArgument(format!(
                "queue {} needs a capacity of at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "queue".to_string(),
            capacity: DEFAULT_CAPACITY,
            drop_policy: DropPolicy::Block,
        }
    }
}

/// Frame counters, for statistics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Frames accepted by `enqueue`.
    pub enqueued: u64,
    /// Frames handed to a consumer.
    pub dequeued: u64,
    /// Frames evicted under `DropOldest`.
    pub dropped: u64,
    /// Frames refused because the queue was closed.
    pub rejected: u64,
    /// Frames still queued when the queue was closed.
    pub discarded: u64,
}

struct Slot {
    // Captured at enqueue so the queue never touches chunk locks while holding its own.
    timestamp: Timestamp,
    chunk: MemoryChunk,
}

struct QueueState {
    items: VecDeque<Slot>,
    latest_enqueued: Timestamp,
    latest_dequeued: Timestamp,
    stats: QueueStats,
}

/// Bounded FIFO of [`MemoryChunk`]s, safe to share between threads.
pub struct SafeQueue {
    name: String,
    capacity: usize,
    drop_policy: DropPolicy,
    closed: AtomicBool,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl SafeQueue {
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(config.capacity),
                latest_enqueued: 0,
                latest_dequeued: 0,
                stats: QueueStats::default(),
            }),
            name: config.name,
            capacity: config.capacity,
            drop_policy: config.drop_policy,
            closed: AtomicBool::new(false),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    pub fn with_capacity(
        name: impl Into<String>,
        capacity: usize,
        drop_policy: DropPolicy,
    ) -> Result<Self> {
        Self::new(
            QueueConfig::new(name)
                .capacity(capacity)
                .drop_policy(drop_policy),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand `chunk` to the queue.
    ///
    /// Returns true if the chunk is in the queue when the call returns. On
    /// false the queue has already released the chunk; the caller has nothing
    /// left to do with it.
    ///
    /// Under [`DropPolicy::Block`] this waits for room, or until the queue is
    /// closed. Under [`DropPolicy::DropOldest`] it never waits: a full queue
    /// releases its oldest frame instead, and the call still returns true.
    pub fn enqueue(&self, chunk: MemoryChunk) -> bool {
        let timestamp = chunk.timestamp();
        if timestamp == 0 {
            tracing::debug!("{}: enqueue got {} with timestamp=0", self, chunk);
        }
        match self.drop_policy {
            DropPolicy::Block => self.enqueue_blocking(chunk, timestamp),
            DropPolicy::DropOldest => self.enqueue_with_drop(chunk, timestamp),
        }
    }

    fn enqueue_blocking(&self, chunk: MemoryChunk, timestamp: Timestamp) -> bool {
        let mut state = self.state.lock();
        while !self.is_closed() && state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if self.is_closed() {
            state.stats.rejected += 1;
            drop(state);
            self.reject(chunk);
            return false;
        }
        let queued = self.push_locked(&mut state, chunk, timestamp);
        drop(state);
        self.check_bound(queued);
        true
    }

    fn enqueue_with_drop(&self, chunk: MemoryChunk, timestamp: Timestamp) -> bool {
        let mut state = self.state.lock();
        if self.is_closed() {
            state.stats.rejected += 1;
            drop(state);
            self.reject(chunk);
            return false;
        }
        let evicted = if state.items.len() >= self.capacity {
            state.stats.dropped += 1;
            state.items.pop_front()
        } else {
            None
        };
        let had_room = state.items.len() < self.capacity;
        let queued = self.push_locked(&mut state, chunk, timestamp);
        drop(state);

        assert_invariant(
            DROP_OLDEST_EVICTS_HEAD,
            had_room,
            "no room after evicting the oldest frame",
            Some(self.name.as_str()),
        );
        self.check_bound(queued);
        if let Some(old) = evicted {
            tracing::debug!("{}: queue full, dropping oldest frame {}", self, old.chunk);
            old.chunk.release();
        }
        true
    }

    // Returns the queue length after the push.
    fn push_locked(&self, state: &mut QueueState, chunk: MemoryChunk, timestamp: Timestamp) -> usize {
        state.latest_enqueued = timestamp;
        state.items.push_back(Slot { timestamp, chunk });
        state.stats.enqueued += 1;
        self.not_empty.notify_one();
        state.items.len()
    }

    // Called after the queue lock is let go.
    fn check_bound(&self, queued: usize) {
        assert_invariant(
            QUEUE_CAPACITY_BOUND,
            queued <= self.capacity,
            "queue holds more frames than its capacity",
            Some(self.name.as_str()),
        );
    }

    fn reject(&self, chunk: MemoryChunk) {
        tracing::warn!("{}: enqueue on closed queue, releasing {}", self, chunk);
        assert_invariant(
            CLOSED_QUEUE_REJECTS,
            self.is_closed(),
            "frame rejected by an open queue",
            Some(self.name.as_str()),
        );
        chunk.release();
    }

    /// Take the next frame, waiting as long as it takes.
    ///
    /// The caller owns the returned reference. Returns `None` once the queue
    /// is closed.
    pub fn dequeue(&self) -> Option<MemoryChunk> {
        let mut state = self.state.lock();
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(chunk) = self.pop_locked(&mut state) {
                return Some(chunk);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Take the next frame, waiting at most `timeout` (zero polls).
    ///
    /// Returns `None` on timeout or once the queue is closed.
    pub fn try_dequeue(&self, timeout: Duration) -> Option<MemoryChunk> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.dequeue();
        };
        let mut state = self.state.lock();
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(chunk) = self.pop_locked(&mut state) {
                return Some(chunk);
            }
            if Instant::now() >= deadline {
                return None;
            }
            self.not_empty.wait_until(&mut state, deadline);
        }
    }

    fn pop_locked(&self, state: &mut QueueState) -> Option<MemoryChunk> {
        let slot = state.items.pop_front()?;
        state.latest_dequeued = slot.timestamp;
        state.stats.dequeued += 1;
        self.not_full.notify_one();
        Some(slot.chunk)
    }

    /// Close the queue: wake every waiter and release whatever is still queued.
    ///
    /// Closing twice only logs a warning.
    pub fn close(&self) {
        if !self.shut_down() {
            tracing::warn!("{}: close() on closed queue", self);
        }
    }

    // Returns false if the queue was already closed.
    fn shut_down(&self) -> bool {
        let drained: Vec<MemoryChunk> = {
            let mut state = self.state.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            tracing::debug!("{}: closing with {} queued frames", self, state.items.len());
            state.stats.discarded += state.items.len() as u64;
            let drained = state.items.drain(..).map(|slot| slot.chunk).collect();
            drained
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();

        for chunk in drained {
            chunk.release();
        }
        let emptied = self.state.lock().items.is_empty();
        assert_invariant(
            CLOSE_DRAINS_QUEUE,
            emptied,
            "closed queue still holds frames",
            Some(self.name.as_str()),
        );
        true
    }

    /// True if an enqueue would probably not wait. Racy with other producers.
    pub fn can_enqueue(&self) -> bool {
        !self.is_closed() && self.state.lock().items.len() < self.capacity
    }

    /// True if a dequeue would probably not wait. Racy with other consumers.
    pub fn can_dequeue(&self) -> bool {
        self.count() > 0
    }

    /// Number of queued frames; 0 once closed.
    pub fn count(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.state.lock().items.len()
    }

    /// The frame the next dequeue will probably return.
    ///
    /// The queue keeps its reference: do not release the returned handle.
    pub fn peek(&self) -> Option<MemoryChunk> {
        self.state.lock().items.front().map(|slot| slot.chunk.alias())
    }

    /// Timestamp of the head frame, `default_if_unset` if the head has no
    /// timestamp, or 0 if the queue is empty.
    pub fn peek_timestamp(&self, default_if_unset: Timestamp) -> Timestamp {
        match self.state.lock().items.front() {
            Some(slot) if slot.timestamp == 0 => default_if_unset,
            Some(slot) => slot.timestamp,
            None => 0,
        }
    }

    /// Timestamp of the most recently enqueued frame.
    pub fn latest_timestamp(&self) -> Timestamp {
        self.state.lock().latest_enqueued
    }

    /// Span between the latest enqueued and latest dequeued timestamps.
    ///
    /// Zero until both are known, and whenever the dequeued side is ahead.
    pub fn queued_duration(&self) -> Duration {
        let state = self.state.lock();
        let (enqueued, dequeued) = (state.latest_enqueued, state.latest_dequeued);
        if enqueued == 0 || dequeued == 0 || dequeued > enqueued {
            return Duration::ZERO;
        }
        Duration::from_millis(enqueued.abs_diff(dequeued))
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }
}

impl Drop for SafeQueue {
    fn drop(&mut self) {
        if !self.is_closed() {
            let queued = self.state.get_mut().items.len();
            tracing::warn!(
                "{}: not closed before drop, releasing {} queued frames",
                self,
                queued
            );
            self.shut_down();
        }
    }
}

impl std::fmt::Display for SafeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SafeQueue#{}", self.name)
    }
}

impl std::fmt::Debug for SafeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("drop_policy", &self.drop_policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}
