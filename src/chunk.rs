//! Explicitly refcounted frame buffers.
//!
//! A [`MemoryChunk`] is a handle to one frame: a [`NativeBuffer`] plus its
//! [`FrameMetadata`]. The chunk's reference count is managed by hand, the way
//! producers, queues and consumers hand frames to each other:
//!
//! - construction gives the creator one reference,
//! - [`MemoryChunk::add_ref`] creates another reference and returns a handle for it,
//! - [`MemoryChunk::release`] gives one reference back; the last one runs the
//!   buffer's release hook.
//!
//! Handles are cheap to move between threads. Dropping a handle does not
//! release its reference; only `release` does.

use crate::buffer::{ForeignBuffer, NativeBuffer};
use crate::error::{Error, Result};
use crate::invariant_ppt::{
    assert_invariant, ADD_REF_REQUIRES_LIVE, CHUNK_STARTS_REFERENCED, REFCOUNT_NON_NEGATIVE,
    RELEASE_HOOK_ONCE,
};
use crate::leak_registry::{LeakRegistry, LiveChunk};
use crate::metadata::FrameMetadata;
use crate::Timestamp;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

struct RefState {
    ref_count: usize,
    // Buffer accesses in flight. The buffer stays in place while non-zero;
    // the last one out frees it if the count already reached zero.
    pins: usize,
    buffer: Option<Box<dyn NativeBuffer>>,
}

struct ChunkShared {
    instance_id: u64,
    kind: &'static str,
    length: usize,
    state: Mutex<RefState>,
    metadata: Mutex<FrameMetadata>,
    registry: LeakRegistry,
}

impl ChunkShared {
    /// Drop one reference. Hands back the buffer when this was the last one.
    fn decrement(&self) -> Result<(usize, Option<Box<dyn NativeBuffer>>)> {
        let mut state = self.state.lock();
        if state.ref_count == 0 {
            return Err(Error::DoubleRelease {
                instance_id: self.instance_id,
            });
        }
        state.ref_count -= 1;
        if state.ref_count > 0 || state.pins > 0 {
            return Ok((state.ref_count, None));
        }
        Ok((0, state.buffer.take()))
    }

    fn pin(&self) -> Result<NonNull<dyn NativeBuffer>> {
        let mut state = self.state.lock();
        let buffer = match &state.buffer {
            Some(buffer) if state.ref_count > 0 => NonNull::from(&**buffer),
            _ => {
                return Err(Error::UseAfterFree {
                    instance_id: self.instance_id,
                })
            }
        };
        state.pins += 1;
        Ok(buffer)
    }

    /// Hands back the buffer when the last reference went while it was pinned.
    fn unpin(&self) -> Option<Box<dyn NativeBuffer>> {
        let mut state = self.state.lock();
        state.pins -= 1;
        if state.pins == 0 && state.ref_count == 0 {
            state.buffer.take()
        } else {
            None
        }
    }

    fn increment(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.ref_count == 0 {
            return Err(Error::UseAfterFree {
                instance_id: self.instance_id,
            });
        }
        state.ref_count += 1;
        Ok(state.ref_count)
    }

    // Runs with no chunk lock held; the registry takes its own.
    fn free_buffer(&self, buffer: Box<dyn NativeBuffer>) {
        tracing::trace!("{}#{}: releasing {} bytes", self.kind, self.instance_id, self.length);
        buffer.free();
        let deregistered = self.registry.delete_reference(self.instance_id);
        assert_invariant(
            RELEASE_HOOK_ONCE,
            deregistered || !self.registry.is_enabled(),
            "chunk released but was not registered as live",
            Some(self.kind),
        );
    }
}

impl Drop for ChunkShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(buffer) = state.buffer.take() {
            tracing::warn!(
                "{}#{}: last handle dropped with {} unreleased references, releasing buffer",
                self.kind,
                self.instance_id,
                state.ref_count
            );
            state.ref_count = 0;
            self.free_buffer(buffer);
        }
    }
}

/// Handle to a refcounted frame buffer.
pub struct MemoryChunk {
    shared: Arc<ChunkShared>,
}

impl MemoryChunk {
    /// Wrap `buffer` in a chunk tracked by the global [`LeakRegistry`].
    pub fn new<B: NativeBuffer>(buffer: B) -> Self {
        Self::with_registry(buffer, &LeakRegistry::global())
    }

    /// Wrap `buffer` in a chunk tracked by `registry`.
    pub fn with_registry<B: NativeBuffer>(buffer: B, registry: &LeakRegistry) -> Self {
        Self::from_boxed(Box::new(buffer), registry)
    }

    /// Wrap an already boxed buffer.
    pub fn from_boxed(buffer: Box<dyn NativeBuffer>, registry: &LeakRegistry) -> Self {
        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let kind = buffer.kind();
        let length = buffer.len();
        registry.add_reference(LiveChunk {
            instance_id,
            kind,
            length,
        });
        let chunk = Self {
            shared: Arc::new(ChunkShared {
                instance_id,
                kind,
                length,
                state: Mutex::new(RefState {
                    ref_count: 1,
                    pins: 0,
                    buffer: Some(buffer),
                }),
                metadata: Mutex::new(FrameMetadata::new()),
                registry: registry.clone(),
            }),
        };
        let referenced = chunk.ref_count() == 1;
        assert_invariant(
            CHUNK_STARTS_REFERENCED,
            referenced,
            "new chunk must hold exactly one reference",
            Some(kind),
        );
        chunk
    }

    /// Take ownership of `len` bytes of foreign memory, freed by `dealloc`.
    ///
    /// Fails with `InvalidArgument` if `ptr` is null.
    ///
    /// # Safety
    /// Same contract as [`ForeignBuffer::from_raw`].
    pub unsafe fn from_raw<F>(ptr: *mut u8, len: usize, dealloc: F) -> Result<Self>
    where
        F: FnOnce(NonNull<u8>, usize) + Send + 'static,
    {
        ForeignBuffer::from_raw(ptr, len, dealloc).map(Self::new)
    }

    /// Diagnostic id, unique per process.
    pub fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    pub fn kind(&self) -> &'static str {
        self.shared.kind
    }

    /// Byte size of the underlying buffer.
    pub fn length(&self) -> usize {
        self.shared.length
    }

    pub fn ref_count(&self) -> usize {
        self.shared.state.lock().ref_count
    }

    pub fn is_released(&self) -> bool {
        self.ref_count() == 0
    }

    /// True if both handles refer to the same chunk.
    pub fn same_chunk(&self, other: &MemoryChunk) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Take an additional reference and return a handle that owns it.
    ///
    /// # Panics
    /// If the chunk was already released.
    pub fn add_ref(&self) -> MemoryChunk {
        enforce(ADD_REF_REQUIRES_LIVE, self.shared.increment());
        self.alias()
    }

    /// Give back one reference and return how many are left.
    ///
    /// When the count reaches zero the buffer's release hook runs on this
    /// thread and the chunk leaves its registry.
    ///
    /// # Panics
    /// If no references are left (double release).
    pub fn release(&self) -> usize {
        let (remaining, freed) = enforce(REFCOUNT_NON_NEGATIVE, self.shared.decrement());
        if let Some(buffer) = freed {
            self.shared.free_buffer(buffer);
        }
        remaining
    }

    /// Address of the buffer.
    ///
    /// The pointer is only valid while the caller's reference is held.
    pub fn pointer(&self) -> Result<NonNull<u8>> {
        self.with_buffer(|buffer| NonNull::from(buffer.as_bytes()).cast::<u8>())
    }

    /// Run `f` on the buffer bytes.
    ///
    /// No lock is held while `f` runs, so `f` may use this chunk freely, even
    /// release it. A release hook due during `f` runs once `f` returns.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.with_buffer(|buffer| f(buffer.as_bytes()))
    }

    /// Run `f` on the float samples, or return `None` for non-sample buffers.
    pub fn with_samples<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<Option<R>> {
        self.with_buffer(|buffer| buffer.as_samples().map(f))
    }

    fn with_buffer<R>(&self, f: impl FnOnce(&dyn NativeBuffer) -> R) -> Result<R> {
        let buffer = self.shared.pin().map_err(|err| {
            tracing::error!("{}: buffer accessed after release", self);
            err
        })?;
        let _pin = BufferPin {
            shared: &self.shared,
        };
        // SAFETY: the buffer is not taken out of its box while pinned, and
        // `NativeBuffer: Sync` allows shared access from several threads.
        Ok(f(unsafe { buffer.as_ref() }))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.shared.metadata.lock().timestamp
    }

    pub fn set_timestamp(&self, timestamp: Timestamp) {
        self.shared.metadata.lock().timestamp = timestamp;
    }

    /// Snapshot of the frame metadata.
    pub fn metadata(&self) -> FrameMetadata {
        self.shared.metadata.lock().clone()
    }

    /// Mutate the metadata in place.
    ///
    /// `f` runs under the metadata lock: it must not call this chunk's other
    /// metadata accessors.
    pub fn update_metadata<R>(&self, f: impl FnOnce(&mut FrameMetadata) -> R) -> R {
        f(&mut *self.shared.metadata.lock())
    }

    pub fn set_dsi(&self, bytes: &[u8]) -> Result<()> {
        self.shared.metadata.lock().set_dsi(bytes)
    }

    pub fn set_filename(&self, filename: impl Into<String>) {
        self.shared.metadata.lock().filename = Some(filename.into());
    }

    /// Another handle to the same chunk, without taking a reference.
    pub(crate) fn alias(&self) -> MemoryChunk {
        MemoryChunk {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct BufferPin<'a> {
    shared: &'a ChunkShared,
}

impl Drop for BufferPin<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.shared.unpin() {
            self.shared.free_buffer(buffer);
        }
    }
}

/// Record invariant `id`, or panic with the ownership error that broke it.
fn enforce<T>(id: u32, outcome: Result<T>) -> T {
    match outcome {
        Ok(value) => {
            assert_invariant(id, true, "", None);
            value
        }
        Err(err) => {
            assert_invariant(id, false, &err.to_string(), None);
            unreachable!("assert_invariant panics on failure")
        }
    }
}

impl std::fmt::Display for MemoryChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.shared.kind, self.shared.instance_id)
    }
}

impl std::fmt::Debug for MemoryChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChunk")
            .field("instance_id", &self.shared.instance_id)
            .field("kind", &self.shared.kind)
            .field("length", &self.shared.length)
            .field("ref_count", &self.ref_count())
            .field("timestamp", &self.timestamp())
            .finish()
    }
}
