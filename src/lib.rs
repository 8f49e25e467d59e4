//! Zero-copy transport of media frames between threads.
//!
//! A capture or decode thread wraps each frame in a [`MemoryChunk`], stamps
//! its timestamp and hands it to a [`SafeQueue`]. A render, encode or transmit
//! thread takes it out, uses the buffer in place, and releases it. The buffer
//! itself is never copied, and never freed while someone still holds a
//! reference to it.
//!
//! ```
//! use framequeue::{ByteBuffer, DropPolicy, MemoryChunk, SafeQueue};
//!
//! let queue = SafeQueue::with_capacity("video", 2, DropPolicy::Block).unwrap();
//! let frame = MemoryChunk::new(ByteBuffer::zeroed(1024));
//! frame.set_timestamp(40);
//! assert!(queue.enqueue(frame));
//!
//! let frame = queue.dequeue().unwrap();
//! assert_eq!(frame.timestamp(), 40);
//! frame.release();
//! queue.close();
//! ```

pub mod buffer;
pub mod chunk;
pub mod error;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod leak_registry;
pub mod metadata;
pub mod packetizer;
pub mod queue;

/// Presentation timestamp in milliseconds. 0 means unset.
pub type Timestamp = i64;

pub use buffer::{ByteBuffer, ForeignBuffer, NativeBuffer, SampleBuffer};
pub use chunk::MemoryChunk;
pub use error::{Error, Result};
pub use leak_registry::{LeakRegistry, LiveChunk};
pub use metadata::FrameMetadata;
pub use packetizer::{AudioPacketizer, PacketizerConfig, PushReport, WavSource};
pub use queue::{DropPolicy, QueueConfig, QueueStats, SafeQueue};
