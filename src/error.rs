//! Error types for frame buffers and queues.

use thiserror::Error;

/// Result type alias for framequeue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by chunks, buffers and queue construction.
///
/// A closed queue or an elapsed `try_dequeue` timeout are not errors; they
/// surface as `false` / `None` from the queue operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A buffer or queue was constructed from unusable input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The chunk's native buffer was read after its last reference was released.
    #[error("use after free: chunk #{instance_id} was already released")]
    UseAfterFree { instance_id: u64 },

    /// The chunk's reference count would have dropped below zero.
    #[error("double release: chunk #{instance_id} has no references left")]
    DoubleRelease { instance_id: u64 },

    /// WAV decoding error
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that indicate a broken ownership protocol rather than bad input.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::UseAfterFree { .. } | Error::DoubleRelease { .. })
    }
}
