//! Buffer kinds that can back a [`MemoryChunk`](crate::chunk::MemoryChunk).
//!
//! A buffer kind owns the frame's memory and knows how to give it back. The
//! chunk only does the counting; the release hook ([`NativeBuffer::free`]) is
//! where the memory actually goes away.

use crate::error::{Error, Result};
use std::path::Path;
use std::ptr::NonNull;

/// A block of frame memory with a type-specific release hook.
///
/// Consumers on several threads may read one buffer at the same time.
pub trait NativeBuffer: Send + Sync + 'static {
    /// Short name of the buffer kind, for diagnostics.
    fn kind(&self) -> &'static str;

    /// The buffer contents as raw bytes.
    fn as_bytes(&self) -> &[u8];

    /// Byte length of the buffer.
    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Float sample view, for buffer kinds that hold audio samples.
    fn as_samples(&self) -> Option<&[f32]> {
        None
    }

    /// Release hook, run exactly once when the owning chunk's last reference goes.
    fn free(self: Box<Self>) {}
}

/// Owned byte buffer (encoded video, compressed pointclouds, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl NativeBuffer for ByteBuffer {
    fn kind(&self) -> &'static str {
        "ByteBuffer"
    }

    fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Interleaved `f32` audio samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Wrap interleaved samples. `channels` must be non-zero and divide the sample count.
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(Error::InvalidArgument(
                "sample buffer needs at least one channel".into(),
            ));
        }
        if samples.len() % channels as usize != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Mono buffer of silence.
    pub fn silence(frames: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0.0; frames],
            channels: 1,
            sample_rate,
        }
    }

    /// Read a whole WAV file, converting integer PCM to floats in [-1.0, 1.0).
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let samples = read_wav_samples(reader)?;
        Self::new(samples, spec.channels, spec.sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback duration in milliseconds, 0 if the sample rate is unknown.
    pub fn duration_ms(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frames() as i64 * 1000) / self.sample_rate as i64
    }
}

fn read_wav_samples<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Vec<f32>> {
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok(samples)
}

impl NativeBuffer for SampleBuffer {
    fn kind(&self) -> &'static str {
        "SampleBuffer"
    }

    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.samples)
    }

    fn as_samples(&self) -> Option<&[f32]> {
        Some(&self.samples)
    }
}

type Dealloc = Box<dyn FnOnce(NonNull<u8>, usize) + Send>;

/// Memory allocated outside Rust (a capture or codec library), freed through a
/// caller-supplied deallocator.
pub struct ForeignBuffer {
    ptr: NonNull<u8>,
    len: usize,
    dealloc: Option<Dealloc>,
}

// SAFETY: `from_raw` requires the memory to be usable from any thread until
// the deallocator runs; the buffer is only read through `&self`, and the
// deallocator is only touched from `Drop`.
unsafe impl Send for ForeignBuffer {}
unsafe impl Sync for ForeignBuffer {}

impl ForeignBuffer {
    /// Take ownership of `len` bytes at `ptr`.
    ///
    /// Fails with `InvalidArgument` if `ptr` is null.
    ///
    /// # Safety
    /// `ptr` must point to `len` readable bytes that stay valid and unmodified
    /// until `dealloc` is called, and may be read from any thread.
    pub unsafe fn from_raw<F>(ptr: *mut u8, len: usize, dealloc: F) -> Result<Self>
    where
        F: FnOnce(NonNull<u8>, usize) + Send + 'static,
    {
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::InvalidArgument("foreign buffer constructed with null pointer".into())
        })?;
        Ok(Self {
            ptr,
            len,
            dealloc: Some(Box::new(dealloc)),
        })
    }
}

impl NativeBuffer for ForeignBuffer {
    fn kind(&self) -> &'static str {
        "ForeignBuffer"
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the `from_raw` contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ForeignBuffer {
    fn drop(&mut self) {
        if let Some(dealloc) = self.dealloc.take() {
            dealloc(self.ptr, self.len);
        }
    }
}

impl std::fmt::Debug for ForeignBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn sample_buffer_validates_channels() {
        assert!(SampleBuffer::new(vec![0.0; 4], 0, 48000).is_err());
        assert!(SampleBuffer::new(vec![0.0; 5], 2, 48000).is_err());
        let buf = SampleBuffer::new(vec![0.0; 6], 2, 48000).unwrap();
        assert_eq!(buf.frames(), 3);
        assert_eq!(buf.len(), 6 * std::mem::size_of::<f32>());
    }

    #[test]
    fn sample_buffer_duration() {
        let buf = SampleBuffer::silence(480, 48000);
        assert_eq!(buf.duration_ms(), 10);
        assert_eq!(SampleBuffer::silence(480, 0).duration_ms(), 0);
    }

    #[test]
    fn foreign_buffer_rejects_null() {
        let result = unsafe { ForeignBuffer::from_raw(std::ptr::null_mut(), 16, |_, _| {}) };
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn foreign_buffer_runs_dealloc_once() {
        let freed = Arc::new(AtomicUsize::new(0));
        let raw = Box::into_raw(vec![1u8, 2, 3].into_boxed_slice()) as *mut u8;
        let counter = freed.clone();
        let buf = unsafe {
            ForeignBuffer::from_raw(raw, 3, move |ptr, len| {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)));
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
        .unwrap();
        assert_eq!(buf.as_bytes(), &[1, 2, 3]);
        Box::new(buf).free();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }
}
