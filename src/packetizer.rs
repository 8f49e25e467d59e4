//! Producer side: cut a continuous sample stream into timestamped frames.
//!
//! Capture code delivers audio in whatever block sizes the device likes. The
//! consumer side wants fixed-size packets, each with a presentation timestamp.
//! [`AudioPacketizer`] buffers samples until a packet is full, wraps it in a
//! [`SampleBuffer`] chunk and enqueues it. [`WavSource`] does the same for a
//! whole WAV file.

use crate::buffer::SampleBuffer;
use crate::chunk::MemoryChunk;
use crate::error::{Error, Result};
use crate::leak_registry::LeakRegistry;
use crate::queue::SafeQueue;
use crate::Timestamp;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Packetizer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketizerConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Packets per second.
    pub fps: u32,
    /// Packet size is rounded up to a multiple of this (0 = no rounding).
    pub min_buffer_size: usize,
    /// Timestamp of the first packet in ms; 0 means "now".
    pub start_timestamp: Timestamp,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            fps: 50,
            min_buffer_size: 0,
            start_timestamp: 0,
        }
    }
}

/// Sample frames per packet for the given rate and packet frequency.
pub fn samples_per_packet(sample_rate: u32, fps: u32, min_buffer_size: usize) -> Result<usize> {
    if sample_rate == 0 || fps == 0 {
        return Err(Error::InvalidArgument(format!(
            "cannot packetize {} Hz audio at {} packets per second",
            sample_rate, fps
        )));
    }
    let mut per_packet = (sample_rate / fps) as usize;
    if per_packet == 0 {
        return Err(Error::InvalidArgument(format!(
            "{} packets per second exceeds sample rate {}",
            fps, sample_rate
        )));
    }
    if min_buffer_size > 0 && per_packet % min_buffer_size != 0 {
        per_packet = per_packet.div_ceil(min_buffer_size) * min_buffer_size;
        tracing::warn!(
            "packetizer: adapted packet size to {} samples, fps={:.2}",
            per_packet,
            sample_rate as f32 / per_packet as f32
        );
    }
    if sample_rate as usize % per_packet != 0 {
        tracing::warn!(
            "packetizer: {} samples per packet gives a non-integral number of packets per second",
            per_packet
        );
    }
    Ok(per_packet)
}

/// What happened to the packets produced by one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Packets the queue accepted.
    pub delivered: usize,
    /// Packets the queue refused (it was closed).
    pub dropped: usize,
}

impl AddAssign for PushReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

/// Accumulates interleaved samples and emits fixed-size timestamped chunks.
#[derive(Debug)]
pub struct AudioPacketizer {
    config: PacketizerConfig,
    packet_frames: usize,
    start_timestamp: Timestamp,
    frames_emitted: u64,
    pending: Vec<f32>,
    registry: LeakRegistry,
    filename: Option<String>,
}

impl AudioPacketizer {
    pub fn new(config: PacketizerConfig) -> Result<Self> {
        if config.channels == 0 {
            return Err(Error::InvalidArgument(
                "packetizer needs at least one channel".into(),
            ));
        }
        let packet_frames =
            samples_per_packet(config.sample_rate, config.fps, config.min_buffer_size)?;
        let start_timestamp = if config.start_timestamp == 0 {
            wall_clock_ms()
        } else {
            config.start_timestamp
        };
        Ok(Self {
            pending: Vec::with_capacity(packet_frames * config.channels as usize),
            config,
            packet_frames,
            start_timestamp,
            frames_emitted: 0,
            registry: LeakRegistry::global(),
            filename: None,
        })
    }

    /// Track emitted chunks in `registry` instead of the global one.
    pub fn with_registry(mut self, registry: &LeakRegistry) -> Self {
        self.registry = registry.clone();
        self
    }

    /// Stamp every emitted chunk with the file it came from.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Sample frames (per channel) in one packet.
    pub fn packet_frames(&self) -> usize {
        self.packet_frames
    }

    /// Sample frames buffered but not yet emitted.
    pub fn pending_frames(&self) -> usize {
        self.pending.len() / self.config.channels as usize
    }

    /// Timestamp the next packet will carry.
    pub fn next_timestamp(&self) -> Timestamp {
        self.start_timestamp
            + (self.frames_emitted as i64 * 1000) / self.config.sample_rate as i64
    }

    /// Buffer `samples` (interleaved) and enqueue every packet that fills up.
    pub fn push_samples(&mut self, samples: &[f32], queue: &SafeQueue) -> Result<PushReport> {
        let packet_len = self.packet_len();
        let mut report = PushReport::default();
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= packet_len {
            let packet: Vec<f32> = self.pending.drain(..packet_len).collect();
            self.emit(packet, queue, &mut report)?;
        }
        Ok(report)
    }

    /// Emit buffered samples as a final, zero-padded packet.
    pub fn flush(&mut self, queue: &SafeQueue) -> Result<PushReport> {
        let mut report = PushReport::default();
        if self.pending.is_empty() {
            return Ok(report);
        }
        let mut packet = std::mem::take(&mut self.pending);
        packet.resize(self.packet_len(), 0.0);
        self.emit(packet, queue, &mut report)?;
        Ok(report)
    }

    fn packet_len(&self) -> usize {
        self.packet_frames * self.config.channels as usize
    }

    fn emit(&mut self, packet: Vec<f32>, queue: &SafeQueue, report: &mut PushReport) -> Result<()> {
        let timestamp = self.next_timestamp();
        let buffer = SampleBuffer::new(packet, self.config.channels, self.config.sample_rate)?;
        let chunk = MemoryChunk::with_registry(buffer, &self.registry);
        chunk.update_metadata(|meta| {
            meta.timestamp = timestamp;
            meta.filename = self.filename.clone();
        });
        self.frames_emitted += self.packet_frames as u64;
        if queue.enqueue(chunk) {
            report.delivered += 1;
        } else {
            report.dropped += 1;
        }
        Ok(())
    }
}

fn wall_clock_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// A WAV file played into a queue as fixed-size packets.
#[derive(Debug)]
pub struct WavSource {
    path: PathBuf,
    audio: SampleBuffer,
    registry: LeakRegistry,
}

impl WavSource {
    /// Decode `path` completely.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let audio = SampleBuffer::from_wav(&path)?;
        tracing::debug!(
            "WavSource: {} has {} frames, {} channels at {} Hz",
            path.display(),
            audio.frames(),
            audio.channels(),
            audio.sample_rate()
        );
        Ok(Self {
            path,
            audio,
            registry: LeakRegistry::global(),
        })
    }

    pub fn with_registry(mut self, registry: &LeakRegistry) -> Self {
        self.registry = registry.clone();
        self
    }

    pub fn audio(&self) -> &SampleBuffer {
        &self.audio
    }

    /// Packetize the whole file into `queue`, `fps` packets per second of audio.
    ///
    /// Stops early once the queue is closed. With a blocking queue, run the
    /// consumer on another thread.
    pub fn pump(&self, queue: &SafeQueue, fps: u32, start_timestamp: Timestamp) -> Result<PushReport> {
        let config = PacketizerConfig {
            sample_rate: self.audio.sample_rate(),
            channels: self.audio.channels(),
            fps,
            min_buffer_size: 0,
            start_timestamp,
        };
        let mut packetizer = AudioPacketizer::new(config)?
            .with_registry(&self.registry)
            .with_filename(self.path.to_string_lossy());
        let block = packetizer.packet_frames() * self.audio.channels() as usize;

        let mut report = PushReport::default();
        for samples in self.audio.samples().chunks(block) {
            report += packetizer.push_samples(samples, queue)?;
            if queue.is_closed() {
                tracing::debug!("WavSource: {} stopped, queue closed", self.path.display());
                return Ok(report);
            }
        }
        report += packetizer.flush(queue)?;
        Ok(report)
    }
}
