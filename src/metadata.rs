//! Per-frame metadata carried alongside a chunk's buffer.

use crate::error::{Error, Result};
use crate::Timestamp;

/// Maximum size of the side-channel descriptor.
pub const DSI_CAPACITY: usize = 256;

/// Metadata stamped on a frame by its producer.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Presentation timestamp in milliseconds. 0 means unset.
    pub timestamp: Timestamp,
    dsi: [u8; DSI_CAPACITY],
    dsi_size: usize,
    /// File the frame was read from, if any.
    pub filename: Option<String>,
}

impl FrameMetadata {
    /// Metadata with no timestamp, empty descriptor and no filename.
    pub fn new() -> Self {
        Self {
            timestamp: 0,
            dsi: [0; DSI_CAPACITY],
            dsi_size: 0,
            filename: None,
        }
    }

    /// Metadata carrying only a timestamp.
    pub fn with_timestamp(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..Self::new()
        }
    }

    /// The side-channel descriptor bytes.
    pub fn dsi(&self) -> &[u8] {
        &self.dsi[..self.dsi_size]
    }

    /// Replace the side-channel descriptor.
    ///
    /// Fails with `InvalidArgument` if `bytes` exceeds [`DSI_CAPACITY`]; the
    /// previous descriptor is kept in that case.
    pub fn set_dsi(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > DSI_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "side-channel descriptor of {} bytes exceeds {} byte limit",
                bytes.len(),
                DSI_CAPACITY
            )));
        }
        self.dsi[..bytes.len()].copy_from_slice(bytes);
        self.dsi[bytes.len()..].fill(0);
        self.dsi_size = bytes.len();
        Ok(())
    }

    /// True if a non-zero timestamp has been set.
    pub fn has_timestamp(&self) -> bool {
        self.timestamp != 0
    }
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameMetadata")
            .field("timestamp", &self.timestamp)
            .field("dsi_size", &self.dsi_size)
            .field("filename", &self.filename)
            .finish()
    }
}
