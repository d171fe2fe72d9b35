//! Text codec for frames.
//!
//! Frames travel as one JSON document per transport message. The codec only
//! adds a size ceiling on top of `serde_json` so a misbehaving peer cannot make
//! the server buffer arbitrarily large documents.

use crate::error::{ProtocolError, Result};
use crate::messages::Frame;

/// Default maximum encoded frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encoder/decoder for JSON text frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Get the configured size limit.
    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame to its wire text.
    pub fn encode(&self, frame: &Frame) -> Result<String> {
        let text = serde_json::to_string(frame)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.check_size(text.len())?;
        Ok(text)
    }

    /// Decode a frame from wire text.
    pub fn decode(&self, text: &str) -> Result<Frame> {
        self.check_size(text.len())?;
        Ok(serde_json::from_str(text)?)
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
