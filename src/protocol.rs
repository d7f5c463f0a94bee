//! Wire protocol
//!
//! Every WebSocket binary message carries exactly one [`PacketWrapper`].
//! Messages are bincode-encoded with fixed-width integers; there is no
//! fragmentation at this layer.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;

/// Remote pointer and keyboard input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputPacket {
    /// Mouse movement since the last packet
    pub dx: f32,
    pub dy: f32,
    pub mouse_down: bool,
    pub mouse_up: bool,
    pub scroll: f32,
    /// Key names as reported by the viewer (`"w"`, `"Shift"`, ...)
    pub keys_down: Vec<String>,
    pub keys_up: Vec<String>,
}

/// One pre-encoded video unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFramePacket {
    pub data: Vec<u8>,
    /// Capture time, Unix microseconds
    pub timestamp: i64,
}

/// Interleaved float audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFramePacket {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Capture time, Unix microseconds
    pub timestamp: i64,
}

/// Tagged wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PacketWrapper {
    Settings(Settings),
    Input(InputPacket),
    VideoFrame(VideoFramePacket),
    AudioFrame(AudioFramePacket),
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_PACKET_SIZE)
}

impl PacketWrapper {
    /// Serialize to a single binary message
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        codec()
            .serialize(self)
            .map_err(|e| NetworkError::Encode(e.to_string()))
    }

    /// Strict decode
    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        codec()
            .deserialize(bytes)
            .map_err(|e| NetworkError::InvalidPacket(e.to_string()))
    }

    /// Decode for the inbound path: malformed input becomes `None`
    pub fn decode_lenient(bytes: &[u8]) -> Option<Self> {
        match Self::decode(bytes) {
            Ok(packet) => Some(packet),
            Err(e) => {
                tracing::debug!("Ignoring malformed packet ({} bytes): {}", bytes.len(), e);
                None
            }
        }
    }

    /// Short name of the active case, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PacketWrapper::Settings(_) => "settings",
            PacketWrapper::Input(_) => "input",
            PacketWrapper::VideoFrame(_) => "video",
            PacketWrapper::AudioFrame(_) => "audio",
        }
    }
}

/// Capture timestamp for outgoing frames
pub fn capture_timestamp() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
