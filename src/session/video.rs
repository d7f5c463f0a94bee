//! Host-side collaborators: video encoder and head pose

use std::sync::Arc;

use crate::config::Settings;
use crate::network::ConnectionRegistry;
use crate::protocol::{capture_timestamp, PacketWrapper, VideoFramePacket};
use crate::session::pose::Pose;

/// Parameters a video encoder is (re)initialized with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    /// Bits per second
    pub bitrate_bits: u32,
    pub fov: f32,
}

impl VideoConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
            bitrate_bits: settings.bitrate.saturating_mul(1000),
            fov: settings.fov,
        }
    }
}

/// Where encoded video units go. Cheap to clone and safe to use from the
/// encoder's own thread.
#[derive(Clone)]
pub struct VideoSink {
    registry: Arc<ConnectionRegistry>,
}

impl VideoSink {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Timestamp one encoded unit and send it to every viewer
    pub fn push_unit(&self, data: &[u8]) -> usize {
        let packet = PacketWrapper::VideoFrame(VideoFramePacket {
            data: data.to_vec(),
            timestamp: capture_timestamp(),
        });
        self.registry.broadcast(&packet, None)
    }
}

/// Captures and encodes the streamed view
pub trait VideoEncoder {
    fn init(&mut self, config: VideoConfig, sink: VideoSink);
    fn stop(&mut self);
    /// Move the capture camera
    fn set_viewpoint(&mut self, pose: Pose);
}

/// The local user's head pose, sampled once per tick
pub trait HeadPoseSource {
    fn pose(&self) -> Pose;
}
