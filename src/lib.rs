//! # Stream Bridge
//!
//! Streams a host application's live audio and video to remote viewers over
//! WebSocket and lets any viewer push settings back.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               HOST PROCESS                               │
//! │  ┌─────────────┐    ┌─────────────┐          ┌──────────────────────┐    │
//! │  │ Game Audio  │    │ Microphone  │          │  Video Encoder       │    │
//! │  │  (host thr) │    │ (cpal thr)  │          │  (collaborator thr)  │    │
//! │  └──────┬──────┘    └──────┬──────┘          └──────────┬───────────┘    │
//! │         │ shared lock      │ shared lock                │                │
//! │         ▼                  ▼                            │                │
//! │  ┌─────────────────────────────────┐                    │                │
//! │  │      AudioMixer (audio::mixer)  │                    │                │
//! │  │   game buffer  |  mic buffer    │                    │                │
//! │  └──────────────┬──────────────────┘                    │                │
//! │                 │ drain (exclusive lock, once per tick)  │                │
//! │                 ▼                                        ▼                │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │      SessionCoordinator (session) - main thread tick              │  │
//! │  │      Idle / Waiting / Capturing, settings, pose smoothing          │  │
//! │  └──────────────┬─────────────────────────────────▲───────────────────┘  │
//! │                 │ PacketWrapper (protocol)        │ ServerEvent queue    │
//! │                 ▼                                 │ (MPSC, per tick)     │
//! │  ┌────────────────────────────────────────────────┴───────────────────┐  │
//! │  │   BroadcastServer (network) - I/O thread, ConnectionRegistry       │  │
//! │  └──────────────────────────────┬─────────────────────────────────────┘  │
//! └─────────────────────────────────┼────────────────────────────────────────┘
//!                                   │ WebSocket (binary)
//!                                   ▼
//!                         viewer   viewer   viewer
//! ```

pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use bridge::StreamBridge;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Fallback sample rate when the host cannot report one
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default listening port (kept as a string like the persisted setting)
    pub const DEFAULT_PORT: &str = "3308";

    /// Default stream resolution
    pub const DEFAULT_WIDTH: u32 = 1280;
    pub const DEFAULT_HEIGHT: u32 = 720;

    /// Default stream bitrate in kbps
    pub const DEFAULT_BITRATE_KBPS: u32 = 10_000;

    /// Default stream frame rate
    pub const DEFAULT_FPS: f32 = 30.0;

    /// Default capture camera field of view in degrees
    pub const DEFAULT_FOV: f32 = 80.0;

    /// Smoothing values below this snap the camera straight to the head pose
    pub const MIN_SMOOTHING: f32 = 0.1;

    /// Gain applied to chunk RMS so that useful loudness falls roughly in 0..2
    pub const LOUDNESS_GAIN: f32 = 200.0;

    /// Loudness release rate, in loudness units per second
    pub const LOUDNESS_DECAY_PER_SEC: f32 = 4.0;

    /// Upper bound on a single encoded packet
    pub const MAX_PACKET_SIZE: u64 = 16 * 1024 * 1024;

    /// Close reason sent to viewers when the server is refreshed
    pub const CLOSE_REASON_CONFIG_CHANGED: &str = "configuration changed";
}
