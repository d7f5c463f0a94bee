//! Audio subsystem module

pub mod capture;
pub mod device;
pub mod microphone;
pub mod mixer;

pub use capture::{AudioCapture, AudioLevels, GameAudioSink};
pub use device::{CaptureBackend, CaptureStream, ChunkHandler, CpalBackend};
pub use microphone::{LoudnessTracker, MicrophoneSource};
pub use mixer::{AudioMixer, MixedFrame};
