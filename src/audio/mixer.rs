//! Two-stream audio mixer
//!
//! Game audio and microphone audio arrive on their own real-time threads and
//! are appended to separate buffers. Once per tick the main thread drains
//! both and merges the overlapping part under the configured [`MixMode`].
//!
//! Locking: both buffers live behind one read-write lock. Producers take the
//! shared side and only touch their own buffer (each has a short mutex of
//! its own), so game and mic appends never wait on each other. The drain
//! takes the exclusive side and needs no further locking.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use crate::config::MixMode;

/// Result of one drain
#[derive(Debug, Clone, PartialEq)]
pub struct MixedFrame {
    /// Interleaved samples
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

struct Buffers {
    game: Mutex<Vec<f32>>,
    mic: Mutex<Vec<f32>>,
}

/// Mixer for game and microphone audio
pub struct AudioMixer {
    buffers: RwLock<Buffers>,
    /// Set when a mic chunk since the last drain crossed the threshold
    mic_activity: AtomicBool,
    /// Whether a microphone is currently feeding the mixer
    mic_attached: AtomicBool,
    /// Submissions are dropped while inactive
    active: AtomicBool,
    mix_mode: Mutex<MixMode>,
    sample_rate: AtomicU32,
    game_channels: AtomicU16,
    mic_channels: AtomicU16,
    mic_sample_rate: AtomicU32,
    /// Last (mic rate, mic channels, game rate, game channels) checked
    checked_formats: Mutex<Option<(u32, u16, u32, u16)>>,
}

impl AudioMixer {
    pub fn new(mix_mode: MixMode) -> Self {
        Self {
            buffers: RwLock::new(Buffers {
                game: Mutex::new(Vec::new()),
                mic: Mutex::new(Vec::new()),
            }),
            mic_activity: AtomicBool::new(false),
            mic_attached: AtomicBool::new(false),
            active: AtomicBool::new(false),
            mix_mode: Mutex::new(mix_mode),
            sample_rate: AtomicU32::new(0),
            game_channels: AtomicU16::new(0),
            mic_channels: AtomicU16::new(0),
            mic_sample_rate: AtomicU32::new(0),
            checked_formats: Mutex::new(None),
        }
    }

    /// Start accepting audio at the given output sample rate
    pub fn activate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    /// Stop accepting audio and discard anything buffered
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        let mut buffers = self.buffers.write();
        buffers.game.get_mut().clear();
        buffers.mic.get_mut().clear();
        self.mic_activity.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_mix_mode(&self, mode: MixMode) {
        *self.mix_mode.lock() = mode;
    }

    pub fn mix_mode(&self) -> MixMode {
        *self.mix_mode.lock()
    }

    /// Mark the microphone as present or absent.
    ///
    /// Detaching discards pending mic samples so the next drain passes game
    /// audio straight through.
    pub fn set_mic_attached(&self, attached: bool) {
        self.mic_attached.store(attached, Ordering::SeqCst);
        if !attached {
            let mut buffers = self.buffers.write();
            buffers.mic.get_mut().clear();
            self.mic_activity.store(false, Ordering::SeqCst);
        }
    }

    pub fn mic_attached(&self) -> bool {
        self.mic_attached.load(Ordering::SeqCst)
    }

    /// Record the format of the mic stream, used for mismatch warnings
    pub fn set_mic_format(&self, sample_rate: u32, channels: u16) {
        self.mic_sample_rate.store(sample_rate, Ordering::Relaxed);
        self.mic_channels.store(channels, Ordering::Relaxed);
    }

    /// Append game audio, scaled by `volume`
    pub fn submit_game(&self, chunk: &[f32], channels: u16, volume: f32) {
        self.game_channels.store(channels, Ordering::Relaxed);
        if !self.is_active() {
            return;
        }
        let buffers = self.buffers.read();
        let mut game = buffers.game.lock();
        game.extend(chunk.iter().map(|s| s * volume));
    }

    /// Append microphone audio, scaled by `volume`
    pub fn submit_mic(&self, chunk: &[f32], volume: f32, over_threshold: bool) {
        if !self.is_active() || !self.mic_attached() {
            return;
        }
        let buffers = self.buffers.read();
        let mut mic = buffers.mic.lock();
        mic.extend(chunk.iter().map(|s| s * volume));
        if over_threshold {
            self.mic_activity.store(true, Ordering::Relaxed);
        }
    }

    /// Buffered sample counts as `(game, mic)`
    pub fn buffered(&self) -> (usize, usize) {
        let buffers = self.buffers.read();
        let game = buffers.game.lock().len();
        let mic = buffers.mic.lock().len();
        (game, mic)
    }

    /// Merge what both producers have delivered since the last drain
    pub fn drain(&self) -> Option<MixedFrame> {
        let mut buffers = self.buffers.write();
        let had_activity = self.mic_activity.swap(false, Ordering::Relaxed);

        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        let channels = self.game_channels.load(Ordering::Relaxed);
        if sample_rate == 0 || channels == 0 {
            return None;
        }

        let Buffers { game, mic } = &mut *buffers;
        let game = game.get_mut();
        let mic = mic.get_mut();

        if !self.mic_attached() || mic.is_empty() {
            if game.is_empty() {
                return None;
            }
            let samples = std::mem::take(game);
            return Some(MixedFrame {
                samples,
                sample_rate,
                channels,
            });
        }

        self.warn_on_format_mismatch(sample_rate, channels);

        let size = game.len().min(mic.len());
        if size == 0 {
            return None;
        }

        let out = match self.mix_mode() {
            MixMode::Add => mix_add(&game[..size], &mic[..size]),
            MixMode::Average => mix_average(&game[..size], &mic[..size]),
            MixMode::GatedAverage if had_activity => mix_average(&game[..size], &mic[..size]),
            MixMode::GatedAverage => game[..size].to_vec(),
        };

        game.drain(..size);
        mic.drain(..size);

        Some(MixedFrame {
            samples: out,
            sample_rate,
            channels,
        })
    }

    /// Warns once per distinct pair of mismatched formats
    fn warn_on_format_mismatch(&self, sample_rate: u32, channels: u16) -> bool {
        let mic_rate = self.mic_sample_rate.load(Ordering::Relaxed);
        let mic_channels = self.mic_channels.load(Ordering::Relaxed);
        if mic_rate == 0 || mic_channels == 0 {
            return false;
        }

        let formats = (mic_rate, mic_channels, sample_rate, channels);
        let mut checked = self.checked_formats.lock();
        if *checked == Some(formats) {
            return false;
        }
        *checked = Some(formats);

        if mic_rate != sample_rate || mic_channels != channels {
            tracing::warn!(
                "Mismatch in reported config! mic: {}/{}, game: {}/{}",
                mic_channels,
                mic_rate,
                channels,
                sample_rate
            );
            return true;
        }
        false
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new(MixMode::default())
    }
}

/// `game[i] + mic[i]`
pub fn mix_add(game: &[f32], mic: &[f32]) -> Vec<f32> {
    game.iter().zip(mic).map(|(g, m)| g + m).collect()
}

/// `(game[i] + mic[i]) / 2`
pub fn mix_average(game: &[f32], mic: &[f32]) -> Vec<f32> {
    game.iter().zip(mic).map(|(g, m)| (g + m) / 2.0).collect()
}
