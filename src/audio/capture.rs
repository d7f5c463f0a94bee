//! Audio capture instance
//!
//! Binds the shared [`AudioMixer`] to a microphone and to the host's game
//! audio for the duration of one capture session. The coordinator creates
//! one when capture starts and drops it when capture stops.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::audio::device::CaptureBackend;
use crate::audio::microphone::MicrophoneSource;
use crate::audio::mixer::AudioMixer;
use crate::config::Settings;
use crate::constants::DEFAULT_SAMPLE_RATE;
use crate::protocol::{capture_timestamp, AudioFramePacket};

/// Volume and gate levels read by the real-time threads
#[derive(Debug)]
pub struct AudioLevels {
    game_volume: AtomicU32,
    mic_volume: AtomicU32,
    mic_threshold: AtomicU32,
}

impl AudioLevels {
    pub fn new(settings: &Settings) -> Self {
        let levels = Self {
            game_volume: AtomicU32::new(0),
            mic_volume: AtomicU32::new(0),
            mic_threshold: AtomicU32::new(0),
        };
        levels.update(settings);
        levels
    }

    pub fn update(&self, settings: &Settings) {
        self.game_volume
            .store(settings.game_volume.to_bits(), Ordering::Relaxed);
        self.mic_volume
            .store(settings.mic_volume.to_bits(), Ordering::Relaxed);
        self.mic_threshold
            .store(settings.mic_threshold.to_bits(), Ordering::Relaxed);
    }

    pub fn game_volume(&self) -> f32 {
        f32::from_bits(self.game_volume.load(Ordering::Relaxed))
    }

    pub fn mic_volume(&self) -> f32 {
        f32::from_bits(self.mic_volume.load(Ordering::Relaxed))
    }

    pub fn mic_threshold(&self) -> f32 {
        f32::from_bits(self.mic_threshold.load(Ordering::Relaxed))
    }
}

/// Handle the host calls from its audio thread with game audio
#[derive(Clone)]
pub struct GameAudioSink {
    mixer: Arc<AudioMixer>,
    levels: Arc<AudioLevels>,
}

impl GameAudioSink {
    pub fn new(mixer: Arc<AudioMixer>, levels: Arc<AudioLevels>) -> Self {
        Self { mixer, levels }
    }

    /// Feed interleaved game samples
    pub fn push(&self, samples: &[f32], channels: u16) {
        self.mixer
            .submit_game(samples, channels, self.levels.game_volume());
    }
}

/// One capture session's audio side
pub struct AudioCapture {
    mixer: Arc<AudioMixer>,
    levels: Arc<AudioLevels>,
    backend: Arc<dyn CaptureBackend>,
    mic: Option<MicrophoneSource>,
    sample_rate: u32,
}

impl AudioCapture {
    pub fn new(
        mixer: Arc<AudioMixer>,
        levels: Arc<AudioLevels>,
        backend: Arc<dyn CaptureBackend>,
        settings: &Settings,
    ) -> Self {
        tracing::debug!("Creating audio capture");
        let sample_rate = backend.output_sample_rate().unwrap_or(DEFAULT_SAMPLE_RATE);
        levels.update(settings);
        mixer.set_mix_mode(settings.mix_mode);
        mixer.activate(sample_rate);

        Self {
            mixer,
            levels,
            backend,
            mic: None,
            sample_rate,
        }
    }

    /// Enable or disable microphone capture
    pub fn set_mic_capture(&mut self, enabled: bool) {
        if enabled {
            let mic = self.mic.get_or_insert_with(|| {
                let mic = MicrophoneSource::new(self.backend.clone());
                let mixer = self.mixer.clone();
                let levels = self.levels.clone();
                let sample_rate = self.sample_rate;
                mic.subscribe(Box::new(move |chunk, channels, loudness| {
                    mixer.set_mic_format(sample_rate, channels);
                    // Below the threshold the mic is gated to silence
                    let over = loudness >= levels.mic_threshold();
                    let volume = if over { levels.mic_volume() } else { 0.0 };
                    mixer.submit_mic(chunk, volume, over);
                }));
                mic
            });
            mic.start();
            self.mixer.set_mic_attached(mic.is_recording());
        } else if let Some(mic) = self.mic.as_mut() {
            mic.stop();
            self.mixer.set_mic_attached(false);
        }
    }

    /// Push new levels and mix mode from the settings
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.levels.update(settings);
        self.mixer.set_mix_mode(settings.mix_mode);
    }

    pub fn mic_recording(&self) -> bool {
        self.mic.as_ref().map(|m| m.is_recording()).unwrap_or(false)
    }

    pub fn mic(&self) -> Option<&MicrophoneSource> {
        self.mic.as_ref()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Drain the mixer into an outgoing audio frame
    pub fn tick(&self) -> Option<AudioFramePacket> {
        let frame = self.mixer.drain()?;
        Some(AudioFramePacket {
            samples: frame.samples,
            sample_rate: frame.sample_rate,
            channels: frame.channels,
            timestamp: capture_timestamp(),
        })
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        tracing::debug!("Stopping audio capture");
        if let Some(mut mic) = self.mic.take() {
            mic.unsubscribe();
            mic.stop();
        }
        self.mixer.set_mic_attached(false);
        self.mixer.deactivate();
    }
}
