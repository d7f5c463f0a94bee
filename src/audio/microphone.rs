//! Microphone capture
//!
//! Owns the capture device lifecycle (Idle → Recording → Idle) and tracks
//! the loudness of what it hears. It does no gating or volume scaling: each
//! chunk is handed to the subscribed callback together with the current
//! loudness, and the consumer decides what to do with it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use crate::audio::device::{CaptureBackend, CaptureStream, ChunkHandler};
use crate::error::AudioError;
use crate::constants::{DEFAULT_SAMPLE_RATE, LOUDNESS_DECAY_PER_SEC, LOUDNESS_GAIN};

/// Callback receiving `(samples, channels, loudness)` on the device thread
pub type MicCallback = Box<dyn FnMut(&[f32], u16, f32) + Send>;

/// Root-mean-square amplitude of a chunk, boosted by [`LOUDNESS_GAIN`]
pub fn rms_loudness(chunk: &[f32]) -> f32 {
    if chunk.is_empty() {
        return 0.0;
    }
    let sum: f32 = chunk.iter().map(|s| s * s).sum();
    (sum / chunk.len() as f32).sqrt() * LOUDNESS_GAIN
}

/// Loudness estimate with instant attack and linear release
#[derive(Debug, Clone, Copy)]
pub struct LoudnessTracker {
    current: f32,
    decay_per_second: f32,
}

impl LoudnessTracker {
    pub fn new(decay_per_second: f32) -> Self {
        Self {
            current: 0.0,
            decay_per_second,
        }
    }

    /// Fold in the loudness of a chunk lasting `duration_secs`
    pub fn update(&mut self, loudness: f32, duration_secs: f32) -> f32 {
        if loudness > self.current {
            self.current = loudness;
        } else {
            let decayed = self.current - self.decay_per_second * duration_secs;
            self.current = decayed.max(loudness).max(0.0);
        }
        self.current
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = 0.0;
    }
}

impl Default for LoudnessTracker {
    fn default() -> Self {
        Self::new(LOUDNESS_DECAY_PER_SEC)
    }
}

/// State shared with the device thread
struct MicShared {
    callback: Mutex<Option<MicCallback>>,
    loudness: Mutex<LoudnessTracker>,
    /// 0 while unset
    sample_rate: AtomicU32,
    channels: AtomicU16,
}

impl MicShared {
    fn on_chunk(&self, chunk: &mut [f32], channels: u16) {
        self.channels.store(channels, Ordering::Relaxed);
        let sample_rate = self.sample_rate.load(Ordering::Relaxed);

        if sample_rate != 0 && channels != 0 {
            let frames = chunk.len() / channels as usize;
            let duration = frames as f32 / sample_rate as f32;
            let loudness = self
                .loudness
                .lock()
                .update(rms_loudness(chunk), duration);

            if let Some(callback) = self.callback.lock().as_mut() {
                callback(chunk, channels, loudness);
            }
        }

        // Captured audio must never reach a local output
        chunk.fill(0.0);
    }
}

/// Microphone capture state machine
pub struct MicrophoneSource {
    backend: Arc<dyn CaptureBackend>,
    shared: Arc<MicShared>,
    stream: Option<Box<dyn CaptureStream>>,
    device: Option<String>,
}

impl MicrophoneSource {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            shared: Arc::new(MicShared {
                callback: Mutex::new(None),
                loudness: Mutex::new(LoudnessTracker::default()),
                sample_rate: AtomicU32::new(0),
                channels: AtomicU16::new(0),
            }),
            stream: None,
            device: None,
        }
    }

    /// Install the chunk callback, replacing any previous one
    pub fn subscribe(&self, callback: MicCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    /// Remove the chunk callback. Must happen before the consumer goes away.
    pub fn unsubscribe(&self) {
        *self.shared.callback.lock() = None;
    }

    /// Start recording from the first capture device
    pub fn start(&mut self) {
        if self.stream.is_some() {
            return;
        }

        let devices = self.backend.input_devices();
        let Some(device) = devices.first().cloned() else {
            tracing::error!("{}", AudioError::DeviceUnavailable);
            return;
        };
        tracing::debug!("Found microphones: {}", devices.join(", "));
        tracing::info!("Recording with microphone {}", device);

        let sample_rate = self
            .backend
            .output_sample_rate()
            .unwrap_or(DEFAULT_SAMPLE_RATE);
        self.shared.sample_rate.store(sample_rate, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handler: ChunkHandler = Arc::new(move |chunk: &mut [f32], channels: u16| {
            shared.on_chunk(chunk, channels);
        });

        match self.backend.start_capture(&device, sample_rate, handler) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.device = Some(device);
            }
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                self.reset_fields();
            }
        }
    }

    /// Stop recording. Safe to call when idle.
    pub fn stop(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        tracing::info!(
            "Ending recording of microphone {}",
            self.device.as_deref().unwrap_or("?")
        );
        stream.stop();
        self.device = None;
        self.reset_fields();
    }

    fn reset_fields(&self) {
        self.shared.sample_rate.store(0, Ordering::SeqCst);
        self.shared.channels.store(0, Ordering::SeqCst);
        self.shared.loudness.lock().reset();
    }

    /// Process one chunk as the device thread would
    pub fn on_chunk(&self, chunk: &mut [f32], channels: u16) {
        self.shared.on_chunk(chunk, channels);
    }

    pub fn is_recording(&self) -> bool {
        self.stream.is_some()
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn loudness(&self) -> f32 {
        self.shared.loudness.lock().current()
    }

    /// Recording sample rate, `None` while idle
    pub fn sample_rate(&self) -> Option<u32> {
        match self.shared.sample_rate.load(Ordering::SeqCst) {
            0 => None,
            rate => Some(rate),
        }
    }

    /// Channel count of the last chunk, `None` while idle
    pub fn channels(&self) -> Option<u16> {
        match self.shared.channels.load(Ordering::SeqCst) {
            0 => None,
            channels => Some(channels),
        }
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.unsubscribe();
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(count: Arc<AtomicUsize>) -> MicCallback {
        Box::new(move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_no_devices_stays_idle() {
        let backend = Arc::new(FakeBackend::default());
        let mut mic = MicrophoneSource::new(backend.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        mic.subscribe(counting_callback(calls.clone()));

        mic.start();
        assert!(!mic.is_recording());
        assert_eq!(mic.sample_rate(), None);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 0);

        // Nothing was wired to the device, so no chunk can arrive
        assert!(!backend.feed(&mut [0.5; 8], 2));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_failure_reverts() {
        let backend = Arc::new(FakeBackend {
            fail_start: true,
            ..FakeBackend::with_device("Headset")
        });
        let mut mic = MicrophoneSource::new(backend.clone());

        mic.start();
        assert!(!mic.is_recording());
        assert_eq!(mic.sample_rate(), None);
        assert_eq!(mic.device(), None);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let backend = Arc::new(FakeBackend::with_device("Headset"));
        let mut mic = MicrophoneSource::new(backend.clone());

        mic.start();
        assert!(mic.is_recording());
        assert_eq!(mic.device(), Some("Headset"));
        assert_eq!(mic.sample_rate(), Some(1000));

        // Already recording: no second device start
        mic.start();
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);

        backend.feed(&mut [1.0; 10], 1);
        assert!(mic.loudness() > 0.0);
        assert_eq!(mic.channels(), Some(1));

        mic.stop();
        mic.stop();
        assert!(!mic.is_recording());
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert_eq!(mic.sample_rate(), None);
        assert_eq!(mic.channels(), None);
        assert_eq!(mic.loudness(), 0.0);
    }

    #[test]
    fn test_chunk_forwarded_then_zeroed() {
        let backend = Arc::new(FakeBackend::with_device("Headset"));
        let mut mic = MicrophoneSource::new(backend.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            mic.subscribe(Box::new(move |chunk, channels, loudness| {
                seen.lock().push((chunk.to_vec(), channels, loudness));
            }));
        }
        mic.start();

        let mut chunk = [0.5f32, -0.5, 0.5, -0.5];
        assert!(backend.feed(&mut chunk, 2));
        assert_eq!(chunk, [0.0; 4]);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, vec![0.5, -0.5, 0.5, -0.5]);
        assert_eq!(seen[0].1, 2);
        assert!((seen[0].2 - 0.5 * LOUDNESS_GAIN).abs() < 1e-3);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let backend = Arc::new(FakeBackend::with_device("Headset"));
        let mut mic = MicrophoneSource::new(backend.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        mic.subscribe(counting_callback(calls.clone()));
        mic.start();

        backend.feed(&mut [0.1; 4], 1);
        mic.unsubscribe();
        let mut chunk = [0.1f32; 4];
        backend.feed(&mut chunk, 1);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Still zeroed even with nobody listening
        assert_eq!(chunk, [0.0; 4]);
    }

    #[test]
    fn test_loudness_decay() {
        let mut tracker = LoudnessTracker::new(2.0);
        let duration = 0.125;

        assert_eq!(tracker.update(1.0, duration), 1.0);

        let mut previous = tracker.current();
        let mut steps = 0;
        while tracker.current() > 0.0 {
            let next = tracker.update(0.0, duration);
            assert_eq!(previous - next, 0.25);
            assert!(next >= 0.0);
            previous = next;
            steps += 1;
            assert!(steps <= 4);
        }
        assert_eq!(steps, 4);

        // A partial step is clamped at zero rather than going negative
        tracker.update(0.1, duration);
        assert_eq!(tracker.update(0.0, duration), 0.0);

        // Stays clamped at zero
        assert_eq!(tracker.update(0.0, duration), 0.0);
    }

    #[test]
    fn test_loudness_attack_is_instant() {
        let mut tracker = LoudnessTracker::new(1.0);
        tracker.update(0.2, 0.01);
        assert_eq!(tracker.update(1.5, 0.01), 1.5);

        // Release never undershoots the new chunk's own loudness
        assert_eq!(tracker.update(1.4, 0.25), 1.4);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms_loudness(&[]), 0.0);
        assert_eq!(rms_loudness(&[0.0; 16]), 0.0);
        let loud = rms_loudness(&[0.01, -0.01, 0.01, -0.01]);
        assert!((loud - 0.01 * LOUDNESS_GAIN).abs() < 1e-4);
    }
}
