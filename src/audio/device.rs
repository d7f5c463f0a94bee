//! Capture device access
//!
//! [`CaptureBackend`] is the seam between the microphone state machine and
//! the platform audio API. [`CpalBackend`] is the real implementation.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::AudioError;

/// Receives raw chunks on the device thread: `(samples, channels)`
pub type ChunkHandler = Arc<dyn Fn(&mut [f32], u16) + Send + Sync>;

/// A running capture; dropping or stopping it ends the recording
pub trait CaptureStream: Send {
    fn stop(&mut self);
}

/// Platform audio capture
pub trait CaptureBackend: Send + Sync {
    /// Names of available capture devices, in host order
    fn input_devices(&self) -> Vec<String>;

    /// Sample rate of the host's audio output
    fn output_sample_rate(&self) -> Option<u32>;

    /// Begin continuous capture from `device` at `sample_rate`
    fn start_capture(
        &self,
        device: &str,
        sample_rate: u32,
        handler: ChunkHandler,
    ) -> Result<Box<dyn CaptureStream>, AudioError>;
}

/// cpal-backed capture
#[derive(Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn find_input(name: &str) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;

        for device in devices {
            if let Ok(device_name) = device.name() {
                if device_name == name {
                    return Ok(device);
                }
            }
        }

        Err(AudioError::DeviceNotFound(name.to_string()))
    }
}

impl CaptureBackend for CpalBackend {
    fn input_devices(&self) -> Vec<String> {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate input devices: {}", e);
                Vec::new()
            }
        }
    }

    fn output_sample_rate(&self) -> Option<u32> {
        let host = cpal::default_host();
        host.default_output_device()
            .and_then(|d| d.default_output_config().ok())
            .map(|c| c.sample_rate().0)
    }

    fn start_capture(
        &self,
        device: &str,
        sample_rate: u32,
        handler: ChunkHandler,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        let cpal_device = Self::find_input(device)?;
        let default_config = cpal_device
            .default_input_config()
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = config.channels;

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        // cpal streams are not Send, so the stream lives on its own thread
        let handle = thread::Builder::new()
            .name(format!("mic-{}", device))
            .spawn(move || {
                let mut scratch: Vec<f32> = Vec::new();
                let stream = cpal_device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        scratch.clear();
                        scratch.extend_from_slice(data);
                        handler(&mut scratch, channels);
                    },
                    move |err| {
                        tracing::error!("Microphone stream error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread exited".into())));
        if let Err(e) = started {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Box::new(CpalCapture {
            running,
            thread_handle: Some(handle),
        }))
    }
}

struct CpalCapture {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCapture {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
