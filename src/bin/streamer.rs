//! Stream Bridge Demo Host
//!
//! Runs the bridge against a synthetic host: a sine tone stands in for game
//! audio, the head pose is fixed and the "video encoder" emits placeholder
//! units. The microphone is real. Connect a viewer to `ws://<host>:<port>/`.

use anyhow::Result;
use glam::{Quat, Vec3};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_bridge::{
    audio::{CaptureBackend, CpalBackend, GameAudioSink},
    config::TomlSettingsStore,
    constants::DEFAULT_SAMPLE_RATE,
    session::{HeadPoseSource, Pose, VideoConfig, VideoEncoder, VideoSink},
    StreamBridge,
};

/// Main loop rate
const TICK_RATE_HZ: u64 = 100;

/// Game audio tone
const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.1;

struct FixedHead;

impl HeadPoseSource for FixedHead {
    fn pose(&self) -> Pose {
        Pose::new(Vec3::new(0.0, 1.7, 0.0), Quat::IDENTITY)
    }
}

/// Emits a small placeholder unit per frame on its own thread
#[derive(Default)]
struct PlaceholderEncoder {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl VideoEncoder for PlaceholderEncoder {
    fn init(&mut self, config: VideoConfig, sink: VideoSink) {
        tracing::info!(
            "Encoder init: {}x{} @ {} fps, {} bps, fov {}",
            config.width,
            config.height,
            config.fps,
            config.bitrate_bits,
            config.fov
        );

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let interval = Duration::from_secs_f32(1.0 / config.fps.max(1.0));
        let header = [0u8, 0, 0, 1, 0x65];

        match thread::Builder::new()
            .name("placeholder-encoder".into())
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    sink.push_unit(&header);
                    thread::sleep(interval);
                }
            }) {
            Ok(handle) => {
                self.running = running;
                self.thread = Some(handle);
            }
            Err(e) => tracing::error!("Failed to spawn encoder thread: {}", e),
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn set_viewpoint(&mut self, pose: Pose) {
        tracing::trace!("Viewpoint {:?}", pose.position);
    }
}

impl Drop for PlaceholderEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stands in for the host's audio thread
struct ToneGenerator {
    sink: GameAudioSink,
    sample_rate: u32,
    phase: f32,
    carry: f32,
}

impl ToneGenerator {
    fn push(&mut self, dt: f32) {
        let exact = self.sample_rate as f32 * dt + self.carry;
        let frames = exact.floor();
        self.carry = exact - frames;

        let step = TAU * TONE_HZ / self.sample_rate as f32;
        let mut samples = Vec::with_capacity(frames as usize * 2);
        for _ in 0..frames as usize {
            let value = self.phase.sin() * TONE_AMPLITUDE;
            samples.push(value);
            samples.push(value);
            self.phase = (self.phase + step) % TAU;
        }
        self.sink.push(&samples, 2);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Stream Bridge");

    let store = TomlSettingsStore::default_location()?;
    let settings = store.load_or_default();
    tracing::info!("Settings file: {}", store.path().display());

    let backend = Arc::new(CpalBackend::new());
    let sample_rate = backend.output_sample_rate().unwrap_or(DEFAULT_SAMPLE_RATE);
    println!("\n=== Input Devices ===");
    for name in backend.input_devices() {
        println!("  {}", name);
    }
    println!();

    let mut bridge = StreamBridge::new(settings, Box::new(store), backend);
    if !bridge.start() {
        anyhow::bail!("Could not listen on port {}", bridge.coordinator().settings().port);
    }
    if let Some(addr) = bridge.server().local_addr() {
        tracing::info!("Viewers can connect to ws://{}/", addr);
    }

    let coordinator = bridge.coordinator_mut();
    coordinator.set_head_pose_source(Box::new(FixedHead));
    coordinator.on_capture_target_available(Box::<PlaceholderEncoder>::default());

    let mut tone = ToneGenerator {
        sink: bridge.coordinator().game_audio_sink(),
        sample_rate,
        phase: 0.0,
        carry: 0.0,
    };

    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / TICK_RATE_HZ));
    let mut last = Instant::now();

    tracing::info!("Starting main loop - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last).as_secs_f32();
                last = now;

                tone.push(dt);
                bridge.tick(dt);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down");
    bridge.coordinator_mut().stop_capture();
    Ok(())
}
