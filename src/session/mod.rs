//! Session coordination
//!
//! [`SessionCoordinator`] owns the capture state machine and the settings
//! snapshot. It runs on the main thread only: network events reach it
//! through the event queue and it reaches viewers through the registry.
//!
//! ```text
//!            restart (no target)            target available
//!   Idle ───────────────────────▶ Waiting ─────────────────────┐
//!    ▲                              ▲                          ▼
//!    │ stop                         │ host reset           Capturing
//!    └──────────────────────────────┴──────────────────────────┘
//! ```

pub mod pose;
pub mod remote;
pub mod video;

pub use pose::{Pose, PoseSmoother};
pub use remote::RemoteControl;
pub use video::{HeadPoseSource, VideoConfig, VideoEncoder, VideoSink};

use std::sync::Arc;

use crate::audio::{AudioCapture, AudioLevels, AudioMixer, CaptureBackend, GameAudioSink};
use crate::config::{Settings, SettingsStore};
use crate::network::{ConnectionId, ConnectionRegistry, ServerEvent};
use crate::protocol::PacketWrapper;

/// Capture lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// A restart was requested but there is no capture target yet
    Waiting,
    Capturing,
}

/// Main-thread owner of capture state and settings
pub struct SessionCoordinator {
    settings: Settings,
    store: Box<dyn SettingsStore>,
    registry: Arc<ConnectionRegistry>,
    mixer: Arc<AudioMixer>,
    levels: Arc<AudioLevels>,
    audio_backend: Arc<dyn CaptureBackend>,
    encoder: Option<Box<dyn VideoEncoder>>,
    head_pose: Option<Box<dyn HeadPoseSource>>,
    audio: Option<AudioCapture>,
    state: SessionState,
    smoother: PoseSmoother,
    remote: RemoteControl,
    /// The effective mic setting changed since it was last applied
    mic_changed: bool,
}

impl SessionCoordinator {
    pub fn new(
        settings: Settings,
        store: Box<dyn SettingsStore>,
        registry: Arc<ConnectionRegistry>,
        audio_backend: Arc<dyn CaptureBackend>,
    ) -> Self {
        let mixer = Arc::new(AudioMixer::new(settings.mix_mode));
        let levels = Arc::new(AudioLevels::new(&settings));
        Self {
            settings,
            store,
            registry,
            mixer,
            levels,
            audio_backend,
            encoder: None,
            head_pose: None,
            audio: None,
            state: SessionState::Idle,
            smoother: PoseSmoother::new(),
            remote: RemoteControl::new(),
            mic_changed: false,
        }
    }

    /// Handle for the host's audio thread
    pub fn game_audio_sink(&self) -> GameAudioSink {
        GameAudioSink::new(self.mixer.clone(), self.levels.clone())
    }

    pub fn set_head_pose_source(&mut self, source: Box<dyn HeadPoseSource>) {
        self.head_pose = Some(source);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Waiting counts as capturing; it is a capture that has not started yet
    pub fn is_capturing(&self) -> bool {
        match self.state {
            SessionState::Waiting => true,
            SessionState::Capturing => self.encoder.is_some(),
            SessionState::Idle => false,
        }
    }

    pub fn audio(&self) -> Option<&AudioCapture> {
        self.audio.as_ref()
    }

    pub fn mixer(&self) -> &Arc<AudioMixer> {
        &self.mixer
    }

    /// The host has a view to capture. Keeps an already installed encoder.
    pub fn on_capture_target_available(&mut self, encoder: Box<dyn VideoEncoder>) {
        if self.encoder.is_none() {
            tracing::debug!("Installing video encoder");
            self.encoder = Some(encoder);
            self.smoother.reset();
        }
        if self.state == SessionState::Waiting {
            self.restart_capture();
        }
    }

    /// (Re)start video and audio capture with the current settings
    pub fn restart_capture(&mut self) {
        let Some(encoder) = self.encoder.as_mut() else {
            tracing::debug!("No capture target yet, waiting");
            self.state = SessionState::Waiting;
            return;
        };

        tracing::info!("Refreshing capture");
        encoder.stop();
        encoder.init(
            VideoConfig::from_settings(&self.settings),
            VideoSink::new(self.registry.clone()),
        );

        // A failed mic is only retried when it is asked for again
        let mic_changed = std::mem::take(&mut self.mic_changed);
        let apply_mic = mic_changed || self.audio.is_none();
        let audio = self.audio.get_or_insert_with(|| {
            AudioCapture::new(
                self.mixer.clone(),
                self.levels.clone(),
                self.audio_backend.clone(),
                &self.settings,
            )
        });
        audio.apply_settings(&self.settings);
        if apply_mic {
            audio.set_mic_capture(self.settings.mic_active());
        }

        self.state = SessionState::Capturing;
    }

    pub fn stop_capture(&mut self) {
        tracing::info!("Stopping capture");
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.stop();
        }
        self.audio = None;
        self.remote.reset();
        self.state = SessionState::Idle;
    }

    /// The host destroyed its capture objects on its own.
    ///
    /// The encoder is released without `stop()`. A capture that was running
    /// resumes as soon as a new target shows up.
    pub fn on_host_context_reset(&mut self) {
        tracing::debug!("Host context reset");
        self.encoder = None;
        self.audio = None;
        self.state = match self.state {
            SessionState::Capturing => SessionState::Waiting,
            _ => SessionState::Idle,
        };
    }

    /// Settings pushed by a viewer
    pub fn apply_remote_settings(&mut self, incoming: Settings, origin: Option<ConnectionId>) {
        tracing::info!("Applying settings from {:?}", origin);
        let mic_was_active = self.settings.mic_active();
        let port = std::mem::take(&mut self.settings.port);
        self.settings = Settings { port, ..incoming };
        self.settings_changed(mic_was_active);
        self.send_settings(origin);
        self.restart_capture();
    }

    /// Local edit: mutate, persist, tell every viewer, restart
    pub fn update_settings(&mut self, edit: impl FnOnce(&mut Settings)) {
        let mic_was_active = self.settings.mic_active();
        edit(&mut self.settings);
        self.settings_changed(mic_was_active);
        self.send_settings(None);
        self.restart_capture();
    }

    /// Replace the port without restarting capture
    pub fn set_port(&mut self, port: String) {
        self.settings.port = port;
        self.persist();
    }

    fn settings_changed(&mut self, mic_was_active: bool) {
        self.mic_changed |= mic_was_active != self.settings.mic_active();
        self.levels.update(&self.settings);
        self.mixer.set_mix_mode(self.settings.mix_mode);
        if !self.settings.remote_control {
            self.remote.reset();
        }
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.settings) {
            tracing::warn!("Failed to save settings: {}", e);
        }
    }

    /// Send the settings to every viewer except `exclude`
    pub fn send_settings(&self, exclude: Option<ConnectionId>) -> usize {
        tracing::debug!("Sending settings except to {:?}", exclude);
        self.registry
            .broadcast(&PacketWrapper::Settings(self.settings.clone()), exclude)
    }

    pub fn send_settings_to(&self, id: ConnectionId) {
        if let Err(e) = self
            .registry
            .send_to(id, &PacketWrapper::Settings(self.settings.clone()))
        {
            tracing::warn!("Failed to send settings to {}: {}", id, e);
        }
    }

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected(id) => self.send_settings_to(id),
            ServerEvent::Message {
                from,
                packet: Some(packet),
            } => self.handle_packet(packet, Some(from)),
            ServerEvent::Message { from, packet: None } => {
                tracing::debug!("Ignoring malformed message from {}", from);
            }
            ServerEvent::RegistryEmptied => {
                // A viewer may have connected since the event was queued
                if self.registry.is_empty() && self.state != SessionState::Idle {
                    self.stop_capture();
                }
            }
        }
    }

    pub fn handle_packet(&mut self, packet: PacketWrapper, origin: Option<ConnectionId>) {
        match packet {
            PacketWrapper::Settings(settings) => self.apply_remote_settings(settings, origin),
            PacketWrapper::Input(input) => {
                if self.settings.remote_control {
                    self.remote.apply(&input);
                }
            }
            other => tracing::debug!("Ignoring inbound {} packet", other.kind()),
        }
    }

    /// Once per main loop tick
    pub fn tick(&mut self, dt: f32) {
        if let Some(frame) = self.audio.as_ref().and_then(AudioCapture::tick) {
            self.registry
                .broadcast(&PacketWrapper::AudioFrame(frame), None);
        }
        self.update_pose(dt);
    }

    fn update_pose(&mut self, dt: f32) {
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };

        let pose = if self.settings.remote_control {
            let current = self.smoother.current().unwrap_or_default();
            let rotation = self.remote.rotation();
            let pose = Pose::new(
                current.position + rotation * self.remote.movement(dt),
                rotation,
            );
            self.smoother.set(pose);
            pose
        } else {
            let Some(source) = self.head_pose.as_ref() else {
                return;
            };
            self.smoother
                .step(source.pose(), dt, self.settings.smoothing)
        };
        encoder.set_viewpoint(pose);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// What a [`RecordingEncoder`] has been asked to do
    #[derive(Debug, Default)]
    pub struct EncoderLog {
        pub inits: Vec<VideoConfig>,
        pub stops: usize,
        pub viewpoints: Vec<Pose>,
    }

    /// Encoder that records its calls
    #[derive(Clone, Default)]
    pub struct RecordingEncoder {
        pub log: Arc<Mutex<EncoderLog>>,
    }

    impl VideoEncoder for RecordingEncoder {
        fn init(&mut self, config: VideoConfig, _sink: VideoSink) {
            self.log.lock().inits.push(config);
        }

        fn stop(&mut self) {
            self.log.lock().stops += 1;
        }

        fn set_viewpoint(&mut self, pose: Pose) {
            self.log.lock().viewpoints.push(pose);
        }
    }

    pub struct FixedPose(pub Pose);

    impl HeadPoseSource for FixedPose {
        fn pose(&self) -> Pose {
            self.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::audio::microphone::testing::FakeBackend;
    use crate::config::{MemorySettingsStore, MixMode};
    use crate::network::{Outbound, OutboundReceiver};
    use crate::protocol::InputPacket;
    use glam::Vec3;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct Fixture {
        coordinator: SessionCoordinator,
        registry: Arc<ConnectionRegistry>,
        store: MemorySettingsStore,
        backend: Arc<FakeBackend>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = MemorySettingsStore::new();
        let backend = Arc::new(FakeBackend::with_device("Headset"));
        let coordinator = SessionCoordinator::new(
            Settings::default(),
            Box::new(store.clone()),
            registry.clone(),
            backend.clone(),
        );
        Fixture {
            coordinator,
            registry,
            store,
            backend,
        }
    }

    fn connect(registry: &ConnectionRegistry) -> (ConnectionId, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(tx), rx)
    }

    fn received(rx: &mut OutboundReceiver) -> Vec<PacketWrapper> {
        let mut packets = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Data(bytes) = outbound {
                packets.push(PacketWrapper::decode(&bytes).unwrap());
            }
        }
        packets
    }

    fn recording_encoder() -> (Box<dyn VideoEncoder>, Arc<Mutex<EncoderLog>>) {
        let encoder = RecordingEncoder::default();
        let log = encoder.log.clone();
        (Box::new(encoder), log)
    }

    #[test]
    fn test_restart_without_target_waits() {
        let mut f = fixture();
        f.coordinator.restart_capture();
        assert_eq!(f.coordinator.state(), SessionState::Waiting);
        assert!(f.coordinator.is_capturing());
        assert!(f.coordinator.audio().is_none());
    }

    #[test]
    fn test_target_resumes_waiting_capture() {
        let mut f = fixture();
        f.coordinator.restart_capture();

        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);

        assert_eq!(f.coordinator.state(), SessionState::Capturing);
        assert!(f.coordinator.audio().is_some());
        let log = log.lock();
        assert_eq!(log.stops, 1);
        assert_eq!(log.inits.len(), 1);
        assert_eq!(log.inits[0].bitrate_bits, Settings::default().bitrate * 1000);
    }

    #[test]
    fn test_target_alone_does_not_start() {
        let mut f = fixture();
        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);

        assert_eq!(f.coordinator.state(), SessionState::Idle);
        assert!(log.lock().inits.is_empty());
    }

    #[test]
    fn test_second_target_keeps_first_encoder() {
        let mut f = fixture();
        let (first, first_log) = recording_encoder();
        let (second, second_log) = recording_encoder();
        f.coordinator.on_capture_target_available(first);
        f.coordinator.on_capture_target_available(second);

        f.coordinator.restart_capture();
        assert_eq!(first_log.lock().inits.len(), 1);
        assert!(second_log.lock().inits.is_empty());
    }

    #[test]
    fn test_stop_capture() {
        let mut f = fixture();
        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);
        f.coordinator.restart_capture();
        assert!(f.coordinator.audio().unwrap().mic_recording());

        f.coordinator.stop_capture();
        assert_eq!(f.coordinator.state(), SessionState::Idle);
        assert!(!f.coordinator.is_capturing());
        assert!(f.coordinator.audio().is_none());
        assert_eq!(log.lock().stops, 2);
        assert!(!f.coordinator.mixer().is_active());
    }

    #[test]
    fn test_host_reset_while_capturing() {
        let mut f = fixture();
        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);
        f.coordinator.restart_capture();

        f.coordinator.on_host_context_reset();
        assert_eq!(f.coordinator.state(), SessionState::Waiting);
        assert_eq!(log.lock().stops, 1, "reset must not stop the encoder");

        // The next target picks the capture back up
        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);
        assert_eq!(f.coordinator.state(), SessionState::Capturing);
        assert_eq!(log.lock().inits.len(), 1);
    }

    #[test]
    fn test_host_reset_while_idle() {
        let mut f = fixture();
        f.coordinator.on_host_context_reset();
        assert_eq!(f.coordinator.state(), SessionState::Idle);
    }

    #[test]
    fn test_remote_settings_echo_excludes_origin() {
        let mut f = fixture();
        let (x, mut x_rx) = connect(&f.registry);
        let (_y, mut y_rx) = connect(&f.registry);

        let incoming = Settings {
            bitrate: 5000,
            port: "9999".to_string(),
            ..Settings::default()
        };
        f.coordinator
            .handle_packet(PacketWrapper::Settings(incoming), Some(x));

        assert_eq!(f.coordinator.settings().bitrate, 5000);
        // Port only changes through a local edit
        assert_eq!(f.coordinator.settings().port, "3308");
        assert_eq!(f.store.saved().unwrap().bitrate, 5000);
        assert_eq!(f.coordinator.state(), SessionState::Waiting);

        assert!(received(&mut x_rx).is_empty());
        match received(&mut y_rx).as_slice() {
            [PacketWrapper::Settings(settings)] => assert_eq!(settings.bitrate, 5000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_remote_settings_update_mixer() {
        let mut f = fixture();
        let incoming = Settings {
            mix_mode: MixMode::Average,
            ..Settings::default()
        };
        f.coordinator.apply_remote_settings(incoming, None);
        assert_eq!(f.coordinator.mixer().mix_mode(), MixMode::Average);
    }

    #[test]
    fn test_local_edit_reaches_everyone() {
        let mut f = fixture();
        let (_x, mut x_rx) = connect(&f.registry);
        f.coordinator.update_settings(|s| s.fps = 60.0);

        assert_eq!(f.store.save_count(), 1);
        match received(&mut x_rx).as_slice() {
            [PacketWrapper::Settings(settings)] => assert_eq!(settings.fps, 60.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_connected_gets_settings() {
        let mut f = fixture();
        let (x, mut x_rx) = connect(&f.registry);
        let (_y, mut y_rx) = connect(&f.registry);

        f.coordinator.handle_event(ServerEvent::Connected(x));
        match received(&mut x_rx).as_slice() {
            [PacketWrapper::Settings(settings)] => assert_eq!(settings, &Settings::default()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(received(&mut y_rx).is_empty());
    }

    #[test]
    fn test_registry_emptied_rechecks() {
        let mut f = fixture();
        let (encoder, _log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);
        f.coordinator.restart_capture();

        // Someone reconnected before the event was handled
        let (_x, _x_rx) = connect(&f.registry);
        f.coordinator.handle_event(ServerEvent::RegistryEmptied);
        assert_eq!(f.coordinator.state(), SessionState::Capturing);

        f.registry.close_all("bye");
        f.coordinator.handle_event(ServerEvent::RegistryEmptied);
        assert_eq!(f.coordinator.state(), SessionState::Idle);
    }

    #[test]
    fn test_malformed_message_ignored() {
        let mut f = fixture();
        f.coordinator.handle_event(ServerEvent::Message {
            from: ConnectionId::new(),
            packet: None,
        });
        assert_eq!(f.coordinator.state(), SessionState::Idle);
        assert_eq!(f.store.save_count(), 0);
    }

    #[test]
    fn test_tick_broadcasts_audio() {
        let mut f = fixture();
        let (encoder, _log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);
        f.coordinator.update_settings(|s| s.mic_enabled = false);
        let (_x, mut x_rx) = connect(&f.registry);

        f.coordinator.game_audio_sink().push(&[0.5, 0.5], 2);
        f.coordinator.tick(0.01);

        match received(&mut x_rx).as_slice() {
            [PacketWrapper::AudioFrame(frame)] => {
                assert_eq!(frame.samples, vec![0.5, 0.5]);
                assert_eq!(frame.sample_rate, 1000);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Nothing buffered, nothing sent
        f.coordinator.tick(0.01);
        assert!(received(&mut x_rx).is_empty());
    }

    #[test]
    fn test_mic_follows_remote_control() {
        let mut f = fixture();
        let (encoder, _log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);
        f.coordinator.restart_capture();
        assert!(f.coordinator.audio().unwrap().mic_recording());

        f.coordinator.update_settings(|s| s.remote_control = true);
        assert!(!f.coordinator.audio().unwrap().mic_recording());
        assert_eq!(f.backend.stops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_head_pose_drives_viewpoint() {
        let mut f = fixture();
        let target = Pose::new(Vec3::new(1.0, 2.0, 3.0), glam::Quat::IDENTITY);
        f.coordinator.set_head_pose_source(Box::new(FixedPose(target)));
        f.coordinator.update_settings(|s| s.smoothing = 0.0);

        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);
        f.coordinator.tick(0.01);

        assert_eq!(log.lock().viewpoints, vec![target]);
    }

    #[test]
    fn test_input_ignored_without_remote_control() {
        let mut f = fixture();
        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);

        f.coordinator.handle_packet(
            PacketWrapper::Input(InputPacket {
                keys_down: vec!["w".to_string()],
                ..InputPacket::default()
            }),
            None,
        );
        f.coordinator.tick(0.5);
        // No head pose source and no remote control: viewpoint untouched
        assert!(log.lock().viewpoints.is_empty());
    }

    #[test]
    fn test_remote_input_moves_viewpoint() {
        let mut f = fixture();
        f.coordinator.update_settings(|s| s.remote_control = true);
        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);

        f.coordinator.handle_packet(
            PacketWrapper::Input(InputPacket {
                keys_down: vec!["w".to_string()],
                ..InputPacket::default()
            }),
            None,
        );
        f.coordinator.tick(0.5);
        f.coordinator.tick(0.5);

        let log = log.lock();
        assert_eq!(log.viewpoints.len(), 2);
        assert_eq!(log.viewpoints[1].position, Vec3::new(0.0, 0.0, 2.0));
    }

    #[test]
    fn test_failed_mic_not_retried_on_unrelated_edits() {
        let registry = Arc::new(ConnectionRegistry::new());
        let backend = Arc::new(FakeBackend {
            fail_start: true,
            ..FakeBackend::with_device("Headset")
        });
        let mut coordinator = SessionCoordinator::new(
            Settings::default(),
            Box::new(MemorySettingsStore::new()),
            registry,
            backend.clone(),
        );
        let (encoder, _log) = recording_encoder();
        coordinator.on_capture_target_available(encoder);
        coordinator.restart_capture();
        assert_eq!(backend.starts.load(std::sync::atomic::Ordering::SeqCst), 1);

        for fps in [30.0, 60.0, 90.0] {
            coordinator.apply_remote_settings(
                Settings {
                    fps,
                    ..Settings::default()
                },
                None,
            );
        }
        assert_eq!(backend.starts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!coordinator.audio().unwrap().mic_recording());

        // Turning the mic off and on again is an explicit request
        coordinator.update_settings(|s| s.mic_enabled = false);
        coordinator.update_settings(|s| s.mic_enabled = true);
        assert_eq!(backend.starts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registry_emptied_stops_once() {
        let mut f = fixture();
        let (encoder, log) = recording_encoder();
        f.coordinator.on_capture_target_available(encoder);
        f.coordinator.restart_capture();
        assert_eq!(log.lock().stops, 1);

        f.coordinator.handle_event(ServerEvent::RegistryEmptied);
        f.coordinator.handle_event(ServerEvent::RegistryEmptied);
        assert_eq!(f.coordinator.state(), SessionState::Idle);
        assert_eq!(log.lock().stops, 2);
    }
}
