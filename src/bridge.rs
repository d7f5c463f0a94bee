//! Main-thread driver
//!
//! Wires the server, the event queue and the session coordinator together.
//! The host calls [`StreamBridge::tick`] once per frame from the thread that
//! owns the coordinator.

use std::sync::Arc;

use crate::audio::CaptureBackend;
use crate::config::{parse_port, Settings, SettingsStore};
use crate::error::ConfigError;
use crate::network::{event_queue, BroadcastServer, ConnectionRegistry, EventReceiver, RefreshCallback};
use crate::session::SessionCoordinator;

pub struct StreamBridge {
    server: BroadcastServer,
    coordinator: SessionCoordinator,
    events: EventReceiver,
}

impl StreamBridge {
    /// Build the bridge. An unusable port in `settings` is reset and saved.
    pub fn new(
        mut settings: Settings,
        store: Box<dyn SettingsStore>,
        audio_backend: Arc<dyn CaptureBackend>,
    ) -> Self {
        if settings.sanitize() {
            if let Err(e) = store.save(&settings) {
                tracing::warn!("Failed to save corrected settings: {}", e);
            }
        }

        let registry = Arc::new(ConnectionRegistry::new());
        let (events_tx, events) = event_queue();
        let server = BroadcastServer::new(registry.clone(), events_tx);
        let coordinator = SessionCoordinator::new(settings, store, registry, audio_backend);

        Self {
            server,
            coordinator,
            events,
        }
    }

    /// Start listening on the configured port
    pub fn start(&mut self) -> bool {
        match self.coordinator.settings().port() {
            Ok(port) => self.server.init(port),
            Err(e) => {
                tracing::error!("Cannot start server: {}", e);
                false
            }
        }
    }

    /// Handle queued network events, advance a pending refresh, then tick
    /// the session.
    pub fn tick(&mut self, dt: f32) {
        for event in self.events.try_iter() {
            self.coordinator.handle_event(event);
        }
        self.server.poll();
        self.coordinator.tick(dt);
    }

    /// Change the listening port.
    ///
    /// An invalid value is rejected and the previous port stays in effect.
    /// A valid one is saved and the server restarts on it, dropping every
    /// viewer.
    pub fn set_port(&mut self, value: &str) -> Result<(), ConfigError> {
        let port = parse_port(value).map_err(|e| {
            tracing::warn!("Rejecting port {:?}, keeping {}", value, self.coordinator.settings().port);
            e
        })?;
        self.coordinator.set_port(value.trim().to_string());
        self.server.refresh(port, None);
        Ok(())
    }

    /// Restart the server on the configured port
    pub fn refresh(&mut self, on_done: Option<RefreshCallback>) {
        match self.coordinator.settings().port() {
            Ok(port) => self.server.refresh(port, on_done),
            Err(e) => {
                tracing::error!("Cannot refresh server: {}", e);
                if let Some(on_done) = on_done {
                    on_done(false);
                }
            }
        }
    }

    pub fn server(&self) -> &BroadcastServer {
        &self.server
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut SessionCoordinator {
        &mut self.coordinator
    }
}
