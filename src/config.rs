//! Settings snapshot and persistence
//!
//! The settings are a flat record shared by the local host and every viewer.
//! Only the main thread mutates it; the store persists it as TOML.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::*;
use crate::error::ConfigError;

/// How microphone audio is combined with game audio.
///
/// The numeric index matches the label order shown to users:
/// `0 = Average`, `1 = GatedAverage`, `2 = Add`. Unknown indices fall back to
/// [`MixMode::Add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixMode {
    /// `(game + mic) / 2` on every tick with mic data
    Average,
    /// Average only on ticks where the mic crossed its threshold
    GatedAverage,
    /// `game + mic`
    #[default]
    Add,
}

impl MixMode {
    /// Labels in index order
    pub const LABELS: [&'static str; 3] = ["Average", "Gated Average", "Add"];

    /// Map a user-facing index to a policy
    pub fn from_index(index: i32) -> Self {
        match index {
            0 => MixMode::Average,
            1 => MixMode::GatedAverage,
            _ => MixMode::Add,
        }
    }

    pub fn index(self) -> i32 {
        match self {
            MixMode::Average => 0,
            MixMode::GatedAverage => 1,
            MixMode::Add => 2,
        }
    }

    pub fn label(self) -> &'static str {
        Self::LABELS[self.index() as usize]
    }
}

/// Stream settings snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listening port, kept as the raw configured string
    pub port: String,
    pub width: u32,
    pub height: u32,
    /// Video bitrate in kbps
    pub bitrate: u32,
    pub fps: f32,
    pub fov: f32,
    /// Camera smoothing window; below [`MIN_SMOOTHING`] the camera snaps
    pub smoothing: f32,
    /// Drive the camera from viewer input instead of the head pose
    pub remote_control: bool,
    pub mic_enabled: bool,
    pub game_volume: f32,
    pub mic_volume: f32,
    /// Loudness a mic chunk must reach to be heard
    pub mic_threshold: f32,
    pub mix_mode: MixMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            bitrate: DEFAULT_BITRATE_KBPS,
            fps: DEFAULT_FPS,
            fov: DEFAULT_FOV,
            smoothing: 1.0,
            remote_control: false,
            mic_enabled: true,
            game_volume: 1.0,
            mic_volume: 1.0,
            mic_threshold: 1.0,
            mix_mode: MixMode::default(),
        }
    }
}

impl Settings {
    /// Parsed listening port
    pub fn port(&self) -> Result<u16, ConfigError> {
        parse_port(&self.port)
    }

    /// Reset fields that cannot be used as configured.
    ///
    /// Returns true if anything changed.
    pub fn sanitize(&mut self) -> bool {
        if parse_port(&self.port).is_err() {
            tracing::info!("Resetting invalid port {:?} to {}", self.port, DEFAULT_PORT);
            self.port = DEFAULT_PORT.to_string();
            return true;
        }
        false
    }

    /// Microphone capture is only wanted while the host pose drives the camera
    pub fn mic_active(&self) -> bool {
        self.mic_enabled && !self.remote_control
    }
}

/// Parse a port string
pub fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort(value.to_string()))
}

/// Settings persistence
pub trait SettingsStore: Send {
    fn load(&self) -> Result<Settings, ConfigError>;
    fn save(&self, settings: &Settings) -> Result<(), ConfigError>;
}

/// TOML file store
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the platform config directory
    pub fn default_location() -> Result<Self, ConfigError> {
        let dirs = directories::ProjectDirs::from("", "", "stream-bridge")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::new(dirs.config_dir().join("settings.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when the file is missing,
    /// and fix an invalid port in place.
    pub fn load_or_default(&self) -> Settings {
        let mut settings = match self.load() {
            Ok(settings) => settings,
            Err(ConfigError::Read(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No settings at {}, using defaults", self.path.display());
                Settings::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load settings from {}: {}", self.path.display(), e);
                Settings::default()
            }
        };

        if settings.sanitize() {
            if let Err(e) = self.save(&settings) {
                tracing::warn!("Failed to save corrected settings: {}", e);
            }
        }
        settings
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&text)?)
    }

    fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(settings)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

/// In-memory store; clones share the same slot
#[derive(Clone, Default)]
pub struct MemorySettingsStore {
    slot: Arc<Mutex<Option<Settings>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    pub fn saved(&self) -> Option<Settings> {
        self.slot.lock().clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        Ok(self.slot.lock().clone().unwrap_or_default())
    }

    fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        *self.slot.lock() = Some(settings.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("3308").unwrap(), 3308);
        assert_eq!(parse_port(" 9999 ").unwrap(), 9999);
        assert!(parse_port("abc").is_err());
        assert!(parse_port("70000").is_err());
        assert!(parse_port("").is_err());
    }

    #[test]
    fn test_sanitize_resets_invalid_port() {
        let mut settings = Settings {
            port: "not-a-port".to_string(),
            ..Settings::default()
        };
        assert!(settings.sanitize());
        assert_eq!(settings.port, DEFAULT_PORT);

        // Already valid: untouched
        assert!(!settings.sanitize());
    }

    #[test]
    fn test_mix_mode_mapping() {
        assert_eq!(MixMode::from_index(0), MixMode::Average);
        assert_eq!(MixMode::from_index(1), MixMode::GatedAverage);
        assert_eq!(MixMode::from_index(2), MixMode::Add);
        assert_eq!(MixMode::from_index(-1), MixMode::Add);
        assert_eq!(MixMode::from_index(7), MixMode::Add);
        assert_eq!(MixMode::default(), MixMode::Add);

        for index in 0..3 {
            assert_eq!(MixMode::from_index(index).index(), index);
        }
        assert_eq!(MixMode::GatedAverage.label(), "Gated Average");
    }

    #[test]
    fn test_mic_active_requires_local_pose() {
        let mut settings = Settings::default();
        assert!(settings.mic_active());
        settings.remote_control = true;
        assert!(!settings.mic_active());
    }

    #[test]
    fn test_toml_store_persists() {
        let dir = std::env::temp_dir().join(format!("stream-bridge-{}", uuid::Uuid::new_v4()));
        let store = TomlSettingsStore::new(dir.join("settings.toml"));

        // Missing file gives defaults
        assert_eq!(store.load_or_default(), Settings::default());

        let settings = Settings {
            bitrate: 5000,
            mix_mode: MixMode::GatedAverage,
            ..Settings::default()
        };
        store.save(&settings).unwrap();
        assert_eq!(store.load().unwrap(), settings);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_toml_store_fixes_bad_port_on_load() {
        let dir = std::env::temp_dir().join(format!("stream-bridge-{}", uuid::Uuid::new_v4()));
        let store = TomlSettingsStore::new(dir.join("settings.toml"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(store.path(), "port = \"oops\"\nbitrate = 2000\n").unwrap();

        let settings = store.load_or_default();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.bitrate, 2000);
        assert_eq!(store.load().unwrap().port, DEFAULT_PORT);

        let _ = std::fs::remove_dir_all(dir);
    }
}
