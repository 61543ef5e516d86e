//! Persistent application configuration model and defaults (§2a, §6a).

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::models::GainMode;

/// Root configuration persisted to `settings.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub replay_gain: ReplayGainSettings,
    #[serde(default = "default_theme_mode")]
    pub theme_mode: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            replay_gain: ReplayGainSettings::default(),
            theme_mode: default_theme_mode(),
        }
    }
}

/// Transport timeout/retry knobs (§6a).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connection_timeout_ms", with = "duration_ms")]
    pub connection_timeout: Duration,
    #[serde(default = "default_request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(default = "default_metadata_timeout_ms", with = "duration_ms")]
    pub metadata_timeout: Duration,
    #[serde(default = "default_streaming_timeout_ms", with = "duration_ms")]
    pub streaming_timeout: Duration,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_base_backoff_ms", with = "duration_ms")]
    pub base_backoff: Duration,
    #[serde(default = "default_max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_timeout: default_connection_timeout_ms(),
            request_timeout: default_request_timeout_ms(),
            metadata_timeout: default_metadata_timeout_ms(),
            streaming_timeout: default_streaming_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            base_backoff: default_base_backoff_ms(),
            max_backoff: default_max_backoff_ms(),
        }
    }
}

/// ReplayGain preferences applied by the `GainProvider` (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplayGainSettings {
    #[serde(default = "default_gain_mode")]
    pub mode: GainMode,
    #[serde(default)]
    pub preamp_db: f32,
    #[serde(default = "default_true")]
    pub prevent_clip: bool,
    #[serde(default = "default_fallback_gain_db")]
    pub fallback_gain_db: f32,
}

impl Default for ReplayGainSettings {
    fn default() -> Self {
        Self {
            mode: default_gain_mode(),
            preamp_db: 0.0,
            prevent_clip: true,
            fallback_gain_db: default_fallback_gain_db(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

fn default_true() -> bool {
    true
}

fn default_theme_mode() -> String {
    "system".to_string()
}

fn default_gain_mode() -> GainMode {
    GainMode::Off
}

fn default_fallback_gain_db() -> f32 {
    -6.0
}

fn default_connection_timeout_ms() -> Duration {
    Duration::from_millis(5_000)
}

fn default_request_timeout_ms() -> Duration {
    Duration::from_millis(15_000)
}

fn default_metadata_timeout_ms() -> Duration {
    Duration::from_millis(10_000)
}

fn default_streaming_timeout_ms() -> Duration {
    Duration::from_millis(30_000)
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff_ms() -> Duration {
    Duration::from_millis(10_000)
}

impl Settings {
    /// Loads settings from `<data_dir>/settings.toml`, falling back to defaults on any error.
    pub fn load(data_dir: &Path) -> Self {
        let path = settings_path(data_dir);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!("Settings: failed to parse {}: {err}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persists settings to `<data_dir>/settings.toml`. Failures are logged, never fatal (§7).
    pub fn save(&self, data_dir: &Path) {
        let path = settings_path(data_dir);
        let serialized = match toml::to_string_pretty(self) {
            Ok(text) => text,
            Err(err) => {
                warn!("Settings: failed to serialize settings: {err}");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("Settings: failed to create data dir {}: {err}", parent.display());
                return;
            }
        }
        if let Err(err) = std::fs::write(&path, serialized) {
            warn!("Settings: failed to write {}: {err}", path.display());
        }
    }
}

fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_have_expected_values() {
        let settings = Settings::default();
        assert_eq!(settings.network.max_retry_attempts, 3);
        assert_eq!(settings.network.base_backoff, Duration::from_millis(500));
        assert_eq!(settings.replay_gain.mode, GainMode::Off);
        assert!(settings.replay_gain.prevent_clip);
        assert_eq!(settings.theme_mode, "system");
    }

    #[test]
    fn test_legacy_partial_toml_fills_in_defaults() {
        let legacy = r#"
[network]
max_retry_attempts = 5
"#;
        let parsed: Settings = toml::from_str(legacy).expect("settings should parse");
        assert_eq!(parsed.network.max_retry_attempts, 5);
        assert_eq!(parsed.network.connection_timeout, Duration::from_millis(5_000));
        assert_eq!(parsed.replay_gain.mode, GainMode::Off);
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!(
            "playback-core-settings-test-{:?}",
            std::thread::current().id()
        ));
        let mut settings = Settings::default();
        settings.replay_gain.preamp_db = 3.5;
        settings.save(&dir);
        let loaded = Settings::load(&dir);
        assert_eq!(loaded.replay_gain.preamp_db, 3.5);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
