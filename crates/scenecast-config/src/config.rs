//! Configuration structs with defaults and RON persistence.

use std::path::{Path, PathBuf};

use scenecast_net::{ServerInfoMessage, ServerSettings};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and connection settings.
    pub server: ServerSettings,
    /// Handshake sent to every client.
    pub info: ServerInfoMessage,
    /// Logging settings.
    pub debug: DebugConfig,
    /// Demo producer settings.
    pub demo: DemoConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Filter directive, e.g. "info" or "info,scenecast_net=debug".
    pub log_level: String,
    /// Directory for the JSON log file. No file is written when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Demo producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    /// Frames per second.
    pub frame_rate: u32,
    /// Number of animated shapes.
    pub shape_count: u32,
    /// Resource bytes streamed per frame and client; 0 is unlimited.
    pub transfer_budget: usize,
    /// Run the monitor on a background thread.
    pub async_monitor: bool,
    /// How long to wait for the first client before starting, in ms.
    pub wait_for_client_ms: u64,
    /// Stop after this many frames; 0 runs until interrupted.
    pub max_frames: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            shape_count: 8,
            transfer_budget: 16 * 1024,
            async_monitor: true,
            wait_for_client_ms: 5000,
            max_frames: 0,
        }
    }
}

/// Platform config directory for scenecast, e.g. `~/.config/scenecast`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scenecast")
}

// --- Load / Save / Reload ---

impl Config {
    /// Load `config.ron` from `config_dir`, writing a default one if absent.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            let config = Self::read(&path)?;
            log::info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Save as `config.ron` in `config_dir`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(&path, serialized).map_err(|source| ConfigError::Write { path, source })
    }

    /// Re-read the file. Returns `Some` only if its contents differ from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = Self::read(&config_dir.join(CONFIG_FILE))?;
        if &fresh != self {
            log::info!("Config reloaded with changes");
            Ok(Some(fresh))
        } else {
            Ok(None)
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.listen_port.checked_add(server.port_range).is_none() {
            return Err(ConfigError::Invalid {
                field: "server.port_range",
                reason: format!(
                    "{} + {} exceeds the port space",
                    server.listen_port, server.port_range
                ),
            });
        }
        if server.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "server.poll_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.info.time_unit == 0 {
            return Err(ConfigError::Invalid {
                field: "info.time_unit",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.demo.frame_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "demo.frame_rate",
                reason: "must be at least 1".to_string(),
            });
        }
        if server.compress && !server.collate {
            log::warn!("compression has no effect without collation");
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecast_net::CoordinateFrame;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("listen_port: 33500"));
        assert!(ron_str.contains("time_unit: 1000"));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = ron::from_str("(server: (listen_port: 4000))").unwrap();
        assert_eq!(config.server.listen_port, 4000);
        assert!(config.server.collate);
        assert_eq!(config.info, ServerInfoMessage::default());
        assert_eq!(config.demo, DemoConfig::default());
    }

    #[test]
    fn test_unknown_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_coordinate_frame_by_name() {
        let config: Config = ron::from_str("(info: (coordinate_frame: XzNegY))").unwrap();
        assert_eq!(config.info.coordinate_frame, CoordinateFrame::XzNegY);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.listen_port = 40000;
        config.server.compress = true;
        config.debug.log_dir = Some(dir.path().join("logs"));

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let config = Config::load_or_create(&nested).unwrap();
        assert_eq!(config, Config::default());
        assert!(nested.join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.demo.frame_rate = 60;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.demo.frame_rate, 60);
    }

    #[test]
    fn test_invalid_ron_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn test_validate_rejects_port_overflow() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.server.listen_port = u16::MAX;
        config.server.port_range = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "server.port_range",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut config = Config::default();
        config.demo.frame_rate = 0;
        assert!(config.validate().is_err());
    }
}
