//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "strata.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and tick settings.
    pub server: ServerConfig,
    /// Interest management settings.
    pub interest: InterestConfig,
    /// Outbound channel settings.
    pub channel: ChannelConfig,
    /// Hit validation tolerances.
    pub validation: ValidationConfig,
    /// Party/guild directory settings.
    pub social: SocialConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Listener and simulation tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the server binds to.
    pub bind_address: String,
    /// Server port.
    pub port: u16,
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Maximum concurrently connected peers.
    pub max_connections: u32,
}

/// Which interest policy decides the per-connection visible set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InterestMode {
    /// Every object that is not hidden from the observer.
    Global,
    /// Objects within `visible_range` of the observer's controlled object.
    Proximity,
}

/// Interest management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterestConfig {
    /// Active interest policy.
    pub mode: InterestMode,
    /// Visible range in meters for [`InterestMode::Proximity`].
    pub visible_range: f32,
    /// Reassign scene object ids in deterministic scene-path order on load.
    pub reorder_scene_object_ids: bool,
}

/// Outbound channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Whether per-tick batches may be LZ4-compressed.
    pub compression_enabled: bool,
    /// Minimum encoded batch size (bytes) before compression is applied.
    pub compression_threshold: usize,
}

/// Hit validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Maximum ratio of implied projectile speed over declared speed.
    pub speed_tolerance: f64,
    /// Dot product above which a claimed destination counts as collinear
    /// with the claimed direction.
    pub collinearity_threshold: f32,
    /// How long a prepared hit registration record stays valid.
    pub hit_record_lifetime_ms: i64,
}

/// Party/guild directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SocialConfig {
    /// Seconds before a pending invitation expires.
    pub invitation_duration_secs: u64,
    /// Maximum members per party.
    pub max_party_members: usize,
    /// Maximum members per guild.
    pub max_guild_members: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the config.
    pub file_logging: bool,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7770,
            tick_rate: 30,
            max_connections: 256,
        }
    }
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            mode: InterestMode::Proximity,
            visible_range: 100.0,
            reorder_scene_object_ids: true,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_threshold: 256,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            speed_tolerance: 1.05,
            collinearity_threshold: 0.75,
            hit_record_lifetime_ms: 10_000,
        }
    }
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            invitation_duration_secs: 10,
            max_party_members: 8,
            max_guild_members: 50,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            file_logging: false,
        }
    }
}

/// Platform config directory for Strata (`<config_dir>/strata`), falling back
/// to the working directory when the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("strata"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `strata.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("port: 7770"));
        assert!(ron_str.contains("speed_tolerance: 1.05"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(server: (), interest: (mode: Global))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.interest.mode, InterestMode::Global);
        assert_eq!(config.interest.visible_range, 100.0);
        assert_eq!(config.validation, ValidationConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.port = 9000;
        config.validation.speed_tolerance = 1.1;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.interest.visible_range = 250.0;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().interest.visible_range, 250.0);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}
