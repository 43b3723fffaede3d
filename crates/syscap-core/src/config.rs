//! Configuration system for syscap
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of ring geometry and converter bounds

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default bound on successive conversion passes for a single event
pub const DEFAULT_MAX_CONVERSION_PASSES: u32 = 50;

/// Default capacity of the per-context conversion state
pub const DEFAULT_MAX_PENDING_CONTEXTS: usize = 65536;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete syscap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyscapConfig {
    /// Sensor settings
    pub sensor: SensorSettings,

    /// Ring buffer settings
    pub capture: CaptureSettings,

    /// Schema converter settings
    pub converter: ConverterSettings,
}

/// Sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Ring buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Number of buffers to open (0 = one per online CPU)
    pub buffer_count: usize,

    /// Data pages per buffer (must be a power of two)
    pub data_pages: usize,

    /// Page size in bytes
    pub page_size: usize,
}

impl CaptureSettings {
    /// Size of each buffer's data region in bytes
    pub fn data_size(&self) -> usize {
        self.data_pages.saturating_mul(self.page_size)
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_count: 0,
            data_pages: 256,
            page_size: 4096,
        }
    }
}

/// Schema converter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterSettings {
    /// Convert legacy layouts (disable to pass events through untouched)
    pub enabled: bool,

    /// Maximum successive conversion passes for one event
    pub max_passes: u32,

    /// Maximum execution contexts with a pending stashed event
    pub max_pending_contexts: usize,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_passes: DEFAULT_MAX_CONVERSION_PASSES,
            max_pending_contexts: DEFAULT_MAX_PENDING_CONTEXTS,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. SYSCAP_CONFIG environment variable
    /// 3. ~/.config/syscap/config.toml
    /// 4. /etc/syscap/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SyscapConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            SyscapConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("SYSCAP_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("SYSCAP_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("syscap").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/syscap/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<SyscapConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: SyscapConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut SyscapConfig) {
        if let Ok(val) = std::env::var("SYSCAP_LOG_LEVEL") {
            config.sensor.log_level = val;
        }

        if let Ok(val) = std::env::var("SYSCAP_BUFFER_COUNT") {
            if let Ok(count) = val.parse() {
                config.capture.buffer_count = count;
            }
        }
        if let Ok(val) = std::env::var("SYSCAP_DATA_PAGES") {
            if let Ok(pages) = val.parse() {
                config.capture.data_pages = pages;
            }
        }

        if let Ok(val) = std::env::var("SYSCAP_CONVERTER_ENABLED") {
            config.converter.enabled = val.parse().unwrap_or(config.converter.enabled);
        }
        if let Ok(val) = std::env::var("SYSCAP_MAX_CONVERSION_PASSES") {
            if let Ok(passes) = val.parse() {
                config.converter.max_passes = passes;
            }
        }
        if let Ok(val) = std::env::var("SYSCAP_MAX_PENDING_CONTEXTS") {
            if let Ok(max) = val.parse() {
                config.converter.max_pending_contexts = max;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &SyscapConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if !config.capture.data_pages.is_power_of_two() {
            return Err(ConfigError::ValidationError(format!(
                "data_pages must be a power of two, got {}",
                config.capture.data_pages
            )));
        }

        if !config.capture.page_size.is_power_of_two() || config.capture.page_size < 64 {
            return Err(ConfigError::ValidationError(format!(
                "page_size must be a power of two of at least 64 bytes, got {}",
                config.capture.page_size
            )));
        }

        if config.converter.max_passes == 0 {
            return Err(ConfigError::ValidationError(
                "converter.max_passes must be at least 1".to_string(),
            ));
        }

        if config.converter.max_pending_contexts == 0 {
            return Err(ConfigError::ValidationError(
                "converter.max_pending_contexts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &SyscapConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("syscap").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyscapConfig::default();
        assert_eq!(config.sensor.log_level, "info");
        assert_eq!(config.capture.data_size(), 256 * 4096);
        assert!(config.converter.enabled);
        assert_eq!(config.converter.max_passes, 50);
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "debug"
        "#;
        let config: SyscapConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "debug");
        // Other fields should be default
        assert_eq!(config.capture.data_pages, 256);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "trace"

            [capture]
            buffer_count = 4
            data_pages = 8
            page_size = 4096

            [converter]
            enabled = false
            max_passes = 10
            max_pending_contexts = 128
        "#;

        let config: SyscapConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "trace");
        assert_eq!(config.capture.buffer_count, 4);
        assert_eq!(config.capture.data_size(), 8 * 4096);
        assert!(!config.converter.enabled);
        assert_eq!(config.converter.max_passes, 10);
        assert_eq!(config.converter.max_pending_contexts, 128);
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = SyscapConfig {
            sensor: SensorSettings {
                log_level: "invalid".to_string(),
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_non_power_of_two_pages() {
        let config = SyscapConfig {
            capture: CaptureSettings {
                data_pages: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_zero_passes() {
        let config = SyscapConfig {
            converter: ConverterSettings {
                max_passes: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SyscapConfig::default();
        config.converter.max_passes = 7;

        let loader = ConfigLoader::new();
        loader.save(&config, &path).unwrap();
        let loaded = loader.load_from_file(&path).unwrap();
        assert_eq!(loaded.converter.max_passes, 7);
    }

    #[test]
    fn test_load_missing_file() {
        let loader = ConfigLoader::new();
        let err = loader
            .load_from_file(Path::new("/nonexistent/syscap.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_serialize_config() {
        let config = SyscapConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[sensor]"));
        assert!(toml_str.contains("max_passes"));
    }
}
