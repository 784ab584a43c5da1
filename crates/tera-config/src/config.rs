//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
pub const CONFIG_FILE_NAME: &str = "blockdata.ron";

/// Top-level block data configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Chunk array construction settings.
    pub storage: StorageConfig,
    /// Deflation policy.
    pub deflate: DeflateConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// How new chunk arrays are created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Element width of the dense backend new chunks start with (4, 8 or 16).
    pub default_bit_width: u8,
    /// Chunk extent as `[size_x, size_y, size_z]`.
    pub chunk_extent: [u32; 3],
}

/// What the standard deflator may do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeflateConfig {
    /// Master switch; when off every deflation request is a no-op.
    pub enabled: bool,
    /// Allow moving to a narrower element width.
    pub narrow_bit_width: bool,
    /// Allow storing uniform columns as a single value.
    pub sparse_columns: bool,
    /// Extra bytes a deflation must save before it is adopted.
    pub min_savings_bytes: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_bit_width: 8,
            chunk_extent: [16, 256, 16],
        }
    }
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            narrow_bit_width: true,
            sparse_columns: true,
            min_savings_bytes: 0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Validation ---

impl Config {
    /// Checks values serde cannot rule out on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let storage = &self.storage;
        if !matches!(storage.default_bit_width, 4 | 8 | 16) {
            return Err(ConfigError::Invalid(format!(
                "storage.default_bit_width must be 4, 8 or 16, got {}",
                storage.default_bit_width
            )));
        }
        if storage.chunk_extent.contains(&0) {
            return Err(ConfigError::Invalid(format!(
                "storage.chunk_extent must be positive, got {:?}",
                storage.chunk_extent
            )));
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `blockdata.ron`.
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
        let new_config = Self::read(&config_dir.join(CONFIG_FILE_NAME))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(config_path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(config_path).map_err(ConfigError::ReadError)?;
        let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }
}
