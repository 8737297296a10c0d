//! Bridge configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Apple endpoint settings.
    pub apple: AppleConfig,
    /// Anisette server settings.
    pub anisette: AnisetteConfig,
    /// Traccar target settings.
    pub traccar: TraccarConfig,
    /// Polling settings.
    pub poll: PollConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Plist export ingestion settings.
    pub plists: PlistConfig,
    /// Beacons to track.
    #[serde(default)]
    pub beacons: Vec<BeaconConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Overlay settings from `FMBRIDGE_*` environment variables.
    ///
    /// Environment wins over file values, so a containerized deployment can
    /// run without any config file at all.
    pub fn apply_env(&mut self) {
        self.apply_env_from(std::env::vars());
    }

    /// Overlay settings from an explicit variable iterator.
    pub fn apply_env_from(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (name, value) in vars {
            match name.as_str() {
                "FMBRIDGE_AUTH_URL" => self.apple.auth_url = value,
                "FMBRIDGE_FETCH_URL" => self.apple.fetch_url = value,
                "FMBRIDGE_ANISETTE_URL" => self.anisette.url = value,
                "FMBRIDGE_TRACCAR_URL" => self.traccar.url = value,
                "FMBRIDGE_POLL_INTERVAL" => {
                    if let Ok(secs) = value.parse() {
                        self.poll.interval_secs = secs;
                    }
                }
                "FMBRIDGE_DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
                "FMBRIDGE_PLIST_DIR" => self.plists.dir = Some(PathBuf::from(value)),
                "FMBRIDGE_PRIVATE_KEYS" => {
                    self.beacons = value
                        .split(',')
                        .map(str::trim)
                        .filter(|key| !key.is_empty())
                        .map(|key| BeaconConfig {
                            private_key: key.to_string(),
                            label: None,
                        })
                        .collect();
                }
                _ => {}
            }
        }
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - All endpoint URLs parse as absolute URLs
    /// - The poll interval is within bounds (1 minute - 1 day)
    /// - The data directory is not empty
    /// - Beacon keys are present and unique
    /// - At least one input source (beacons or a plist directory) exists
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.apple.validate());
        errors.extend(self.anisette.validate());
        errors.extend(self.traccar.validate());
        errors.extend(self.poll.validate());
        errors.extend(self.storage.validate());

        let mut seen_keys = std::collections::HashSet::new();
        for (i, beacon) in self.beacons.iter().enumerate() {
            let prefix = format!("beacons[{}]", i);
            errors.extend(beacon.validate(&prefix));

            if !seen_keys.insert(beacon.private_key.as_str()) {
                errors.push(ValidationError {
                    field: format!("{}.private_key", prefix),
                    message: "duplicate beacon key".to_string(),
                });
            }
        }

        if self.beacons.is_empty() && self.plists.dir.is_none() {
            errors.push(ValidationError {
                field: "beacons".to_string(),
                message: "no beacons configured and no plist directory set; nothing to bridge"
                    .to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Apple endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppleConfig {
    /// Authentication service URL (login, 2FA, token refresh).
    pub auth_url: String,
    /// Report-fetch gateway URL.
    pub fetch_url: String,
}

impl Default for AppleConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://127.0.0.1:8090".to_string(),
            fetch_url: fmbridge_core::client::DEFAULT_FETCH_URL.to_string(),
        }
    }
}

impl AppleConfig {
    /// Validate Apple endpoint configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        errors.extend(validate_url("apple.auth_url", &self.auth_url));
        errors.extend(validate_url("apple.fetch_url", &self.fetch_url));
        errors
    }
}

/// Anisette server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnisetteConfig {
    /// Anisette server URL.
    pub url: String,
}

impl Default for AnisetteConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:6969".to_string(),
        }
    }
}

impl AnisetteConfig {
    /// Validate anisette configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        validate_url("anisette.url", &self.url)
    }
}

/// Traccar target configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraccarConfig {
    /// OsmAnd endpoint URL of the Traccar instance.
    pub url: String,
}

impl Default for TraccarConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5055".to_string(),
        }
    }
}

impl TraccarConfig {
    /// Validate Traccar configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        validate_url("traccar.url", &self.url)
    }
}

/// Polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Seconds between poll cycles.
    pub interval_secs: u64,
}

/// Minimum poll interval in seconds (1 minute).
pub const MIN_POLL_INTERVAL: u64 = 60;
/// Maximum poll interval in seconds (1 day).
pub const MAX_POLL_INTERVAL: u64 = 86_400;

impl Default for PollConfig {
    fn default() -> Self {
        // One hour; polling Apple harder than this risks rate limiting.
        Self {
            interval_secs: 3600,
        }
    }
}

impl PollConfig {
    /// Validate polling configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.interval_secs < MIN_POLL_INTERVAL {
            errors.push(ValidationError {
                field: "poll.interval_secs".to_string(),
                message: format!(
                    "poll interval {} is too short (minimum {} seconds)",
                    self.interval_secs, MIN_POLL_INTERVAL
                ),
            });
        } else if self.interval_secs > MAX_POLL_INTERVAL {
            errors.push(ValidationError {
                field: "poll.interval_secs".to_string(),
                message: format!(
                    "poll interval {} is too long (maximum {} seconds / 1 day)",
                    self.interval_secs, MAX_POLL_INTERVAL
                ),
            });
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the persisted session and poll marker.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.data_dir".to_string(),
                message: "data directory cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Plist export ingestion configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlistConfig {
    /// Directory scanned for AirTag export files; ingestion is off when unset.
    pub dir: Option<PathBuf>,
}

/// Configuration for one tracked beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Base64-encoded P-224 private key.
    pub private_key: String,
    /// Friendly label for logs.
    #[serde(default)]
    pub label: Option<String>,
}

impl BeaconConfig {
    /// Validate beacon configuration.
    ///
    /// Only shape checks happen here; whether the key decodes to a valid
    /// P-224 scalar is settled when the beacon is loaded at startup.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.private_key.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.private_key", prefix),
                message: "private key cannot be empty".to_string(),
            });
        }

        if let Some(label) = &self.label {
            if label.is_empty() {
                errors.push(ValidationError {
                    field: format!("{}.label", prefix),
                    message: "label cannot be empty string (use null/omit instead)".to_string(),
                });
            }
        }

        errors
    }
}

fn validate_url(field: &str, value: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if value.is_empty() {
        errors.push(ValidationError {
            field: field.to_string(),
            message: "URL cannot be empty".to_string(),
        });
    } else if let Err(e) = reqwest::Url::parse(value) {
        errors.push(ValidationError {
            field: field.to_string(),
            message: format!("invalid URL '{}': {}", value, e),
        });
    }

    errors
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `traccar.url` or `beacons[0].private_key`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fmbridge")
        .join("config.toml")
}

/// Default data directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fmbridge")
}
