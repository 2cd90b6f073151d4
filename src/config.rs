//! Configuration file handling.
//!
//! A TOML file with `[camera]`, `[acquisition]` and `[logging]` sections.
//! Every key is optional; missing keys take the built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::acquisition::Timing;
use crate::controller::ControllerOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Device selection.
    #[serde(default)]
    pub camera: CameraSection,
    /// Acquisition timing.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[camera]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraSection {
    /// Start in simulation mode.
    #[serde(default)]
    pub simulation: bool,
    /// Device to connect to; empty or absent picks the first one found.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// `[acquisition]` section, all values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquisitionConfig {
    /// Bounded wait for the device lock in the acquisition loop.
    pub lock_timeout_ms: u64,
    /// Pause after a failed lock attempt.
    pub lock_retry_ms: u64,
    /// Timeout for a single frame pull.
    pub frame_timeout_ms: u64,
    /// Pause after a driver fault while pulling.
    pub error_backoff_ms: u64,
    /// How long a stop waits for the acquisition thread.
    pub join_timeout_ms: u64,
    /// FPS sampling interval; 0 disables FPS reporting.
    pub fps_interval_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self::from(Timing::default())
    }
}

#[allow(clippy::cast_possible_truncation)]
impl From<Timing> for AcquisitionConfig {
    fn from(timing: Timing) -> Self {
        Self {
            lock_timeout_ms: timing.lock_timeout.as_millis() as u64,
            lock_retry_ms: timing.lock_retry.as_millis() as u64,
            frame_timeout_ms: timing.frame_timeout.as_millis() as u64,
            error_backoff_ms: timing.error_backoff.as_millis() as u64,
            join_timeout_ms: timing.join_timeout.as_millis() as u64,
            fps_interval_ms: timing.fps_interval.as_millis() as u64,
        }
    }
}

impl From<AcquisitionConfig> for Timing {
    fn from(config: AcquisitionConfig) -> Self {
        Self {
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            lock_retry: Duration::from_millis(config.lock_retry_ms),
            frame_timeout: Duration::from_millis(config.frame_timeout_ms),
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            fps_interval: Duration::from_millis(config.fps_interval_ms),
        }
    }
}

/// Log output style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output style.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::default(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML or has unknown keys.
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from `path`, or the defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or a timing
    /// value is zero where a wait is required.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns the TOML error on malformed input or unknown keys.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let acquisition = &self.acquisition;
        for (name, value) in [
            ("lock_timeout_ms", acquisition.lock_timeout_ms),
            ("frame_timeout_ms", acquisition.frame_timeout_ms),
            ("join_timeout_ms", acquisition.join_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "acquisition.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Controller options derived from this configuration.
    #[must_use]
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            simulation: self.camera.simulation,
            timing: self.acquisition.into(),
        }
    }

    /// Configured device, with an empty id treated as absent.
    #[must_use]
    pub fn device_id(&self) -> &str {
        self.camera.device_id.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_defaults_without_path() {
        let config = Config::load(None).expect("defaults");
        assert_eq!(config, Config::default());
        assert_eq!(Timing::from(config.acquisition), Timing::default());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.device_id(), "");
    }

    #[test]
    fn test_load_full_file() {
        let file = write_config(
            r#"
            [camera]
            simulation = true
            device_id = "SIM-USB-1"

            [acquisition]
            frame_timeout_ms = 25
            fps_interval_ms = 0

            [logging]
            level = "debug"
            format = "json"
            "#,
        );
        let config = Config::load(Some(file.path())).expect("load");

        assert!(config.camera.simulation);
        assert_eq!(config.device_id(), "SIM-USB-1");
        assert_eq!(config.logging.format, LogFormat::Json);

        let options = config.controller_options();
        assert!(options.simulation);
        assert_eq!(options.timing.frame_timeout, Duration::from_millis(25));
        assert!(options.timing.fps_interval.is_zero());
        assert_eq!(options.timing.lock_timeout, Timing::default().lock_timeout);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let file = write_config("[camera]\nsimulaton = true\n");
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_zero_join_timeout_is_rejected() {
        let file = write_config("[acquisition]\njoin_timeout_ms = 0\n");
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = Config::load(Some(&dir.path().join("absent.toml"))).expect_err("missing");
        assert!(err.to_string().contains("absent.toml"));
    }
}
