//! Layered settings using Figment.
//!
//! Settings are assembled from, in increasing priority:
//! 1. built-in defaults
//! 2. a TOML file (optional)
//! 3. environment variables prefixed with `QAS_`, nested with `__`
//!
//! ```toml
//! log_level = "info"
//!
//! [paths]
//! root = "/nsls2/data/qas-new/legacy"
//!
//! [streaming]
//! mount_check_wait = "10s"
//! mount_check = "once"
//!
//! [flyer]
//! complete_timeout = "5m"
//! ```
//!
//! `QAS_STREAMING__SAMPLE_MARGIN=1.5` overrides `streaming.sample_margin`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, FlyerError};

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "QAS_";

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Output locations
    pub paths: PathSettings,
    /// Pizza-box channel settings
    pub channels: ChannelSettings,
    /// Streaming box settings
    pub streaming: StreamingSettings,
    /// Trigger output settings
    pub trigger: TriggerSettings,
    /// Flyer settings
    pub flyer: FlyerSettings,
    /// Monochromator trajectory settings
    pub trajectory: TrajectorySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            paths: PathSettings::default(),
            channels: ChannelSettings::default(),
            streaming: StreamingSettings::default(),
            trigger: TriggerSettings::default(),
            flyer: FlyerSettings::default(),
            trajectory: TrajectorySettings::default(),
        }
    }
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Beamline data root (`ROOT_PATH`)
    pub root: PathBuf,
    /// Raw data directory below the root (`RAW_FILEPATH`)
    pub raw_subdir: String,
    /// User data directory below the root, where processed files land
    pub user_subdir: String,
    /// Directory the pizza-box writes channel files into
    pub pizzabox_dir: PathBuf,
    /// Directory probed by the streaming box mount check
    pub mount_root: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/nsls2/data/qas-new/legacy"),
            raw_subdir: "raw".to_string(),
            user_subdir: "users".to_string(),
            pizzabox_dir: PathBuf::from("/epics/pb_data"),
            mount_root: PathBuf::from("/nsls2/data/qas-new/legacy/raw/apb"),
        }
    }
}

/// How a channel turns its file into datums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPolicy {
    /// One datum per acquisition
    Single,
    /// Wait for the file, then one datum per `chunk_size` rows
    FromFile,
}

/// Pizza-box channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Rows per datum chunk
    pub chunk_size: usize,
    /// Length limit of the file path register
    pub path_limit: Option<usize>,
    /// Datum generation policy
    pub chunking: ChunkPolicy,
    /// Interval between checks for a finished channel file
    #[serde(with = "humantime_serde")]
    pub file_poll_interval: Duration,
    /// Bound on waiting for a channel file
    #[serde(with = "humantime_serde")]
    pub file_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            path_limit: Some(40),
            chunking: ChunkPolicy::Single,
            file_poll_interval: Duration::from_millis(100),
            file_timeout: Duration::from_secs(5),
        }
    }
}

/// When the streaming box mount check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountCheckPolicy {
    /// First kickoff of each flyer; a success is cached
    Once,
    /// Every kickoff
    EveryScan,
    /// Never
    Disabled,
}

/// Streaming box settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Oversizing factor for the expected sample count
    pub sample_margin: f64,
    /// Expected sample counts are rounded to a multiple of this
    pub rounding_quantum: u64,
    /// Samples requested by the mount check acquisition
    pub mount_check_samples: u64,
    /// Bound on waiting for the mount check files
    #[serde(with = "humantime_serde")]
    pub mount_check_wait: Duration,
    /// When the mount check runs
    pub mount_check: MountCheckPolicy,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            sample_margin: 1.3,
            rounding_quantum: 100,
            mount_check_samples: 2000,
            mount_check_wait: Duration::from_secs(10),
            mount_check: MountCheckPolicy::Once,
        }
    }
}

/// Trigger output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    /// Pause between enabling stream mode and starting pulse generation
    #[serde(with = "humantime_serde")]
    pub stream_settle: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            stream_settle: Duration::from_millis(200),
        }
    }
}

/// Flyer settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlyerSettings {
    /// Bound on `complete()`; unbounded when absent
    #[serde(with = "humantime_serde")]
    pub complete_timeout: Option<Duration>,
    /// Bound on `kickoff()` reaching the motor start; unbounded when absent
    #[serde(with = "humantime_serde")]
    pub kickoff_timeout: Option<Duration>,
}

/// Monochromator trajectory settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectorySettings {
    /// Controller servo rate in points per second
    pub servo_rate_hz: f64,
    /// Trajectory size (points) per lookup table slot
    pub lut_sizes: BTreeMap<String, u64>,
}

impl Default for TrajectorySettings {
    fn default() -> Self {
        Self {
            servo_rate_hz: 16000.0,
            lut_sizes: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Provider stack: defaults, then `path` (if given), then environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML string on top of the defaults, without environment.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(text))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check values that parse but make no sense.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(FlyerError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.paths.root.as_os_str().is_empty() {
            return Err(FlyerError::Configuration("paths.root is empty".into()));
        }
        if self.channels.chunk_size == 0 {
            return Err(FlyerError::Configuration(
                "channels.chunk_size must be positive".into(),
            ));
        }
        if !(self.streaming.sample_margin.is_finite() && self.streaming.sample_margin >= 1.0) {
            return Err(FlyerError::Configuration(format!(
                "streaming.sample_margin {} must be >= 1.0",
                self.streaming.sample_margin
            )));
        }
        if self.streaming.rounding_quantum == 0 {
            return Err(FlyerError::Configuration(
                "streaming.rounding_quantum must be positive".into(),
            ));
        }
        if self.trajectory.servo_rate_hz <= 0.0 {
            return Err(FlyerError::Configuration(
                "trajectory.servo_rate_hz must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.channels.chunk_size, 1024);
        assert_eq!(settings.flyer.complete_timeout, None);
        assert_eq!(settings.streaming.mount_check, MountCheckPolicy::Once);
    }

    #[test]
    fn toml_overrides_defaults_with_humantime_durations() {
        let settings = Settings::from_toml_str(
            r#"
            [streaming]
            mount_check_wait = "250ms"
            mount_check = "every_scan"

            [flyer]
            complete_timeout = "2m"

            [trajectory.lut_sizes]
            "3" = 160000
            "#,
        )
        .unwrap();
        assert_eq!(settings.streaming.mount_check_wait, Duration::from_millis(250));
        assert_eq!(settings.streaming.mount_check, MountCheckPolicy::EveryScan);
        assert_eq!(settings.flyer.complete_timeout, Some(Duration::from_secs(120)));
        assert_eq!(settings.trajectory.lut_sizes.get("3"), Some(&160000));
        assert_eq!(settings.streaming.sample_margin, 1.3);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let err = Settings::from_toml_str("[channels]\nchunk_size = 0\n").unwrap_err();
        assert!(err.is_configuration());
        assert!(Settings::from_toml_str("log_level = \"loud\"").is_err());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[streaming]\nsample_margin = 1.4").unwrap();
        std::env::set_var("QAS_STREAMING__SAMPLE_MARGIN", "1.5");
        let settings = Settings::load(Some(file.path()));
        std::env::remove_var("QAS_STREAMING__SAMPLE_MARGIN");
        assert_eq!(settings.unwrap().streaming.sample_margin, 1.5);
    }

    #[test]
    #[serial]
    fn file_is_used_without_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[streaming]\nsample_margin = 1.4").unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.streaming.sample_margin, 1.4);
    }
}
