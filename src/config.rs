//! Engine configuration.
//!
//! Configuration is loaded once at startup (never in the hot loop) from:
//! 1. Built-in defaults
//! 2. A TOML file (default `scanrun.toml`)
//! 3. Environment variables prefixed with `SCANRUN_` (nested keys separated
//!    by `__`, e.g. `SCANRUN_SAFETY__IGNORE_DAYLIGHT=true`)
//!
//! later sources overriding earlier ones. `RunConfig::validate` catches
//! values that parse fine but are semantically wrong; any configuration
//! error is fatal at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Observing site location (for the daylight gate)
    #[serde(default)]
    pub site: SiteConfig,
    /// Filesystem collaborators
    #[serde(default)]
    pub paths: PathsConfig,
    /// Poll interval and timeouts
    #[serde(default)]
    pub timing: TimingConfig,
    /// Daylight and stow behavior
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Optional startup auto-homing
    #[serde(default)]
    pub homing: HomingConfig,
    /// Calibration frame counts and flat geometry
    #[serde(default)]
    pub calib: CalibConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site latitude, degrees north
    pub latitude_deg: f64,
    /// Site longitude, degrees east
    pub longitude_deg: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// The persisted scan queue this engine drains
    pub queue_file: PathBuf,
    /// Directory holding one `<Name>.sock` per device channel
    pub channel_dir: PathBuf,
    /// Device readiness document published by the control daemons
    pub status_file: PathBuf,
    /// Weather document published by the weather daemon
    pub weather_file: PathBuf,
    /// Where finished composite calibration frames land
    pub calib_dir: PathBuf,
    /// Scratch space for raw intermediate frames
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Bound on one device-bus wait
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Max time to wait for devices to set up before a run
    pub setup_timeout_s: i64,
    /// Max time for a full-frame camera download
    pub camera_download_max_s: i64,
    /// Weather status older than this is treated as invalid
    #[serde(with = "humantime_serde")]
    pub weather_max_age: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Degrees the sun must be below the horizon to count as dark
    pub sun_down_deg: f64,
    /// Stow altitude commanded at dawn, degrees
    pub stow_alt_deg: f64,
    /// Stow azimuth commanded at dawn, degrees
    pub stow_az_deg: f64,
    /// Run regardless of daylight (testing / solar work)
    pub ignore_daylight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomingConfig {
    /// Home telescope/focus/filter at startup if the status says unhomed
    pub auto_home: bool,
    /// How long to allow homing to complete
    #[serde(with = "humantime_serde")]
    pub home_wait: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibConfig {
    /// Raw frames per bias composite
    pub bias_frames: u32,
    /// Raw frames per thermal composite
    pub thermal_frames: u32,
    /// Seconds per raw thermal frame
    pub thermal_dur_s: f64,
    /// Raw frames per flat composite
    pub flat_frames: u32,
    /// Seconds per raw flat frame
    pub flat_dur_s: f64,
    /// Telescope altitude for the flat panel, degrees
    pub flat_alt_deg: f64,
    /// Telescope azimuth for the flat panel, degrees
    pub flat_az_deg: f64,
    /// Dome azimuth for flats, degrees; 0 = dome position is irrelevant
    pub flat_dome_az_deg: f64,
    /// Max dome position error for flats, degrees
    pub dome_tol_deg: f64,
    /// Lights level commanded for flats
    pub flat_lights: i32,
    /// Composite builder program (receives an argv, never a shell string)
    pub composite_cmd: String,
    /// Post-processing program for finished science frames
    pub postprocess_cmd: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            latitude_deg: 0.0,
            longitude_deg: 0.0,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            queue_file: PathBuf::from("archive/queue/scanrun.slq"),
            channel_dir: PathBuf::from("comm"),
            status_file: PathBuf::from("comm/status.json"),
            weather_file: PathBuf::from("comm/weather.json"),
            calib_dir: PathBuf::from("archive/calib"),
            tmp_dir: PathBuf::from("/tmp"),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            setup_timeout_s: 60,
            camera_download_max_s: 30,
            weather_max_age: Duration::from_secs(30),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sun_down_deg: 12.0,
            stow_alt_deg: 20.0,
            stow_az_deg: 180.0,
            ignore_daylight: false,
        }
    }
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            auto_home: false,
            home_wait: Duration::from_secs(100),
        }
    }
}

impl Default for CalibConfig {
    fn default() -> Self {
        Self {
            bias_frames: 5,
            thermal_frames: 5,
            thermal_dur_s: 60.0,
            flat_frames: 5,
            flat_dur_s: 1.0,
            flat_alt_deg: 45.0,
            flat_az_deg: 0.0,
            flat_dome_az_deg: 0.0,
            dome_tol_deg: 2.0,
            flat_lights: 3,
            composite_cmd: String::from("calimage"),
            postprocess_cmd: String::from("postprocess"),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            paths: PathsConfig::default(),
            timing: TimingConfig::default(),
            safety: SafetyConfig::default(),
            homing: HomingConfig::default(),
            calib: CalibConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load from the default location (`scanrun.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("scanrun.toml")
    }

    /// Load configuration from a specific TOML file, with environment
    /// overrides on top.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let cfg: RunConfig = Figment::from(Serialized::defaults(RunConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCANRUN_").split("__"))
            .extract()
            .map_err(Box::new)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic checks on values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-90.0..=90.0).contains(&self.site.latitude_deg) {
            return Err(ConfigError::Validation(format!(
                "site.latitude_deg {} out of range",
                self.site.latitude_deg
            )));
        }
        if !(-180.0..=360.0).contains(&self.site.longitude_deg) {
            return Err(ConfigError::Validation(format!(
                "site.longitude_deg {} out of range",
                self.site.longitude_deg
            )));
        }
        if self.timing.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "timing.poll_interval must be non-zero".into(),
            ));
        }
        if self.timing.setup_timeout_s <= 0 {
            return Err(ConfigError::Validation(
                "timing.setup_timeout_s must be positive".into(),
            ));
        }
        if self.timing.camera_download_max_s < 0 {
            return Err(ConfigError::Validation(
                "timing.camera_download_max_s must not be negative".into(),
            ));
        }
        for (name, n) in [
            ("calib.bias_frames", self.calib.bias_frames),
            ("calib.thermal_frames", self.calib.thermal_frames),
            ("calib.flat_frames", self.calib.flat_frames),
        ] {
            if n == 0 {
                return Err(ConfigError::Validation(format!("{name} must be at least 1")));
            }
        }
        if self.calib.thermal_dur_s < 0.0 {
            return Err(ConfigError::Validation(
                "calib.thermal_dur_s must not be negative".into(),
            ));
        }
        if self.calib.flat_dur_s < 0.0 {
            return Err(ConfigError::Validation(
                "calib.flat_dur_s must not be negative".into(),
            ));
        }
        if self.calib.composite_cmd.is_empty() || self.calib.postprocess_cmd.is_empty() {
            return Err(ConfigError::Validation(
                "calib.composite_cmd and calib.postprocess_cmd must be set".into(),
            ));
        }
        Ok(())
    }
}
