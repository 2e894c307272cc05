//! Externally published device and weather state.
//!
//! The device-control daemons publish a small JSON document describing the
//! readiness of each axis; the weather daemon publishes another with an
//! alert bit and a freshness timestamp. This engine only ever reads the few
//! fields below and re-reads them once per tick, keeping the last good copy
//! when a read or parse fails (a daemon rewriting the file mid-read is not
//! an error worth acting on).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Camera acquisition state as published by the camera daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    #[default]
    Idle,
    Exposing,
    Reading,
}

/// Telescope mount state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TelescopeState {
    Absent,
    #[default]
    Stopped,
    Slewing,
    Hunting,
    Tracking,
    Homing,
}

/// Dome shutter (or roll-off roof) state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutterState {
    #[default]
    Absent,
    Open,
    Opening,
    Closed,
    Closing,
}

/// Dome rotation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DomeState {
    #[default]
    Absent,
    Stopped,
    Rotating,
    Homing,
}

/// Snapshot of device readiness, published by the control daemons.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct DeviceStatus {
    pub camera: CameraState,
    pub telescope: TelescopeState,
    pub shutter: ShutterState,
    pub dome: DomeState,
    /// Current dome azimuth, degrees
    pub dome_az_deg: f64,
    /// Dome in position (or tracking the slit) and not in error
    pub dome_ready: bool,
    /// A filter wheel exists on this installation
    pub filter_present: bool,
    /// Filter wheel settled on the commanded slot
    pub filter_ready: bool,
    /// Currently selected filter code, if known
    pub filter: Option<char>,
    /// A focuser exists on this installation
    pub focus_present: bool,
    /// Focuser settled
    pub focus_ready: bool,
    /// Flat-field lights level; negative = no lights installed
    pub lights: i32,
    /// Every axis that needs homing reports homed
    pub homed: bool,
}

/// Weather summary published by the weather daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeatherStatus {
    /// When the producer last updated this document
    pub updated: DateTime<Utc>,
    /// Conditions demand that nothing runs
    pub alert: bool,
}

impl Default for WeatherStatus {
    fn default() -> Self {
        Self {
            // an epoch-old default can never be considered fresh
            updated: DateTime::<Utc>::UNIX_EPOCH,
            alert: false,
        }
    }
}

impl DeviceStatus {
    /// Read the published document, or `None` if it is missing or garbled.
    pub fn load(path: &Path) -> Option<Self> {
        load_json(path)
    }
}

impl WeatherStatus {
    pub fn load(path: &Path) -> Option<Self> {
        load_json(path)
    }

    /// Alert counts only while the document is fresh.
    pub fn alerting(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        let fresh = now
            .signed_duration_since(self.updated)
            .to_std()
            .map(|age| age <= max_age)
            .unwrap_or(true); // updated in the (near) future: treat as fresh
        fresh && self.alert
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "status read failed, keeping last");
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "status parse failed, keeping last");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_device_status_roundtrip() {
        let mut st = DeviceStatus::default();
        st.camera = CameraState::Exposing;
        st.filter = Some('R');
        st.lights = 2;

        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", serde_json::to_string(&st).unwrap()).unwrap();

        let back = DeviceStatus::load(f.path()).unwrap();
        assert_eq!(back.camera, CameraState::Exposing);
        assert_eq!(back.filter, Some('R'));
        assert_eq!(back.lights, 2);
    }

    #[test]
    fn test_missing_status_file() {
        assert!(DeviceStatus::load(Path::new("/nonexistent/status.json")).is_none());
    }

    #[test]
    fn test_weather_freshness() {
        let now = Utc::now();
        let max_age = Duration::from_secs(30);

        let fresh = WeatherStatus {
            updated: now - chrono::Duration::seconds(5),
            alert: true,
        };
        assert!(fresh.alerting(now, max_age));

        let stale = WeatherStatus {
            updated: now - chrono::Duration::seconds(120),
            alert: true,
        };
        assert!(!stale.alerting(now, max_age));

        let calm = WeatherStatus {
            updated: now,
            alert: false,
        };
        assert!(!calm.alerting(now, max_age));

        // default (epoch) must never alert
        assert!(!WeatherStatus::default().alerting(now, max_age));
    }
}
