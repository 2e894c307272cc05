//! Environmental safety gates: sun altitude and weather alerts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{SafetyConfig, SiteConfig};
use crate::solar::SunModel;
use crate::status::WeatherStatus;

/// Tracks whether the sun is up, recomputing at most once a minute.
///
/// Starts out assuming daylight so a process launched at night reports a
/// dusk transition rather than a spurious dawn shutdown.
pub struct SunGuard {
    model: Box<dyn SunModel>,
    last_check: Option<DateTime<Utc>>,
    sun_up: bool,
}

const SUN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

impl SunGuard {
    pub fn new(model: Box<dyn SunModel>) -> Self {
        Self {
            model,
            last_check: None,
            sun_up: true,
        }
    }

    /// Refresh the cached sun state. Returns true exactly when the sun
    /// has just risen past the darkness threshold, which is the cue for
    /// an emergency stow. With `ignore_daylight` set the transition is
    /// still tracked but never reported.
    pub fn check_dawn(&mut self, now: DateTime<Utc>, site: &SiteConfig, safety: &SafetyConfig) -> bool {
        if let Some(last) = self.last_check {
            if now.signed_duration_since(last).to_std().is_ok_and(|d| d < SUN_CHECK_INTERVAL) {
                return false;
            }
        }
        self.last_check = Some(now);

        let alt = self
            .model
            .altitude_deg(now, site.latitude_deg, site.longitude_deg);
        let was_up = self.sun_up;
        self.sun_up = alt > -safety.sun_down_deg;

        !safety.ignore_daylight && self.sun_up && !was_up
    }

    /// True when it is dark enough to operate (or daylight is ignored).
    pub fn ok_to_run(&self, safety: &SafetyConfig) -> bool {
        safety.ignore_daylight || !self.sun_up
    }
}

/// Weather alert gate with edge-triggered logging. A report that has gone
/// stale is treated as no alert, matching the stations that simply stop
/// publishing when they shut down for the day.
#[derive(Debug, Default)]
pub struct WeatherGuard {
    last_alert: bool,
}

impl WeatherGuard {
    /// Returns true while a fresh weather alert is in force.
    pub fn alerting(&mut self, wx: &WeatherStatus, now: DateTime<Utc>, max_age: Duration) -> bool {
        let alert = wx.alerting(now, max_age);
        if alert && !self.last_alert {
            info!("weather alert asserted");
        }
        if !alert && self.last_alert {
            info!("weather alert rescinded");
        }
        self.last_alert = alert;
        alert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedSun(f64);

    impl SunModel for FixedSun {
        fn altitude_deg(&self, _now: DateTime<Utc>, _lat: f64, _lon: f64) -> f64 {
            self.0
        }
    }

    /// Scriptable altitude sequence, one value per recomputation.
    struct SunScript(std::cell::RefCell<Vec<f64>>);

    impl SunModel for SunScript {
        fn altitude_deg(&self, _now: DateTime<Utc>, _lat: f64, _lon: f64) -> f64 {
            let mut v = self.0.borrow_mut();
            if v.len() > 1 {
                v.remove(0)
            } else {
                v[0]
            }
        }
    }

    fn site() -> SiteConfig {
        SiteConfig {
            latitude_deg: 32.0,
            longitude_deg: -110.0,
        }
    }

    #[test]
    fn test_no_dawn_report_when_started_in_daylight() {
        let mut guard = SunGuard::new(Box::new(FixedSun(30.0)));
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 18, 0, 0).unwrap();
        assert!(!guard.check_dawn(now, &site(), &SafetyConfig::default()));
        assert!(!guard.ok_to_run(&SafetyConfig::default()));
    }

    #[test]
    fn test_dawn_transition_reported_once() {
        let mut guard = SunGuard::new(Box::new(SunScript(std::cell::RefCell::new(vec![
            -30.0, -30.0, 5.0, 5.0,
        ]))));
        let cfg = SafetyConfig::default();
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 3, 0, 0).unwrap();

        assert!(!guard.check_dawn(t0, &site(), &cfg));
        assert!(guard.ok_to_run(&cfg));
        // cached: a second call inside the minute does not recompute
        assert!(!guard.check_dawn(t0 + chrono::Duration::seconds(10), &site(), &cfg));

        let t1 = t0 + chrono::Duration::seconds(120);
        assert!(!guard.check_dawn(t1, &site(), &cfg));
        let t2 = t1 + chrono::Duration::seconds(120);
        assert!(guard.check_dawn(t2, &site(), &cfg));
        assert!(!guard.ok_to_run(&cfg));
        // already up: no repeat report
        let t3 = t2 + chrono::Duration::seconds(120);
        assert!(!guard.check_dawn(t3, &site(), &cfg));
    }

    #[test]
    fn test_ignore_daylight_suppresses_dawn_and_allows_running() {
        let mut guard = SunGuard::new(Box::new(SunScript(std::cell::RefCell::new(vec![
            -30.0, 5.0,
        ]))));
        let cfg = SafetyConfig {
            ignore_daylight: true,
            ..SafetyConfig::default()
        };
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 3, 0, 0).unwrap();
        assert!(!guard.check_dawn(t0, &site(), &cfg));
        assert!(!guard.check_dawn(t0 + chrono::Duration::seconds(120), &site(), &cfg));
        assert!(guard.ok_to_run(&cfg));
    }

    #[test]
    fn test_weather_edges_and_staleness() {
        let mut guard = WeatherGuard::default();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 4, 0, 0).unwrap();
        let max_age = Duration::from_secs(30);

        let fresh_alert = WeatherStatus {
            updated: now - chrono::Duration::seconds(5),
            alert: true,
        };
        assert!(guard.alerting(&fresh_alert, now, max_age));
        assert!(guard.alerting(&fresh_alert, now, max_age));

        let stale_alert = WeatherStatus {
            updated: now - chrono::Duration::seconds(120),
            alert: true,
        };
        assert!(!guard.alerting(&stale_alert, now, max_age));
    }
}
