//! Solar position, as far as safety logic needs it.
//!
//! The only question the engine ever asks is "how far below the horizon is
//! the sun right now" so a low-precision ephemeris is plenty. The formulas
//! follow the NOAA solar calculator's simplified algorithm; accuracy is a
//! small fraction of a degree over the next few decades, against a safety
//! threshold of many degrees.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Answers sun-altitude queries. Split out as a trait so scenario tests
/// can script day and night directly.
pub trait SunModel {
    /// Apparent solar altitude in degrees at the given site and instant.
    fn altitude_deg(&self, now: DateTime<Utc>, lat_deg: f64, lon_deg: f64) -> f64;
}

/// The real ephemeris.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoaaSun;

impl SunModel for NoaaSun {
    fn altitude_deg(&self, now: DateTime<Utc>, lat_deg: f64, lon_deg: f64) -> f64 {
        let jd = julian_day(now);
        let t = (jd - 2_451_545.0) / 36_525.0; // Julian centuries from J2000

        // geometric mean longitude and anomaly of the sun, degrees
        let l0 = (280.46646 + t * (36_000.76983 + t * 0.000_3032)).rem_euclid(360.0);
        let m = 357.52911 + t * (35_999.05029 - 0.000_1537 * t);
        let m_rad = m.to_radians();

        // equation of center
        let c = m_rad.sin() * (1.914_602 - t * (0.004_817 + 0.000_014 * t))
            + (2.0 * m_rad).sin() * (0.019_993 - 0.000_101 * t)
            + (3.0 * m_rad).sin() * 0.000_289;

        let true_long = l0 + c;
        let omega = 125.04 - 1934.136 * t;
        let app_long = true_long - 0.005_69 - 0.004_78 * omega.to_radians().sin();

        // obliquity of the ecliptic, corrected
        let e0 = 23.0 + (26.0 + (21.448 - t * (46.815 + t * (0.000_59 - t * 0.001_813))) / 60.0) / 60.0;
        let eps = e0 + 0.002_56 * omega.to_radians().cos();
        let eps_rad = eps.to_radians();

        let decl = (eps_rad.sin() * app_long.to_radians().sin()).asin();

        // equation of time, minutes
        let y = (eps_rad / 2.0).tan().powi(2);
        let l0_rad = l0.to_radians();
        let ecc = 0.016_708_634 - t * (0.000_042_037 + 0.000_000_126_7 * t);
        let eqtime = 4.0
            * (y * (2.0 * l0_rad).sin() - 2.0 * ecc * m_rad.sin()
                + 4.0 * ecc * y * m_rad.sin() * (2.0 * l0_rad).cos()
                - 0.5 * y * y * (4.0 * l0_rad).sin()
                - 1.25 * ecc * ecc * (2.0 * m_rad).sin())
            .to_degrees();

        // true solar time, minutes from local midnight
        let minutes = f64::from(now.hour()) * 60.0
            + f64::from(now.minute())
            + f64::from(now.second()) / 60.0;
        let tst = (minutes + eqtime + 4.0 * lon_deg).rem_euclid(1440.0);

        // hour angle, degrees
        let ha = tst / 4.0 - 180.0;

        let lat_rad = lat_deg.to_radians();
        let cos_zenith = lat_rad.sin() * decl.sin() + lat_rad.cos() * decl.cos() * ha.to_radians().cos();
        90.0 - cos_zenith.clamp(-1.0, 1.0).acos().to_degrees()
    }
}

fn julian_day(now: DateTime<Utc>) -> f64 {
    let (y, m, d) = (now.year(), now.month() as i32, now.day() as i32);
    let (y, m) = if m <= 2 { (y - 1, m + 12) } else { (y, m) };
    let a = y / 100;
    let b = 2 - a + a / 4;
    let day_frac = f64::from(now.num_seconds_from_midnight()) / 86_400.0;
    (365.25 * f64::from(y + 4716)).floor()
        + (30.6001 * f64::from(m + 1)).floor()
        + f64::from(d)
        + f64::from(b)
        - 1524.5
        + day_frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // Greenwich, equinox: sun crosses the meridian near noon at altitude
    // roughly 90 - latitude.
    #[test]
    fn test_equinox_noon_altitude() {
        let sun = NoaaSun;
        let noon = Utc.with_ymd_and_hms(2026, 3, 20, 12, 7, 0).unwrap();
        let alt = sun.altitude_deg(noon, 51.48, 0.0);
        assert!((alt - (90.0 - 51.48)).abs() < 1.0, "alt = {alt}");
    }

    #[test]
    fn test_midnight_is_well_below_horizon() {
        let sun = NoaaSun;
        let midnight = Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap();
        let alt = sun.altitude_deg(midnight, 51.48, 0.0);
        assert!(alt < -30.0, "alt = {alt}");
    }

    #[test]
    fn test_longitude_shifts_local_noon() {
        let sun = NoaaSun;
        let t = Utc.with_ymd_and_hms(2026, 6, 21, 18, 0, 0).unwrap();
        // 90 degrees west: 18 UT is local noon, sun should be high
        let west = sun.altitude_deg(t, 30.0, -90.0);
        // at Greenwich the same instant is evening
        let gw = sun.altitude_deg(t, 30.0, 0.0);
        assert!(west > 60.0, "west = {west}");
        assert!(gw < west);
    }
}
