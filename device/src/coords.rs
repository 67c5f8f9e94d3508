//! Coordinate helpers
//!
//! RA is in hours and Dec in degrees throughout. Sky positions sent to the
//! device are JNow; catalogue J2000 positions are precessed first.

use crate::error::{DeviceError, DeviceResult};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

const J2000: f64 = 2451545.0;

/// An RA or Dec as users write it: a number or a sexagesimal string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordinateValue {
    Number(f64),
    Text(String),
}

impl CoordinateValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CoordinateValue::Number(n) => Some(*n),
            CoordinateValue::Text(_) => None,
        }
    }

    /// Numeric sentinel meaning "use the current mount position"
    pub fn is_current_position(&self) -> bool {
        matches!(self, CoordinateValue::Number(n) if *n < 0.0)
    }

    pub fn ra_hours(&self) -> DeviceResult<f64> {
        match self {
            CoordinateValue::Number(n) => Ok(*n),
            CoordinateValue::Text(s) => parse_ra_hours(s),
        }
    }

    pub fn dec_degrees(&self) -> DeviceResult<f64> {
        match self {
            CoordinateValue::Number(n) => Ok(*n),
            CoordinateValue::Text(s) => parse_dec_degrees(s),
        }
    }
}

impl From<f64> for CoordinateValue {
    fn from(value: f64) -> Self {
        CoordinateValue::Number(value)
    }
}

impl From<&str> for CoordinateValue {
    fn from(value: &str) -> Self {
        CoordinateValue::Text(value.to_string())
    }
}

impl fmt::Display for CoordinateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinateValue::Number(n) => write!(f, "{}", n),
            CoordinateValue::Text(s) => f.write_str(s),
        }
    }
}

fn invalid(input: &str, reason: &str) -> DeviceError {
    DeviceError::InvalidCoordinate {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

/// Split "12h34m56.7s", "12:34:56.7", "-12d34m56s", "12 34 56" or "12.5" into parts
fn sexagesimal_parts(input: &str) -> DeviceResult<(f64, Vec<f64>)> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(input, "empty"));
    }

    let negative = trimmed.starts_with('-');
    let body = trimmed.trim_start_matches(['+', '-']);

    let parts: Vec<f64> = body
        .split(|c: char| matches!(c, 'h' | 'd' | 'm' | 's' | ':' | ' ' | '°' | '\'' | '"'))
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<f64>().map_err(|_| invalid(input, "not a number")))
        .collect::<DeviceResult<_>>()?;

    if parts.is_empty() || parts.len() > 3 {
        return Err(invalid(input, "expected one to three fields"));
    }
    if parts.iter().skip(1).any(|v| *v < 0.0 || *v >= 60.0) {
        return Err(invalid(input, "minutes/seconds out of range"));
    }

    let sign = if negative { -1.0 } else { 1.0 };
    Ok((sign, parts))
}

fn combine(parts: &[f64]) -> f64 {
    parts
        .iter()
        .enumerate()
        .map(|(i, v)| v / 60f64.powi(i as i32))
        .sum()
}

/// Parse a right ascension into hours
pub fn parse_ra_hours(input: &str) -> DeviceResult<f64> {
    let (sign, parts) = sexagesimal_parts(input)?;
    if sign < 0.0 {
        return Err(invalid(input, "right ascension cannot be negative"));
    }
    let hours = combine(&parts);
    if hours >= 24.0 {
        return Err(invalid(input, "hours out of range"));
    }
    Ok(hours)
}

/// Parse a declination into degrees
pub fn parse_dec_degrees(input: &str) -> DeviceResult<f64> {
    let (sign, parts) = sexagesimal_parts(input)?;
    let degrees = sign * combine(&parts);
    if !(-90.0..=90.0).contains(&degrees) {
        return Err(invalid(input, "degrees out of range"));
    }
    Ok(degrees)
}

/// Round the seconds field of a sexagesimal string to one decimal place
///
/// Strings without a minutes marker are returned unchanged.
pub fn trim_seconds(input: &str) -> String {
    let Some(pos) = input.find('m') else {
        return input.to_string();
    };
    let (head, tail) = input.split_at(pos + 1);
    let seconds_text = tail.trim_end_matches(['s', '"']).trim();
    if seconds_text.is_empty() {
        return input.to_string();
    }
    match seconds_text.parse::<f64>() {
        Ok(seconds) => format!("{}{:.1}s", head, seconds),
        Err(_) => input.to_string(),
    }
}

/// Round to a fixed number of decimal places
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn normalize_ra_hours(ra: f64) -> f64 {
    ra.rem_euclid(24.0)
}

pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month();
    let day = dt.day();

    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = y / 100;
    let b = 2 - a + a / 4;

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + day as f64
        + b as f64
        - 1524.5;

    let seconds = dt.second() as f64 + dt.nanosecond() as f64 / 1e9;
    let time_fraction = (dt.hour() as f64 + dt.minute() as f64 / 60.0 + seconds / 3600.0) / 24.0;

    jd + time_fraction
}

/// Local mean sidereal time in hours
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - J2000) / 36525.0;

    // Greenwich Mean Sidereal Time in degrees
    let gmst = 280.46061837 + 360.98564736629 * (jd - J2000) + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    (gmst + longitude).rem_euclid(360.0) / 15.0
}

/// Equatorial (JNow) to horizontal; returns (altitude, azimuth) in degrees, azimuth from north through east
pub fn equatorial_to_horizontal(
    ra_hours: f64,
    dec_degrees: f64,
    latitude: f64,
    longitude: f64,
    at: &DateTime<Utc>,
) -> (f64, f64) {
    let lst = local_sidereal_time(julian_day(at), longitude);
    let ha = ((lst - ra_hours) * 15.0).to_radians();
    let dec = dec_degrees.to_radians();
    let lat = latitude.to_radians();

    let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * ha.cos();
    let alt = sin_alt.clamp(-1.0, 1.0).asin();

    let y = -ha.sin() * dec.cos();
    let x = dec.sin() * lat.cos() - dec.cos() * lat.sin() * ha.cos();
    let az = y.atan2(x).to_degrees().rem_euclid(360.0);

    (alt.to_degrees(), az)
}

/// Horizontal to equatorial (JNow); returns (ra hours, dec degrees)
pub fn horizontal_to_equatorial(
    altitude: f64,
    azimuth: f64,
    latitude: f64,
    longitude: f64,
    at: &DateTime<Utc>,
) -> (f64, f64) {
    let lst = local_sidereal_time(julian_day(at), longitude);
    let alt = altitude.to_radians();
    let az = azimuth.to_radians();
    let lat = latitude.to_radians();

    let sin_dec = alt.sin() * lat.sin() + alt.cos() * lat.cos() * az.cos();
    let dec = sin_dec.clamp(-1.0, 1.0).asin();

    let y = -az.sin() * alt.cos();
    let x = alt.sin() * lat.cos() - alt.cos() * lat.sin() * az.cos();
    let ha_hours = y.atan2(x).to_degrees() / 15.0;

    (normalize_ra_hours(lst - ha_hours), dec.to_degrees())
}

/// Precess a J2000 position to the equinox of `at` (IAU 1976 angles)
pub fn precess_j2000_to_jnow(ra_hours: f64, dec_degrees: f64, at: &DateTime<Utc>) -> (f64, f64) {
    let t = (julian_day(at) - J2000) / 36525.0;
    let arcsec = PI / (180.0 * 3600.0);

    let zeta = (2306.2181 * t + 0.30188 * t * t + 0.017998 * t * t * t) * arcsec;
    let z = (2306.2181 * t + 1.09468 * t * t + 0.018203 * t * t * t) * arcsec;
    let theta = (2004.3109 * t - 0.42665 * t * t - 0.041833 * t * t * t) * arcsec;

    let ra = (ra_hours * 15.0).to_radians();
    let dec = dec_degrees.to_radians();

    let a = dec.cos() * (ra + zeta).sin();
    let b = theta.cos() * dec.cos() * (ra + zeta).cos() - theta.sin() * dec.sin();
    let c = theta.sin() * dec.cos() * (ra + zeta).cos() + theta.cos() * dec.sin();

    let ra_new = a.atan2(b) + z;
    let dec_new = c.clamp(-1.0, 1.0).asin();

    (
        normalize_ra_hours(ra_new.to_degrees() / 15.0),
        dec_new.to_degrees(),
    )
}

/// Squared small-angle separation in deg², RA scaled by cos(dec)
pub fn separation_sq_deg(ra1_hours: f64, dec1: f64, ra2_hours: f64, dec2: f64) -> f64 {
    let mut d_ra = (ra1_hours - ra2_hours) * 15.0;
    if d_ra > 180.0 {
        d_ra -= 360.0;
    } else if d_ra < -180.0 {
        d_ra += 360.0;
    }
    let mean_dec = ((dec1 + dec2) / 2.0).to_radians();
    let d_ra = d_ra * mean_dec.cos();
    let d_dec = dec1 - dec2;
    d_ra * d_ra + d_dec * d_dec
}

/// Resolve user coordinates to a JNow (ra hours, dec degrees) pair
pub fn resolve_target(
    ra: &CoordinateValue,
    dec: &CoordinateValue,
    is_j2000: bool,
    at: &DateTime<Utc>,
) -> DeviceResult<(f64, f64)> {
    let ra_hours = ra.ra_hours()?;
    let dec_degrees = dec.dec_degrees()?;
    if is_j2000 {
        Ok(precess_j2000_to_jnow(ra_hours, dec_degrees, at))
    } else {
        Ok((ra_hours, dec_degrees))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_parse_ra_formats() {
        assert!(close(parse_ra_hours("12h30m0s").unwrap(), 12.5, 1e-9));
        assert!(close(parse_ra_hours("05:34:31.94").unwrap(), 5.575_538_9, 1e-6));
        assert!(close(parse_ra_hours("0.7123").unwrap(), 0.7123, 1e-9));
        assert!(parse_ra_hours("24h00m00s").is_err());
        assert!(parse_ra_hours("-1h").is_err());
        assert!(parse_ra_hours("").is_err());
    }

    #[test]
    fn test_parse_dec_formats() {
        assert!(close(parse_dec_degrees("+41d16m9s").unwrap(), 41.269_166_7, 1e-6));
        assert!(close(parse_dec_degrees("-12:30:00").unwrap(), -12.5, 1e-9));
        assert!(close(parse_dec_degrees("-0d30m0s").unwrap(), -0.5, 1e-9));
        assert!(parse_dec_degrees("95d").is_err());
        assert!(parse_dec_degrees("10d75m").is_err());
    }

    #[test]
    fn test_trim_seconds() {
        assert_eq!(trim_seconds("5h34m31.94s"), "5h34m31.9s");
        assert_eq!(trim_seconds("+22d0m52.26s"), "+22d0m52.3s");
        assert_eq!(trim_seconds("5.57"), "5.57");
    }

    #[test]
    fn test_coordinate_value_json() {
        let value: CoordinateValue = serde_json::from_str("\"5h34m31.9s\"").unwrap();
        assert_eq!(value, CoordinateValue::Text("5h34m31.9s".into()));
        let value: CoordinateValue = serde_json::from_str("-1").unwrap();
        assert!(value.is_current_position());
    }

    #[test]
    fn test_julian_day_epoch() {
        let dt = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!(close(julian_day(&dt), 2451545.0, 1e-9));
    }

    #[test]
    fn test_sidereal_time_at_epoch() {
        let lst = local_sidereal_time(2451545.0, 0.0);
        assert!(close(lst, 280.46061837 / 15.0, 1e-9));
        let east = local_sidereal_time(2451545.0, 15.0);
        assert!(close(east, lst + 1.0, 1e-9));
    }

    #[test]
    fn test_pole_altitude_equals_latitude() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap();
        let (alt, _) = equatorial_to_horizontal(7.0, 90.0, 40.0, -75.0, &at);
        assert!(close(alt, 40.0, 1e-6));
    }

    #[test]
    fn test_horizontal_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 9, 12, 4, 30, 0).unwrap();
        let (ra, dec) = horizontal_to_equatorial(55.0, 130.0, 47.6, -122.3, &at);
        let (alt, az) = equatorial_to_horizontal(ra, dec, 47.6, -122.3, &at);
        assert!(close(alt, 55.0, 1e-6));
        assert!(close(az, 130.0, 1e-6));
    }

    #[test]
    fn test_precession_identity_at_epoch() {
        let at = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        let (ra, dec) = precess_j2000_to_jnow(5.5, 22.0, &at);
        assert!(close(ra, 5.5, 1e-9));
        assert!(close(dec, 22.0, 1e-9));
    }

    #[test]
    fn test_precession_rate_near_equinox() {
        // 25 years of precession at RA 0, Dec 0: ~3.07s/yr in RA, ~20.04"/yr in Dec.
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let (ra, dec) = precess_j2000_to_jnow(0.0, 0.0, &at);
        assert!(close(ra, 0.0213, 0.0005));
        assert!(close(dec, 0.139, 0.002));
    }

    #[test]
    fn test_separation_wraps_ra() {
        let d = separation_sq_deg(23.999, 0.0, 0.001, 0.0);
        assert!(close(d, (0.002f64 * 15.0).powi(2), 1e-9));
        assert!(separation_sq_deg(10.0, 20.0, 10.0, 20.0) < 1e-12);
    }

    #[test]
    fn test_resolve_target_numeric_jnow() {
        let at = Utc::now();
        let (ra, dec) = resolve_target(&10.0.into(), &(-5.0).into(), false, &at).unwrap();
        assert_eq!((ra, dec), (10.0, -5.0));
        assert!(resolve_target(&"bogus".into(), &0.0.into(), false, &at).is_err());
    }
}
