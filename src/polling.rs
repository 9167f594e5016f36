//! Day/night polling decision
//!
//! Solar-only systems produce nothing at night and the PVS often goes idle,
//! so polling is gated on sun elevation. Battery-backed systems are watched
//! around the clock.

use crate::config::{DEFAULT_ELEVATION_THRESHOLD, LocationConfig, PollingConfig};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;

/// Why a cycle will or will not poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollReason {
    BatteryActive,
    DayActive,
    NightDisabled,
}

/// Outcome of the day/night evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PollingDecision {
    pub should_poll: bool,
    pub reason: PollReason,
    /// Threshold compared against, absent in battery mode
    pub active_threshold: Option<f64>,
}

/// Decide whether to poll for the given sun elevation
///
/// Solar-only systems use the lower of the two thresholds for both morning and
/// evening.
pub fn evaluate(elevation: f64, sunrise: f64, sunset: f64, has_battery: bool) -> PollingDecision {
    if has_battery {
        return PollingDecision {
            should_poll: true,
            reason: PollReason::BatteryActive,
            active_threshold: None,
        };
    }

    let threshold = sunrise.min(sunset);
    let should_poll = elevation >= threshold;
    PollingDecision {
        should_poll,
        reason: if should_poll {
            PollReason::DayActive
        } else {
            PollReason::NightDisabled
        },
        active_threshold: Some(threshold),
    }
}

/// Stand-in elevation from the local hour when no live reading exists
pub fn fallback_elevation(hour: u32) -> f64 {
    match hour {
        6 | 18 => 5.0,
        7..=9 => 10.0 + f64::from(hour - 7) * 7.5,
        10..=14 => 45.0,
        15..=17 => 25.0 - f64::from(hour - 15) * 7.5,
        _ => -10.0,
    }
}

/// Sunrise/sunset thresholds after resolving older single-threshold settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub sunrise: f64,
    pub sunset: f64,
}

impl Thresholds {
    pub fn resolve(cfg: &PollingConfig) -> Self {
        let legacy = cfg.elevation_threshold;
        Self {
            sunrise: cfg
                .sunrise_elevation
                .or(legacy)
                .unwrap_or(DEFAULT_ELEVATION_THRESHOLD),
            sunset: cfg
                .sunset_elevation
                .or(legacy)
                .unwrap_or(DEFAULT_ELEVATION_THRESHOLD),
        }
    }
}

/// Source of live sun elevation readings
pub trait SunElevation: Send + Sync {
    /// Degrees above the horizon at `now`, `None` when unknown
    fn elevation_at(&self, now: DateTime<Utc>) -> Option<f64>;
}

/// Constant reading, or none at all
#[derive(Debug, Clone, Copy)]
pub struct FixedElevation(pub Option<f64>);

impl SunElevation for FixedElevation {
    fn elevation_at(&self, _now: DateTime<Utc>) -> Option<f64> {
        self.0
    }
}

/// Approximate solar position for a fixed site
#[derive(Debug, Clone, Copy)]
pub struct SolarElevation {
    latitude: f64,
    longitude: f64,
}

impl SolarElevation {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub const fn from_location(loc: LocationConfig) -> Self {
        Self::new(loc.latitude, loc.longitude)
    }
}

impl SunElevation for SolarElevation {
    fn elevation_at(&self, now: DateTime<Utc>) -> Option<f64> {
        let day = f64::from(now.ordinal());
        let utc_minutes = f64::from(now.hour()) * 60.0
            + f64::from(now.minute())
            + f64::from(now.second()) / 60.0;

        let declination = (23.44_f64).to_radians()
            * ((360.0 / 365.0) * (284.0 + day)).to_radians().sin();
        let b = ((360.0 / 365.0) * (day - 81.0)).to_radians();
        let equation_of_time = 9.87 * (2.0 * b).sin() - 7.53 * b.cos() - 1.5 * b.sin();

        let solar_minutes = utc_minutes + 4.0 * self.longitude + equation_of_time;
        let hour_angle = (solar_minutes / 4.0 - 180.0).to_radians();
        let lat = self.latitude.to_radians();

        let sin_elev =
            lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos();
        let elevation = sin_elev.clamp(-1.0, 1.0).asin().to_degrees();
        elevation.is_finite().then_some(elevation)
    }
}
