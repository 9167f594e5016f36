//! In-place upgrades of configuration written by older releases

use super::{Config, DEFAULT_POLLING_INTERVAL_SECS, MIN_POLLING_INTERVAL_SECS};
use std::fmt;

/// A single migration step that was applied
#[derive(Debug, Clone, PartialEq)]
pub enum Migration {
    /// Single elevation threshold moved onto the unset sunrise/sunset values
    ElevationThreshold { threshold: f64 },
    /// `polling_interval_seconds` moved to `interval_seconds`
    IntervalKey { from: u64, to: u64 },
    /// Interval raised to the hardware-protection floor
    IntervalFloor { from: u64, to: u64 },
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElevationThreshold { threshold } => write!(
                f,
                "elevation_threshold {threshold} migrated to sunrise/sunset thresholds"
            ),
            Self::IntervalKey { from, to } => {
                write!(f, "polling_interval_seconds {from}s migrated to interval_seconds {to}s")
            }
            Self::IntervalFloor { from, to } => {
                write!(f, "interval_seconds raised from {from}s to {to}s")
            }
        }
    }
}

/// Apply every pending migration and report what changed
pub fn migrate(config: &mut Config) -> Vec<Migration> {
    let mut applied = Vec::new();

    if let Some(threshold) = config.polling.elevation_threshold.take() {
        // Explicit values win; the old single value only fills the gaps
        let polling = &mut config.polling;
        let filled = polling.sunrise_elevation.is_none() || polling.sunset_elevation.is_none();
        polling.sunrise_elevation.get_or_insert(threshold);
        polling.sunset_elevation.get_or_insert(threshold);
        if filled {
            applied.push(Migration::ElevationThreshold { threshold });
        }
    }

    if let Some(old) = config.polling.polling_interval_seconds.take() {
        // Older releases allowed aggressive intervals; start them at the safe default
        let to = old.max(DEFAULT_POLLING_INTERVAL_SECS);
        config.polling.interval_seconds = to;
        applied.push(Migration::IntervalKey { from: old, to });
    }

    if config.polling.interval_seconds < MIN_POLLING_INTERVAL_SECS {
        let from = config.polling.interval_seconds;
        config.polling.interval_seconds = MIN_POLLING_INTERVAL_SECS;
        applied.push(Migration::IntervalFloor {
            from,
            to: MIN_POLLING_INTERVAL_SECS,
        });
    }

    applied
}
