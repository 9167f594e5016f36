//! Per-inverter presence tracking
//!
//! Microinverters drop off the PVS bus individually. The tracker learns the
//! expected set from the first successful poll, counts consecutive misses per
//! serial and reports alert/recovery transitions. Serials that show up later
//! (panel replacements) join the expected set; serials missing for a long time
//! are forgotten.

use crate::config::DiagnosticsConfig;
use crate::logging::get_logger;
use crate::snapshot::{DeviceSnapshot, DeviceType};
use serde::Serialize;
use std::collections::BTreeMap;

/// Transitions produced by one observation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InverterHealthReport {
    /// Serials that just reached the alert threshold
    pub alerts: Vec<String>,
    /// Previously alerted serials that reappeared, with their miss count
    pub recoveries: Vec<(String, u32)>,
    pub added: Vec<String>,
    pub dropped: Vec<String>,
}

impl InverterHealthReport {
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
            && self.recoveries.is_empty()
            && self.added.is_empty()
            && self.dropped.is_empty()
    }
}

/// Aggregate view for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InverterHealthSummary {
    /// False until the first snapshot with inverters has been seen
    pub tracking: bool,
    pub total_expected: usize,
    pub healthy: usize,
    /// Missing but below the alert threshold
    pub warning: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct InverterHealthTracker {
    misses: BTreeMap<String, u32>,
    initialized: bool,
    alert_after: u32,
    drop_after: u32,
    logger: crate::logging::StructuredLogger,
}

impl Default for InverterHealthTracker {
    fn default() -> Self {
        Self::new(5, 30)
    }
}

impl InverterHealthTracker {
    pub fn new(alert_after: u32, drop_after: u32) -> Self {
        let alert_after = alert_after.max(1);
        Self {
            misses: BTreeMap::new(),
            initialized: false,
            alert_after,
            drop_after: drop_after.max(alert_after),
            logger: get_logger("inverter_health"),
        }
    }

    pub fn from_config(cfg: &DiagnosticsConfig) -> Self {
        Self::new(cfg.inverter_alert_misses, cfg.inverter_drop_misses)
    }

    /// Serials currently at or past the alert threshold
    pub fn failing(&self) -> Vec<String> {
        self.misses
            .iter()
            .filter(|(_, n)| **n >= self.alert_after)
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// Feed one successful snapshot
    ///
    /// Snapshots without any inverters are ignored; they say nothing about
    /// individual units.
    pub fn observe(&mut self, snapshot: &DeviceSnapshot) -> InverterHealthReport {
        let current = snapshot.serials(DeviceType::Inverter);
        let mut report = InverterHealthReport::default();
        if current.is_empty() {
            return report;
        }

        if !self.initialized {
            self.misses = current.iter().map(|s| (s.clone(), 0)).collect();
            self.initialized = true;
            self.logger.info(&format!(
                "Tracking health of {} inverters",
                self.misses.len()
            ));
            return report;
        }

        for (serial, count) in &mut self.misses {
            if current.contains(serial) {
                if *count >= self.alert_after {
                    self.logger.info(&format!(
                        "Inverter {serial} recovered after {count} missed polls"
                    ));
                    report.recoveries.push((serial.clone(), *count));
                }
                *count = 0;
            } else {
                *count = count.saturating_add(1);
                if *count == self.alert_after {
                    self.logger.warn(&format!(
                        "Inverter {serial} missing for {count} consecutive polls"
                    ));
                    report.alerts.push(serial.clone());
                }
            }
        }

        for serial in &current {
            if !self.misses.contains_key(serial) {
                self.misses.insert(serial.clone(), 0);
                report.added.push(serial.clone());
            }
        }
        if !report.added.is_empty() {
            self.logger.info(&format!(
                "Detected {} new inverters: {}",
                report.added.len(),
                report.added.join(", ")
            ));
        }

        let drop_after = self.drop_after;
        self.misses.retain(|serial, count| {
            if *count >= drop_after {
                report.dropped.push(serial.clone());
                false
            } else {
                true
            }
        });
        if !report.dropped.is_empty() {
            self.logger.info(&format!(
                "No longer tracking permanently missing inverters: {}",
                report.dropped.join(", ")
            ));
        }

        report
    }

    pub fn summary(&self) -> InverterHealthSummary {
        let failed = self.misses.values().filter(|n| **n >= self.alert_after).count();
        let warning = self
            .misses
            .values()
            .filter(|n| **n >= 1 && **n < self.alert_after)
            .count();
        InverterHealthSummary {
            tracking: self.initialized,
            total_expected: self.misses.len(),
            healthy: self.misses.len() - failed - warning,
            warning,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DeviceRecord;

    fn snap(serials: &[&str]) -> DeviceSnapshot {
        let mut s = DeviceSnapshot::new();
        s.insert(DeviceType::Pvs, "ZT1", DeviceRecord::new());
        for serial in serials {
            s.insert(DeviceType::Inverter, serial, DeviceRecord::new());
        }
        s
    }

    #[test]
    fn first_observation_sets_expected() {
        let mut t = InverterHealthTracker::default();
        let report = t.observe(&snap(&["A", "B"]));
        assert!(report.is_empty());
        let summary = t.summary();
        assert!(summary.tracking);
        assert_eq!(summary.total_expected, 2);
    }

    #[test]
    fn alert_fires_once_at_threshold_then_recovers() {
        let mut t = InverterHealthTracker::default();
        t.observe(&snap(&["A", "B"]));

        let mut alerts = 0;
        for _ in 0..8 {
            alerts += t.observe(&snap(&["A"])).alerts.len();
        }
        assert_eq!(alerts, 1);
        assert_eq!(t.failing(), vec!["B".to_string()]);
        assert_eq!(t.summary().failed, 1);

        let report = t.observe(&snap(&["A", "B"]));
        assert_eq!(report.recoveries, vec![("B".to_string(), 8)]);
        assert!(t.failing().is_empty());
    }

    #[test]
    fn brief_absence_is_only_a_warning() {
        let mut t = InverterHealthTracker::default();
        t.observe(&snap(&["A", "B"]));
        let report = t.observe(&snap(&["A"]));
        assert!(report.alerts.is_empty());
        assert_eq!(t.summary().warning, 1);

        let report = t.observe(&snap(&["A", "B"]));
        assert!(report.recoveries.is_empty());
        assert_eq!(t.summary().healthy, 2);
    }

    #[test]
    fn new_serials_join_and_long_missing_are_dropped() {
        let mut t = InverterHealthTracker::new(5, 30);
        t.observe(&snap(&["A", "B"]));

        let report = t.observe(&snap(&["A", "C"]));
        assert_eq!(report.added, vec!["C".to_string()]);

        let mut dropped = Vec::new();
        for _ in 0..40 {
            dropped.extend(t.observe(&snap(&["A", "C"])).dropped);
        }
        assert_eq!(dropped, vec!["B".to_string()]);
        assert_eq!(t.summary().total_expected, 2);
        assert!(t.failing().is_empty());
    }

    #[test]
    fn snapshot_without_inverters_is_ignored() {
        let mut t = InverterHealthTracker::default();
        t.observe(&snap(&["A"]));
        for _ in 0..10 {
            assert!(t.observe(&snap(&[])).is_empty());
        }
        assert!(t.failing().is_empty());
    }
}
