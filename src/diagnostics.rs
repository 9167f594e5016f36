//! Polling diagnostics
//!
//! Running counters kept by the coordinator, plus the synthetic diagnostics
//! device that exposes them through the same device map as real hardware.

use crate::health::HealthState;
use crate::inverter_health::InverterHealthSummary;
use crate::snapshot::{DeviceRecord, DeviceType, FieldValue};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Serial of the synthetic diagnostics device
pub const DIAGNOSTICS_SERIAL: &str = "sunpower_diagnostics";

/// Default capacity of the response-time window
pub const DEFAULT_RESPONSE_WINDOW: usize = 50;

/// Per-instance poll statistics
///
/// `total_polls == successful_polls + failed_polls` always holds; derived
/// metrics are computed on read.
#[derive(Debug, Clone)]
pub struct DiagnosticStats {
    total_polls: u64,
    successful_polls: u64,
    failed_polls: u64,
    consecutive_failures: u32,
    skipped_cycles: u64,
    last_success: Option<DateTime<Utc>>,
    response_times: VecDeque<Duration>,
    capacity: usize,
    started_at: DateTime<Utc>,
}

impl Default for DiagnosticStats {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_WINDOW)
    }
}

impl DiagnosticStats {
    pub fn new(capacity: usize) -> Self {
        Self::started_at(capacity, Utc::now())
    }

    pub fn started_at(capacity: usize, started_at: DateTime<Utc>) -> Self {
        let capacity = capacity.max(1);
        Self {
            total_polls: 0,
            successful_polls: 0,
            failed_polls: 0,
            consecutive_failures: 0,
            skipped_cycles: 0,
            last_success: None,
            response_times: VecDeque::with_capacity(capacity),
            capacity,
            started_at,
        }
    }

    /// Record the outcome of one poll attempt
    pub fn record_result(&mut self, success: bool, response_time: Option<Duration>) {
        self.total_polls += 1;
        if success {
            self.successful_polls += 1;
            self.consecutive_failures = 0;
            self.last_success = Some(Utc::now());
            if let Some(rt) = response_time {
                if self.response_times.len() == self.capacity {
                    self.response_times.pop_front();
                }
                self.response_times.push_back(rt);
            }
        } else {
            self.failed_polls += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }

    /// A cycle that deliberately did not contact the device
    pub fn record_skipped(&mut self) {
        self.skipped_cycles += 1;
    }

    pub const fn total_polls(&self) -> u64 {
        self.total_polls
    }

    pub const fn successful_polls(&self) -> u64 {
        self.successful_polls
    }

    pub const fn failed_polls(&self) -> u64 {
        self.failed_polls
    }

    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub const fn skipped_cycles(&self) -> u64 {
        self.skipped_cycles
    }

    pub const fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn response_times(&self) -> impl Iterator<Item = Duration> + '_ {
        self.response_times.iter().copied()
    }

    pub fn response_window_len(&self) -> usize {
        self.response_times.len()
    }

    /// Percentage of polls that succeeded, 0 before the first poll
    pub fn success_rate(&self) -> f64 {
        if self.total_polls == 0 {
            return 0.0;
        }
        self.successful_polls as f64 / self.total_polls as f64 * 100.0
    }

    /// Mean response time in seconds over the window, 0 when empty
    pub fn average_response_time(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.response_times.iter().map(Duration::as_secs_f64).sum();
        sum / self.response_times.len() as f64
    }

    /// Share of elapsed time the gateway is estimated to have been reachable
    pub fn uptime_percent(&self, interval: Duration, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.started_at).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return 100.0;
        }
        let downtime = self.failed_polls as f64 * interval.as_secs_f64();
        ((elapsed - downtime) / elapsed * 100.0).clamp(0.0, 100.0)
    }

    pub fn summary(&self, interval: Duration, now: DateTime<Utc>) -> StatsSummary {
        StatsSummary {
            total_polls: self.total_polls,
            successful_polls: self.successful_polls,
            failed_polls: self.failed_polls,
            consecutive_failures: self.consecutive_failures,
            skipped_cycles: self.skipped_cycles,
            success_rate: round_to(self.success_rate(), 1),
            average_response_time: round_to(self.average_response_time(), 2),
            uptime_percent: round_to(self.uptime_percent(interval, now), 1),
            last_success: self.last_success,
            started_at: self.started_at,
        }
    }
}

/// Read-only view of [`DiagnosticStats`] with derived metrics filled in
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub consecutive_failures: u32,
    pub skipped_cycles: u64,
    pub success_rate: f64,
    pub average_response_time: f64,
    pub uptime_percent: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// "%H:%M %m-%d-%y" in local time, or "Never"
pub fn format_last_success(last: Option<DateTime<Utc>>) -> String {
    last.map_or_else(
        || "Never".to_string(),
        |t| t.with_timezone(&Local).format("%H:%M %m-%d-%y").to_string(),
    )
}

/// Build the synthetic diagnostics device record
pub fn diagnostics_device(
    stats: &DiagnosticStats,
    interval: Duration,
    active_inverters: usize,
    polling_enabled: bool,
    now: DateTime<Utc>,
) -> DeviceRecord {
    let mut record = DeviceRecord::new();
    record.insert("MODEL".into(), DeviceType::Diagnostics.tag().into());
    record.insert(
        "DESCR".into(),
        "Enhanced SunPower Integration Diagnostics".into(),
    );
    record.insert("STATE".into(), "working".into());
    record.insert("SWVER".into(), env!("APP_VERSION").into());
    record.insert("HWVER".into(), "Virtual".into());
    record.insert(
        "polling_interval_seconds".into(),
        interval.as_secs().into(),
    );
    record.insert(
        "poll_success_rate".into(),
        FieldValue::float(round_to(stats.success_rate(), 1)),
    );
    record.insert("total_polls".into(), stats.total_polls().into());
    record.insert(
        "consecutive_failures".into(),
        u64::from(stats.consecutive_failures()).into(),
    );
    record.insert(
        "last_successful_poll".into(),
        format_last_success(stats.last_success()).into(),
    );
    record.insert(
        "average_response_time".into(),
        FieldValue::float(round_to(stats.average_response_time(), 2)),
    );
    record.insert("active_inverters".into(), (active_inverters as u64).into());
    record.insert(
        "polling_status".into(),
        if polling_enabled { "Enabled" } else { "Disabled" }.into(),
    );
    record.insert(
        "pvs_uptime_percent".into(),
        FieldValue::float(round_to(stats.uptime_percent(interval, now), 1)),
    );
    record
}

/// Configuration as shown in the report; the credential is never included
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub host: String,
    pub protocol: String,
    pub polling_interval_seconds: u64,
    pub polling_enabled: bool,
    pub sunrise_elevation: f64,
    pub sunset_elevation: f64,
    pub has_battery: bool,
    pub credential_configured: bool,
}

/// Everything an operator needs to judge polling health at a glance
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub version: &'static str,
    pub instance_id: String,
    pub generated_at: DateTime<Utc>,
    pub config: ConfigSummary,
    pub stats: StatsSummary,
    pub health: HealthState,
    pub battery_detected: bool,
    pub devices: BTreeMap<String, usize>,
    pub last_outcome: Option<String>,
    pub last_source: Option<String>,
    pub last_error: Option<String>,
    pub failing_inverters: Vec<String>,
    pub inverters: InverterHealthSummary,
}

impl DiagnosticsReport {
    pub const VERSION: &'static str = env!("APP_VERSION");
}
