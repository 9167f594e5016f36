//! Polling coordinator
//!
//! One [`Coordinator`] per gateway. Each cycle walks a fixed sequence:
//!
//! 1. serve the cache if it is younger than the interval (minus tolerance)
//! 2. decide day/night from sun elevation and battery presence
//! 3. at night, serve the cache or fail with `NoCachedDataInNightMode`
//! 4. on the first day cycle, reset health state
//! 5. probe health, query the device list, validate it
//! 6. on success, persist and return the fresh snapshot
//! 7. on failure, walk the cache fallback chain or fail with `AllSourcesExhausted`
//!
//! Diagnostics are recorded exactly once per cycle. The coordinator is the
//! only writer of its health and diagnostic state; readers get snapshots of it
//! through a `watch` channel.

pub mod fallback;

pub use fallback::{FALLBACK_CHAIN, FallbackSource};

use crate::cache::{CachedSnapshot, SnapshotStore};
use crate::client::DeviceClient;
use crate::config::{Config, POLL_TOLERANCE_SECS};
use crate::diagnostics::{
    ConfigSummary, DIAGNOSTICS_SERIAL, DiagnosticStats, DiagnosticsReport, diagnostics_device,
};
use crate::error::{HeliosError, Result};
use crate::health::{Connector, HealthProber, HealthState, HealthStatus, TcpConnector};
use crate::inverter_health::InverterHealthTracker;
use crate::logging::{LogContext, get_logger_with_context};
use crate::polling::{
    FixedElevation, PollingDecision, SolarElevation, SunElevation, Thresholds, evaluate,
    fallback_elevation,
};
use crate::snapshot::{DeviceSnapshot, DeviceType};
use chrono::{DateTime, Local, Timelike, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};

/// Upper bound for a device list query
const MAX_QUERY_TIMEOUT: Duration = Duration::from_secs(90);

/// Headroom kept between the query timeout and the next cycle
const QUERY_HEADROOM: Duration = Duration::from_secs(10);

/// Cache younger than this is served without touching the network
pub fn freshness_window(interval: Duration) -> Duration {
    interval.saturating_sub(Duration::from_secs(POLL_TOLERANCE_SECS))
}

/// Device query timeout for a polling interval
pub fn query_timeout(interval: Duration) -> Duration {
    MAX_QUERY_TIMEOUT.min(interval.saturating_sub(QUERY_HEADROOM))
}

/// Why cached data was returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReason {
    /// Cache younger than the polling interval
    Fresh,
    NightMode,
    PollingDisabled,
    /// The poll failed; `cause` is the underlying error
    PollFailed {
        source: FallbackSource,
        cause: String,
    },
}

impl fmt::Display for CacheReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => f.write_str("cache fresh"),
            Self::NightMode => f.write_str("night mode fallback"),
            Self::PollingDisabled => f.write_str("polling disabled"),
            Self::PollFailed { source, cause } => {
                write!(f, "poll failed, using {source}: {cause}")
            }
        }
    }
}

impl Serialize for CacheReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Provenance of a cycle's snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    Fresh,
    Cache {
        reason: CacheReason,
        #[serde(rename = "age_seconds", serialize_with = "serialize_secs")]
        age: Duration,
    },
}

impl DataSource {
    pub const fn is_cache(&self) -> bool {
        matches!(self, Self::Cache { .. })
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => f.write_str("fresh"),
            Self::Cache { reason, age } => write!(f, "cache ({}, {}s old)", reason, age.as_secs()),
        }
    }
}

/// Terminal outcome of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Success,
    CacheFallback,
    HardFail,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::CacheFallback => f.write_str("cache_fallback"),
            Self::HardFail => f.write_str("hard_fail"),
        }
    }
}

/// What a successful cycle hands upward
///
/// `snapshot` always includes the diagnostics pseudo-device.
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub snapshot: DeviceSnapshot,
    pub source: DataSource,
    pub outcome: CycleOutcome,
    /// Absent when the cycle ended before the day/night decision
    pub decision: Option<PollingDecision>,
}

/// Published after every cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStatus {
    pub report: Option<DiagnosticsReport>,
    /// Latest returned snapshot, diagnostics included
    pub snapshot: Option<DeviceSnapshot>,
    pub source: Option<DataSource>,
    pub cycles: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Adaptive polling and resilience for one gateway
pub struct Coordinator {
    config: Config,
    instance_id: String,
    client: Box<dyn DeviceClient>,
    store: Arc<dyn SnapshotStore>,
    sun: Box<dyn SunElevation>,
    prober: HealthProber,
    health: HealthState,
    stats: DiagnosticStats,
    inverters: InverterHealthTracker,
    battery_detected: bool,
    day_mode_active: bool,
    polling_enabled: bool,
    cycles: u64,
    last_outcome: Option<CycleOutcome>,
    last_source: Option<DataSource>,
    last_error: Option<String>,
    last_snapshot: Option<DeviceSnapshot>,
    status: watch::Sender<Arc<CoordinatorStatus>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    logger: crate::logging::StructuredLogger,
}

impl Coordinator {
    pub fn new(config: Config, client: Box<dyn DeviceClient>, store: Arc<dyn SnapshotStore>) -> Self {
        let instance_id = config.instance_id();
        let interval = config.polling_interval();
        let sun: Box<dyn SunElevation> = match config.location {
            Some(loc) => Box::new(SolarElevation::from_location(loc)),
            None => Box::new(FixedElevation(None)),
        };
        let prober = HealthProber::new(
            Arc::new(TcpConnector::new(config.health.port)),
            interval,
            Duration::from_millis(config.health.retry_pause_ms),
        );
        let logger =
            get_logger_with_context(LogContext::new("coordinator").with_instance(&instance_id));
        let (status, _) = watch::channel(Arc::new(CoordinatorStatus::default()));
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            stats: DiagnosticStats::new(config.diagnostics.response_window),
            inverters: InverterHealthTracker::from_config(&config.diagnostics),
            polling_enabled: config.polling.enabled,
            config,
            instance_id,
            client,
            store,
            sun,
            prober,
            health: HealthState::default(),
            battery_detected: false,
            day_mode_active: false,
            cycles: 0,
            last_outcome: None,
            last_source: None,
            last_error: None,
            last_snapshot: None,
            status,
            shutdown_tx,
            shutdown_rx,
            logger,
        };
        coordinator.publish();
        coordinator
    }

    /// Replace the elevation source
    #[must_use]
    pub fn with_sun(mut self, sun: Box<dyn SunElevation>) -> Self {
        self.sun = sun;
        self
    }

    /// Replace the connectivity check used by the health probe
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.prober = HealthProber::new(
            connector,
            self.config.polling_interval(),
            Duration::from_millis(self.config.health.retry_pause_ms),
        );
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn stats(&self) -> &DiagnosticStats {
        &self.stats
    }

    pub const fn health(&self) -> &HealthState {
        &self.health
    }

    pub const fn inverter_tracker(&self) -> &InverterHealthTracker {
        &self.inverters
    }

    pub const fn last_outcome(&self) -> Option<CycleOutcome> {
        self.last_outcome
    }

    pub const fn battery_detected(&self) -> bool {
        self.battery_detected
    }

    /// Configured battery flag or battery devices seen in earlier data
    pub const fn has_battery(&self) -> bool {
        self.config.polling.has_battery || self.battery_detected
    }

    pub const fn polling_enabled(&self) -> bool {
        self.polling_enabled
    }

    pub fn set_polling_enabled(&mut self, enabled: bool) {
        if enabled != self.polling_enabled {
            self.logger.info(&format!(
                "Polling {}",
                if enabled { "enabled" } else { "disabled" }
            ));
        }
        self.polling_enabled = enabled;
    }

    /// Receiver for status published after each cycle
    pub fn subscribe(&self) -> watch::Receiver<Arc<CoordinatorStatus>> {
        self.status.subscribe()
    }

    /// Sender that stops [`Self::run`]
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<()> {
        self.shutdown_tx.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_tx.send(()).ok();
    }

    /// Run one cycle now
    pub async fn run_cycle(&mut self) -> Result<CycleResult> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as if the wall clock read `now`
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> Result<CycleResult> {
        self.cycles += 1;
        let result = self.execute_cycle(now).await;
        match &result {
            Ok(r) => {
                self.last_outcome = Some(r.outcome);
                self.last_source = Some(r.source.clone());
                self.last_snapshot = Some(r.snapshot.clone());
                if r.outcome == CycleOutcome::Success && !r.source.is_cache() {
                    self.last_error = None;
                }
            }
            Err(e) => {
                self.last_outcome = Some(CycleOutcome::HardFail);
                self.last_error = Some(e.to_string());
            }
        }
        self.publish();
        result
    }

    async fn execute_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleResult> {
        let interval = self.config.polling_interval();

        let mut cached = None;
        if let Some(c) = self.load_cache() {
            let age = c.age(now);
            if age < freshness_window(interval) {
                match c.snapshot.validate() {
                    Ok(()) => {
                        self.logger.debug(&format!(
                            "Cache is {}s old, skipping poll (interval {}s)",
                            age.as_secs(),
                            interval.as_secs()
                        ));
                        self.stats.record_skipped();
                        let source = DataSource::Cache {
                            reason: CacheReason::Fresh,
                            age,
                        };
                        return Ok(self.finish(c.snapshot, source, CycleOutcome::Success, None, now));
                    }
                    Err(e) => self.logger.warn(&format!("Discarding invalid cached snapshot: {e}")),
                }
            } else {
                cached = Some(c);
            }
        }

        if !self.polling_enabled {
            self.stats.record_skipped();
            return match cached {
                Some(c) => {
                    let age = c.age(now);
                    let source = DataSource::Cache {
                        reason: CacheReason::PollingDisabled,
                        age,
                    };
                    Ok(self.finish(c.snapshot, source, CycleOutcome::CacheFallback, None, now))
                }
                None => Err(HeliosError::exhausted(HeliosError::config(
                    "Polling disabled and no cached data available",
                ))),
            };
        }

        let decision = self.decide(now);
        if !decision.should_poll {
            self.day_mode_active = false;
            self.stats.record_skipped();
            let Some(c) = cached.filter(|c| c.snapshot.validate().is_ok()) else {
                self.logger
                    .warn("Night mode active but no cached data is available");
                return Err(HeliosError::NoCachedDataInNightMode);
            };
            let age = c.age(now);
            self.logger.debug(&format!(
                "Night mode, serving {}s old cache",
                age.as_secs()
            ));
            let source = DataSource::Cache {
                reason: CacheReason::NightMode,
                age,
            };
            return Ok(self.finish(
                c.snapshot,
                source,
                CycleOutcome::CacheFallback,
                Some(decision),
                now,
            ));
        }

        if !self.day_mode_active {
            self.day_mode_active = true;
            self.health.reset();
            self.logger
                .info("Day mode activated, health state reset");
        }

        match self.poll(interval).await {
            Ok((mut snapshot, elapsed)) => {
                if self.config.polling.auto_detect_battery
                    && !self.battery_detected
                    && snapshot.has_battery_devices()
                {
                    self.battery_detected = true;
                    self.logger
                        .info("Battery devices detected, polling around the clock from now on");
                }

                // Judge inverter health on what the gateway actually reported
                let changes = self.inverters.observe(&snapshot);
                if !changes.alerts.is_empty() {
                    self.logger.warn(&format!(
                        "Inverters not reporting: {}",
                        changes.alerts.join(", ")
                    ));
                }

                if let Some(c) = &cached {
                    let preserved = snapshot.preserve_from(&c.snapshot);
                    if preserved > 0 {
                        self.logger.info(&format!(
                            "Preserved {preserved} cached devices missing from fresh data"
                        ));
                    }
                }

                if self.has_battery() {
                    self.merge_ess_status(&mut snapshot, interval).await;
                }

                if let Err(e) = self.store.store(&self.instance_id, &snapshot) {
                    self.logger.warn(&format!("Failed to update cache: {e}"));
                }
                self.stats.record_result(true, Some(elapsed));

                self.logger.info(&format!(
                    "Polled {} devices in {:.2}s ({})",
                    snapshot.device_count(),
                    elapsed.as_secs_f64(),
                    snapshot.summary_line()
                ));
                Ok(self.finish(
                    snapshot,
                    DataSource::Fresh,
                    CycleOutcome::Success,
                    Some(decision),
                    now,
                ))
            }
            Err(cause) => {
                self.stats.record_result(false, None);
                self.last_error = Some(cause.to_string());
                self.logger.warn(&format!("Poll failed: {cause}"));

                match fallback::resolve(
                    &FALLBACK_CHAIN,
                    cached,
                    self.store.as_ref(),
                    &self.instance_id,
                    &self.logger,
                ) {
                    Some((source, c)) => {
                        let age = c.age(now);
                        self.logger.info(&format!(
                            "Serving {}s old cache from {}",
                            age.as_secs(),
                            source
                        ));
                        let reason = CacheReason::PollFailed {
                            source,
                            cause: cause.to_string(),
                        };
                        Ok(self.finish(
                            c.snapshot,
                            DataSource::Cache { reason, age },
                            CycleOutcome::CacheFallback,
                            Some(decision),
                            now,
                        ))
                    }
                    None => {
                        self.logger
                            .error(&format!("No data source left after poll failure: {cause}"));
                        Err(HeliosError::exhausted(cause))
                    }
                }
            }
        }
    }

    fn load_cache(&self) -> Option<CachedSnapshot> {
        match self.store.load(&self.instance_id) {
            Ok(found) => found,
            Err(e) => {
                self.logger.warn(&format!("Cache unavailable: {e}"));
                None
            }
        }
    }

    fn decide(&self, now: DateTime<Utc>) -> PollingDecision {
        let elevation = self.sun.elevation_at(now).unwrap_or_else(|| {
            let hour = now.with_timezone(&Local).hour();
            let fallback = fallback_elevation(hour);
            self.logger.debug(&format!(
                "No sun elevation reading, assuming {fallback} for hour {hour}"
            ));
            fallback
        });
        let thresholds = Thresholds::resolve(&self.config.polling);
        let decision = evaluate(
            elevation,
            thresholds.sunrise,
            thresholds.sunset,
            self.has_battery(),
        );
        self.logger.debug(&format!(
            "Sun elevation {:.1}, decision {:?}",
            elevation, decision.reason
        ));
        decision
    }

    async fn poll(&mut self, interval: Duration) -> Result<(DeviceSnapshot, Duration)> {
        let host = self.config.gateway.host.clone();
        let status = self
            .prober
            .probe_with_budget(
                &host,
                self.config.health.max_retries,
                self.config.backoff_window(),
                &mut self.health,
            )
            .await;
        match status {
            HealthStatus::Healthy => {}
            HealthStatus::Unreachable => {
                return Err(HeliosError::connection(format!("PVS at {host} is unreachable")));
            }
            HealthStatus::Backoff => {
                return Err(HeliosError::connection(format!(
                    "PVS at {host} is in health check backoff"
                )));
            }
        }

        let started = Instant::now();
        let snapshot = self.client.query_device_list(query_timeout(interval)).await?;
        let elapsed = started.elapsed();
        snapshot.validate()?;
        Ok((snapshot, elapsed))
    }

    /// Add the energy storage records; a failed fetch leaves the poll intact
    async fn merge_ess_status(&self, snapshot: &mut DeviceSnapshot, interval: Duration) {
        match self.client.query_ess_status(query_timeout(interval)).await {
            Ok(ess) => {
                let merged = snapshot.merge(ess);
                if merged == 0 {
                    self.logger
                        .warn("ESS report held no battery devices");
                } else {
                    self.logger
                        .debug(&format!("Merged {merged} devices from the ESS report"));
                }
            }
            Err(e) => self
                .logger
                .error(&format!("ESS status unavailable, keeping device list only: {e}")),
        }
    }

    fn finish(
        &self,
        mut snapshot: DeviceSnapshot,
        source: DataSource,
        outcome: CycleOutcome,
        decision: Option<PollingDecision>,
        now: DateTime<Utc>,
    ) -> CycleResult {
        let active = snapshot.serials(DeviceType::Inverter).len();
        snapshot.insert(
            DeviceType::Diagnostics,
            DIAGNOSTICS_SERIAL,
            diagnostics_device(
                &self.stats,
                self.config.polling_interval(),
                active,
                self.polling_enabled,
                now,
            ),
        );
        CycleResult {
            snapshot,
            source,
            outcome,
            decision,
        }
    }

    /// Operator-facing summary of polling health
    pub fn report(&self) -> DiagnosticsReport {
        let now = Utc::now();
        let interval = self.config.polling_interval();
        let thresholds = Thresholds::resolve(&self.config.polling);
        DiagnosticsReport {
            version: DiagnosticsReport::VERSION,
            instance_id: self.instance_id.clone(),
            generated_at: now,
            config: ConfigSummary {
                host: self.config.gateway.host.clone(),
                protocol: self.client.protocol().to_string(),
                polling_interval_seconds: interval.as_secs(),
                polling_enabled: self.polling_enabled,
                sunrise_elevation: thresholds.sunrise,
                sunset_elevation: thresholds.sunset,
                has_battery: self.has_battery(),
                credential_configured: self.config.gateway.credential.is_some(),
            },
            stats: self.stats.summary(interval, now),
            health: self.health.clone(),
            battery_detected: self.battery_detected,
            devices: self
                .last_snapshot
                .as_ref()
                .map(|s| {
                    s.device_summary()
                        .into_iter()
                        .map(|(t, n)| (t.tag().to_string(), n))
                        .collect()
                })
                .unwrap_or_default(),
            last_outcome: self.last_outcome.map(|o| o.to_string()),
            last_source: self.last_source.as_ref().map(ToString::to_string),
            last_error: self.last_error.clone(),
            failing_inverters: self.inverters.failing(),
            inverters: self.inverters.summary(),
        }
    }

    fn publish(&self) {
        let status = CoordinatorStatus {
            report: Some(self.report()),
            snapshot: self.last_snapshot.clone(),
            source: self.last_source.clone(),
            cycles: self.cycles,
            updated_at: Some(Utc::now()),
        };
        self.status.send_replace(Arc::new(status));
    }

    /// Poll on the configured interval until shutdown is requested
    pub async fn run(&mut self) -> Result<()> {
        let period = self.config.polling_interval();
        self.logger.info(&format!(
            "Starting coordinator for {} every {}s using {} protocol",
            self.config.gateway.host,
            period.as_secs(),
            self.client.protocol()
        ));

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(result) => self.logger.debug(&format!(
                            "Cycle {} finished: {} from {}",
                            self.cycles, result.outcome, result.source
                        )),
                        Err(e) => self.logger.error(&format!("Polling cycle failed: {e}")),
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    self.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        self.logger.info("Coordinator stopped");
        Ok(())
    }
}
