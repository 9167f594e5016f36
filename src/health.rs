//! PVS reachability probe
//!
//! A cheap TCP connect in front of the expensive device-list query. Repeated
//! failure puts the instance into a cooldown window during which no network
//! traffic is attempted at all.

use crate::logging::get_logger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Upper bound for a single connect attempt
const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a whole probe including pauses
const MAX_PROBE_BUDGET: Duration = Duration::from_secs(30);

/// Per-instance probe state, owned by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub consecutive_failures: u32,
    /// `None` means no cooldown is pending
    pub backoff_until: Option<DateTime<Utc>>,
    pub first_poll_done: bool,
}

impl HealthState {
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Fresh trust window; the first-poll flag survives
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.backoff_until = None;
    }
}

/// Result of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unreachable,
    Backoff,
}

/// One connectivity attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str, timeout: Duration) -> bool;
}

/// Plain TCP connect to the gateway's web port
pub struct TcpConnector {
    default_port: u16,
}

impl TcpConnector {
    pub const fn new(default_port: u16) -> Self {
        Self { default_port }
    }

    fn target(&self, address: &str) -> String {
        if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, self.default_port)
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str, attempt_timeout: Duration) -> bool {
        matches!(
            timeout(attempt_timeout, TcpStream::connect(self.target(address))).await,
            Ok(Ok(_))
        )
    }
}

/// Retry loop with cooldown around a [`Connector`]
pub struct HealthProber {
    connector: Arc<dyn Connector>,
    attempt_timeout: Duration,
    retry_pause: Duration,
    budget: Duration,
    logger: crate::logging::StructuredLogger,
}

impl HealthProber {
    /// Timeouts derive from the polling interval so a probe never eats a whole cycle
    pub fn new(connector: Arc<dyn Connector>, interval: Duration, retry_pause: Duration) -> Self {
        Self {
            connector,
            attempt_timeout: MAX_ATTEMPT_TIMEOUT.min(interval / 10),
            retry_pause,
            budget: MAX_PROBE_BUDGET.min(interval / 4),
            logger: get_logger("health"),
        }
    }

    #[must_use]
    pub const fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub const fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub const fn budget(&self) -> Duration {
        self.budget
    }

    /// Probe the gateway, honoring and updating the cooldown in `state`
    pub async fn probe(
        &self,
        address: &str,
        max_retries: u32,
        backoff_window: Duration,
        state: &mut HealthState,
    ) -> HealthStatus {
        if !state.first_poll_done {
            // Network interfaces may still be coming up at startup
            state.first_poll_done = true;
            self.logger
                .info("First poll since startup, skipping health check");
            return HealthStatus::Healthy;
        }

        let now = Utc::now();
        if state.in_backoff(now) {
            if let Some(until) = state.backoff_until {
                self.logger.info(&format!(
                    "PVS in backoff period, {}s remaining",
                    (until - now).num_seconds()
                ));
            }
            return HealthStatus::Backoff;
        }

        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            if self.connector.connect(address, self.attempt_timeout).await {
                if attempt > 1 {
                    self.logger
                        .info(&format!("PVS reachable on attempt {attempt}/{attempts}"));
                }
                state.consecutive_failures = 0;
                return HealthStatus::Healthy;
            }
            self.logger.debug(&format!(
                "Health check attempt {attempt}/{attempts} to {address} failed"
            ));
            if attempt < attempts {
                sleep(self.retry_pause).await;
            }
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let window = chrono::Duration::from_std(backoff_window).unwrap_or_else(|_| chrono::Duration::zero());
        state.backoff_until = Some(Utc::now() + window);
        self.logger.warn(&format!(
            "PVS unreachable after {} attempts, backing off for {}s (failures: {})",
            attempts,
            backoff_window.as_secs(),
            state.consecutive_failures
        ));
        HealthStatus::Unreachable
    }

    /// [`Self::probe`] bounded by the overall budget; overrunning counts as unreachable
    pub async fn probe_with_budget(
        &self,
        address: &str,
        max_retries: u32,
        backoff_window: Duration,
        state: &mut HealthState,
    ) -> HealthStatus {
        let budget = self.budget;
        let outcome = timeout(
            budget,
            self.probe(address, max_retries, backoff_window, state),
        )
        .await;
        if let Ok(status) = outcome {
            status
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            self.logger.warn(&format!(
                "Health check exceeded {}ms budget, PVS considered offline",
                budget.as_millis()
            ));
            HealthStatus::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted results; defaults to failure once exhausted
    struct ScriptedConnector {
        results: Mutex<VecDeque<bool>>,
        calls: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(results: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.iter().copied().collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _address: &str, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop_front().unwrap_or(false)
        }
    }

    struct SlowConnector;

    #[async_trait]
    impl Connector for SlowConnector {
        async fn connect(&self, _address: &str, _timeout: Duration) -> bool {
            sleep(Duration::from_secs(2)).await;
            true
        }
    }

    fn prober(connector: Arc<dyn Connector>) -> HealthProber {
        HealthProber::new(connector, Duration::from_secs(300), Duration::ZERO)
    }

    fn warmed_state() -> HealthState {
        HealthState {
            first_poll_done: true,
            ..HealthState::default()
        }
    }

    #[test]
    fn timeouts_derive_from_interval() {
        let p = HealthProber::new(ScriptedConnector::new(&[]), Duration::from_secs(300), Duration::ZERO);
        assert_eq!(p.attempt_timeout(), Duration::from_secs(5));
        assert_eq!(p.budget(), Duration::from_secs(30));

        let p = HealthProber::new(ScriptedConnector::new(&[]), Duration::from_secs(20), Duration::ZERO);
        assert_eq!(p.attempt_timeout(), Duration::from_secs(2));
        assert_eq!(p.budget(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn first_probe_is_healthy_without_network() {
        let conn = ScriptedConnector::new(&[false, false]);
        let p = prober(conn.clone());
        let mut state = HealthState::default();

        let status = p.probe("pvs", 2, Duration::from_secs(60), &mut state).await;

        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(conn.calls(), 0);
        assert!(state.first_poll_done);
    }

    #[tokio::test]
    async fn success_short_circuits() {
        let conn = ScriptedConnector::new(&[false, true, true]);
        let p = prober(conn.clone());
        let mut state = warmed_state();
        state.consecutive_failures = 3;

        let status = p.probe("pvs", 3, Duration::from_secs(60), &mut state).await;

        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(conn.calls(), 2);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.backoff_until.is_none());
    }

    #[tokio::test]
    async fn exhaustion_enters_backoff_then_retries_after_window() {
        let conn = ScriptedConnector::new(&[false, false]);
        let p = prober(conn.clone());
        let mut state = warmed_state();

        let status = p.probe("pvs", 2, Duration::from_secs(60), &mut state).await;
        assert_eq!(status, HealthStatus::Unreachable);
        assert_eq!(conn.calls(), 2);
        assert_eq!(state.consecutive_failures, 1);
        assert!(state.in_backoff(Utc::now()));

        let status = p.probe("pvs", 2, Duration::from_secs(60), &mut state).await;
        assert_eq!(status, HealthStatus::Backoff);
        assert_eq!(conn.calls(), 2);

        // Window elapsed
        state.backoff_until = Some(Utc::now() - chrono::Duration::seconds(1));
        let status = p.probe("pvs", 2, Duration::from_secs(60), &mut state).await;
        assert_eq!(status, HealthStatus::Unreachable);
        assert_eq!(conn.calls(), 4);
    }

    #[tokio::test]
    async fn budget_overrun_counts_as_unreachable() {
        let p = prober(Arc::new(SlowConnector)).with_budget(Duration::from_millis(50));
        let mut state = warmed_state();

        let status = p
            .probe_with_budget("pvs", 2, Duration::from_secs(60), &mut state)
            .await;

        assert_eq!(status, HealthStatus::Unreachable);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn reset_clears_backoff_but_not_first_poll() {
        let mut state = HealthState {
            consecutive_failures: 4,
            backoff_until: Some(Utc::now() + chrono::Duration::hours(1)),
            first_poll_done: true,
        };
        state.reset();
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.in_backoff(Utc::now()));
        assert!(state.first_poll_done);
    }

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let conn = TcpConnector::new(80);
        assert!(conn.connect(&addr, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!conn.connect(&addr, Duration::from_millis(500)).await);
    }

    #[test]
    fn tcp_connector_appends_default_port() {
        let conn = TcpConnector::new(80);
        assert_eq!(conn.target("172.27.153.1"), "172.27.153.1:80");
        assert_eq!(conn.target("10.0.0.5:9090"), "10.0.0.5:9090");
    }
}
