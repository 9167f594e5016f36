//! Read-only status API
//!
//! Handlers never touch the coordinator; they read the latest
//! [`CoordinatorStatus`] published on its watch channel.

use crate::coordinator::CoordinatorStatus;
use crate::logging::get_logger;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub status_rx: watch::Receiver<Arc<CoordinatorStatus>>,
}

impl AppState {
    pub const fn new(status_rx: watch::Receiver<Arc<CoordinatorStatus>>) -> Self {
        Self { status_rx }
    }

    fn latest(&self) -> Arc<CoordinatorStatus> {
        self.status_rx.borrow().clone()
    }
}

fn not_ready(what: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": format!("{what} not available yet") })),
    )
        .into_response()
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Cycle counters, data source and the diagnostics report
pub async fn status(State(state): State<AppState>) -> Response {
    let latest = state.latest();
    Json(serde_json::json!({
        "cycles": latest.cycles,
        "updated_at": latest.updated_at,
        "source": latest.source,
        "report": latest.report,
    }))
    .into_response()
}

pub async fn diagnostics(State(state): State<AppState>) -> Response {
    let latest = state.latest();
    match &latest.report {
        Some(report) => Json(report).into_response(),
        None => not_ready("Diagnostics"),
    }
}

/// Last snapshot in the gateway's own device-list shape
pub async fn latest_snapshot(State(state): State<AppState>) -> Response {
    let latest = state.latest();
    match &latest.snapshot {
        Some(snapshot) => Json(snapshot.to_device_list()).into_response(),
        None => not_ready("Device data"),
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/snapshot", get(latest_snapshot))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    status_rx: watch::Receiver<Arc<CoordinatorStatus>>,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let router = build_router(AppState::new(status_rx));
    let logger = get_logger("web");

    let addr = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            logger.warn(&format!("Invalid host '{host}'; falling back to 127.0.0.1"));
            ([127, 0, 0, 1], port).into()
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Status API listening at http://{}:{}/api",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{CacheReason, DataSource};
    use crate::snapshot::{DeviceRecord, DeviceSnapshot, DeviceType};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn populated() -> CoordinatorStatus {
        let mut snapshot = DeviceSnapshot::new();
        snapshot.insert(DeviceType::Pvs, "ZT0001", DeviceRecord::new());
        snapshot.insert(DeviceType::Inverter, "E001", DeviceRecord::new());
        CoordinatorStatus {
            report: None,
            snapshot: Some(snapshot),
            source: Some(DataSource::Cache {
                reason: CacheReason::NightMode,
                age: Duration::from_secs(1800),
            }),
            cycles: 4,
            updated_at: Some(chrono::Utc::now()),
        }
    }

    fn router_with(status: CoordinatorStatus) -> (Router, watch::Sender<Arc<CoordinatorStatus>>) {
        let (tx, rx) = watch::channel(Arc::new(status));
        (build_router(AppState::new(rx)), tx)
    }

    #[tokio::test]
    async fn health_ok() {
        let (router, _tx) = router_with(CoordinatorStatus::default());
        let response = router
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn snapshot_unavailable_before_first_cycle() {
        let (router, _tx) = router_with(CoordinatorStatus::default());
        let (status, body) = get_json(router, "/api/snapshot").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn snapshot_uses_gateway_list_shape() {
        let (router, _tx) = router_with(populated());
        let (status, body) = get_json(router, "/api/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        let list = body["devices"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|d| d["DEVICE_TYPE"] == "Inverter" && d["SERIAL"] == "E001"));
    }

    #[tokio::test]
    async fn status_reports_source_and_cycles() {
        let (router, _tx) = router_with(populated());
        let (status, body) = get_json(router, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cycles"], 4);
        assert_eq!(body["source"]["kind"], "cache");
        assert_eq!(body["source"]["reason"], "night mode fallback");
        assert_eq!(body["source"]["age_seconds"], 1800);
    }

    #[tokio::test]
    async fn status_follows_latest_publication() {
        let (tx, rx) = watch::channel(Arc::new(CoordinatorStatus::default()));
        let state = AppState::new(rx);
        tx.send_replace(Arc::new(populated()));
        let (_, body) = get_json(build_router(state), "/api/status").await;
        assert_eq!(body["cycles"], 4);
    }

    #[tokio::test]
    async fn diagnostics_missing_report_is_503() {
        let (router, _tx) = router_with(populated());
        let (status, _) = get_json(router, "/api/diagnostics").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
