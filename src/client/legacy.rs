//! CGI device list client for firmware before the local API

use super::ess::{ESS_STATUS_PATH, ess_snapshot};
use super::{DeviceClient, GatewayHttp, Protocol, bounded, is_auth_status, read_json};
use crate::error::{HeliosError, Result};
use crate::logging::get_logger;
use crate::snapshot::DeviceSnapshot;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const DEVICE_LIST_PATH: &str = "/cgi-bin/dl_cgi?Command=DeviceList";

/// `GET /cgi-bin/dl_cgi?Command=DeviceList` over plain HTTP
///
/// Unauthenticated first. Some transitional builds answer 401/403 here, in
/// which case a session is opened and the request retried once. The ESS
/// status report follows the same rules.
pub struct LegacyClient {
    http: Arc<GatewayHttp>,
    logger: crate::logging::StructuredLogger,
}

impl LegacyClient {
    pub fn new(http: Arc<GatewayHttp>) -> Self {
        Self {
            http,
            logger: get_logger("legacy_client"),
        }
    }

    async fn fetch(&self, endpoint: &str) -> Result<serde_json::Value> {
        let url = self.http.plain_url(endpoint);
        let resp = self.http.client().get(&url).send().await?;
        let status = resp.status();
        if status.is_success() {
            return read_json(resp).await;
        }
        if !is_auth_status(status) {
            return Err(HeliosError::connection(format!(
                "PVS returned HTTP {}",
                status.as_u16()
            )));
        }

        self.logger.info(&format!(
            "{} requires authentication (HTTP {})",
            endpoint,
            status.as_u16()
        ));
        self.http.authenticate().await?;

        let resp = self.http.client().get(&url).send().await?;
        let status = resp.status();
        if status.is_success() {
            return read_json(resp).await;
        }
        Err(HeliosError::connection(format!(
            "PVS returned HTTP {} after authentication",
            status.as_u16()
        )))
    }
}

#[async_trait]
impl DeviceClient for LegacyClient {
    async fn query_device_list(&self, timeout: Duration) -> Result<DeviceSnapshot> {
        let payload = bounded(timeout, self.fetch(DEVICE_LIST_PATH)).await?;
        DeviceSnapshot::from_device_list(&payload)
    }

    async fn query_ess_status(&self, timeout: Duration) -> Result<DeviceSnapshot> {
        let payload = bounded(timeout, self.fetch(ESS_STATUS_PATH)).await?;
        ess_snapshot(&payload)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Legacy
    }
}
