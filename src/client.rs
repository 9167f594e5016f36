//! Device clients for the PVS management interface
//!
//! Two wire protocols exist. Older firmware serves the whole device list from
//! an unauthenticated CGI endpoint; build 61840 and later expose a session
//! authenticated variable server instead. Both are normalized into a
//! [`DeviceSnapshot`] so the coordinator never sees the difference.

pub mod ess;
pub mod legacy;
pub mod varserver;

pub use legacy::LegacyClient;
pub use varserver::VarserverClient;

use crate::error::{HeliosError, Result};
use crate::logging::get_logger;
use crate::snapshot::DeviceSnapshot;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::cookie::Jar;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Fixed account name for local API logins
pub const AUTH_USERNAME: &str = "ssm_owner";

/// Upper bound for any single HTTP exchange; queries are bounded tighter by callers
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Wire protocol spoken by a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Legacy,
    Varserver,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Varserver => f.write_str("varserver"),
        }
    }
}

/// Source of full device lists
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Fetch and normalize the device list within `timeout`
    async fn query_device_list(&self, timeout: Duration) -> Result<DeviceSnapshot>;

    /// Fetch battery, ESS and hub records from the energy storage report
    async fn query_ess_status(&self, timeout: Duration) -> Result<DeviceSnapshot>;

    fn protocol(&self) -> Protocol;
}

/// Build the `Authorization` value for a credential
///
/// The gateway expects the scheme in lowercase.
pub fn basic_auth_header(credential: &str) -> String {
    let token = STANDARD.encode(format!("{AUTH_USERNAME}:{credential}"));
    format!("basic {token}")
}

pub(crate) fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Read a response body as JSON, reporting bad payloads as parse failures
pub(crate) async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value> {
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| {
        HeliosError::parse(format!(
            "Invalid JSON from PVS ({} bytes): {}",
            text.len(),
            e
        ))
    })
}

/// Bound a query future by `limit`; overrunning is a transport failure
pub(crate) async fn bounded<F, T>(limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(HeliosError::timeout(format!(
            "PVS query exceeded {}s",
            limit.as_secs()
        ))),
    }
}

/// HTTP plumbing shared by both protocols
///
/// Holds the reqwest client (with its cookie jar), the base URLs for the
/// plain and TLS endpoints and the optional credential. The gateway uses a
/// self-signed certificate, so certificate validation is disabled.
pub struct GatewayHttp {
    plain_base: String,
    tls_base: String,
    credential: Option<String>,
    client: RwLock<reqwest::Client>,
    logger: crate::logging::StructuredLogger,
}

impl GatewayHttp {
    /// Endpoints derived from the gateway host (`http://host`, `https://host`)
    pub fn new(host: &str, credential: Option<String>) -> Result<Self> {
        let host = host.trim().trim_end_matches('/');
        Self::with_base_urls(
            &format!("http://{host}"),
            &format!("https://{host}"),
            credential,
        )
    }

    /// Explicit base URLs, e.g. a mock server for both
    pub fn with_base_urls(plain: &str, tls: &str, credential: Option<String>) -> Result<Self> {
        let credential = credential
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        Ok(Self {
            plain_base: plain.trim_end_matches('/').to_string(),
            tls_base: tls.trim_end_matches('/').to_string(),
            credential,
            client: RwLock::new(Self::build_client()?),
            logger: get_logger("gateway_http"),
        })
    }

    /// Same endpoints, different credential, fresh session
    pub fn with_credential(&self, credential: Option<String>) -> Result<Self> {
        Self::with_base_urls(&self.plain_base, &self.tls_base, credential)
    }

    fn build_client() -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .cookie_provider(Arc::new(Jar::default()))
            .user_agent(concat!("helios/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HeliosError::connection(format!("Failed to build HTTP client: {e}")))
    }

    /// Current client; cheap to clone
    pub fn client(&self) -> reqwest::Client {
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn plain_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.plain_base, path_and_query)
    }

    pub fn tls_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.tls_base, path_and_query)
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// Log in and obtain a session cookie
    ///
    /// Stale cookies interfere with the login, so every attempt starts from a
    /// fresh jar.
    pub async fn authenticate(&self) -> Result<()> {
        let Some(credential) = self.credential.as_deref() else {
            return Err(HeliosError::auth(
                "Authentication required but no credential configured",
            ));
        };

        let fresh = Self::build_client()?;
        match self.client.write() {
            Ok(mut guard) => *guard = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }

        let url = self.tls_url("/auth?login");
        self.logger.debug(&format!("Authenticating against {url}"));
        let resp = fresh
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, basic_auth_header(credential))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            self.logger.info("Session authentication successful");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        self.logger.warn(&format!(
            "Authentication failed: HTTP {} {}",
            status.as_u16(),
            snippet
        ));
        Err(HeliosError::auth(format!(
            "PVS rejected credential: HTTP {}",
            status.as_u16()
        )))
    }
}

/// Build the client for `protocol` over shared plumbing
pub fn client_for(protocol: Protocol, http: Arc<GatewayHttp>) -> Box<dyn DeviceClient> {
    match protocol {
        Protocol::Legacy => Box::new(LegacyClient::new(http)),
        Protocol::Varserver => Box::new(VarserverClient::new(http)),
    }
}
