//! Firmware detection and protocol selection
//!
//! Runs once at startup. The supervisor info endpoint reports the firmware
//! build; builds at or above [`MIN_LOCALAPI_BUILD`] speak the varserver
//! protocol, older ones the legacy CGI. Some gateways report an eligible build
//! but only serve the legacy endpoint correctly, so every choice is confirmed
//! with a real query before it is accepted.

use crate::client::{DeviceClient, GatewayHttp, LegacyClient, Protocol, VarserverClient};
use crate::error::{HeliosError, Result};
use crate::logging::get_logger;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// First firmware build serving the local API
pub const MIN_LOCALAPI_BUILD: u32 = 61840;

const SUPERVISOR_INFO_PATH: &str = "/cgi-bin/dl_cgi/supervisor/info";

/// Build number and the format it was written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "format", content = "build", rename_all = "snake_case")]
pub enum BuildNumber {
    /// `61840`
    Numeric(u32),
    /// `2025.06, Build 61840` or `build:61840`
    Labelled(u32),
    /// `2025.6.3.61840`, build is the last component
    Dotted(u32),
    Unparseable,
}

impl BuildNumber {
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        if s.is_empty() {
            return Self::Unparseable;
        }

        if s.chars().all(|c| c.is_ascii_digit()) {
            return s.parse().map_or(Self::Unparseable, Self::Numeric);
        }

        let lower = s.to_ascii_lowercase();
        if let Some(pos) = lower.find("build") {
            let rest = s[pos + "build".len()..]
                .trim_start_matches(|c: char| c == ':' || c == '=' || c == '#' || c.is_whitespace());
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if let Ok(n) = digits.parse() {
                return Self::Labelled(n);
            }
            return Self::Unparseable;
        }

        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() >= 2
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        {
            if let Some(Ok(n)) = parts.last().map(|p| p.parse()) {
                return Self::Dotted(n);
            }
        }

        Self::Unparseable
    }

    /// Accept the build as the gateway reports it, number or string
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map_or(Self::Unparseable, Self::Numeric),
            Value::String(s) => Self::parse(s),
            _ => Self::Unparseable,
        }
    }

    pub const fn value(self) -> Option<u32> {
        match self {
            Self::Numeric(n) | Self::Labelled(n) | Self::Dotted(n) => Some(n),
            Self::Unparseable => None,
        }
    }
}

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(n) => write!(f, "{n}"),
            None => f.write_str("unknown"),
        }
    }
}

pub const fn select_protocol(build: u32) -> Protocol {
    if build >= MIN_LOCALAPI_BUILD {
        Protocol::Varserver
    } else {
        Protocol::Legacy
    }
}

/// Local API password: last five characters of the PVS serial, uppercased
pub fn credential_from_serial(serial: &str) -> Option<String> {
    let serial = serial.trim();
    let chars: Vec<char> = serial.chars().collect();
    if chars.len() < 5 {
        return None;
    }
    Some(chars[chars.len() - 5..].iter().collect::<String>().to_uppercase())
}

/// What setup learned about the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareProfile {
    pub build_number: Option<u32>,
    pub uses_new_protocol: bool,
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    pub serial: Option<String>,
}

impl FirmwareProfile {
    pub const fn protocol(&self) -> Protocol {
        if self.uses_new_protocol {
            Protocol::Varserver
        } else {
            Protocol::Legacy
        }
    }
}

/// Parsed supervisor info response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorInfo {
    pub build: BuildNumber,
    pub serial: Option<String>,
}

/// `GET /cgi-bin/dl_cgi/supervisor/info`
///
/// Fields may sit at the top level or under a `supervisor` object depending
/// on firmware.
pub async fn fetch_supervisor_info(http: &GatewayHttp, timeout: Duration) -> Result<SupervisorInfo> {
    let url = http.plain_url(SUPERVISOR_INFO_PATH);
    let resp = http.client().get(&url).timeout(timeout).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(HeliosError::connection(format!(
            "Supervisor info returned HTTP {}",
            status.as_u16()
        )));
    }
    let body = crate::client::read_json(resp).await?;
    let root = body.get("supervisor").unwrap_or(&body);

    Ok(SupervisorInfo {
        build: root
            .get("BUILD")
            .map_or(BuildNumber::Unparseable, BuildNumber::from_json),
        serial: root
            .get("SERIAL")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

/// Profile plus a client already proven to work
pub struct DetectedGateway {
    pub profile: FirmwareProfile,
    pub client: Box<dyn DeviceClient>,
}

/// Detect firmware and pick a working protocol
///
/// `configured_credential` wins over one derived from the serial.
pub async fn detect_profile(
    http: &GatewayHttp,
    configured_credential: Option<String>,
    timeout: Duration,
) -> Result<DetectedGateway> {
    let logger = get_logger("firmware");

    let info = match fetch_supervisor_info(http, timeout).await {
        Ok(info) => Some(info),
        Err(e) => {
            logger.warn(&format!("Supervisor info unavailable: {e}"));
            None
        }
    };

    let serial = info.as_ref().and_then(|i| i.serial.clone());
    let credential = configured_credential
        .filter(|c| !c.trim().is_empty())
        .or_else(|| serial.as_deref().and_then(credential_from_serial));
    let http = Arc::new(http.with_credential(credential.clone())?);
    let build = info.as_ref().and_then(|i| i.build.value());

    let profile = |uses_new_protocol| FirmwareProfile {
        build_number: build,
        uses_new_protocol,
        credential: credential.clone(),
        serial: serial.clone(),
    };

    let candidates: Vec<Protocol> = match build {
        Some(b) => {
            logger.info(&format!(
                "PVS firmware build {b}, selecting {} protocol",
                select_protocol(b)
            ));
            match select_protocol(b) {
                Protocol::Varserver => vec![Protocol::Varserver, Protocol::Legacy],
                Protocol::Legacy => vec![Protocol::Legacy],
            }
        }
        None if credential.is_some() => {
            logger.info("Firmware build unknown, probing both protocols");
            vec![Protocol::Varserver, Protocol::Legacy]
        }
        None => {
            logger.info("Firmware build unknown and no credential, probing legacy protocol");
            vec![Protocol::Legacy]
        }
    };

    let mut last_error = None;
    for protocol in candidates {
        let client: Box<dyn DeviceClient> = match protocol {
            Protocol::Varserver => {
                if credential.is_none() {
                    continue;
                }
                Box::new(VarserverClient::new(http.clone()))
            }
            Protocol::Legacy => Box::new(LegacyClient::new(http.clone())),
        };
        match client.query_device_list(timeout).await {
            Ok(snapshot) => {
                logger.info(&format!(
                    "{} protocol validated with {} devices",
                    protocol,
                    snapshot.device_count()
                ));
                return Ok(DetectedGateway {
                    profile: profile(protocol == Protocol::Varserver),
                    client,
                });
            }
            Err(e) => {
                logger.warn(&format!("{protocol} protocol validation failed: {e}"));
                last_error = Some(e);
            }
        }
    }

    Err(HeliosError::connection(format!(
        "No protocol could be validated against the PVS: {}",
        last_error.map_or_else(|| "no credential for varserver".to_string(), |e| e.to_string())
    )))
}

/// A gateway configured for the legacy protocol that now reports a local API build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareUpgrade {
    pub from: Option<u32>,
    pub to: u32,
}

pub fn detect_upgrade(
    previous: Protocol,
    stored_build: Option<&str>,
    current: BuildNumber,
) -> Option<FirmwareUpgrade> {
    if previous != Protocol::Legacy {
        return None;
    }
    let to = current.value()?;
    (select_protocol(to) == Protocol::Varserver).then(|| FirmwareUpgrade {
        from: stored_build.and_then(|b| BuildNumber::parse(b).value()),
        to,
    })
}
