//! Variable-server client for firmware with the local API
//!
//! Variables are fetched by path prefix and come back as a flat list of
//! `{name, value}` pairs. Device variables are grouped by the numeric index in
//! the path (`/sys/devices/inverter/3/p3phsumKw`) and mapped onto the field
//! names of the legacy device list.

use super::ess::{ESS_PREFIX, ess_report_from_vars, ess_snapshot};
use super::{DeviceClient, GatewayHttp, Protocol, bounded, is_auth_status, read_json};
use crate::error::{HeliosError, Result};
use crate::logging::get_logger;
use crate::snapshot::DeviceSnapshot;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sessions are renewed proactively after this long
pub const REAUTH_INTERVAL: Duration = Duration::from_secs(3600);

const INFO_PREFIX: &str = "/sys/info/";
const INVERTER_PREFIX: &str = "/sys/devices/inverter/";
const METER_PREFIX: &str = "/sys/devices/meter/";
const FLASH_WEAR_VAR: &str = "/sys/pvs/flashwear_type_b";

/// Path segment holding the device index
const INDEX_POSITION: usize = 4;

/// (varserver parameter, device-list field); missing values default to 0
const INVERTER_FIELDS: &[(&str, &str)] = &[
    ("ltea3phsumKwh", "ltea_3phsum_kwh"),
    ("p3phsumKw", "p_3phsum_kw"),
    ("vln3phavgV", "vln_3phavg_v"),
    ("freqHz", "freq_hz"),
    ("i3phsumA", "i_3phsum_a"),
    ("tHtsnkDegc", "t_htsnk_degc"),
];

const METER_FIELDS: &[(&str, &str)] = &[
    ("netLtea3phsumKwh", "net_ltea_3phsum_kwh"),
    ("p3phsumKw", "p_3phsum_kw"),
    ("freqHz", "freq_hz"),
];

#[derive(Debug, Deserialize)]
struct VarsResponse {
    #[serde(default)]
    values: Vec<VarEntry>,
}

#[derive(Debug, Deserialize)]
struct VarEntry {
    name: String,
    #[serde(default)]
    value: Value,
}

/// Session-authenticated client for `POST /vars?name=<prefix>`
pub struct VarserverClient {
    http: Arc<GatewayHttp>,
    last_auth: Mutex<Option<Instant>>,
    flash_wear: bool,
    logger: crate::logging::StructuredLogger,
}

impl VarserverClient {
    pub fn new(http: Arc<GatewayHttp>) -> Self {
        Self {
            http,
            last_auth: Mutex::new(None),
            flash_wear: true,
            logger: get_logger("varserver_client"),
        }
    }

    /// Skip the flash-wear lookup (older local API builds lack the variable)
    #[must_use]
    pub const fn without_flash_wear(mut self) -> Self {
        self.flash_wear = false;
        self
    }

    fn session_due(&self) -> bool {
        match self.last_auth.lock() {
            Ok(guard) => guard.is_none_or(|at| at.elapsed() >= REAUTH_INTERVAL),
            Err(_) => true,
        }
    }

    fn mark_authenticated(&self) {
        if let Ok(mut guard) = self.last_auth.lock() {
            *guard = Some(Instant::now());
        }
    }

    async fn login(&self) -> Result<()> {
        self.http.authenticate().await?;
        self.mark_authenticated();
        Ok(())
    }

    async fn ensure_session(&self) -> Result<()> {
        if self.session_due() {
            self.logger.debug("Opening varserver session");
            self.login().await?;
        }
        Ok(())
    }

    async fn post_vars(&self, name: &str) -> Result<reqwest::Response> {
        let url = self.http.tls_url("/vars");
        Ok(self
            .http
            .client()
            .post(&url)
            .query(&[("name", name)])
            .send()
            .await?)
    }

    /// All variables under `prefix`, keyed by full name
    pub async fn fetch_vars(&self, prefix: &str) -> Result<BTreeMap<String, Value>> {
        self.ensure_session().await?;

        let mut resp = self.post_vars(prefix).await?;
        if is_auth_status(resp.status()) {
            self.logger.info(&format!(
                "Session rejected (HTTP {}), re-authenticating",
                resp.status().as_u16()
            ));
            self.login().await?;
            resp = self.post_vars(prefix).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(HeliosError::connection(format!(
                "Varserver returned HTTP {} for {}",
                status.as_u16(),
                prefix
            )));
        }

        let body = read_json(resp).await?;
        let parsed: VarsResponse = serde_json::from_value(body)
            .map_err(|e| HeliosError::parse(format!("Unexpected varserver payload: {e}")))?;
        Ok(parsed
            .values
            .into_iter()
            .map(|entry| (entry.name, entry.value))
            .collect())
    }

    /// Flash wear in percent; absent or malformed values are `None`
    pub async fn fetch_flash_wear(&self) -> Option<u64> {
        match self.fetch_vars(FLASH_WEAR_VAR).await {
            Ok(vars) => vars.get(FLASH_WEAR_VAR).and_then(parse_flash_wear),
            Err(e) => {
                self.logger.debug(&format!("Flash wear unavailable: {e}"));
                None
            }
        }
    }

    async fn fetch(&self) -> Result<Value> {
        let info = self.fetch_vars(INFO_PREFIX).await?;
        let inverters = self.fetch_vars(INVERTER_PREFIX).await?;
        let meters = self.fetch_vars(METER_PREFIX).await?;
        let flash_wear = if self.flash_wear {
            self.fetch_flash_wear().await
        } else {
            None
        };

        let list = build_device_list(&info, &inverters, &meters, flash_wear);
        self.logger.debug(&format!(
            "Assembled {} devices from varserver",
            list.get("devices").and_then(Value::as_array).map_or(0, Vec::len)
        ));
        Ok(list)
    }
}

#[async_trait]
impl DeviceClient for VarserverClient {
    async fn query_device_list(&self, timeout: Duration) -> Result<DeviceSnapshot> {
        let payload = bounded(timeout, self.fetch()).await?;
        DeviceSnapshot::from_device_list(&payload)
    }

    async fn query_ess_status(&self, timeout: Duration) -> Result<DeviceSnapshot> {
        let vars = bounded(timeout, self.fetch_vars(ESS_PREFIX)).await?;
        let grouped = group_by_index(&vars);
        self.logger
            .debug(&format!("Found {} ESS devices on varserver", grouped.len()));
        ess_snapshot(&ess_report_from_vars(&grouped))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Varserver
    }
}

/// `"0x3"` or `"3"` (or a bare number) times ten
pub fn parse_flash_wear(value: &Value) -> Option<u64> {
    let raw = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok()?,
                None => s.parse().ok()?,
            }
        }
        _ => return None,
    };
    raw.checked_mul(10)
}

/// Group `/sys/devices/<kind>/<idx>/<param>` variables by index
fn group_by_index(vars: &BTreeMap<String, Value>) -> BTreeMap<u32, BTreeMap<String, Value>> {
    let mut grouped: BTreeMap<u32, BTreeMap<String, Value>> = BTreeMap::new();
    for (name, value) in vars {
        let parts: Vec<&str> = name.split('/').collect();
        let (Some(idx), Some(param)) = (parts.get(INDEX_POSITION), parts.get(INDEX_POSITION + 1))
        else {
            continue;
        };
        let Ok(idx) = idx.parse::<u32>() else {
            continue;
        };
        if param.is_empty() {
            continue;
        }
        grouped
            .entry(idx)
            .or_default()
            .insert((*param).to_string(), value.clone());
    }
    grouped
}

fn text_or(params: &BTreeMap<String, Value>, key: &str, default: &str) -> Value {
    match params.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Value::String(s.clone()),
        Some(Value::Number(n)) => Value::String(n.to_string()),
        _ => Value::String(default.to_string()),
    }
}

fn number_or_zero(params: &BTreeMap<String, Value>, key: &str) -> Value {
    match params.get(key) {
        Some(v @ (Value::Number(_) | Value::String(_))) => v.clone(),
        _ => json!(0.0),
    }
}

fn common_fields(
    params: &BTreeMap<String, Value>,
    device_type: &str,
    serial: &Value,
) -> Map<String, Value> {
    let mut dev = Map::new();
    dev.insert("DEVICE_TYPE".into(), json!(device_type));
    dev.insert("SERIAL".into(), serial.clone());
    dev.insert("TYPE".into(), json!(device_type));
    dev.insert("STATE".into(), text_or(params, "state", "working"));
    dev.insert("MODEL".into(), text_or(params, "prodMdlNm", ""));
    dev.insert("HWVER".into(), text_or(params, "hwVer", ""));
    dev.insert("SWVER".into(), text_or(params, "swVer", ""));
    dev.insert("DATATIME".into(), text_or(params, "msmtEps", ""));
    if let Some(s) = serial.as_str() {
        dev.insert("DESCR".into(), json!(format!("{device_type} {s}")));
    }
    dev
}

/// Reassemble the legacy `{"devices": [...]}` shape from varserver variables
fn build_device_list(
    info: &BTreeMap<String, Value>,
    inverters: &BTreeMap<String, Value>,
    meters: &BTreeMap<String, Value>,
    flash_wear: Option<u64>,
) -> Value {
    let mut devices = Vec::new();

    if !info.is_empty() {
        let get = |key: &str, default: &str| {
            info.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        let mut pvs = Map::new();
        pvs.insert("DEVICE_TYPE".into(), json!("PVS"));
        pvs.insert("TYPE".into(), json!("PVS"));
        pvs.insert("SERIAL".into(), json!(get("/sys/info/serialnum", "UNKNOWN")));
        pvs.insert("MODEL".into(), json!(get("/sys/info/model", "PVS6")));
        pvs.insert("HWVER".into(), json!(get("/sys/info/hwrev", "")));
        pvs.insert("SWVER".into(), json!(get("/sys/info/sw_rev", "")));
        pvs.insert("STATE".into(), json!("working"));
        if let Some(pct) = flash_wear {
            pvs.insert("flashwear_type_b".into(), json!(pct));
        }
        devices.push(Value::Object(pvs));
    }

    for (idx, params) in group_by_index(inverters) {
        let serial = text_or(&params, "sn", &format!("INV_{idx}"));
        let mut dev = common_fields(&params, "Inverter", &serial);
        for (var, field) in INVERTER_FIELDS {
            dev.insert((*field).to_string(), number_or_zero(&params, var));
        }
        devices.push(Value::Object(dev));
    }

    for (idx, params) in group_by_index(meters) {
        let serial = text_or(&params, "sn", &format!("METER_{idx}"));
        let mut dev = common_fields(&params, "Power Meter", &serial);
        for (var, field) in METER_FIELDS {
            dev.insert((*field).to_string(), number_or_zero(&params, var));
        }
        devices.push(Value::Object(dev));
    }

    json!({ "devices": devices })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{DeviceType, FieldValue};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vars(pairs: &[(&str, Value)]) -> Value {
        json!({
            "count": pairs.len(),
            "values": pairs.iter().map(|(n, v)| json!({"name": n, "value": v})).collect::<Vec<_>>()
        })
    }

    async fn mount_vars(server: &MockServer, prefix: &str, body: Value) {
        Mock::given(method("POST"))
            .and(path("/vars"))
            .and(query_param("name", prefix))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_gateway(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        mount_vars(
            server,
            INFO_PREFIX,
            vars(&[
                ("/sys/info/serialnum", json!("ZT222885000549W3193")),
                ("/sys/info/model", json!("PV Supervisor PVS6")),
                ("/sys/info/sw_rev", json!("2025.06, Build 61846")),
            ]),
        )
        .await;
        mount_vars(
            server,
            INVERTER_PREFIX,
            vars(&[
                ("/sys/devices/inverter/0/sn", json!("E00122142080335")),
                ("/sys/devices/inverter/0/p3phsumKw", json!(0.2311)),
                ("/sys/devices/inverter/0/prodMdlNm", json!("AC_Module_Type_H")),
                ("/sys/devices/inverter/1/p3phsumKw", json!(0.198)),
            ]),
        )
        .await;
        mount_vars(
            server,
            METER_PREFIX,
            vars(&[
                ("/sys/devices/meter/0/sn", json!("PVS6M22283193p")),
                ("/sys/devices/meter/0/netLtea3phsumKwh", json!(1234.5)),
            ]),
        )
        .await;
        mount_vars(
            server,
            FLASH_WEAR_VAR,
            vars(&[(FLASH_WEAR_VAR, json!("0x3"))]),
        )
        .await;
    }

    fn client(server: &MockServer) -> VarserverClient {
        let http = GatewayHttp::with_base_urls(&server.uri(), &server.uri(), Some("93193".into()))
            .unwrap();
        VarserverClient::new(Arc::new(http))
    }

    #[test]
    fn flash_wear_parsing() {
        assert_eq!(parse_flash_wear(&json!("0x3")), Some(30));
        assert_eq!(parse_flash_wear(&json!("0x0a")), Some(100));
        assert_eq!(parse_flash_wear(&json!("4")), Some(40));
        assert_eq!(parse_flash_wear(&json!(2)), Some(20));
        assert_eq!(parse_flash_wear(&json!("zz")), None);
        assert_eq!(parse_flash_wear(&Value::Null), None);
    }

    #[test]
    fn grouping_ignores_malformed_paths() {
        let mut v = BTreeMap::new();
        v.insert("/sys/devices/inverter/0/sn".to_string(), json!("A"));
        v.insert("/sys/devices/inverter/x/sn".to_string(), json!("B"));
        v.insert("/sys/devices/inverter/".to_string(), json!("C"));
        v.insert("/sys/devices/inverter/2/".to_string(), json!("D"));
        let grouped = group_by_index(&v);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[&0]["sn"], json!("A"));
    }

    #[test]
    fn device_list_uses_legacy_names_and_defaults() {
        let info = BTreeMap::from([("/sys/info/serialnum".to_string(), json!("ZT1"))]);
        let inverters = BTreeMap::from([(
            "/sys/devices/inverter/7/freqHz".to_string(),
            json!(60.01),
        )]);
        let list = build_device_list(&info, &inverters, &BTreeMap::new(), Some(30));
        let snap = DeviceSnapshot::from_device_list(&list).unwrap();

        let pvs = snap.device(DeviceType::Pvs, "ZT1").unwrap();
        assert_eq!(pvs.get("MODEL").and_then(FieldValue::as_str), Some("PVS6"));
        assert_eq!(pvs.get("flashwear_type_b").and_then(FieldValue::as_f64), Some(30.0));

        let inv = snap.device(DeviceType::Inverter, "INV_7").unwrap();
        assert_eq!(inv.get("freq_hz").and_then(FieldValue::as_f64), Some(60.01));
        assert_eq!(inv.get("p_3phsum_kw").and_then(FieldValue::as_f64), Some(0.0));
        assert_eq!(inv.get("STATE").and_then(FieldValue::as_str), Some("working"));
    }

    #[tokio::test]
    async fn queries_all_prefixes() {
        let server = MockServer::start().await;
        mount_gateway(&server).await;

        let snap = client(&server)
            .query_device_list(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(snap.serials(DeviceType::Inverter).len(), 2);
        assert!(snap.device(DeviceType::Inverter, "E00122142080335").is_some());
        assert!(snap.device(DeviceType::Inverter, "INV_1").is_some());
        let meter = snap.device(DeviceType::PowerMeter, "PVS6M22283193p").unwrap();
        assert_eq!(
            meter.get("net_ltea_3phsum_kwh").and_then(FieldValue::as_f64),
            Some(1234.5)
        );
        let pvs = snap.device(DeviceType::Pvs, "ZT222885000549W3193").unwrap();
        assert_eq!(pvs.get("flashwear_type_b").and_then(FieldValue::as_f64), Some(30.0));
    }

    #[tokio::test]
    async fn authenticates_once_for_many_queries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        mount_vars(&server, INFO_PREFIX, vars(&[("/sys/info/serialnum", json!("ZT1"))])).await;
        mount_vars(&server, INVERTER_PREFIX, vars(&[])).await;
        mount_vars(&server, METER_PREFIX, vars(&[])).await;

        let c = client(&server).without_flash_wear();
        c.query_device_list(Duration::from_secs(5)).await.unwrap();
        c.query_device_list(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_session_is_renewed_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vars"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_vars(&server, INFO_PREFIX, vars(&[("/sys/info/serialnum", json!("ZT1"))])).await;
        mount_vars(&server, INVERTER_PREFIX, vars(&[])).await;
        mount_vars(&server, METER_PREFIX, vars(&[])).await;

        let snap = client(&server)
            .without_flash_wear()
            .query_device_list(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(snap.device_count(), 1);
    }

    #[tokio::test]
    async fn persistent_rejection_is_connection_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vars"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client(&server)
            .query_device_list(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HeliosError::Connection { .. }));
    }

    #[tokio::test]
    async fn login_failure_surfaces_as_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server)
            .query_device_list(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HeliosError::Auth { .. }));
    }

    #[tokio::test]
    async fn ess_vars_become_battery_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        mount_vars(
            &server,
            ESS_PREFIX,
            vars(&[
                ("/sys/devices/ess/0/sn", json!("BC212200611033751")),
                ("/sys/devices/ess/0/socVal", json!(0.82)),
                ("/sys/devices/ess/0/vBattV", json!(50.0)),
                ("/sys/devices/ess/0/p3phsumKw", json!(1.0)),
            ]),
        )
        .await;

        let snap = client(&server)
            .query_ess_status(Duration::from_secs(5))
            .await
            .unwrap();
        let battery = snap
            .device(DeviceType::EssBms, "ess_battery_0_033751")
            .unwrap();
        assert_eq!(battery["system_state_of_charge"].as_f64(), Some(0.82));
        assert_eq!(battery["battery_amperage"].as_f64(), Some(20.0));
        let ess = snap
            .device(DeviceType::EnergyStorageSystem, "ess_virtual_0_11033751")
            .unwrap();
        assert_eq!(ess["agg_power"].as_f64(), Some(1.0));
    }

    #[tokio::test]
    async fn ess_without_devices_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        mount_vars(&server, ESS_PREFIX, vars(&[])).await;

        let snap = client(&server)
            .query_ess_status(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(snap.is_empty());
    }
}
