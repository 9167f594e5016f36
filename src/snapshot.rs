//! Normalized device snapshot
//!
//! The PVS reports a flat `{"devices": [...]}` list where every entry carries
//! a `DEVICE_TYPE` tag and a `SERIAL`. Helios indexes that list by a closed
//! set of device types and by serial, keeping each record's fields open so
//! firmware can add new ones without breaking parsing.

use crate::error::{HeliosError, Result};
use crate::logging::get_logger;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Field carrying the device type tag in every record
pub const DEVICE_TYPE_FIELD: &str = "DEVICE_TYPE";

/// Field carrying the serial number in every record
pub const SERIAL_FIELD: &str = "SERIAL";

/// Longer serials indicate a corrupted payload
const MAX_SERIAL_LEN: usize = 50;

/// Device type tags known to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "PVS")]
    Pvs,
    #[serde(rename = "Inverter")]
    Inverter,
    #[serde(rename = "Power Meter")]
    PowerMeter,
    #[serde(rename = "ESS BMS")]
    EssBms,
    #[serde(rename = "Energy Storage System")]
    EnergyStorageSystem,
    #[serde(rename = "ESS")]
    Ess,
    #[serde(rename = "Battery")]
    Battery,
    #[serde(rename = "HUB+")]
    HubPlus,
    #[serde(rename = "SunVault")]
    SunVault,
    /// Synthetic device carrying polling diagnostics
    #[serde(rename = "Enhanced SunPower Diagnostics")]
    Diagnostics,
}

impl DeviceType {
    pub const ALL: [Self; 10] = [
        Self::Pvs,
        Self::Inverter,
        Self::PowerMeter,
        Self::EssBms,
        Self::EnergyStorageSystem,
        Self::Ess,
        Self::Battery,
        Self::HubPlus,
        Self::SunVault,
        Self::Diagnostics,
    ];

    /// Tag as it appears in `DEVICE_TYPE`
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Pvs => "PVS",
            Self::Inverter => "Inverter",
            Self::PowerMeter => "Power Meter",
            Self::EssBms => "ESS BMS",
            Self::EnergyStorageSystem => "Energy Storage System",
            Self::Ess => "ESS",
            Self::Battery => "Battery",
            Self::HubPlus => "HUB+",
            Self::SunVault => "SunVault",
            Self::Diagnostics => "Enhanced SunPower Diagnostics",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag.trim())
    }

    /// Types whose presence means the site has battery storage
    pub const fn is_battery(self) -> bool {
        matches!(
            self,
            Self::EssBms | Self::EnergyStorageSystem | Self::Ess | Self::Battery | Self::SunVault
        )
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Scalar field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl FieldValue {
    /// Convert a JSON scalar; nulls and nested values are not fields
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => Some(Self::Number(n.clone())),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; the PVS reports many numbers as strings
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn float(value: f64) -> Self {
        serde_json::Number::from_f64(value).map_or_else(|| Self::Text(value.to_string()), Self::Number)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Fields of one device
pub type DeviceRecord = BTreeMap<String, FieldValue>;

/// All devices reported at one point in time, by type then serial
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSnapshot {
    devices: BTreeMap<DeviceType, BTreeMap<String, DeviceRecord>>,
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from the raw `{"devices": [...]}` payload
    ///
    /// Entries that are not objects, lack a type or serial, carry an
    /// implausible serial, or use an unknown type tag are skipped. A payload
    /// yielding no devices is rejected.
    pub fn from_device_list(payload: &Value) -> Result<Self> {
        let logger = get_logger("snapshot");

        let Some(root) = payload.as_object() else {
            return Err(HeliosError::parse("Device list payload is not an object"));
        };
        let Some(devices) = root.get("devices") else {
            return Err(HeliosError::parse("Device list payload has no 'devices' key"));
        };
        let Some(entries) = devices.as_array() else {
            return Err(HeliosError::parse("'devices' is not a list"));
        };

        let mut snapshot = Self::new();
        for (idx, entry) in entries.iter().enumerate() {
            let Some(fields) = entry.as_object() else {
                logger.warn(&format!("Device {idx} is not an object, skipping"));
                continue;
            };
            let Some(tag) = fields.get(DEVICE_TYPE_FIELD).and_then(Value::as_str) else {
                logger.warn(&format!("Device {idx} missing {DEVICE_TYPE_FIELD}, skipping"));
                continue;
            };
            let Some(serial) = fields.get(SERIAL_FIELD).and_then(serial_of) else {
                logger.warn(&format!("Device {idx} missing {SERIAL_FIELD}, skipping"));
                continue;
            };
            if serial.len() > MAX_SERIAL_LEN {
                logger.warn(&format!("Device {idx} has suspiciously long serial, skipping"));
                continue;
            }
            let Some(device_type) = DeviceType::from_tag(tag) else {
                logger.debug(&format!("Device {serial} has unrecognized type '{tag}', skipping"));
                continue;
            };

            snapshot.insert(device_type, &serial, record_from_object(fields));
        }

        if snapshot.is_empty() {
            return Err(HeliosError::validation(
                "devices",
                format!("No valid devices in {} entries", entries.len()),
            ));
        }

        logger.debug(&format!(
            "Parsed {} devices: {}",
            snapshot.device_count(),
            snapshot.summary_line()
        ));
        Ok(snapshot)
    }

    /// Re-emit the gateway's flat list shape
    pub fn to_device_list(&self) -> Value {
        let devices: Vec<Value> = self
            .devices
            .values()
            .flat_map(BTreeMap::values)
            .map(|record| {
                Value::Object(
                    record
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect::<Map<String, Value>>(),
                )
            })
            .collect();
        serde_json::json!({ "devices": devices })
    }

    /// Check the structural invariants of a snapshot
    pub fn validate(&self) -> Result<()> {
        if self.device_count() == 0 {
            return Err(HeliosError::validation("devices", "Snapshot has no devices"));
        }
        for (device_type, by_serial) in &self.devices {
            for (serial, record) in by_serial {
                if !record.contains_key(DEVICE_TYPE_FIELD) {
                    return Err(HeliosError::validation(
                        device_type.tag(),
                        format!("Device '{serial}' missing {DEVICE_TYPE_FIELD}"),
                    ));
                }
                if !record.contains_key(SERIAL_FIELD) {
                    return Err(HeliosError::validation(
                        device_type.tag(),
                        format!("Device '{serial}' missing {SERIAL_FIELD}"),
                    ));
                }
            }
        }
        if !self
            .devices
            .iter()
            .any(|(t, by_serial)| *t != DeviceType::Diagnostics && !by_serial.is_empty())
        {
            return Err(HeliosError::validation(
                "devices",
                "No recognized device group besides diagnostics",
            ));
        }
        Ok(())
    }

    /// Add or replace a device; type and serial fields are stamped onto the record
    pub fn insert(&mut self, device_type: DeviceType, serial: &str, mut record: DeviceRecord) {
        record.insert(DEVICE_TYPE_FIELD.to_string(), device_type.tag().into());
        record.insert(SERIAL_FIELD.to_string(), serial.into());
        self.devices
            .entry(device_type)
            .or_default()
            .insert(serial.to_string(), record);
    }

    /// Add every device of `other`, replacing those with the same type and serial
    pub fn merge(&mut self, other: Self) -> usize {
        let mut merged = 0;
        for (device_type, devices) in other.devices {
            merged += devices.len();
            self.devices.entry(device_type).or_default().extend(devices);
        }
        merged
    }

    pub fn remove_type(&mut self, device_type: DeviceType) {
        self.devices.remove(&device_type);
    }

    /// Copy without one device group
    #[must_use]
    pub fn without_type(&self, device_type: DeviceType) -> Self {
        let mut copy = self.clone();
        copy.remove_type(device_type);
        copy
    }

    pub fn devices_of(&self, device_type: DeviceType) -> Option<&BTreeMap<String, DeviceRecord>> {
        self.devices.get(&device_type).filter(|m| !m.is_empty())
    }

    pub fn device(&self, device_type: DeviceType, serial: &str) -> Option<&DeviceRecord> {
        self.devices.get(&device_type)?.get(serial)
    }

    pub fn serials(&self, device_type: DeviceType) -> BTreeSet<String> {
        self.devices
            .get(&device_type)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.device_count() == 0
    }

    /// Device count per type
    pub fn device_summary(&self) -> BTreeMap<DeviceType, usize> {
        self.devices
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(t, m)| (*t, m.len()))
            .collect()
    }

    pub fn has_battery_devices(&self) -> bool {
        self.devices
            .iter()
            .any(|(t, m)| t.is_battery() && !m.is_empty())
    }

    /// Carry cached inverters and meters over when fresh data lacks them
    ///
    /// At night some firmware stops reporting inverters entirely. Returns how
    /// many records were copied from `cached`.
    pub fn preserve_from(&mut self, cached: &Self) -> usize {
        let mut preserved = 0;
        for device_type in [DeviceType::Inverter, DeviceType::PowerMeter] {
            if self.devices_of(device_type).is_some() {
                continue;
            }
            let Some(old) = cached.devices_of(device_type) else {
                continue;
            };
            let target = self.devices.entry(device_type).or_default();
            for (serial, record) in old {
                if !target.contains_key(serial) {
                    target.insert(serial.clone(), record.clone());
                    preserved += 1;
                }
            }
        }
        preserved
    }

    /// "Inverter: 12, PVS: 1" style summary for logs
    pub fn summary_line(&self) -> String {
        self.device_summary()
            .iter()
            .map(|(t, n)| format!("{t}: {n}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn serial_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn record_from_object(fields: &Map<String, Value>) -> DeviceRecord {
    fields
        .iter()
        .filter_map(|(k, v)| FieldValue::from_json(v).map(|fv| (k.clone(), fv)))
        .collect()
}
