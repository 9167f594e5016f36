//! Energy storage status
//!
//! Battery sites expose a separate ESS report next to the device list. Legacy
//! firmware serves it at `/cgi-bin/dl_cgi/energy-storage-system/status`; the
//! varserver keeps the same data under `/sys/devices/ess/`. Both are reduced
//! to the legacy `ess_report` shape and then turned into device records.
//!
//! Serials in the ESS report do not match the ones in the device list (the
//! BMS reports `BC...` while batteries are listed as `M00...`), so records
//! are keyed by position plus a serial suffix.

use crate::error::{HeliosError, Result};
use crate::snapshot::{DeviceRecord, DeviceSnapshot, DeviceType, FieldValue};
use serde_json::{Value, json};
use std::collections::BTreeMap;

pub const ESS_STATUS_PATH: &str = "/cgi-bin/dl_cgi/energy-storage-system/status";
pub const ESS_PREFIX: &str = "/sys/devices/ess/";

const BATTERY_FIELDS: &[&str] = &[
    "battery_amperage",
    "battery_voltage",
    "customer_state_of_charge",
    "system_state_of_charge",
    "temperature",
];

const HUB_STATES: &[&str] = &[
    "contactor_position",
    "grid_frequency_state",
    "grid_voltage_state",
    "load_frequency_state",
    "load_voltage_state",
];

const HUB_READINGS: &[&str] = &[
    "grid_phase1_voltage",
    "grid_phase2_voltage",
    "hub_humidity",
    "hub_temperature",
    "inverter_connection_voltage",
    "load_phase1_voltage",
    "load_phase2_voltage",
    "main_voltage",
];

/// `entry[key].value` as a number, 0 when absent or not numeric
fn reading(entry: &Value, key: &str) -> f64 {
    match entry.get(key).and_then(|v| v.get("value")) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn suffix(serial: &str, len: usize) -> &str {
    let start = serial.char_indices().rev().nth(len - 1).map_or(0, |(i, _)| i);
    &serial[start..]
}

fn virtual_record(descr: String, model: &str) -> DeviceRecord {
    let mut record = DeviceRecord::new();
    record.insert("STATE".into(), "working".into());
    record.insert("SWVER".into(), "ESS".into());
    record.insert("HWVER".into(), "ESS".into());
    record.insert("DESCR".into(), descr.into());
    record.insert("MODEL".into(), model.into());
    record
}

fn entries<'a>(report: &'a Value, key: &str) -> &'a [Value] {
    report
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Turn an `{"ess_report": {...}}` payload into battery, ESS and hub records
pub fn ess_snapshot(payload: &Value) -> Result<DeviceSnapshot> {
    let report = payload
        .get("ess_report")
        .filter(|r| r.is_object())
        .ok_or_else(|| HeliosError::parse("ESS payload has no ess_report object"))?;

    let mut snapshot = DeviceSnapshot::new();

    for (i, battery) in entries(report, "battery_status").iter().enumerate() {
        let serial = battery
            .get("serial_number")
            .and_then(Value::as_str)
            .map_or_else(|| format!("unknown_battery_{i}"), str::to_string);
        let mut record = virtual_record(format!("Virtual Battery {}", i + 1), "ESS Battery");
        for field in BATTERY_FIELDS {
            record.insert((*field).into(), FieldValue::float(reading(battery, field)));
        }
        snapshot.insert(
            DeviceType::EssBms,
            &format!("ess_battery_{i}_{}", suffix(&serial, 6)),
            record,
        );
    }

    for (i, ess) in entries(report, "ess_status").iter().enumerate() {
        let serial = ess
            .get("serial_number")
            .and_then(Value::as_str)
            .map_or_else(|| format!("unknown_ess_{i}"), str::to_string);
        let mut record = virtual_record(format!("Virtual ESS {}", i + 1), "ESS Device");
        record.insert(
            "enclosure_humidity".into(),
            FieldValue::float(reading(ess, "enclosure_humidity")),
        );
        record.insert(
            "enclosure_temperature".into(),
            FieldValue::float(reading(ess, "enclosure_temperature")),
        );

        let meter = ess.get("ess_meter_reading").cloned().unwrap_or(Value::Null);
        record.insert("agg_power".into(), FieldValue::float(reading(&meter, "agg_power")));
        for side in ["a", "b"] {
            let phase = meter
                .get(format!("meter_{side}"))
                .and_then(|m| m.get("reading"))
                .cloned()
                .unwrap_or(Value::Null);
            for quantity in ["current", "power", "voltage"] {
                record.insert(
                    format!("meter_{side}_{quantity}"),
                    FieldValue::float(reading(&phase, quantity)),
                );
            }
        }
        snapshot.insert(
            DeviceType::EnergyStorageSystem,
            &format!("ess_virtual_{i}_{}", suffix(&serial, 8)),
            record,
        );
    }

    if let Some(hub) = report.get("hub_plus_status").filter(|h| h.is_object()) {
        let serial = hub
            .get("serial_number")
            .and_then(Value::as_str)
            .unwrap_or("unknown_hubplus");
        let mut record = virtual_record("Virtual Hub Plus".into(), "Hub Plus Device");
        for field in HUB_STATES {
            let state = hub.get(*field).and_then(Value::as_str).unwrap_or("UNKNOWN");
            record.insert((*field).into(), state.into());
        }
        for field in HUB_READINGS {
            record.insert((*field).into(), FieldValue::float(reading(hub, field)));
        }
        snapshot.insert(
            DeviceType::HubPlus,
            &format!("hubplus_virtual_{}", suffix(serial, 8)),
            record,
        );
    }

    Ok(snapshot)
}

fn number(params: &BTreeMap<String, Value>, key: &str) -> f64 {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Rebuild the legacy `ess_report` from varserver ESS variables grouped by index
pub fn ess_report_from_vars(grouped: &BTreeMap<u32, BTreeMap<String, Value>>) -> Value {
    let mut batteries = Vec::new();
    let mut systems = Vec::new();

    for (idx, params) in grouped {
        let serial = params
            .get("sn")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map_or_else(|| format!("ESS_{idx}"), str::to_string);
        let soc = number(params, "socVal");
        let customer_soc = number(params, "customerSocVal");
        let voltage = number(params, "vBattV");
        let temperature = number(params, "tInvtrDegc");
        let power_kw = number(params, "p3phsumKw");
        let amperage = if voltage > 0.0 {
            power_kw * 1000.0 / voltage
        } else {
            0.0
        };

        batteries.push(json!({
            "serial_number": format!("battery_{serial}"),
            "battery_amperage": {"value": amperage},
            "battery_voltage": {"value": voltage},
            "customer_state_of_charge": {"value": customer_soc},
            "system_state_of_charge": {"value": soc},
            "temperature": {"value": temperature},
        }));
        systems.push(json!({
            "serial_number": serial,
            "enclosure_humidity": {"value": 0},
            "enclosure_temperature": {"value": temperature},
            "ess_meter_reading": {
                "agg_power": {"value": power_kw},
                "meter_a": {"reading": {}},
                "meter_b": {"reading": {}},
            },
        }));
    }

    json!({
        "ess_report": {
            "battery_status": batteries,
            "ess_status": systems,
            "hub_plus_status": null,
        }
    })
}
