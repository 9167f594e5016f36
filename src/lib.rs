//! # Helios - Adaptive polling for SunPower PVS gateways
//!
//! Polls a SunPower PVS gateway on a fixed interval while protecting its
//! fragile hardware: cached data is served whenever it is fresh enough, the
//! gateway is left alone at night, and an unreachable gateway is backed off
//! instead of hammered. Whatever happens, each cycle returns the best data
//! available or a clear terminal error.
//!
//! ## Architecture
//!
//! - `config`: YAML configuration, migrations and validation
//! - `logging`: Structured logging and tracing
//! - `snapshot`: Normalized device snapshots
//! - `cache`: Per-gateway snapshot persistence
//! - `client`: Legacy and varserver device-list clients
//! - `firmware`: Build detection and protocol selection
//! - `health`: Connectivity probe with backoff
//! - `polling`: Sun-elevation day/night gate
//! - `diagnostics`: Poll statistics and the diagnostics pseudo-device
//! - `inverter_health`: Per-inverter dropout tracking
//! - `coordinator`: The per-cycle state machine
//! - `web`: Read-only status API

pub mod cache;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod firmware;
pub mod health;
pub mod inverter_health;
pub mod logging;
pub mod polling;
pub mod snapshot;
#[cfg(feature = "web")]
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{Coordinator, CycleOutcome, CycleResult, DataSource};
pub use error::{HeliosError, Result};
pub use snapshot::{DeviceSnapshot, DeviceType};
