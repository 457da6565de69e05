//! Battery-pack monitoring and thermal-management controller.
//!
//! A single cooperative [`program::Program`] loop supervises a multi-cell
//! lithium pack: thermistor sampling through a mux, closed-loop fan
//! control against a temperature setpoint, two Daly BMS units on
//! half-duplex serial, tyre-pressure beacons over BLE, wall-clock
//! synchronisation with drift replay, and periodic telemetry with
//! store-and-forward across radio, websocket and MQTT transports.
//!
//! Hardware and network stacks are reached exclusively through the traits
//! in [`platform`]; everything else is host-testable logic.

pub mod alarms;
pub mod bms;
pub mod calibration;
pub mod config;
pub mod control;
pub mod control_endpoints;
pub mod diagnostics;
pub mod fans;
pub mod json_split;
pub mod kv;
pub mod math;
pub mod peers;
pub mod platform;
pub mod program;
pub mod storage;
pub mod telemetry;
pub mod thermistors;
pub mod timekeeper;
pub mod tpms;
pub mod updater;
pub mod util;

/// Firmware version from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build identifier served from `/version` and advertised over mDNS.
#[must_use]
pub fn build_identifier() -> String {
    format!("packmon-{VERSION}")
}
