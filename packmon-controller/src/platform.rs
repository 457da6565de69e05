//! Trait seams for every external collaborator.
//!
//! Concrete radio stacks, drivers and flash filesystems live behind these
//! traits; `packmon-sim` implements them against simulated hardware and a
//! real port implements them against the platform SDK. None of the
//! methods may block beyond a few milliseconds.

use serde::{Deserialize, Serialize};

/// Channels exposed by the analog multiplexer.
pub const MUX_CHANNELS: usize = 16;

/// Analog multiplexer + ADC. `read` drives the four address pins, waits
/// out the settle time and samples; values are raw counts at the
/// configured resolution (default 12 bit).
pub trait AdcMux {
    fn read(&mut self, channel: usize) -> u16;
}

/// Motors driven by the quad H-bridge.
pub const MOTOR_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorTarget {
    All,
    Motor(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorDirection {
    #[default]
    Clockwise,
    CounterClockwise,
}

/// Quad H-bridge driver: 8-bit duty per motor.
pub trait MotorDriver {
    fn set_speed(&mut self, target: MotorTarget, duty: u8);
    fn set_direction(&mut self, target: MotorTarget, direction: MotorDirection);
    fn stop(&mut self, target: MotorTarget);
}

/// One-wire reference thermometer used during calibration runs.
pub trait ReferenceThermometer {
    fn read_celsius(&mut self) -> f32;
}

/// Settable wall clock (epoch seconds + microseconds).
pub trait Clock {
    fn now_epoch(&self) -> (i64, i64);
    fn set_epoch(&mut self, secs: i64, micros: i64);
}

/// Fetches the raw `Date:` header of a HEAD/GET on `url`. The client's
/// own timeout bounds the call.
pub trait DateHeaderFetcher {
    fn fetch(&mut self, url: &str, useragent: &str) -> Option<String>;
}

/// Hardware watchdog; fed once per scheduler tick.
pub trait Watchdog {
    fn feed(&mut self);
}

/// The single alarm output line.
pub trait AlarmOutput {
    fn set(&mut self, active: bool);
}

/// One BLE advertisement captured by the scanner.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub rssi: Option<i8>,
    pub name: Option<String>,
    pub tx_power: Option<i8>,
    pub manufacturer_data: Vec<u8>,
}

/// Passive BLE scanner. The platform runs fixed 5 s scan windows and
/// restarts them itself; results queue up until drained here.
pub trait BleScanner {
    fn take_results(&mut self) -> Vec<Advertisement>;
}

/// Local BLE GATT link: one characteristic with read/write/notify under
/// the fixed service UUID. `available` implies a connected central with a
/// negotiated MTU.
pub trait LocalRadio {
    fn available(&self) -> bool;
    /// Negotiated MTU; usable payload is `mtu - 3`.
    fn mtu(&self) -> usize;
    fn send(&mut self, data: &str) -> bool;
    /// Drain inbound characteristic writes queued by the driver callback.
    fn take_writes(&mut self) -> Vec<String>;
}

/// Local websocket link.
pub trait WebsocketLink {
    fn available(&self) -> bool;
    fn send(&mut self, data: &str) -> bool;
    fn take_messages(&mut self) -> Vec<String>;
}

/// MQTT client of an external broker.
pub trait MqttLink {
    fn available(&self) -> bool;
    fn publish(&mut self, topic: &str, data: &str) -> bool;
    /// Outbound buffer size; payloads beyond it must be split.
    fn buffer_size(&self) -> usize;
}

/// IP connectivity state.
pub trait Network {
    fn available(&self) -> bool;
    fn mac_address(&self) -> String;
}

/// mDNS responder.
pub trait Mdns {
    fn add_service(&mut self, service: &str, proto: &str, port: u16, txt: &[(String, String)]);
}

/// The single HTTP endpoint surface: `GET /version`.
pub trait WebServer {
    fn set_version_body(&mut self, body: &str);
}

/// OTA manifest poller: returns the newer version advertised by the
/// manifest at `url`, if any.
pub trait OtaManifest {
    fn newer_version(&mut self, url: &str) -> Option<String>;
}

/// Platform health probes feeding the SYSTEM_* alarms.
pub trait SystemProbe {
    fn free_memory_bytes(&self) -> usize;
    /// True when the last reset was not an expected power-on/software
    /// reset.
    fn bad_reset(&self) -> bool;
    /// Short reset-reason mnemonic for diagnostics.
    fn reset_reason(&self) -> String;
}
