//! Simulated hardware: deterministic thermistor curves, a quiet motor
//! driver, scripted radio links and a file-backed KV store.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use log::{debug, info};
use packmon_controller::kv::{namespace_ok, string_ok, KvStore};
use packmon_controller::platform::{
    AdcMux, Advertisement, AlarmOutput, BleScanner, Clock, DateHeaderFetcher, LocalRadio, Mdns,
    MotorDirection, MotorDriver, MotorTarget, Network, OtaManifest, ReferenceThermometer,
    SystemProbe, Watchdog, WebServer, WebsocketLink, MOTOR_COUNT, MUX_CHANNELS,
};
use packmon_controller::tpms::TpmsConfig;

/// Small deterministic PRNG so runs replay identically.
struct Lcg(u32);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.0
    }

    /// Uniform in [-range, range].
    fn jitter(&mut self, range: i32) -> i32 {
        (self.next() % (2 * range as u32 + 1)) as i32 - range
    }
}

/// ADC counts follow a slow thermal wander around a per-channel ambient
/// point, with one "hot" channel so the fan loop has work to do.
pub struct SimMux {
    rng: Lcg,
    reads: u64,
    hot_channel: usize,
}

impl SimMux {
    #[must_use]
    pub fn new(hot_channel: usize) -> Self {
        Self {
            rng: Lcg(0x5eed),
            reads: 0,
            hot_channel,
        }
    }
}

impl AdcMux for SimMux {
    fn read(&mut self, channel: usize) -> u16 {
        assert!(channel < MUX_CHANNELS);
        self.reads += 1;
        // ~24C of counts, drifting warmer over time on the hot channel.
        let mut counts = 2210i32 + self.rng.jitter(6);
        if channel == self.hot_channel {
            let warmup = (self.reads / 64).min(600) as i32;
            counts -= warmup;
        }
        counts.clamp(1, 9_999) as u16
    }
}

/// Logs duty transitions instead of driving an H-bridge.
#[derive(Default)]
pub struct SimMotorDriver {
    duties: [u8; MOTOR_COUNT],
}

impl MotorDriver for SimMotorDriver {
    fn set_speed(&mut self, target: MotorTarget, duty: u8) {
        match target {
            MotorTarget::All => {
                info!("motors: all -> duty {duty}");
                self.duties = [duty; MOTOR_COUNT];
            }
            MotorTarget::Motor(motor) => {
                info!("motors: {motor} -> duty {duty}");
                self.duties[motor] = duty;
            }
        }
    }

    fn set_direction(&mut self, _target: MotorTarget, direction: MotorDirection) {
        debug!("motors: direction {direction:?}");
    }

    fn stop(&mut self, target: MotorTarget) {
        debug!("motors: stop {target:?}");
    }
}

pub struct SimReference {
    pub celsius: f32,
}

impl ReferenceThermometer for SimReference {
    fn read_celsius(&mut self) -> f32 {
        self.celsius
    }
}

/// BLE link placeholder: no central connected in the sim.
#[derive(Default)]
pub struct SimRadio;

impl LocalRadio for SimRadio {
    fn available(&self) -> bool {
        false
    }
    fn mtu(&self) -> usize {
        23
    }
    fn send(&mut self, _data: &str) -> bool {
        false
    }
    fn take_writes(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Websocket "client" that just prints what it receives.
pub struct SimWebsocket {
    pub up: bool,
}

impl WebsocketLink for SimWebsocket {
    fn available(&self) -> bool {
        self.up
    }
    fn send(&mut self, data: &str) -> bool {
        info!("websocket <- {data}");
        true
    }
    fn take_messages(&mut self) -> Vec<String> {
        Vec::new()
    }
}

pub struct SimMqtt {
    pub up: bool,
}

impl packmon_controller::platform::MqttLink for SimMqtt {
    fn available(&self) -> bool {
        self.up
    }
    fn publish(&mut self, topic: &str, data: &str) -> bool {
        info!("mqtt <- {topic} ({} bytes)", data.len());
        true
    }
    fn buffer_size(&self) -> usize {
        3 * 1024
    }
}

pub struct SimNetwork;

impl Network for SimNetwork {
    fn available(&self) -> bool {
        true
    }
    fn mac_address(&self) -> String {
        "24:6f:28:aa:bb:cc".to_string()
    }
}

pub struct SimMdns;

impl Mdns for SimMdns {
    fn add_service(&mut self, service: &str, proto: &str, port: u16, txt: &[(String, String)]) {
        info!("mdns: {service}.{proto} port {port} txt {txt:?}");
    }
}

#[derive(Default)]
pub struct SimWebServer;

impl WebServer for SimWebServer {
    fn set_version_body(&mut self, body: &str) {
        info!("webserver: GET /version -> {body}");
    }
}

/// Emits a front-tyre beacon every few drains.
pub struct SimScanner {
    config: TpmsConfig,
    drains: u64,
}

impl SimScanner {
    #[must_use]
    pub fn new(config: TpmsConfig) -> Self {
        Self { config, drains: 0 }
    }
}

impl BleScanner for SimScanner {
    fn take_results(&mut self) -> Vec<Advertisement> {
        self.drains += 1;
        if self.drains % 4 != 0 {
            return Vec::new();
        }
        let mut data = vec![0x01, 0x00, 0x38, 0x89, 0x00, 0x00, 0x36, 0x02];
        data.extend_from_slice(&221_300u32.to_le_bytes());
        data.extend_from_slice(&2_450u32.to_le_bytes());
        data.push(92);
        data.push(0);
        vec![Advertisement {
            address: self.config.front.clone(),
            rssi: Some(-58),
            name: None,
            tx_power: None,
            manufacturer_data: data,
        }]
    }
}

/// Host clock plus a settable offset, standing in for settimeofday.
#[derive(Default)]
pub struct SimClock {
    offset_micros: i64,
}

impl SimClock {
    fn host_micros() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_micros() as i64)
    }
}

impl Clock for SimClock {
    fn now_epoch(&self) -> (i64, i64) {
        let micros = Self::host_micros() + self.offset_micros;
        (micros / 1_000_000, micros % 1_000_000)
    }

    fn set_epoch(&mut self, secs: i64, micros: i64) {
        self.offset_micros = secs * 1_000_000 + micros - Self::host_micros();
        debug!("clock: set, offset now {} us", self.offset_micros);
    }
}

/// Answers with the host's idea of the current time, RFC-1123 formatted
/// like a real `Date:` header.
pub struct SimDateFetcher;

impl DateHeaderFetcher for SimDateFetcher {
    fn fetch(&mut self, url: &str, useragent: &str) -> Option<String> {
        debug!("fetch: {url} ({useragent})");
        Some(Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string())
    }
}

pub struct SimManifest;

impl OtaManifest for SimManifest {
    fn newer_version(&mut self, url: &str) -> Option<String> {
        debug!("manifest: {url}");
        None
    }
}

/// Tracks feed cadence and complains like the hardware TWDT would.
pub struct SimWatchdog {
    timeout_ms: u64,
    last_feed: RefCell<Option<std::time::Instant>>,
}

impl SimWatchdog {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            last_feed: RefCell::new(None),
        }
    }
}

impl Watchdog for SimWatchdog {
    fn feed(&mut self) {
        let mut last = self.last_feed.borrow_mut();
        if let Some(previous) = *last {
            let elapsed = previous.elapsed().as_millis() as u64;
            if elapsed > self.timeout_ms {
                log::error!("watchdog: fed {elapsed} ms late (timeout {} ms)", self.timeout_ms);
            }
        }
        *last = Some(std::time::Instant::now());
    }
}

#[derive(Default)]
pub struct SimAlarmOutput {
    active: bool,
}

impl AlarmOutput for SimAlarmOutput {
    fn set(&mut self, active: bool) {
        if active != self.active {
            info!("alarm line: {}", if active { "ACTIVE" } else { "clear" });
            self.active = active;
        }
    }
}

pub struct SimProbe;

impl SystemProbe for SimProbe {
    fn free_memory_bytes(&self) -> usize {
        192 * 1024
    }
    fn bad_reset(&self) -> bool {
        false
    }
    fn reset_reason(&self) -> String {
        "CHIP_POWER_ON".to_string()
    }
}

/// JSON-file-backed KV store: one flat `namespace.key -> value` map,
/// written through on every set.
pub struct FileKv {
    path: PathBuf,
    values: RefCell<HashMap<String, serde_json::Value>>,
}

impl FileKv {
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let values = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path,
            values: RefCell::new(values),
        }
    }

    fn flush(&self) -> bool {
        let values = self.values.borrow();
        match serde_json::to_string_pretty(&*values) {
            Ok(content) => std::fs::write(&self.path, content).is_ok(),
            Err(_) => false,
        }
    }

    fn get(&self, namespace: &str, key: &str) -> Option<serde_json::Value> {
        self.values.borrow().get(&format!("{namespace}.{key}")).cloned()
    }

    fn set(&self, namespace: &str, key: &str, value: serde_json::Value) -> bool {
        if !namespace_ok(namespace) {
            return false;
        }
        self.values.borrow_mut().insert(format!("{namespace}.{key}"), value);
        self.flush()
    }
}

impl KvStore for FileKv {
    fn get_u32(&self, namespace: &str, key: &str) -> Option<u32> {
        self.get(namespace, key)?.as_u64().and_then(|value| u32::try_from(value).ok())
    }
    fn set_u32(&self, namespace: &str, key: &str, value: u32) -> bool {
        self.set(namespace, key, serde_json::json!(value))
    }
    fn get_i32(&self, namespace: &str, key: &str) -> Option<i32> {
        self.get(namespace, key)?.as_i64().and_then(|value| i32::try_from(value).ok())
    }
    fn set_i32(&self, namespace: &str, key: &str, value: i32) -> bool {
        self.set(namespace, key, serde_json::json!(value))
    }
    fn get_string(&self, namespace: &str, key: &str) -> Option<String> {
        self.get(namespace, key)?.as_str().map(ToString::to_string)
    }
    fn set_string(&self, namespace: &str, key: &str, value: &str) -> bool {
        string_ok(value) && self.set(namespace, key, serde_json::json!(value))
    }
}
