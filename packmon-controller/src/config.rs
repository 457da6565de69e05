//! Controller configuration: compiled-in defaults, provisioned overrides
//! from the KV store as a JSON blob, and clamping of invalid values.

use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};

use crate::bms::BmsConfig;
use crate::calibration::CalibrationConfig;
use crate::control_endpoints::ControlConfig;
use crate::fans::FanConfig;
use crate::kv::KvStore;
use crate::peers::PeerConfig;
use crate::platform::MUX_CHANNELS;
use crate::storage::StoreFileConfig;
use crate::telemetry::TelemetryConfig;
use crate::thermistors::{BatterypackSensorsConfig, BatterypackThresholds, EnvironmentSensorConfig};
use crate::timekeeper::TimeKeeperConfig;
use crate::tpms::TpmsConfig;
use crate::updater::UpdaterConfig;

const KV_NAMESPACE: &str = "packmon";
const KV_CONFIG_KEY: &str = "config";

/// Configurable log level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Scheduler cadence.
    #[serde(default = "default_program_interval")]
    pub program_interval_ms: u64,
    #[serde(default)]
    pub wifi_peers: PeerConfig,
    #[serde(default = "default_mqtt_peers")]
    pub mqtt_peers: PeerConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub batterypack: BatterypackSensorsConfig,
    #[serde(default)]
    pub environment: EnvironmentSensorConfig,
    #[serde(default)]
    pub fans: FanConfig,
    #[serde(default)]
    pub bms: BmsConfig,
    #[serde(default)]
    pub tpms: TpmsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub storage: StoreFileConfig,
    #[serde(default)]
    pub time: TimeKeeperConfig,
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub control: ControlConfig,
    /// SYSTEM_MEMLOW threshold.
    #[serde(default = "default_memory_low")]
    pub memory_low_bytes: usize,
}

fn default_name() -> String {
    "PackMonitor".to_string()
}
const fn default_program_interval() -> u64 {
    5 * 1000
}
fn default_mqtt_peers() -> PeerConfig {
    PeerConfig {
        order: vec!["mqtt.local:1883/user@pass".to_string()],
        retries: 3,
    }
}
const fn default_memory_low() -> usize {
    32 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: LogLevel::default(),
            program_interval_ms: default_program_interval(),
            wifi_peers: PeerConfig::default(),
            mqtt_peers: default_mqtt_peers(),
            calibration: CalibrationConfig::default(),
            batterypack: BatterypackSensorsConfig::default(),
            environment: EnvironmentSensorConfig::default(),
            fans: FanConfig::default(),
            bms: BmsConfig::default(),
            tpms: TpmsConfig::default(),
            telemetry: TelemetryConfig::default(),
            storage: StoreFileConfig::default(),
            time: TimeKeeperConfig::default(),
            updater: UpdaterConfig::default(),
            control: ControlConfig::default(),
            memory_low_bytes: default_memory_low(),
        }
    }
}

impl Config {
    /// Clamp values to valid ranges and reset unusable sections.
    pub fn validate(&mut self) {
        if self.name.is_empty() {
            warn!("Config: empty name, resetting to default");
            self.name = default_name();
        }
        if self.program_interval_ms == 0 {
            warn!("Config: zero program interval, resetting to default");
            self.program_interval_ms = default_program_interval();
        }
        if !(self.fans.alpha > 0.0 && self.fans.alpha <= 1.0) {
            warn!("Config: clamping fan alpha {} to 0.1", self.fans.alpha);
            self.fans.alpha = 0.1;
        }
        if self.fans.min_speed >= self.fans.max_speed {
            warn!(
                "Config: bad fan speed band {}..{}, resetting to defaults",
                self.fans.min_speed, self.fans.max_speed
            );
            let defaults = FanConfig::default();
            self.fans.min_speed = defaults.min_speed;
            self.fans.max_speed = defaults.max_speed;
        }
        if !self.batterypack.thresholds.ordered() {
            warn!("Config: unordered temperature thresholds, resetting to defaults");
            self.batterypack.thresholds = BatterypackThresholds::default();
        }
        let channels_ok = !self.batterypack.channels.is_empty()
            && self.batterypack.channels.iter().all(|&channel| channel < MUX_CHANNELS);
        if !channels_ok {
            warn!("Config: bad batterypack channel list, resetting to defaults");
            self.batterypack.channels = BatterypackSensorsConfig::default().channels;
        }
        if self.environment.channel >= MUX_CHANNELS {
            warn!("Config: bad environment channel, resetting to default");
            self.environment.channel = EnvironmentSensorConfig::default().channel;
        }
        if self.calibration.step_c <= 0.0 || self.calibration.end_c <= self.calibration.start_c {
            warn!("Config: bad calibration sweep, resetting to defaults");
            let defaults = CalibrationConfig::default();
            self.calibration.start_c = defaults.start_c;
            self.calibration.end_c = defaults.end_c;
            self.calibration.step_c = defaults.step_c;
        }
    }

    pub fn load_or_default(store: &dyn KvStore) -> Self {
        match Self::load(store) {
            Some(mut config) => {
                info!("Config: loaded from store");
                config.validate();
                config
            }
            None => {
                warn!("Config: nothing stored, using defaults");
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn load(store: &dyn KvStore) -> Option<Self> {
        let blob = store.get_string(KV_NAMESPACE, KV_CONFIG_KEY)?;
        debug!("Config: blob size {} bytes", blob.len());
        match serde_json::from_str(&blob) {
            Ok(config) => Some(config),
            Err(fault) => {
                warn!("Config: stored blob failed to parse: {fault}");
                None
            }
        }
    }

    pub fn save(&self, store: &dyn KvStore) -> bool {
        match serde_json::to_string(self) {
            Ok(blob) => {
                debug!("Config: blob size {} bytes", blob.len());
                store.set_string(KV_NAMESPACE, KV_CONFIG_KEY, &blob)
            }
            Err(fault) => {
                warn!("Config: serialization failed: {fault}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn roundtrips_through_the_store() {
        let store = MemoryKv::new();
        let mut config = Config::default();
        config.name = "bench-rig".to_string();
        config.fans.min_speed = 120;
        assert!(config.save(&store));

        let loaded = Config::load_or_default(&store);
        assert_eq!(loaded.name, "bench-rig");
        assert_eq!(loaded.fans.min_speed, 120);
    }

    #[test]
    fn missing_store_yields_defaults() {
        let store = MemoryKv::new();
        let config = Config::load_or_default(&store);
        assert_eq!(config.name, "PackMonitor");
        assert_eq!(config.program_interval_ms, 5000);
    }

    #[test]
    fn corrupt_blob_yields_defaults() {
        let store = MemoryKv::new();
        store.set_string(KV_NAMESPACE, KV_CONFIG_KEY, "{not json");
        let config = Config::load_or_default(&store);
        assert_eq!(config.name, "PackMonitor");
    }

    #[test]
    fn validate_clamps_bad_values() {
        let mut config = Config::default();
        config.fans.alpha = 0.0;
        config.fans.min_speed = 200;
        config.fans.max_speed = 100;
        config.batterypack.channels = vec![99];
        config.environment.channel = 40;
        config.validate();
        assert_eq!(config.fans.alpha, 0.1);
        assert!(config.fans.min_speed < config.fans.max_speed);
        assert!(config.batterypack.channels.iter().all(|&c| c < MUX_CHANNELS));
        assert!(config.environment.channel < MUX_CHANNELS);
    }

    #[test]
    fn partial_blob_fills_defaults() {
        let store = MemoryKv::new();
        store.set_string(KV_NAMESPACE, KV_CONFIG_KEY, r#"{"name":"partial"}"#);
        let config = Config::load_or_default(&store);
        assert_eq!(config.name, "partial");
        assert_eq!(config.telemetry.capture_ms, 15_000);
        assert_eq!(config.fans.min_speed, 96);
    }
}
