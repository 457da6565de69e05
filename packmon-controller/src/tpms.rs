//! Tyre-pressure beacons: decode BLE advertisements from the two known
//! sensor addresses.
//!
//! The sensors broadcast an 18-byte manufacturer-data blob:
//!
//! ```text
//! [0..2)   manufacturer id (LE)
//! [2..8)   sensor address
//! [8..12)  pressure, u32 LE, kPa x 1000
//! [12..16) temperature, u32 LE, degC x 100
//! [16]     battery percentage
//! [17]     alarm flag (non-zero = leak alert)
//! ```

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::platform::{Advertisement, BleScanner};
use crate::util::ActivationTracker;
use crate::diagnostics::Diagnosticable;

const MANUFACTURER_DATA_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TpmsReading {
    pub pressure_kpa: f32,
    pub temperature_c: f32,
    pub battery_pct: u8,
    pub alarm: bool,
}

impl TpmsReading {
    /// Decode the manufacturer-data blob; `None` when it is not a tyre
    /// sensor payload.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < MANUFACTURER_DATA_LEN {
            return None;
        }
        let pressure = u32::from_le_bytes(data[8..12].try_into().ok()?);
        let temperature = u32::from_le_bytes(data[12..16].try_into().ok()?);
        Some(Self {
            pressure_kpa: pressure as f32 / 1000.0,
            temperature_c: temperature as f32 / 100.0,
            battery_pct: data[16],
            alarm: data[17] != 0,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpmsConfig {
    pub front: String,
    pub rear: String,
}

impl Default for TpmsConfig {
    fn default() -> Self {
        Self {
            front: "38:89:00:00:36:02".to_string(),
            rear: "38:8b:00:00:ed:63".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Tyre {
    updated: ActivationTracker,
    reading: Option<TpmsReading>,
    rssi: Option<i8>,
}

/// Drains the platform's scan-result queue each tick and keeps the last
/// reading per configured wheel. Scan windows restart in the platform's
/// end-of-scan callback; this component never blocks on a scan.
pub struct TpmsScanner {
    config: TpmsConfig,
    scanner: Box<dyn BleScanner>,
    front: Tyre,
    rear: Tyre,
}

impl TpmsScanner {
    #[must_use]
    pub fn new(config: TpmsConfig, scanner: Box<dyn BleScanner>) -> Self {
        Self {
            config,
            scanner,
            front: Tyre::default(),
            rear: Tyre::default(),
        }
    }

    pub fn process(&mut self) {
        for advertisement in self.scanner.take_results() {
            self.accept(&advertisement);
        }
    }

    fn accept(&mut self, advertisement: &Advertisement) {
        let address = advertisement.address.to_ascii_lowercase();
        let tyre = if address == self.config.front.to_ascii_lowercase() {
            &mut self.front
        } else if address == self.config.rear.to_ascii_lowercase() {
            &mut self.rear
        } else {
            return;
        };
        let Some(reading) = TpmsReading::decode(&advertisement.manufacturer_data) else {
            return;
        };
        debug!(
            "TpmsScanner: {address}: {:.1} kPa, {:.1} C, battery {}%",
            reading.pressure_kpa, reading.temperature_c, reading.battery_pct
        );
        tyre.updated.mark();
        tyre.reading = Some(reading);
        tyre.rssi = advertisement.rssi;
    }

    #[must_use]
    pub fn front(&self) -> Option<TpmsReading> {
        self.front.reading
    }

    #[must_use]
    pub fn rear(&self) -> Option<TpmsReading> {
        self.rear.reading
    }
}

impl Diagnosticable for TpmsScanner {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        let tyre_json = |tyre: &Tyre| {
            let mut entry = Map::new();
            entry.insert("updated".to_string(), json!(tyre.updated.count()));
            if let Some(reading) = &tyre.reading {
                entry.insert(
                    "details".to_string(),
                    json!({
                        "pressure": reading.pressure_kpa,
                        "temperature": reading.temperature_c,
                        "battery": reading.battery_pct,
                        "alarm": reading.alarm,
                        "rssi": tyre.rssi,
                    }),
                );
            }
            Value::Object(entry)
        };
        obj.insert(
            "tpms".to_string(),
            json!({ "front": tyre_json(&self.front), "rear": tyre_json(&self.rear) }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(pressure_mkpa: u32, temperature_cc: u32, battery: u8, alarm: u8) -> Vec<u8> {
        let mut data = vec![0x01, 0x00, 0x38, 0x89, 0x00, 0x00, 0x36, 0x02];
        data.extend_from_slice(&pressure_mkpa.to_le_bytes());
        data.extend_from_slice(&temperature_cc.to_le_bytes());
        data.push(battery);
        data.push(alarm);
        data
    }

    struct ScannerStub {
        results: Vec<Advertisement>,
    }

    impl BleScanner for ScannerStub {
        fn take_results(&mut self) -> Vec<Advertisement> {
            std::mem::take(&mut self.results)
        }
    }

    fn advertisement(address: &str, data: Vec<u8>) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            rssi: Some(-61),
            name: None,
            tx_power: None,
            manufacturer_data: data,
        }
    }

    #[test]
    fn decodes_pressure_temperature_battery() {
        let reading = TpmsReading::decode(&blob(221_300, 2_450, 87, 0)).expect("valid blob");
        assert_eq!(reading.pressure_kpa, 221.3);
        assert_eq!(reading.temperature_c, 24.5);
        assert_eq!(reading.battery_pct, 87);
        assert!(!reading.alarm);
    }

    #[test]
    fn short_blob_is_rejected() {
        assert_eq!(TpmsReading::decode(&[0x01, 0x00, 0x38]), None);
    }

    #[test]
    fn only_configured_addresses_are_tracked() {
        let results = vec![
            advertisement("38:89:00:00:36:02", blob(220_000, 2_000, 90, 0)),
            advertisement("38:8B:00:00:ED:63", blob(230_000, 2_100, 80, 1)),
            advertisement("aa:bb:cc:dd:ee:ff", blob(999_000, 9_900, 1, 1)),
        ];
        let mut scanner = TpmsScanner::new(TpmsConfig::default(), Box::new(ScannerStub { results }));
        scanner.process();

        let front = scanner.front().expect("front seen");
        assert_eq!(front.pressure_kpa, 220.0);
        let rear = scanner.rear().expect("rear seen, case-insensitive");
        assert!(rear.alarm);
        assert_eq!(scanner.front.updated.count(), 1);
    }

    #[test]
    fn latest_reading_wins() {
        let results = vec![
            advertisement("38:89:00:00:36:02", blob(220_000, 2_000, 90, 0)),
            advertisement("38:89:00:00:36:02", blob(218_500, 2_050, 89, 0)),
        ];
        let mut scanner = TpmsScanner::new(TpmsConfig::default(), Box::new(ScannerStub { results }));
        scanner.process();
        assert_eq!(scanner.front().expect("seen").pressure_kpa, 218.5);
        assert_eq!(scanner.front.updated.count(), 2);
    }
}
