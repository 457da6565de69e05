//! Thermistor bank sampling and the batterypack / environment
//! temperature managers built on it.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::alarms::{Alarmable, AlarmKind, AlarmSet};
use crate::calibration::CalibrationRuntime;
use crate::platform::{AdcMux, MUX_CHANNELS};
use crate::util::{round2, ActivationTracker, MovingAverage, Stats};
use crate::diagnostics::Diagnosticable;

/// Raw samples strictly inside this range are treated as plausible.
const RESISTANCE_MAX: u16 = 10_000;
/// Converted temperatures outside this band are rejected.
const TEMPERATURE_MIN_C: f32 = -100.0;
const TEMPERATURE_MAX_C: f32 = 150.0;

/// The mux-swept ADC bank. Every conversion goes through the calibration
/// runtime; a channel yields either a plausible temperature or a bad
/// read, nothing else.
pub struct ThermistorBank {
    mux: Box<dyn AdcMux>,
    stats: [Stats; MUX_CHANNELS],
    bad_reads: ActivationTracker,
}

impl ThermistorBank {
    #[must_use]
    pub fn new(mux: Box<dyn AdcMux>) -> Self {
        Self {
            mux,
            stats: std::array::from_fn(|_| Stats::default()),
            bad_reads: ActivationTracker::default(),
        }
    }

    /// Raw ADC sample, used by the calibration collector.
    pub fn raw(&mut self, channel: usize) -> u16 {
        assert!(channel < MUX_CHANNELS, "channel out of range");
        self.mux.read(channel)
    }

    /// Calibrated read: `Some(temperature)` within [-100, 150] or `None`.
    pub fn read(&mut self, channel: usize, runtime: &CalibrationRuntime) -> Option<f32> {
        assert!(channel < MUX_CHANNELS, "channel out of range");
        let resistance = self.mux.read(channel);
        if resistance == 0 || resistance >= RESISTANCE_MAX {
            self.bad_reads.mark();
            return None;
        }
        let temperature = runtime.calculate_temperature(channel, resistance);
        if !temperature.is_finite() || !(TEMPERATURE_MIN_C..=TEMPERATURE_MAX_C).contains(&temperature) {
            self.bad_reads.mark();
            return None;
        }
        self.stats[channel].add(temperature);
        Some(temperature)
    }
}

impl Diagnosticable for ThermistorBank {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        let channels: Vec<String> = self
            .stats
            .iter()
            .map(|stats| {
                format!(
                    "{:.2},{:.2},{:.2},{:.2}",
                    stats.last(),
                    stats.mean(),
                    stats.min(),
                    stats.max()
                )
            })
            .collect();
        obj.insert(
            "tmp".to_string(),
            json!({ "channels": channels, "bad": self.bad_reads.count() }),
        );
    }
}

/// Temperature thresholds for the batterypack alarm predicates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatterypackThresholds {
    pub setpoint_c: f32,
    pub failure_c: f32,
    pub minimal_c: f32,
    pub warning_c: f32,
    pub maximal_c: f32,
}

impl Default for BatterypackThresholds {
    fn default() -> Self {
        Self {
            setpoint_c: 25.0,
            failure_c: -100.0,
            minimal_c: -20.0,
            warning_c: 35.0,
            maximal_c: 45.0,
        }
    }
}

impl BatterypackThresholds {
    /// Thresholds must be strictly ordered to partition the range.
    #[must_use]
    pub fn ordered(&self) -> bool {
        self.failure_c < self.minimal_c && self.minimal_c < self.warning_c && self.warning_c < self.maximal_c
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatterypackSensorsConfig {
    pub channels: Vec<usize>,
    #[serde(flatten)]
    pub thresholds: BatterypackThresholds,
}

impl Default for BatterypackSensorsConfig {
    fn default() -> Self {
        Self {
            // Channel 8 is the environment probe; the rest watch the pack.
            channels: vec![0, 1, 2, 3, 4, 5, 6, 7, 9, 10, 11, 12, 13, 14, 15],
            thresholds: BatterypackThresholds::default(),
        }
    }
}

/// Batterypack-wide temperature aggregation: per-channel smoothing, tick
/// aggregate, and the alarm predicates over min/max.
pub struct BatterypackTemperatures {
    config: BatterypackSensorsConfig,
    values: Vec<MovingAverage<16>>,
    aggregate: Stats,
    stats_avg: Stats,
    stats_min: Stats,
    stats_max: Stats,
    bad_reads: ActivationTracker,
}

impl BatterypackTemperatures {
    #[must_use]
    pub fn new(config: BatterypackSensorsConfig) -> Self {
        assert!(config.thresholds.ordered(), "bad threshold configuration");
        let values = config.channels.iter().map(|_| MovingAverage::default()).collect();
        Self {
            config,
            values,
            aggregate: Stats::default(),
            stats_avg: Stats::default(),
            stats_min: Stats::default(),
            stats_max: Stats::default(),
            bad_reads: ActivationTracker::default(),
        }
    }

    pub fn process(&mut self, bank: &mut ThermistorBank, runtime: &CalibrationRuntime) {
        self.aggregate.reset();
        for (slot, &channel) in self.config.channels.iter().enumerate() {
            match bank.read(channel, runtime) {
                Some(temperature) => {
                    let smoothed = round2(self.values[slot].update(temperature));
                    self.aggregate.add(smoothed);
                }
                None => self.bad_reads.mark(),
            }
        }
        debug!(
            "BatterypackTemperatures: avg={:.2}, min={:.2}, max={:.2}",
            self.avg(),
            self.min(),
            self.max()
        );
        self.stats_avg.add(self.avg());
        self.stats_min.add(self.min());
        self.stats_max.add(self.max());
    }

    #[must_use]
    pub fn min(&self) -> f32 {
        self.aggregate.min()
    }

    #[must_use]
    pub fn max(&self) -> f32 {
        self.aggregate.max()
    }

    #[must_use]
    pub fn avg(&self) -> f32 {
        round2(self.aggregate.mean())
    }

    #[must_use]
    pub fn setpoint(&self) -> f32 {
        self.config.thresholds.setpoint_c
    }

    /// The value the fan loop regulates on.
    #[must_use]
    pub fn current(&self) -> f32 {
        self.aggregate.max()
    }

    /// Smoothed per-channel temperatures, in configured channel order.
    #[must_use]
    pub fn temperatures(&self) -> Vec<f32> {
        self.values.iter().map(MovingAverage::value).collect()
    }
}

impl Diagnosticable for BatterypackTemperatures {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "bat".to_string(),
            json!({
                "tmp": {
                    "avg": round2(self.stats_avg.mean()),
                    "min": self.stats_min.min(),
                    "max": self.stats_max.max(),
                },
                "bad": self.bad_reads.count(),
            }),
        );
    }
}

impl Alarmable for BatterypackTemperatures {
    fn collect_alarms(&self, set: &mut AlarmSet) {
        let thresholds = &self.config.thresholds;
        if self.aggregate.count() == 0 {
            return;
        }
        if self.min() <= thresholds.failure_c {
            set.insert(AlarmKind::TempFail);
        }
        if self.min() > thresholds.failure_c && self.min() <= thresholds.minimal_c {
            set.insert(AlarmKind::TempMin);
        }
        if self.max() >= thresholds.warning_c && self.max() < thresholds.maximal_c {
            set.insert(AlarmKind::TempWarn);
        }
        if self.max() >= thresholds.maximal_c {
            set.insert(AlarmKind::TempMax);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSensorConfig {
    pub channel: usize,
    pub failure_c: f32,
}

impl Default for EnvironmentSensorConfig {
    fn default() -> Self {
        Self {
            channel: 8,
            failure_c: -100.0,
        }
    }
}

/// The single ambient-temperature channel.
pub struct EnvironmentTemperature {
    config: EnvironmentSensorConfig,
    value: MovingAverage<16>,
    stats: Stats,
    bad_reads: ActivationTracker,
}

impl EnvironmentTemperature {
    #[must_use]
    pub fn new(config: EnvironmentSensorConfig) -> Self {
        Self {
            config,
            value: MovingAverage::default(),
            stats: Stats::default(),
            bad_reads: ActivationTracker::default(),
        }
    }

    pub fn process(&mut self, bank: &mut ThermistorBank, runtime: &CalibrationRuntime) {
        match bank.read(self.config.channel, runtime) {
            Some(temperature) => {
                let smoothed = round2(self.value.update(temperature));
                self.stats.add(smoothed);
            }
            None => self.bad_reads.mark(),
        }
    }

    #[must_use]
    pub fn temperature(&self) -> f32 {
        self.value.value()
    }
}

impl Diagnosticable for EnvironmentTemperature {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "env".to_string(),
            json!({
                "tmp": { "avg": round2(self.stats.mean()), "min": self.stats.min(), "max": self.stats.max() },
                "bad": self.bad_reads.count(),
            }),
        );
    }
}

impl Alarmable for EnvironmentTemperature {
    fn collect_alarms(&self, set: &mut AlarmSet) {
        if self.stats.count() > 0 && self.temperature() <= self.config.failure_c {
            set.insert(AlarmKind::TempFail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::SteinhartCoefficients;

    struct FixedMux {
        samples: [u16; MUX_CHANNELS],
    }

    impl AdcMux for FixedMux {
        fn read(&mut self, channel: usize) -> u16 {
            self.samples[channel]
        }
    }

    fn runtime() -> CalibrationRuntime {
        CalibrationRuntime::default_only(SteinhartCoefficients::default(), MUX_CHANNELS)
    }

    fn bank_with(samples: [u16; MUX_CHANNELS]) -> ThermistorBank {
        ThermistorBank::new(Box::new(FixedMux { samples }))
    }

    #[test]
    fn out_of_range_samples_are_bad_reads() {
        let mut bank = bank_with([0; MUX_CHANNELS]);
        let runtime = runtime();
        assert_eq!(bank.read(0, &runtime), None);
        let mut bank = bank_with([10_000; MUX_CHANNELS]);
        assert_eq!(bank.read(0, &runtime), None);
        assert_eq!(bank.bad_reads.count(), 1);
    }

    #[test]
    fn plausible_sample_converts_and_updates_stats() {
        let mut bank = bank_with([2200; MUX_CHANNELS]);
        let runtime = runtime();
        let temperature = bank.read(3, &runtime).expect("plausible");
        assert!((TEMPERATURE_MIN_C..=TEMPERATURE_MAX_C).contains(&temperature));
        assert_eq!(bank.stats[3].count(), 1);
        assert_eq!(bank.stats[3].last(), temperature);
    }

    #[test]
    #[should_panic(expected = "channel out of range")]
    fn channel_bounds_are_asserted() {
        let mut bank = bank_with([2200; MUX_CHANNELS]);
        let _ = bank.read(MUX_CHANNELS, &runtime());
    }

    /// A runtime that maps resistance directly to a temperature via a
    /// two-point lookup makes alarm scenarios easy to stage.
    fn staged_runtime() -> CalibrationRuntime {
        let strategy = crate::calibration::Strategy::Lookup {
            temperatures: vec![-50.0, 100.0],
            resistances: vec![9000, 1000],
        };
        let channels = vec![vec![strategy]; MUX_CHANNELS];
        CalibrationRuntime::new(SteinhartCoefficients::default(), channels)
    }

    /// Resistance producing `t` under the staged lookup.
    fn staged_resistance(t: f32) -> u16 {
        (9000.0 - (t + 50.0) / 150.0 * 8000.0) as u16
    }

    #[test]
    fn batterypack_alarm_bands() {
        let runtime = staged_runtime();
        let mut manager = BatterypackTemperatures::new(BatterypackSensorsConfig::default());

        let mut check = |temperature: f32, expected: AlarmSet| {
            let mut bank = bank_with([staged_resistance(temperature); MUX_CHANNELS]);
            manager.process(&mut bank, &runtime);
            let mut set = AlarmSet::empty();
            manager.collect_alarms(&mut set);
            assert_eq!(set, expected, "at {temperature}C");
        };

        // The 16-sample smoothing window starts empty, so the first
        // process lands exactly on the staged temperature.
        check(25.0, AlarmSet::empty());
        // Warning band reaches up to, but not including, maximal.
        let mut manager2 = BatterypackTemperatures::new(BatterypackSensorsConfig::default());
        let mut bank = bank_with([staged_resistance(40.0); MUX_CHANNELS]);
        manager2.process(&mut bank, &runtime);
        let mut set = AlarmSet::empty();
        manager2.collect_alarms(&mut set);
        assert_eq!(set, AlarmSet::from(AlarmKind::TempWarn));

        let mut manager3 = BatterypackTemperatures::new(BatterypackSensorsConfig::default());
        let mut bank = bank_with([staged_resistance(50.0); MUX_CHANNELS]);
        manager3.process(&mut bank, &runtime);
        let mut set = AlarmSet::empty();
        manager3.collect_alarms(&mut set);
        assert_eq!(set, AlarmSet::from(AlarmKind::TempMax));

        let mut manager4 = BatterypackTemperatures::new(BatterypackSensorsConfig::default());
        let mut bank = bank_with([staged_resistance(-30.0); MUX_CHANNELS]);
        manager4.process(&mut bank, &runtime);
        let mut set = AlarmSet::empty();
        manager4.collect_alarms(&mut set);
        assert_eq!(set, AlarmSet::from(AlarmKind::TempMin));
    }

    #[test]
    fn current_follows_pack_maximum() {
        let runtime = staged_runtime();
        let mut samples = [staged_resistance(25.0); MUX_CHANNELS];
        samples[5] = staged_resistance(33.0);
        let mut bank = bank_with(samples);
        let mut manager = BatterypackTemperatures::new(BatterypackSensorsConfig::default());
        manager.process(&mut bank, &runtime);
        assert!((manager.current() - 33.0).abs() < 0.5);
        assert!((manager.min() - 25.0).abs() < 0.5);
        assert_eq!(manager.setpoint(), 25.0);
    }

    #[test]
    fn environment_reads_its_own_channel() {
        let runtime = staged_runtime();
        let mut samples = [staged_resistance(25.0); MUX_CHANNELS];
        samples[8] = staged_resistance(12.0);
        let mut bank = bank_with(samples);
        let mut environment = EnvironmentTemperature::new(EnvironmentSensorConfig::default());
        environment.process(&mut bank, &runtime);
        assert!((environment.temperature() - 12.0).abs() < 0.5);
        let mut set = AlarmSet::empty();
        environment.collect_alarms(&mut set);
        assert!(set.is_empty());
    }
}
