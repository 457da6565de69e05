//! Thermistor calibration: reference-tracked collection, Steinhart-Hart
//! fitting, persistence and the runtime lookup used on every sample.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::math;
use crate::platform::{ReferenceThermometer, MUX_CHANNELS};
use crate::util::{ActivationTracker, ActivationTrackerWithDetail, Interval, MovingAverage};
use crate::diagnostics::Diagnosticable;

/// Inputs a strategy will accept during fitting and conversion.
fn resistance_reasonable(resistance: u16) -> bool {
    resistance > 0 && u32::from(resistance) < 100 * 1000
}

fn temperature_reasonable(temperature: f32) -> bool {
    temperature > -273.15 && temperature < 200.0
}

/// The four Steinhart-Hart coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SteinhartCoefficients {
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
    #[serde(rename = "C")]
    pub c: f64,
    #[serde(rename = "D")]
    pub d: f64,
}

impl Default for SteinhartCoefficients {
    fn default() -> Self {
        // Fitted from the reference pack's calibration sweep.
        Self {
            a: -0.012400427786,
            b: 0.006860769298,
            c: -0.001057743719,
            d: 0.000056166727,
        }
    }
}

impl SteinhartCoefficients {
    /// T = 1/(A + B·lnR + C·ln²R + D·ln³R) − 273.15, bounds-checked on
    /// both sides.
    #[must_use]
    pub fn temperature(&self, resistance: u16) -> Option<f32> {
        if !resistance_reasonable(resistance) {
            return None;
        }
        let ln_r = f64::from(resistance).ln();
        let inverse = self.a + self.b * ln_r + self.c * ln_r * ln_r + self.d * ln_r * ln_r * ln_r;
        let temperature = (1.0 / inverse - 273.15) as f32;
        temperature_reasonable(temperature).then_some(temperature)
    }
}

/// A per-channel conversion strategy. The set is closed; the name-keyed
/// factory map exists only at the persistence boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Piecewise-linear interpolation over a table monotone by falling
    /// resistance.
    Lookup {
        temperatures: Vec<f32>,
        resistances: Vec<u16>,
    },
    Steinhart(SteinhartCoefficients),
}

pub const STRATEGY_LOOKUP: &str = "lookup";
pub const STRATEGY_STEINHART: &str = "steinhart";

impl Strategy {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lookup { .. } => STRATEGY_LOOKUP,
            Self::Steinhart(_) => STRATEGY_STEINHART,
        }
    }

    /// First strategy whose conversion accepts the input wins; `None`
    /// passes to the next registered strategy.
    #[must_use]
    pub fn convert(&self, resistance: u16) -> Option<f32> {
        match self {
            Self::Lookup {
                temperatures,
                resistances,
            } => {
                // Resistances fall as temperature rises; find the first
                // entry at or below the sample.
                let index = resistances.iter().position(|&r| r <= resistance)?;
                if index == 0 {
                    return None;
                }
                let (r0, r1) = (f32::from(resistances[index - 1]), f32::from(resistances[index]));
                let (t0, t1) = (temperatures[index - 1], temperatures[index]);
                Some(t0 + (t1 - t0) * (f32::from(resistance) - r0) / (r1 - r0))
            }
            Self::Steinhart(coefficients) => coefficients.temperature(resistance),
        }
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// The raw table gathered during a calibration run: one reference
/// temperature per step and one averaged resistance per sensor per step.
/// Owned transiently by the pipeline and discarded after fitting.
#[derive(Debug, Clone)]
pub struct Collection {
    pub temperatures: Vec<f32>,
    /// Indexed `[sensor][step]`.
    pub resistances: Vec<Vec<u16>>,
}

impl Collection {
    #[must_use]
    pub fn new(sensors: usize, steps: usize) -> Self {
        Self {
            temperatures: vec![0.0; steps],
            resistances: vec![vec![0; steps]; sensors],
        }
    }
}

/// Samples averaged per thermistor at each settled step.
const AVG_SAMPLE: usize = 6;
/// Reference thermometer smoothing window.
const AVG_REFERENCE: usize = 12;
/// Reference poll cadence during collection.
const POLL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectorState {
    /// The reference must first fall below `start - step`.
    WaitBelowStart,
    /// Waiting for the reference to climb past step `n`'s target.
    WaitForStep(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorStatus {
    Waiting,
    Done,
}

/// Per-tick collection state machine. The scheduler drives progress; each
/// step consumes one smoothed reference sample and, on settle, averages
/// [`AVG_SAMPLE`] readings of every channel.
#[derive(Debug)]
pub struct Collector {
    start: f32,
    step_c: f32,
    steps: usize,
    state: CollectorState,
    reference: MovingAverage<AVG_REFERENCE>,
    pub collection: Collection,
}

impl Collector {
    #[must_use]
    pub fn new(sensors: usize, start: f32, end: f32, step_c: f32) -> Self {
        let steps = ((end - start) / step_c) as usize + 1;
        Self {
            start,
            step_c,
            steps,
            state: CollectorState::WaitBelowStart,
            reference: MovingAverage::default(),
            collection: Collection::new(sensors, steps),
        }
    }

    pub fn step(&mut self, reference_c: f32, read_resistance: &mut dyn FnMut(usize) -> u16) -> CollectorStatus {
        let smoothed = self.reference.update(reference_c);
        match self.state {
            CollectorState::WaitBelowStart => {
                if smoothed <= self.start - self.step_c {
                    debug!("Collector: reference below {:.2}C, starting sweep", self.start - self.step_c);
                    self.state = CollectorState::WaitForStep(0);
                }
                CollectorStatus::Waiting
            }
            CollectorState::WaitForStep(step) => {
                let target = self.start + step as f32 * self.step_c;
                if smoothed < target {
                    return CollectorStatus::Waiting;
                }
                self.collection.temperatures[step] = smoothed;
                for (sensor, row) in self.collection.resistances.iter_mut().enumerate() {
                    let sum: u32 = (0..AVG_SAMPLE).map(|_| u32::from(read_resistance(sensor))).sum();
                    row[step] = (sum / AVG_SAMPLE as u32) as u16;
                }
                debug!("Collector: step {}/{} settled at {smoothed:.2}C", step + 1, self.steps);
                if step + 1 == self.steps {
                    return CollectorStatus::Done;
                }
                self.state = CollectorState::WaitForStep(step + 1);
                CollectorStatus::Waiting
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

/// Per-channel fit error bound.
const FIT_ERROR_MAX_C: f32 = 5.0;
/// Pooled default-fit error bound.
const FIT_ERROR_MAX_POOLED_C: f32 = 10.0;

struct NormalEquations {
    xtx: math::Matrix4,
    xty: math::Vector4,
}

impl NormalEquations {
    fn new() -> Self {
        Self {
            xtx: [[0.0; 4]; 4],
            xty: [0.0; 4],
        }
    }

    fn add(&mut self, temperature: f32, resistance: u16) {
        let y = 1.0 / (f64::from(temperature) + 273.15);
        let ln_r = f64::from(resistance).ln();
        let row = [1.0, ln_r, ln_r * ln_r, ln_r * ln_r * ln_r];
        for j in 0..4 {
            for k in 0..4 {
                self.xtx[j][k] += row[j] * row[k];
            }
            self.xty[j] += row[j] * y;
        }
    }

    fn solve(self) -> Result<SteinhartCoefficients, String> {
        let [a, b, c, d] = math::solve4(self.xtx, self.xty).map_err(|fault| fault.to_string())?;
        Ok(SteinhartCoefficients { a, b, c, d })
    }
}

fn check_point(temperature: f32, resistance: u16, index: usize) -> Result<(), String> {
    if !temperature_reasonable(temperature) {
        return Err(format!("invalid temperature at index {index}"));
    }
    if !resistance_reasonable(resistance) {
        return Err(format!("invalid resistance at index {index}"));
    }
    Ok(())
}

fn verify_fit(
    coefficients: &SteinhartCoefficients,
    points: impl Iterator<Item = (f32, u16)>,
    bound_c: f32,
) -> Result<(), String> {
    for (temperature, resistance) in points {
        let error = match coefficients.temperature(resistance) {
            Some(predicted) => (predicted - temperature).abs(),
            None => f32::INFINITY,
        };
        if error > bound_c {
            return Err(format!("unreliable result, error = {error:.2}"));
        }
    }
    Ok(())
}

/// Fit one channel. Requires at least four points.
pub fn fit_steinhart(temperatures: &[f32], resistances: &[u16]) -> Result<SteinhartCoefficients, String> {
    assert_eq!(temperatures.len(), resistances.len());
    if temperatures.len() < 4 {
        return Err(format!("too few points: {}", temperatures.len()));
    }
    let mut equations = NormalEquations::new();
    for (index, (&temperature, &resistance)) in temperatures.iter().zip(resistances).enumerate() {
        check_point(temperature, resistance, index)?;
        equations.add(temperature, resistance);
    }
    let coefficients = equations.solve()?;
    verify_fit(
        &coefficients,
        temperatures.iter().copied().zip(resistances.iter().copied()),
        FIT_ERROR_MAX_C,
    )?;
    Ok(coefficients)
}

/// Fit the default strategy to the data pooled over every channel; the
/// error bound is looser than for per-channel fits.
pub fn fit_steinhart_pooled(collection: &Collection) -> Result<SteinhartCoefficients, String> {
    if collection.temperatures.len() < 4 {
        return Err(format!("too few points: {}", collection.temperatures.len()));
    }
    let mut equations = NormalEquations::new();
    for (index, &temperature) in collection.temperatures.iter().enumerate() {
        for row in &collection.resistances {
            check_point(temperature, row[index], index)?;
            equations.add(temperature, row[index]);
        }
    }
    let coefficients = equations.solve()?;
    let points = collection.temperatures.iter().enumerate().flat_map(|(index, &temperature)| {
        collection
            .resistances
            .iter()
            .map(move |row| (temperature, row[index]))
    });
    verify_fit(&coefficients, points, FIT_ERROR_MAX_POOLED_C)?;
    Ok(coefficients)
}

// ---------------------------------------------------------------------------
// Factories and fitting of the full strategy set
// ---------------------------------------------------------------------------

type StrategyFitter = fn(&[f32], &[u16]) -> Result<Strategy, String>;

fn fit_lookup(temperatures: &[f32], resistances: &[u16]) -> Result<Strategy, String> {
    Ok(Strategy::Lookup {
        temperatures: temperatures.to_vec(),
        resistances: resistances.to_vec(),
    })
}

fn fit_steinhart_strategy(temperatures: &[f32], resistances: &[u16]) -> Result<Strategy, String> {
    fit_steinhart(temperatures, resistances).map(Strategy::Steinhart)
}

/// Strategies attempted during calibration, in fixed order. The lookup
/// table is stored for reference but not used at runtime.
fn fitters_for_calibration() -> IndexMap<&'static str, StrategyFitter> {
    IndexMap::from([
        (STRATEGY_LOOKUP, fit_lookup as StrategyFitter),
        (STRATEGY_STEINHART, fit_steinhart_strategy as StrategyFitter),
    ])
}

/// Fit every channel; a failing strategy is skipped with its diagnostic
/// logged, it does not abort the run.
#[must_use]
pub fn compute_strategies(collection: &Collection) -> Vec<Vec<Strategy>> {
    let fitters = fitters_for_calibration();
    collection
        .resistances
        .iter()
        .enumerate()
        .map(|(sensor, row)| {
            let mut strategies = Vec::new();
            for (name, fitter) in &fitters {
                match fitter(&collection.temperatures, row) {
                    Ok(strategy) => strategies.push(strategy),
                    Err(fault) => debug!("Calibration: sensor {sensor}, {name} fit skipped: {fault}"),
                }
            }
            strategies
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

fn strategy_to_json(strategy: &Strategy) -> Value {
    match strategy {
        Strategy::Lookup {
            temperatures,
            resistances,
        } => json!({ "T": temperatures, "R": resistances }),
        Strategy::Steinhart(coefficients) => serde_json::to_value(coefficients).unwrap_or(Value::Null),
    }
}

fn strategy_from_json(name: &str, details: &Value) -> Option<Strategy> {
    match name {
        // Only the steinhart form is instantiated at load; lookup tables
        // are stored for reference.
        STRATEGY_STEINHART => serde_json::from_value::<SteinhartCoefficients>(details.clone())
            .ok()
            .map(Strategy::Steinhart),
        _ => None,
    }
}

/// Write the strategy set as a single JSON document, atomically (temp
/// file plus rename).
pub fn save_strategies(
    path: &Path,
    default: &SteinhartCoefficients,
    channels: &[Vec<Strategy>],
) -> std::io::Result<()> {
    let mut doc = Map::new();
    for (sensor, strategies) in channels.iter().enumerate() {
        let mut entry = Map::new();
        for strategy in strategies {
            entry.insert(strategy.name().to_string(), strategy_to_json(strategy));
        }
        doc.insert(format!("sensor{sensor}"), Value::Object(entry));
    }
    doc.insert("default".to_string(), serde_json::to_value(default).unwrap_or(Value::Null));

    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, serde_json::to_string(&Value::Object(doc))?)?;
    std::fs::rename(&temp, path)
}

/// Load the persisted document; returns the default coefficients plus
/// per-channel strategies, or `None` when nothing usable is stored.
#[must_use]
pub fn load_strategies(
    path: &Path,
    sensors: usize,
    mut default: SteinhartCoefficients,
) -> Option<(SteinhartCoefficients, Vec<Vec<Strategy>>)> {
    let content = std::fs::read_to_string(path).ok()?;
    let doc: Value = serde_json::from_str(&content).ok()?;
    let mut channels = vec![Vec::new(); sensors];
    let mut count = 0;
    for (sensor, strategies) in channels.iter_mut().enumerate() {
        let Some(entry) = doc.get(format!("sensor{sensor}")).and_then(Value::as_object) else {
            debug!("Calibration: no stored strategies for sensor {sensor}");
            continue;
        };
        for (name, details) in entry {
            if let Some(strategy) = strategy_from_json(name, details) {
                strategies.push(strategy);
                count += 1;
            }
        }
    }
    if let Some(details) = doc.get("default") {
        if let Ok(coefficients) = serde_json::from_value::<SteinhartCoefficients>(details.clone()) {
            default = coefficients;
            count += 1;
        }
    }
    (count > 0).then_some((default, channels))
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Per-channel strategy dispatch with default fallback. Owned for the
/// process lifetime; replaced wholesale after a calibration run.
#[derive(Debug)]
pub struct CalibrationRuntime {
    default: SteinhartCoefficients,
    channels: Vec<Vec<Strategy>>,
}

impl CalibrationRuntime {
    #[must_use]
    pub fn new(default: SteinhartCoefficients, channels: Vec<Vec<Strategy>>) -> Self {
        Self { default, channels }
    }

    #[must_use]
    pub fn default_only(default: SteinhartCoefficients, sensors: usize) -> Self {
        Self::new(default, vec![Vec::new(); sensors])
    }

    /// First registered strategy that yields a plausible temperature
    /// wins, then the default; `NAN` signals total failure.
    #[must_use]
    pub fn calculate_temperature(&self, channel: usize, resistance: u16) -> f32 {
        for strategy in self.channels.get(channel).into_iter().flatten() {
            if let Some(temperature) = strategy.convert(resistance) {
                return temperature;
            }
        }
        if let Some(temperature) = SteinhartCoefficients::temperature(&self.default, resistance) {
            return temperature;
        }
        debug!("CalibrationRuntime: conversion failed, channel={channel}, resistance={resistance}");
        f32::NAN
    }
}

// ---------------------------------------------------------------------------
// Manager component
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
    #[serde(default = "default_start")]
    pub start_c: f32,
    #[serde(default = "default_end")]
    pub end_c: f32,
    #[serde(default = "default_step")]
    pub step_c: f32,
    #[serde(default)]
    pub default: SteinhartCoefficients,
}

fn default_path() -> PathBuf {
    PathBuf::from("temperaturecalibrations.json")
}
const fn default_start() -> f32 {
    5.0
}
const fn default_end() -> f32 {
    60.0
}
const fn default_step() -> f32 {
    0.5
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            start_c: default_start(),
            end_c: default_end(),
            step_c: default_step(),
            default: SteinhartCoefficients::default(),
        }
    }
}

/// The calibration component: loads persisted strategies at `begin`,
/// steps an active collection run from `process`, and answers every
/// conversion through its runtime.
pub struct CalibrationManager {
    config: CalibrationConfig,
    reference: Box<dyn ReferenceThermometer>,
    runtime: CalibrationRuntime,
    collector: Option<Collector>,
    poll: Interval,
    runs: ActivationTracker,
    failures: ActivationTrackerWithDetail,
}

impl CalibrationManager {
    #[must_use]
    pub fn new(config: CalibrationConfig, reference: Box<dyn ReferenceThermometer>) -> Self {
        let runtime = CalibrationRuntime::default_only(config.default, MUX_CHANNELS);
        Self {
            config,
            reference,
            runtime,
            collector: None,
            poll: Interval::new(POLL_MS),
            runs: ActivationTracker::default(),
            failures: ActivationTrackerWithDetail::default(),
        }
    }

    pub fn begin(&mut self) {
        match load_strategies(&self.config.path, MUX_CHANNELS, self.config.default) {
            Some((default, channels)) => {
                let installed: usize = channels.iter().map(Vec::len).sum();
                info!(
                    "CalibrationManager: loaded {installed} strategies from {}",
                    self.config.path.display()
                );
                self.runtime = CalibrationRuntime::new(default, channels);
            }
            None => {
                warn!(
                    "CalibrationManager: no stored calibrations ({}), relying on default",
                    self.config.path.display()
                );
            }
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &CalibrationRuntime {
        &self.runtime
    }

    #[must_use]
    pub fn calculate_temperature(&self, channel: usize, resistance: u16) -> f32 {
        self.runtime.calculate_temperature(channel, resistance)
    }

    #[must_use]
    pub fn calibrating(&self) -> bool {
        self.collector.is_some()
    }

    /// Begin a collection run; progress happens in `process`.
    pub fn start_calibration(&mut self) {
        if self.collector.is_some() {
            return;
        }
        info!(
            "CalibrationManager: collecting {:.1}C..{:.1}C step {:.1}C over {MUX_CHANNELS} channels",
            self.config.start_c, self.config.end_c, self.config.step_c
        );
        self.collector = Some(Collector::new(
            MUX_CHANNELS,
            self.config.start_c,
            self.config.end_c,
            self.config.step_c,
        ));
    }

    /// One scheduler tick: at the poll cadence, advance the collector and
    /// finish the run when the sweep completes.
    pub fn process(&mut self, read_resistance: &mut dyn FnMut(usize) -> u16) {
        let Some(collector) = self.collector.as_mut() else {
            return;
        };
        if !self.poll.ready() {
            return;
        }
        let reference_c = self.reference.read_celsius();
        if collector.step(reference_c, read_resistance) == CollectorStatus::Done {
            let collection = self.collector.take().expect("collector active").collection;
            self.finish(&collection);
        }
    }

    fn finish(&mut self, collection: &Collection) {
        let channels = compute_strategies(collection);
        let default = match fit_steinhart_pooled(collection) {
            Ok(coefficients) => coefficients,
            Err(fault) => {
                warn!("CalibrationManager: default fit failed: {fault}");
                self.failures.mark(fault);
                return;
            }
        };
        if let Err(fault) = save_strategies(&self.config.path, &default, &channels) {
            warn!("CalibrationManager: could not persist calibrations: {fault}");
            self.failures.mark(fault.to_string());
        }
        let installed: usize = channels.iter().map(Vec::len).sum();
        info!("CalibrationManager: calibration complete, {installed} strategies installed");
        self.runtime = CalibrationRuntime::new(default, channels);
        self.runs.mark();
    }
}

impl Diagnosticable for CalibrationManager {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "calibration".to_string(),
            json!({
                "active": self.calibrating(),
                "runs": self.runs.count(),
                "failures": { "count": self.failures.count(), "last": self.failures.detail() },
            }),
        );
    }
}
