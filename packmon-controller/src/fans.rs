//! Fan actuation: percent-to-duty interface, distribution strategies and
//! the PID-driven loop.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::control::{AlphaSmoothing, Pid};
use crate::platform::{MotorDirection, MotorDriver, MotorTarget, MOTOR_COUNT};
use crate::util::{map_range, ActivationTracker, Interval, Stats};
use crate::diagnostics::Diagnosticable;

/// Full-scale duty range.
const DUTY_MIN: u8 = 0;
const DUTY_MAX: u8 = u8::MAX;
const DUTY_RANGE: i32 = 256;

/// Which distribution strategy drives the motors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanStrategyKind {
    /// Same duty on every motor.
    All,
    /// Saturate motors one at a time in configured order.
    Map,
    /// `Map`, plus periodic rotation of the order to equalise wear.
    #[default]
    MapRotate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanConfig {
    #[serde(default)]
    pub strategy: FanStrategyKind,
    #[serde(default)]
    pub direction: MotorDirection,
    /// Lowest duty a running motor is driven at (stall threshold).
    #[serde(default = "default_min_speed")]
    pub min_speed: u8,
    #[serde(default = "default_max_speed")]
    pub max_speed: u8,
    #[serde(default = "default_motor_order")]
    pub motor_order: [usize; MOTOR_COUNT],
    /// Rotation period for `MapRotate`, milliseconds.
    #[serde(default = "default_rotate_ms")]
    pub rotate_ms: u64,
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

const fn default_min_speed() -> u8 {
    96
}
const fn default_max_speed() -> u8 {
    255
}
const fn default_motor_order() -> [usize; MOTOR_COUNT] {
    [0, 1, 2, 3]
}
const fn default_rotate_ms() -> u64 {
    5 * 60 * 1000
}
const fn default_kp() -> f64 {
    10.0
}
const fn default_ki() -> f64 {
    0.1
}
const fn default_kd() -> f64 {
    1.0
}
const fn default_alpha() -> f64 {
    0.1
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            strategy: FanStrategyKind::default(),
            direction: MotorDirection::default(),
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
            motor_order: default_motor_order(),
            rotate_ms: default_rotate_ms(),
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            alpha: default_alpha(),
        }
    }
}

#[derive(Debug)]
struct MapState {
    order: [usize; MOTOR_COUNT],
    duties: [u8; MOTOR_COUNT],
}

impl MapState {
    fn new(order: [usize; MOTOR_COUNT]) -> Self {
        Self {
            order,
            duties: [0; MOTOR_COUNT],
        }
    }

    /// Partition `duty * MOTOR_COUNT` across the motors: each motor in
    /// order saturates fully before the next begins; partial demand in
    /// the transition band maps linearly into `[min, max]`. Only changed
    /// duties are written to the driver.
    fn set_speed(&mut self, duty: u8, driver: &mut dyn MotorDriver, min: u8, max: u8) -> bool {
        let total = i32::from(duty) * MOTOR_COUNT as i32;
        let mut activated = 0;
        for (position, &motor) in self.order.iter().enumerate() {
            let threshold = position as i32 * DUTY_RANGE;
            let motor_duty = if total >= threshold + DUTY_RANGE {
                max
            } else if total > threshold {
                map_range(f64::from(total - threshold), 0.0, f64::from(DUTY_RANGE), f64::from(min), f64::from(max))
                    as u8
            } else {
                0
            };
            if motor_duty != self.duties[motor] {
                driver.set_speed(MotorTarget::Motor(motor), motor_duty);
                self.duties[motor] = motor_duty;
            }
            if motor_duty > 0 {
                activated += 1;
            }
        }
        activated > 0
    }

    fn rotate(&mut self) {
        self.order.rotate_left(1);
    }
}

#[derive(Debug)]
enum Strategy {
    All,
    Map(MapState),
    MapRotate { map: MapState, interval: Interval },
}

impl Strategy {
    fn from_config(config: &FanConfig) -> Self {
        match config.strategy {
            FanStrategyKind::All => Self::All,
            FanStrategyKind::Map => Self::Map(MapState::new(config.motor_order)),
            FanStrategyKind::MapRotate => Self::MapRotate {
                map: MapState::new(config.motor_order),
                interval: Interval::new(config.rotate_ms),
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::All => "motorAll",
            Self::Map(_) => "motorMap",
            Self::MapRotate { .. } => "motorMapWithRotation",
        }
    }

    fn set_speed(&mut self, duty: u8, driver: &mut dyn MotorDriver, config: &FanConfig) -> bool {
        match self {
            Self::All => {
                if duty == DUTY_MIN {
                    driver.stop(MotorTarget::All);
                    driver.set_speed(MotorTarget::All, 0);
                } else {
                    let scaled = map_range(
                        f64::from(duty),
                        f64::from(DUTY_MIN),
                        f64::from(DUTY_MAX),
                        f64::from(config.min_speed),
                        f64::from(config.max_speed),
                    ) as u8;
                    driver.set_speed(MotorTarget::All, scaled);
                    driver.set_direction(MotorTarget::All, config.direction);
                }
                duty > DUTY_MIN
            }
            Self::Map(map) => map.set_speed(duty, driver, config.min_speed, config.max_speed),
            Self::MapRotate { map, interval } => {
                if interval.ready() {
                    debug!("FanController: rotating motor order");
                    map.rotate();
                }
                map.set_speed(duty, driver, config.min_speed, config.max_speed)
            }
        }
    }
}

/// Percent-in, duty-out fan interface over the H-bridge driver.
pub struct FanController {
    config: FanConfig,
    driver: Box<dyn MotorDriver>,
    strategy: Strategy,
    duty: u8,
    active: bool,
    activations: ActivationTracker,
    duty_stats: Stats,
}

impl FanController {
    #[must_use]
    pub fn new(config: FanConfig, driver: Box<dyn MotorDriver>) -> Self {
        assert!(config.min_speed < config.max_speed, "bad speed configuration");
        let strategy = Strategy::from_config(&config);
        Self {
            config,
            driver,
            strategy,
            duty: 0,
            active: false,
            activations: ActivationTracker::default(),
            duty_stats: Stats::default(),
        }
    }

    pub fn begin(&mut self) {
        debug!("FanController: begin, strategy={}", self.strategy.name());
        self.driver.set_direction(MotorTarget::All, self.config.direction);
        self.driver.set_speed(MotorTarget::All, 0);
    }

    /// Drive the pack at `percent` of full speed. Values are clamped to
    /// [0, 100]; a repeat of the previous duty is not re-issued.
    pub fn set_percent(&mut self, percent: f32) {
        let clamped = f64::from(percent.clamp(0.0, 100.0));
        let duty = map_range(clamped, 0.0, 100.0, f64::from(DUTY_MIN), f64::from(DUTY_MAX)) as u8;
        if duty == self.duty {
            return;
        }
        debug!("FanController: setSpeed {duty}");
        self.duty = duty;
        let active = self.strategy.set_speed(duty, self.driver.as_mut(), &self.config);
        if !self.active && active {
            self.activations.mark();
        }
        self.active = active;
        self.duty_stats.add(f32::from(duty));
    }

    /// Last commanded duty (0..=255).
    #[must_use]
    pub fn duty(&self) -> u8 {
        self.duty
    }
}

impl Diagnosticable for FanController {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "fan".to_string(),
            json!({
                "speed": {
                    "val": self.duty_stats.last(),
                    "avg": self.duty_stats.mean(),
                    "min": self.duty_stats.min(),
                    "max": self.duty_stats.max(),
                },
                "actives": self.activations.count(),
            }),
        );
    }
}

/// The closed loop: PID against the pack's hottest sensor, mapped into
/// percent and smoothed before actuation.
pub struct FanLoop {
    pid: Pid,
    smoothing: AlphaSmoothing,
    output_pct: f32,
    stats: Stats,
}

impl FanLoop {
    #[must_use]
    pub fn new(config: &FanConfig) -> Self {
        Self {
            pid: Pid::new(config.kp, config.ki, config.kd),
            smoothing: AlphaSmoothing::new(config.alpha),
            output_pct: 0.0,
            stats: Stats::default(),
        }
    }

    /// One tick against the wall clock.
    pub fn process(&mut self, fans: &mut FanController, setpoint: f32, current: f32) {
        self.run(fans, setpoint, current, None);
    }

    /// One tick with an explicit Δt, for deterministic tests.
    pub fn process_with_dt(&mut self, fans: &mut FanController, setpoint: f32, current: f32, dt: f64) {
        self.run(fans, setpoint, current, Some(dt));
    }

    fn run(&mut self, fans: &mut FanController, setpoint: f32, current: f32, dt: Option<f64>) {
        if current < setpoint {
            debug!("FanLoop: below setpoint ({current:.2} < {setpoint:.2})");
            fans.set_percent(0.0);
            return;
        }
        let raw = match dt {
            Some(dt) => self.pid.apply_with_dt(f64::from(setpoint), f64::from(current), dt),
            None => self.pid.apply(f64::from(setpoint), f64::from(current)),
        };
        let constrained = map_range(raw, -100.0, 100.0, 0.0, 100.0).clamp(0.0, 100.0);
        let smoothed = self.smoothing.apply(constrained);
        debug!("FanLoop: setpoint={setpoint:.2}, current={current:.2} -> raw={raw:.2e}, constrained={constrained:.2e}, smoothed={smoothed:.2e}");
        self.output_pct = smoothed as f32;
        fans.set_percent(self.output_pct);
        self.stats.add(self.output_pct);
    }

    #[must_use]
    pub fn output_pct(&self) -> f32 {
        self.output_pct
    }
}

impl Diagnosticable for FanLoop {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        let mut sub = Map::new();
        self.pid.collect_diagnostics(&mut sub);
        sub.insert(
            "speed".to_string(),
            json!({ "avg": self.stats.mean(), "min": self.stats.min(), "max": self.stats.max() }),
        );
        obj.insert("fanloop".to_string(), Value::Object(sub));
    }
}
