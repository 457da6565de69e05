//! Closed-loop control primitives: PID with integral clamping and
//! exponential smoothing.

use std::time::Instant;

use serde_json::{json, Map, Value};

/// Integral accumulator bound (anti-windup by clamping).
const INTEGRAL_LIMIT: f64 = 100.0;

/// PID on the setpoint error. The derivative acts on the error; the
/// integral accumulator is clamped to ±100.
#[derive(Debug)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    p: f64,
    i: f64,
    d: f64,
    previous_error: f64,
    previous: Option<Instant>,
}

impl Pid {
    #[must_use]
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            p: 0.0,
            i: 0.0,
            d: 0.0,
            previous_error: 0.0,
            previous: None,
        }
    }

    /// One step against the wall clock.
    pub fn apply(&mut self, setpoint: f64, current: f64) -> f64 {
        let now = Instant::now();
        let dt = self
            .previous
            .map_or(0.0, |previous| now.duration_since(previous).as_secs_f64());
        self.previous = Some(now);
        self.apply_with_dt(setpoint, current, dt)
    }

    /// One step with an explicit Δt in seconds.
    pub fn apply_with_dt(&mut self, setpoint: f64, current: f64, dt: f64) -> f64 {
        let error = setpoint - current;
        self.p = self.kp * error;
        self.i = (self.i + self.ki * error * dt).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
        self.d = self.kd * if dt > 0.0 { (error - self.previous_error) / dt } else { 0.0 };
        self.previous_error = error;
        self.p + self.i + self.d
    }

    pub fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "pid".to_string(),
            json!({
                "Kp": self.kp, "Ki": self.ki, "Kd": self.kd,
                "p": self.p, "i": self.i, "d": self.d, "e": self.previous_error,
            }),
        );
    }
}

/// First-order exponential smoother: `out = α·in + (1−α)·out`.
#[derive(Debug)]
pub struct AlphaSmoothing {
    alpha: f64,
    value: f64,
}

impl AlphaSmoothing {
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: 0.0 }
    }

    pub fn apply(&mut self, sample: f64) -> f64 {
        self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        self.value
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worked_step_matches_reference_values() {
        // Kp=10, Ki=0.1, Kd=1, setpoint=25, current=30, dt=1s:
        // e=-5, p=-50, i=-0.5, d=-5 => -55.5
        let mut pid = Pid::new(10.0, 0.1, 1.0);
        let output = pid.apply_with_dt(25.0, 30.0, 1.0);
        assert_eq!(output, -55.5);
        assert_eq!(pid.p, -50.0);
        assert_eq!(pid.i, -0.5);
        assert_eq!(pid.d, -5.0);
    }

    #[test]
    fn integral_clamps_at_hundred() {
        let mut pid = Pid::new(0.0, 1.0, 0.0);
        for _ in 0..10 {
            pid.apply_with_dt(100.0, 0.0, 1.0);
        }
        assert_eq!(pid.i, INTEGRAL_LIMIT);
        // One step with |Ki*e*dt| <= 200 still lands inside the clamp.
        pid.apply_with_dt(-100.0, 100.0, 1.0);
        assert!(pid.i.abs() <= INTEGRAL_LIMIT);
    }

    #[test]
    fn zero_dt_suppresses_derivative() {
        let mut pid = Pid::new(0.0, 0.0, 5.0);
        assert_eq!(pid.apply_with_dt(10.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn smoothing_blends_toward_input() {
        let mut smoothing = AlphaSmoothing::new(0.1);
        assert!((smoothing.apply(22.25) - 2.225).abs() < 1e-12);
        let second = smoothing.apply(22.25);
        assert!(second > 2.225 && second < 22.25);
    }
}
