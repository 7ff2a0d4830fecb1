//! Scalar PID loop used to smooth the approach to the curve target.

use std::time::Instant;

/// Discrete PID loop with fixed gains.
///
/// One instance per controller; the control loop is its only caller, so the
/// struct carries no locking. The first call initializes the loop state and
/// yields no correction.
#[derive(Debug)]
pub struct PidLoop {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    last_error: f64,
    last_time: Option<Instant>,
}

impl PidLoop {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            last_error: 0.0,
            last_time: None,
        }
    }

    /// Advances the loop by the wall-clock time since the previous call and
    /// returns the correction for `measured` toward `setpoint`.
    pub fn update(&mut self, setpoint: f64, measured: f64) -> f64 {
        let now = Instant::now();
        match self.last_time.replace(now) {
            None => {
                self.last_error = setpoint - measured;
                0.0
            }
            Some(previous) => {
                let dt = now.duration_since(previous).as_secs_f64();
                self.step(setpoint, measured, dt)
            }
        }
    }

    /// Single PID step over an explicit time delta.
    pub fn step(&mut self, setpoint: f64, measured: f64, dt: f64) -> f64 {
        let error = setpoint - measured;
        self.integral += error * dt;
        let derivative = if dt > 0.0 {
            (error - self.last_error) / dt
        } else {
            0.0
        };
        self.last_error = error;
        self.kp * error + self.ki * self.integral + self.kd * derivative
    }
}
