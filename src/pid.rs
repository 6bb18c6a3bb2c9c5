use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

/// Discrete PID controller. Output is unbounded, callers clamp.
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    integral: f64,
    prev_error: f64,
}

impl Pid {
    pub fn new(gains: PidGains) -> Self {
        Self { gains, integral: 0.0, prev_error: 0.0 }
    }

    pub fn compute(&mut self, error: f64, dt: f64) -> f64 {
        // a non-positive step contributes neither integral nor derivative
        let derivative = if dt > 0.0 {
            self.integral += error * dt;
            (error - self.prev_error) / dt
        } else {
            0.0
        };

        let output = self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        self.prev_error = error;
        output
    }

    #[cfg(test)]
    fn integral(&self) -> f64 {
        self.integral
    }
}
