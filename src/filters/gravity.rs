//! Gravity direction estimation and mount calibration.
//!
//! The accelerometer reads gravity plus boat motion; a low-pass EMA separates
//! the two. The smoothing factor adapts to boat length: bigger boats heel and
//! pitch more slowly, so their gravity estimate can afford a slower filter.
//!
//! Calibration is a short guarded session. The user turns the boat through a
//! deliberate rotation; the session collects accel and gyro, and only commits
//! a new gravity reference (and yaw sign) if the rotation was real: enough
//! samples, enough total rotation, a clear yaw component, and a consistent
//! turn direction. Anything else is rejected and the previous estimate stays.

use nalgebra::Vector3;

use crate::config::{CalibrationTuning, GravityLowPassTuning};
use crate::types::ImuSample;

/// EMA factor adapted to boat length:
/// `clamp(base_alpha * (base_len / max(base_len, L))^2, min, max)`.
pub fn adapted_alpha(tuning: &GravityLowPassTuning, boat_length_meters: f64) -> f64 {
    let base_len = tuning.base_boat_length_meters;
    let boat_len = if boat_length_meters.is_finite() { boat_length_meters } else { 0.0 };
    let ratio = base_len / base_len.max(boat_len);
    (tuning.base_alpha * ratio * ratio).clamp(tuning.min_alpha, tuning.max_alpha)
}

/// Low-passed gravity vector in the body frame, m/s^2.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GravityEstimate {
    pub vector: Vector3<f64>,
}

impl GravityEstimate {
    /// Unit "down" direction, `None` while the vector is degenerate.
    pub fn unit(&self) -> Option<Vector3<f64>> {
        let norm = self.vector.norm();
        if norm.is_finite() && norm > 1e-3 {
            Some(self.vector / norm)
        } else {
            None
        }
    }

    pub fn magnitude(&self) -> f64 {
        self.vector.norm()
    }
}

/// Running EMA of the accelerometer vector.
pub struct GravityLowPass {
    alpha: f64,
    estimate: Option<Vector3<f64>>,
}

impl GravityLowPass {
    pub fn new(tuning: &GravityLowPassTuning, boat_length_meters: f64) -> Self {
        Self { alpha: adapted_alpha(tuning, boat_length_meters), estimate: None }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Fold one accelerometer reading in. Non-finite readings are ignored.
    pub fn feed(&mut self, accel: Vector3<f64>) {
        if !accel.iter().all(|v| v.is_finite()) {
            return;
        }
        self.estimate = Some(match self.estimate {
            Some(current) => current * (1.0 - self.alpha) + accel * self.alpha,
            None => accel,
        });
    }

    pub fn estimate(&self) -> Option<GravityEstimate> {
        self.estimate.map(|vector| GravityEstimate { vector })
    }

    pub fn reset(&mut self) {
        self.estimate = None;
    }
}

/// Why a calibration session was rejected.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationFailure {
    TooFewSamples { got: usize, needed: usize },
    InsufficientRotation { mean_deg_per_sec: f64 },
    WeakYawComponent { mean_deg_per_sec: f64 },
    InconsistentTurnDirection { agreeing_fraction: f64 },
}

impl std::fmt::Display for CalibrationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewSamples { got, needed } => {
                write!(f, "too few samples ({got} of {needed})")
            }
            Self::InsufficientRotation { mean_deg_per_sec } => {
                write!(f, "mean rotation {mean_deg_per_sec:.1} deg/s too low")
            }
            Self::WeakYawComponent { mean_deg_per_sec } => {
                write!(f, "mean yaw rate {mean_deg_per_sec:.1} deg/s too low")
            }
            Self::InconsistentTurnDirection { agreeing_fraction } => {
                write!(f, "turn direction inconsistent ({:.0}% agreement)", agreeing_fraction * 100.0)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationOutcome {
    /// New gravity reference plus the sign that maps the projected gyro rate
    /// onto compass-positive yaw.
    Accepted { gravity: GravityEstimate, yaw_sign: f64 },
    Rejected(CalibrationFailure),
}

/// One in-flight calibration attempt. `finish` consumes the session, so every
/// exit path releases it.
pub struct CalibrationSession {
    tuning: CalibrationTuning,
    started_at: f64,
    low_pass: GravityLowPass,
    rotation_rates_deg: Vec<f64>,
    yaw_rates_deg: Vec<f64>,
}

impl CalibrationSession {
    pub fn new(
        calibration: &CalibrationTuning,
        gravity: &GravityLowPassTuning,
        boat_length_meters: f64,
        started_at: f64,
    ) -> Self {
        Self {
            tuning: calibration.clone(),
            started_at,
            low_pass: GravityLowPass::new(gravity, boat_length_meters),
            rotation_rates_deg: Vec::new(),
            yaw_rates_deg: Vec::new(),
        }
    }

    pub fn started_at(&self) -> f64 {
        self.started_at
    }

    pub fn sample_count(&self) -> usize {
        self.rotation_rates_deg.len()
    }

    pub fn is_complete(&self, now: f64) -> bool {
        now - self.started_at >= self.tuning.duration_seconds
    }

    /// Accumulate one IMU sample. The yaw rate is the body angular rate
    /// projected onto the session's own gravity estimate, so tilted mounts
    /// still measure turn rate about the true vertical.
    pub fn feed(&mut self, sample: &ImuSample) {
        if !sample.is_finite() {
            return;
        }
        self.low_pass.feed(sample.accel_vec());
        let gyro = sample.gyro_vec();
        self.rotation_rates_deg.push(gyro.norm().to_degrees());
        if let Some(down) = self.low_pass.estimate().and_then(|g| g.unit()) {
            self.yaw_rates_deg.push(gyro.dot(&down).to_degrees());
        }
    }

    /// Apply the acceptance guard and consume the session.
    pub fn finish(self) -> CalibrationOutcome {
        let needed = self.tuning.min_samples;
        let got = self.yaw_rates_deg.len();
        if got < needed {
            return CalibrationOutcome::Rejected(CalibrationFailure::TooFewSamples { got, needed });
        }

        let mean_rotation =
            self.rotation_rates_deg.iter().sum::<f64>() / self.rotation_rates_deg.len() as f64;
        if mean_rotation < self.tuning.min_rotation_deg_per_sec {
            return CalibrationOutcome::Rejected(CalibrationFailure::InsufficientRotation {
                mean_deg_per_sec: mean_rotation,
            });
        }

        let mean_yaw = self.yaw_rates_deg.iter().sum::<f64>() / got as f64;
        if mean_yaw.abs() < self.tuning.min_yaw_mean_deg_per_sec {
            return CalibrationOutcome::Rejected(CalibrationFailure::WeakYawComponent {
                mean_deg_per_sec: mean_yaw.abs(),
            });
        }

        let agreeing = self
            .yaw_rates_deg
            .iter()
            .filter(|r| r.signum() == mean_yaw.signum())
            .count();
        let fraction = agreeing as f64 / got as f64;
        if fraction < self.tuning.min_positive_fraction {
            return CalibrationOutcome::Rejected(CalibrationFailure::InconsistentTurnDirection {
                agreeing_fraction: fraction,
            });
        }

        match self.low_pass.estimate() {
            Some(gravity) if gravity.unit().is_some() => {
                CalibrationOutcome::Accepted { gravity, yaw_sign: mean_yaw.signum() }
            }
            _ => CalibrationOutcome::Rejected(CalibrationFailure::TooFewSamples { got: 0, needed }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use approx::assert_relative_eq;

    fn spin_sample(timestamp: f64, yaw_rad_per_sec: f64) -> ImuSample {
        ImuSample {
            timestamp,
            accel: [0.0, 0.0, 9.81],
            gyro: [0.0, 0.0, yaw_rad_per_sec],
        }
    }

    fn session() -> CalibrationSession {
        let t = Tuning::default();
        CalibrationSession::new(&t.imu.calibration, &t.imu.gravity_low_pass, 8.0, 0.0)
    }

    #[test]
    fn test_alpha_adapts_to_boat_length() {
        let glp = Tuning::default().imu.gravity_low_pass;
        // At the anchor length the base alpha applies.
        assert_relative_eq!(adapted_alpha(&glp, 3.0), 0.12);
        // A 4 m boat smooths by the quadratic length law: 0.12 * (3/4)^2.
        assert_relative_eq!(adapted_alpha(&glp, 4.0), 0.0675);
        // Longer boats hit the floor.
        assert_relative_eq!(adapted_alpha(&glp, 6.0), 0.04);
        assert_relative_eq!(adapted_alpha(&glp, 30.0), 0.04);
        // Shorter than the anchor never exceeds the base.
        assert_relative_eq!(adapted_alpha(&glp, 1.0), 0.12);
    }

    #[test]
    fn test_low_pass_converges_to_steady_input() {
        let glp = Tuning::default().imu.gravity_low_pass;
        let mut lp = GravityLowPass::new(&glp, 3.0);
        assert!(lp.estimate().is_none());
        for _ in 0..200 {
            lp.feed(Vector3::new(0.1, -0.2, 9.8));
        }
        let g = lp.estimate().unwrap();
        assert_relative_eq!(g.vector.z, 9.8, epsilon = 1e-3);
        assert_relative_eq!(g.magnitude(), g.vector.norm());
        let unit = g.unit().unwrap();
        assert_relative_eq!(unit.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_steady_spin_is_accepted() {
        let mut s = session();
        // 0.3 rad/s is about 17 deg/s, comfortably above both guards.
        for i in 0..60 {
            s.feed(&spin_sample(i as f64 * 0.05, 0.3));
        }
        assert!(s.is_complete(3.0));
        match s.finish() {
            CalibrationOutcome::Accepted { gravity, yaw_sign } => {
                assert_relative_eq!(yaw_sign, 1.0);
                assert_relative_eq!(gravity.unit().unwrap().z, 1.0, epsilon = 1e-9);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn test_too_few_samples_is_rejected() {
        let mut s = session();
        for i in 0..5 {
            s.feed(&spin_sample(i as f64 * 0.05, 0.3));
        }
        assert_eq!(
            s.finish(),
            CalibrationOutcome::Rejected(CalibrationFailure::TooFewSamples { got: 5, needed: 20 })
        );
    }

    #[test]
    fn test_slow_rotation_is_rejected() {
        let mut s = session();
        // 2 deg/s: the boat is drifting, not turning.
        for i in 0..60 {
            s.feed(&spin_sample(i as f64 * 0.05, 0.035));
        }
        assert!(matches!(
            s.finish(),
            CalibrationOutcome::Rejected(CalibrationFailure::InsufficientRotation { .. })
        ));
    }

    #[test]
    fn test_alternating_turn_direction_is_rejected() {
        let mut s = session();
        // Rocking back and forth with a slight bias: plenty of rotation and a
        // yaw mean above threshold, but no consistent direction.
        for i in 0..60 {
            let rate = if i % 2 == 0 { 0.5 } else { -0.24 };
            s.feed(&spin_sample(i as f64 * 0.05, rate));
        }
        assert!(matches!(
            s.finish(),
            CalibrationOutcome::Rejected(
                CalibrationFailure::WeakYawComponent { .. }
                    | CalibrationFailure::InconsistentTurnDirection { .. }
            )
        ));
    }

    #[test]
    fn test_non_finite_samples_are_ignored() {
        let mut s = session();
        s.feed(&ImuSample { timestamp: 0.0, accel: [f64::NAN, 0.0, 9.8], gyro: [0.0, 0.0, 0.3] });
        assert_eq!(s.sample_count(), 0);
    }
}
