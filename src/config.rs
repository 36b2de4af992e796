//! Tuning configuration.
//!
//! These are the "magic numbers" that keep the filter stable on slow boats and
//! responsive on fast boats while adapting to GPS accuracy automatically.
//! The whole tree is built once at startup (defaults, optionally overridden
//! from a JSON file) and passed by reference into each component — there is no
//! process-wide mutable tuning state.
//!
//! Notes on the process-noise model:
//! - Constant-velocity (CV) motion with continuous white acceleration noise.
//!   `base_acceleration_variance` is the acceleration variance in (m/s^2)^2;
//!   larger values let the velocity estimate change faster.
//! - Boat-length scaling: for similar displacement boats, typical acceleration
//!   scales roughly as 1/L, so acceleration variance scales as 1/L^2. Variance
//!   shrinks with L^2 above the anchor length and is capped at the anchor so
//!   smaller boats never exceed the base rate.
//! - Speed scaling: below `min_knots`, GPS velocity is unreliable, so the
//!   filter keeps a fixed floor responsiveness. Above it, the trailing max
//!   speed scales variance linearly, anchored at `anchor_knots`.

use serde::Deserialize;
use std::path::Path;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ClampRange {
    pub min: f64,
    pub max: f64,
}

impl ClampRange {
    pub fn apply(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeedScaleTuning {
    pub min_knots: f64,
    pub anchor_knots: f64,
    pub recent_max_speed_window_seconds: f64,
}

impl Default for SpeedScaleTuning {
    fn default() -> Self {
        Self {
            min_knots: 1.0,
            anchor_knots: 3.0,
            recent_max_speed_window_seconds: 300.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessNoiseTuning {
    pub base_acceleration_variance: f64,
    pub base_boat_length_meters: f64,
    pub speed_scale: SpeedScaleTuning,
}

impl Default for ProcessNoiseTuning {
    fn default() -> Self {
        Self {
            base_acceleration_variance: 0.8,
            base_boat_length_meters: 3.0,
            speed_scale: SpeedScaleTuning::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeasurementNoiseTuning {
    /// Reported accuracy is a 1-sigma radius in meters (roughly). Clamped so
    /// absurd values cannot destabilize the filter.
    pub accuracy_default_meters: f64,
    pub accuracy_clamp_meters: ClampRange,
}

impl Default for MeasurementNoiseTuning {
    fn default() -> Self {
        Self {
            accuracy_default_meters: 10.0,
            accuracy_clamp_meters: ClampRange { min: 3.0, max: 50.0 },
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingTuning {
    /// GPS update intervals jitter; clamping dt prevents a single stale fix
    /// from dominating the covariance.
    pub dt_clamp_seconds: ClampRange,
    /// Long predicts are split into sub-steps of this size.
    pub covariance_predict_step_seconds: f64,
}

impl Default for TimingTuning {
    fn default() -> Self {
        Self {
            dt_clamp_seconds: ClampRange { min: 0.2, max: 5.0 },
            covariance_predict_step_seconds: 0.5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitTuning {
    /// Initial velocity variance in (m/s)^2. Generous so the filter learns
    /// vx/vy quickly from the first few fixes.
    pub velocity_variance: f64,
}

impl Default for InitTuning {
    fn default() -> Self {
        Self { velocity_variance: 25.0 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GravityLowPassTuning {
    pub base_alpha: f64,
    pub base_boat_length_meters: f64,
    pub min_alpha: f64,
    pub max_alpha: f64,
}

impl Default for GravityLowPassTuning {
    fn default() -> Self {
        Self {
            base_alpha: 0.12,
            base_boat_length_meters: 3.0,
            min_alpha: 0.04,
            max_alpha: 0.3,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalibrationTuning {
    pub duration_seconds: f64,
    pub min_rotation_deg_per_sec: f64,
    pub min_samples: usize,
    pub min_yaw_mean_deg_per_sec: f64,
    pub min_positive_fraction: f64,
}

impl Default for CalibrationTuning {
    fn default() -> Self {
        Self {
            duration_seconds: 3.0,
            min_rotation_deg_per_sec: 8.0,
            min_samples: 20,
            min_yaw_mean_deg_per_sec: 6.0,
            min_positive_fraction: 0.7,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImuTuning {
    /// Complementary blend: IMU keeps this weight, GPS course the remainder.
    pub heading_imu_weight: f64,
    /// Below this ground speed GPS course is excluded outright, not
    /// down-weighted.
    pub gps_heading_min_speed: f64,
    /// Boats accelerate along their heading axis far more than sideways.
    pub lateral_variance_ratio: f64,
    pub dt_clamp_seconds: ClampRange,
    pub gravity_low_pass: GravityLowPassTuning,
    pub calibration: CalibrationTuning,
}

impl Default for ImuTuning {
    fn default() -> Self {
        Self {
            heading_imu_weight: 0.9,
            gps_heading_min_speed: 0.8,
            lateral_variance_ratio: 0.1,
            dt_clamp_seconds: ClampRange { min: 0.005, max: 0.25 },
            gravity_low_pass: GravityLowPassTuning::default(),
            calibration: CalibrationTuning::default(),
        }
    }
}

/// Complete tuning tree. Immutable for the lifetime of a session.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tuning {
    pub process_noise: ProcessNoiseTuning,
    pub measurement_noise: MeasurementNoiseTuning,
    pub timing: TimingTuning,
    pub init: InitTuning,
    pub imu: ImuTuning,
}

impl Tuning {
    /// Load tuning overrides from a JSON file. Unknown keys are rejected-free:
    /// missing sections fall back to defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let tuning = serde_json::from_str(&text)?;
        Ok(tuning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_nominal_tuning() {
        let t = Tuning::default();
        assert_eq!(t.process_noise.base_acceleration_variance, 0.8);
        assert_eq!(t.measurement_noise.accuracy_clamp_meters.min, 3.0);
        assert_eq!(t.measurement_noise.accuracy_clamp_meters.max, 50.0);
        assert_eq!(t.timing.dt_clamp_seconds.min, 0.2);
        assert_eq!(t.timing.covariance_predict_step_seconds, 0.5);
        assert_eq!(t.init.velocity_variance, 25.0);
        assert_eq!(t.imu.gravity_low_pass.base_alpha, 0.12);
        assert_eq!(t.imu.gravity_low_pass.min_alpha, 0.04);
        assert_eq!(t.imu.gravity_low_pass.max_alpha, 0.3);
        assert_eq!(t.imu.calibration.min_samples, 20);
    }

    #[test]
    fn test_partial_json_overrides() {
        let json = r#"{
            "processNoise": { "baseAccelerationVariance": 1.2 },
            "imu": { "gpsHeadingMinSpeed": 1.0 }
        }"#;
        let t: Tuning = serde_json::from_str(json).unwrap();
        assert_eq!(t.process_noise.base_acceleration_variance, 1.2);
        assert_eq!(t.imu.gps_heading_min_speed, 1.0);
        // Untouched sections keep their defaults.
        assert_eq!(t.process_noise.speed_scale.anchor_knots, 3.0);
        assert_eq!(t.imu.heading_imu_weight, 0.9);
    }
}
