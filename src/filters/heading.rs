//! Speed-gated complementary heading filter.
//!
//! Between GPS fixes the heading advances by integrating the gyro yaw rate,
//! tilt-compensated by projecting the body angular rate onto the calibrated
//! gravity direction. When a fix arrives and the boat is moving fast enough
//! for GPS course to mean anything, the course is blended in with a small
//! weight; below the gate it is excluded outright rather than down-weighted.
//!
//! The fusion also accumulates a pending heading delta so the position filter
//! can rotate its velocity state by the same amount the heading moved.

use nalgebra::Vector3;

use crate::config::ImuTuning;
use crate::filters::gravity::GravityEstimate;
use crate::geo::normalize_angle_rad;
use crate::types::ImuSample;

/// Confidence lost per second of pure gyro integration.
const CONFIDENCE_DECAY_PER_SEC: f64 = 0.02;
/// Confidence gained per corroborating GPS course.
const CONFIDENCE_GPS_GAIN: f64 = 0.1;

/// Fused heading. `heading_rad` uses the compass convention (0 = north,
/// positive clockwise); `confidence` is in [0, 1].
#[derive(Clone, Copy, Debug)]
pub struct HeadingState {
    pub heading_rad: f64,
    pub rate_rad_per_sec: f64,
    pub confidence: f64,
    pub timestamp: f64,
}

pub struct ImuHeadingFusion {
    tuning: ImuTuning,
    /// Maps the gravity-projected gyro rate onto compass-positive yaw. Set by
    /// calibration.
    yaw_sign: f64,
    gravity_unit: Option<Vector3<f64>>,
    state: Option<HeadingState>,
    last_imu_ts: Option<f64>,
    pending_delta_rad: f64,
}

impl ImuHeadingFusion {
    pub fn new(tuning: &ImuTuning) -> Self {
        Self {
            tuning: tuning.clone(),
            yaw_sign: 1.0,
            gravity_unit: None,
            state: None,
            last_imu_ts: None,
            pending_delta_rad: 0.0,
        }
    }

    /// Commit a fresh calibration. The heading state is rebuilt from scratch:
    /// the old heading was integrated under the old mount assumption.
    pub fn apply_calibration(&mut self, gravity: &GravityEstimate, yaw_sign: f64) {
        self.gravity_unit = gravity.unit();
        self.yaw_sign = if yaw_sign < 0.0 { -1.0 } else { 1.0 };
        self.state = None;
        self.last_imu_ts = None;
        self.pending_delta_rad = 0.0;
    }

    pub fn is_calibrated(&self) -> bool {
        self.gravity_unit.is_some()
    }

    pub fn state(&self) -> Option<HeadingState> {
        self.state
    }

    /// Integrate one gyro sample. Returns the heading delta applied, which is
    /// also accumulated for [`take_pending_delta`].
    ///
    /// The first sample after (re)calibration only establishes the timebase.
    pub fn feed_gyro(&mut self, sample: &ImuSample) -> Option<f64> {
        let down = self.gravity_unit?;
        if !sample.is_finite() {
            return None;
        }
        let Some(last_ts) = self.last_imu_ts else {
            self.last_imu_ts = Some(sample.timestamp);
            return None;
        };
        if sample.timestamp <= last_ts {
            return None;
        }
        let dt = self.tuning.dt_clamp_seconds.apply(sample.timestamp - last_ts);
        self.last_imu_ts = Some(sample.timestamp);

        let yaw_rate = self.yaw_sign * sample.gyro_vec().dot(&down);
        let delta = yaw_rate * dt;
        self.pending_delta_rad += delta;

        if let Some(state) = self.state.as_mut() {
            state.heading_rad = normalize_angle_rad(state.heading_rad + delta);
            state.rate_rad_per_sec = yaw_rate;
            state.timestamp = sample.timestamp;
            state.confidence = (state.confidence - CONFIDENCE_DECAY_PER_SEC * dt).max(0.0);
        }
        Some(delta)
    }

    /// Heading delta integrated since the last call. The position filter
    /// applies this to keep its velocity aligned with the fused heading.
    pub fn take_pending_delta(&mut self) -> f64 {
        std::mem::take(&mut self.pending_delta_rad)
    }

    /// Blend a GPS-derived course in. Below the speed gate the course is
    /// ignored entirely.
    pub fn blend_gps(&mut self, gps_heading_rad: f64, speed: f64, timestamp: f64) {
        if !gps_heading_rad.is_finite() || !speed.is_finite() {
            return;
        }
        if speed < self.tuning.gps_heading_min_speed {
            return;
        }
        match self.state.as_mut() {
            Some(state) => {
                let gps_weight = (1.0 - self.tuning.heading_imu_weight).clamp(0.0, 1.0);
                let delta = normalize_angle_rad(gps_heading_rad - state.heading_rad);
                state.heading_rad = normalize_angle_rad(state.heading_rad + delta * gps_weight);
                state.timestamp = timestamp;
                state.confidence =
                    (state.confidence + CONFIDENCE_GPS_GAIN * (1.0 - state.confidence)).min(1.0);
            }
            None => {
                // First usable course seeds the state outright.
                self.state = Some(HeadingState {
                    heading_rad: normalize_angle_rad(gps_heading_rad),
                    rate_rad_per_sec: 0.0,
                    confidence: 0.5,
                    timestamp,
                });
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = None;
        self.last_imu_ts = None;
        self.pending_delta_rad = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use approx::assert_relative_eq;

    fn calibrated() -> ImuHeadingFusion {
        let t = Tuning::default();
        let mut fusion = ImuHeadingFusion::new(&t.imu);
        let gravity = GravityEstimate { vector: Vector3::new(0.0, 0.0, 9.81) };
        fusion.apply_calibration(&gravity, 1.0);
        fusion
    }

    fn gyro_sample(timestamp: f64, yaw: f64) -> ImuSample {
        ImuSample { timestamp, accel: [0.0, 0.0, 9.81], gyro: [0.0, 0.0, yaw] }
    }

    #[test]
    fn test_uncalibrated_fusion_ignores_gyro() {
        let t = Tuning::default();
        let mut fusion = ImuHeadingFusion::new(&t.imu);
        assert!(!fusion.is_calibrated());
        assert!(fusion.feed_gyro(&gyro_sample(0.0, 0.5)).is_none());
        assert!(fusion.feed_gyro(&gyro_sample(0.02, 0.5)).is_none());
        assert_eq!(fusion.take_pending_delta(), 0.0);
    }

    #[test]
    fn test_constant_yaw_integrates_linearly() {
        let mut fusion = calibrated();
        fusion.blend_gps(0.0, 2.0, 0.0);
        // 0.2 rad/s for 1 s at 50 Hz.
        for i in 0..=50 {
            fusion.feed_gyro(&gyro_sample(i as f64 * 0.02, 0.2));
        }
        let state = fusion.state().unwrap();
        assert_relative_eq!(state.heading_rad, 0.2, epsilon = 1e-9);
        assert_relative_eq!(state.rate_rad_per_sec, 0.2);
        let pending = fusion.take_pending_delta();
        assert_relative_eq!(pending, 0.2, epsilon = 1e-9);
        assert_eq!(fusion.take_pending_delta(), 0.0);
    }

    #[test]
    fn test_imu_gap_is_clamped() {
        let mut fusion = calibrated();
        fusion.blend_gps(0.0, 2.0, 0.0);
        fusion.feed_gyro(&gyro_sample(0.0, 0.2));
        // A 2 s dropout integrates as at most 0.25 s.
        let delta = fusion.feed_gyro(&gyro_sample(2.0, 0.2)).unwrap();
        assert_relative_eq!(delta, 0.2 * 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_slow_gps_course_is_excluded() {
        let mut fusion = calibrated();
        // 0.5 m/s is below the 0.8 m/s gate: no state is seeded.
        fusion.blend_gps(1.0, 0.5, 0.0);
        assert!(fusion.state().is_none());
    }

    #[test]
    fn test_gps_blend_uses_small_weight() {
        let mut fusion = calibrated();
        fusion.blend_gps(0.0, 2.0, 0.0);
        // Course disagrees by 1 rad; only 10% is applied per fix.
        fusion.blend_gps(1.0, 2.0, 1.0);
        let state = fusion.state().unwrap();
        assert_relative_eq!(state.heading_rad, 0.1, epsilon = 1e-12);
        assert!(state.confidence > 0.5);
    }

    #[test]
    fn test_confidence_decays_without_gps() {
        let mut fusion = calibrated();
        fusion.blend_gps(0.0, 2.0, 0.0);
        let before = fusion.state().unwrap().confidence;
        for i in 0..500 {
            fusion.feed_gyro(&gyro_sample(i as f64 * 0.02, 0.0));
        }
        let after = fusion.state().unwrap().confidence;
        assert!(after < before);
    }

    #[test]
    fn test_negative_yaw_sign_flips_integration() {
        let t = Tuning::default();
        let mut fusion = ImuHeadingFusion::new(&t.imu);
        let gravity = GravityEstimate { vector: Vector3::new(0.0, 0.0, 9.81) };
        fusion.apply_calibration(&gravity, -1.0);
        fusion.blend_gps(0.0, 2.0, 0.0);
        fusion.feed_gyro(&gyro_sample(0.0, 0.2));
        let delta = fusion.feed_gyro(&gyro_sample(0.02, 0.2)).unwrap();
        assert!(delta < 0.0);
    }
}
