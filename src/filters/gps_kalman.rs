//! Constant-velocity GPS Kalman filter with adaptive process and measurement
//! noise.
//!
//! State vector: [x, y, vx, vy] in meters and m/s relative to the session
//! origin, local tangent plane (x = east, y = north). One filter owns one
//! session; it is created at the first valid fix and discarded at session end.
//!
//! Process noise is white acceleration noise, scaled two ways before entering
//! Q:
//! - boat length: variance shrinks with L^2 above the anchor length, capped
//!   at the base rate for smaller boats;
//! - recent max speed: the trailing max over the configured window acts as a
//!   proxy for imminent maneuvering and scales velocity noise linearly above
//!   the anchor speed.
//! Both scalings are pure functions so they can be tested without filter
//! state. The noise is anisotropic: lateral variance is a configured fraction
//! of forward variance, rotated into x/y by the current heading.

use nalgebra::{Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};
use std::collections::VecDeque;

use crate::config::{ProcessNoiseTuning, SpeedScaleTuning, Tuning};
use crate::geo::{
    from_meters, heading_from_velocity, normalize_angle_rad, to_meters, LatLon, MS_TO_KNOTS,
};
use crate::types::GpsSample;

/// Acceleration variance after boat-length scaling:
/// `q = base * min(1, (base_len / L)^2)`.
pub fn boat_length_process_variance(tuning: &ProcessNoiseTuning, boat_length_meters: f64) -> f64 {
    let base_len = tuning.base_boat_length_meters;
    let boat_len = if boat_length_meters.is_finite() { boat_length_meters } else { 0.0 };
    let effective = base_len.max(boat_len);
    let ratio = base_len / effective;
    tuning.base_acceleration_variance * ratio * ratio
}

/// Speed scale for the velocity process noise. Above `min_knots` the trailing
/// max speed scales variance linearly, anchored at `anchor_knots` and floored
/// at 1 so the filter never drops below nominal responsiveness while moving.
/// Below `min_knots` a fixed floor applies.
pub fn speed_process_scale(tuning: &SpeedScaleTuning, recent_max_speed_ms: f64) -> f64 {
    let knots = if recent_max_speed_ms.is_finite() {
        recent_max_speed_ms.max(0.0) * MS_TO_KNOTS
    } else {
        0.0
    };
    if knots >= tuning.min_knots {
        (knots / tuning.anchor_knots).max(1.0)
    } else {
        tuning.min_knots / tuning.anchor_knots
    }
}

/// Number of equal sub-steps a predict over `dt` decomposes into.
pub fn predict_substep_count(dt: f64, step_seconds: f64) -> usize {
    if !dt.is_finite() || dt <= 0.0 || step_seconds <= 0.0 {
        return 0;
    }
    (dt / step_seconds).ceil() as usize
}

/// Forward/lateral variances rotated into the global x/y frame.
fn directional_covariance(q_forward: f64, q_lateral: f64, heading_rad: f64) -> (f64, f64, f64) {
    let fx = heading_rad.sin();
    let fy = heading_rad.cos();
    let lx = heading_rad.cos();
    let ly = -heading_rad.sin();
    let xx = q_forward * fx * fx + q_lateral * lx * lx;
    let xy = q_forward * fx * fy + q_lateral * lx * ly;
    let yy = q_forward * fy * fy + q_lateral * ly * ly;
    (xx, xy, yy)
}

/// Covariance summary exposed to race-timing logic.
#[derive(Clone, Copy, Debug)]
pub struct CovarianceSummary {
    pub pos_xx: f64,
    pub pos_xy: f64,
    pub pos_yy: f64,
    pub trace: f64,
}

/// Snapshot of the current estimate. Always defined once a session has
/// started; dropped samples simply leave the previous snapshot in place.
#[derive(Clone, Copy, Debug)]
pub struct KalmanEstimate {
    pub timestamp: f64,
    pub position: LatLon,
    pub local_position: (f64, f64),
    pub velocity: (f64, f64),
    pub speed: f64,
    pub heading_rad: Option<f64>,
    pub accuracy: f64,
    pub covariance: CovarianceSummary,
}

struct FilterState {
    origin: LatLon,
    x: Vector4<f64>,
    p: Matrix4<f64>,
    last_ts: f64,
    accuracy: f64,
    heading_rad: Option<f64>,
}

pub struct GpsKalmanFilter {
    tuning: Tuning,
    boat_length_meters: f64,
    /// When an IMU heading is being integrated, GPS course is blended rather
    /// than adopted outright.
    imu_assisted: bool,
    filter: Option<FilterState>,
    /// Trailing (timestamp, speed) pairs for the speed process scale.
    speed_history: VecDeque<(f64, f64)>,
    /// Sub-steps taken by the most recent predict, for diagnostics.
    last_predict_substeps: usize,
}

impl GpsKalmanFilter {
    pub fn new(tuning: &Tuning, boat_length_meters: f64) -> Self {
        Self {
            tuning: tuning.clone(),
            boat_length_meters,
            imu_assisted: false,
            filter: None,
            speed_history: VecDeque::new(),
            last_predict_substeps: 0,
        }
    }

    pub fn set_imu_assisted(&mut self, assisted: bool) {
        self.imu_assisted = assisted;
    }

    /// Discard the session. The next valid fix re-initializes.
    pub fn reset(&mut self) {
        self.filter = None;
        self.speed_history.clear();
        self.last_predict_substeps = 0;
    }

    pub fn is_initialized(&self) -> bool {
        self.filter.is_some()
    }

    pub fn last_predict_substeps(&self) -> usize {
        self.last_predict_substeps
    }

    fn clamped_accuracy(&self, reported: Option<f64>) -> f64 {
        let noise = &self.tuning.measurement_noise;
        let raw = reported
            .filter(|a| a.is_finite() && *a > 0.0)
            .unwrap_or(noise.accuracy_default_meters);
        noise.accuracy_clamp_meters.apply(raw)
    }

    fn recent_max_speed(&self, fallback: f64) -> f64 {
        let max = self
            .speed_history
            .iter()
            .map(|(_, s)| *s)
            .fold(0.0_f64, f64::max);
        if max > 0.0 {
            max
        } else {
            fallback
        }
    }

    fn record_speed(&mut self, timestamp: f64, speed: f64) {
        if !speed.is_finite() {
            return;
        }
        self.speed_history.push_back((timestamp, speed));
        let window = self.tuning.process_noise.speed_scale.recent_max_speed_window_seconds;
        while let Some(&(ts, _)) = self.speed_history.front() {
            if timestamp - ts > window {
                self.speed_history.pop_front();
            } else {
                break;
            }
        }
    }

    fn init_state(&self, sample: &GpsSample) -> FilterState {
        let origin = LatLon { lat: sample.latitude, lon: sample.longitude };
        let accuracy = self.clamped_accuracy(sample.accuracy);
        let (vx, vy) = sample.velocity().unwrap_or((0.0, 0.0));
        let sigma2 = accuracy * accuracy;
        let vel_var = self.tuning.init.velocity_variance;
        let mut p = Matrix4::zeros();
        p[(0, 0)] = sigma2;
        p[(1, 1)] = sigma2;
        p[(2, 2)] = vel_var;
        p[(3, 3)] = vel_var;
        FilterState {
            origin,
            x: Vector4::new(0.0, 0.0, vx, vy),
            p,
            last_ts: sample.timestamp,
            accuracy,
            heading_rad: heading_from_velocity(vx, vy),
        }
    }

    /// One CV predict step of length `dt` with the given noise setup.
    fn predict_step(
        state: &mut FilterState,
        dt: f64,
        pos_cov: (f64, f64, f64),
        vel_cov: (f64, f64, f64),
    ) {
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let dt4 = dt2 * dt2;

        #[rustfmt::skip]
        let f = Matrix4::new(
            1.0, 0.0, dt,  0.0,
            0.0, 1.0, 0.0, dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        // Q for CV with white acceleration: position block dt^4/4, cross
        // block dt^3/2, velocity block dt^2, each carrying its own
        // directional covariance.
        let (pxx, pxy, pyy) = pos_cov;
        let (vxx, vxy, vyy) = vel_cov;
        #[rustfmt::skip]
        let q = Matrix4::new(
            pxx * dt4 / 4.0, pxy * dt4 / 4.0, vxx * dt3 / 2.0, vxy * dt3 / 2.0,
            pxy * dt4 / 4.0, pyy * dt4 / 4.0, vxy * dt3 / 2.0, vyy * dt3 / 2.0,
            vxx * dt3 / 2.0, vxy * dt3 / 2.0, vxx * dt2,       vxy * dt2,
            vxy * dt3 / 2.0, vyy * dt3 / 2.0, vxy * dt2,       vyy * dt2,
        );

        state.x = f * state.x;
        state.p = f * state.p * f.transpose() + q;
    }

    fn noise_setup(&self, state: &FilterState) -> ((f64, f64, f64), (f64, f64, f64)) {
        let q_base = boat_length_process_variance(&self.tuning.process_noise, self.boat_length_meters);
        let current_speed = state.x[2].hypot(state.x[3]);
        let scale = speed_process_scale(
            &self.tuning.process_noise.speed_scale,
            self.recent_max_speed(current_speed),
        );
        let ratio = self.tuning.imu.lateral_variance_ratio;
        let heading = heading_from_velocity(state.x[2], state.x[3])
            .or(state.heading_rad)
            .unwrap_or(0.0);
        let pos_cov = directional_covariance(q_base, q_base * ratio, heading);
        let q_vel = q_base * scale;
        let vel_cov = directional_covariance(q_vel, q_vel * ratio, heading);
        (pos_cov, vel_cov)
    }

    /// Propagate to `timestamp`, decomposing long gaps into equal sub-steps
    /// no larger than the configured predict step so noise accumulation stays
    /// well-conditioned.
    fn predict_clamped(&mut self, dt_raw: f64) {
        let dt = self.tuning.timing.dt_clamp_seconds.apply(dt_raw);
        let step = self.tuning.timing.covariance_predict_step_seconds;
        let substeps = predict_substep_count(dt, step).max(1);
        self.last_predict_substeps = substeps;
        // Noise setup is computed once per predict, not per sub-step: the
        // heading and speed scale are held over the gap.
        let (pos_cov, vel_cov) = match self.filter.as_ref() {
            Some(state) => self.noise_setup(state),
            None => return,
        };
        let Some(state) = self.filter.as_mut() else {
            return;
        };
        let sub_dt = dt / substeps as f64;
        for _ in 0..substeps {
            Self::predict_step(state, sub_dt, pos_cov, vel_cov);
        }
    }

    /// Joseph-form measurement update so the covariance stays symmetric and
    /// positive semi-definite regardless of gain rounding.
    fn joseph_update(state: &mut FilterState, h: Matrix2x4<f64>, z: Vector2<f64>, r_var: f64) {
        let r = Matrix2::from_diagonal_element(r_var);
        let s = h * state.p * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k = state.p * h.transpose() * s_inv;
        let innovation = z - h * state.x;
        state.x += k * innovation;
        let i_kh = Matrix4::identity() - k * h;
        state.p = i_kh * state.p * i_kh.transpose() + k * r * k.transpose();
    }

    /// Rotate the velocity state and the velocity block of the covariance by
    /// `delta_rad`, keeping heading and velocity consistent after a heading
    /// correction.
    fn rotate_velocity(state: &mut FilterState, delta_rad: f64) {
        if !delta_rad.is_finite() || delta_rad == 0.0 {
            return;
        }
        let cos = delta_rad.cos();
        let sin = delta_rad.sin();
        #[rustfmt::skip]
        let t = Matrix4::new(
            1.0, 0.0, 0.0,  0.0,
            0.0, 1.0, 0.0,  0.0,
            0.0, 0.0, cos,  sin,
            0.0, 0.0, -sin, cos,
        );
        state.x = t * state.x;
        state.p = t * state.p * t.transpose();
    }

    /// Apply a pre-integrated IMU heading delta between GPS fixes.
    pub fn apply_heading_delta(&mut self, delta_rad: f64) {
        let Some(state) = self.filter.as_mut() else {
            return;
        };
        if !delta_rad.is_finite() || delta_rad == 0.0 {
            return;
        }
        let base = state
            .heading_rad
            .or_else(|| heading_from_velocity(state.x[2], state.x[3]))
            .unwrap_or(0.0);
        state.heading_rad = Some(normalize_angle_rad(base + delta_rad));
        Self::rotate_velocity(state, delta_rad);
    }

    /// Pure prediction to `timestamp`, used between fixes to keep the
    /// estimate moving. Non-positive elapsed time is a no-op.
    pub fn predict_to(&mut self, timestamp: f64) -> Option<KalmanEstimate> {
        let last_ts = self.filter.as_ref()?.last_ts;
        let target = if timestamp.is_finite() { timestamp.max(last_ts) } else { last_ts };
        let dt_raw = target - last_ts;
        if dt_raw > 0.0 {
            self.predict_clamped(dt_raw);
            if let Some(state) = self.filter.as_mut() {
                state.last_ts = target;
            }
        }
        self.estimate()
    }

    /// Ingest one GPS fix: predict to its timestamp, then update against the
    /// position (and velocity, when reported). Invalid samples are dropped
    /// and the previous estimate holds.
    pub fn update(&mut self, sample: &GpsSample) -> Option<KalmanEstimate> {
        if !sample.has_finite_position() {
            return None;
        }
        if self.filter.is_none() {
            let state = self.init_state(sample);
            let speed = state.x[2].hypot(state.x[3]);
            self.filter = Some(state);
            self.record_speed(sample.timestamp, speed);
            return self.estimate();
        }

        let last_ts = self.filter.as_ref().map(|f| f.last_ts).unwrap_or(0.0);
        let timestamp = sample.timestamp.max(last_ts);
        let dt_raw = timestamp - last_ts;
        if dt_raw <= 0.0 {
            return None;
        }
        self.predict_clamped(dt_raw);

        let accuracy = self.clamped_accuracy(sample.accuracy);
        let velocity_measurement = sample.velocity();
        let gate = self.tuning.imu.gps_heading_min_speed;
        let imu_weight = self.tuning.imu.heading_imu_weight;
        let imu_assisted = self.imu_assisted;

        let state = self.filter.as_mut()?;
        state.last_ts = timestamp;
        state.accuracy = accuracy;

        // Position update in the local meter frame.
        let (zx, zy) = to_meters(
            LatLon { lat: sample.latitude, lon: sample.longitude },
            state.origin,
        );
        #[rustfmt::skip]
        let h_pos = Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );
        Self::joseph_update(state, h_pos, Vector2::new(zx, zy), accuracy * accuracy);

        // Velocity update when the platform reports speed and course.
        // Doppler-derived velocity is roughly an order of magnitude better
        // than the position fix, floored so it never overwhelms the filter.
        if let Some((mvx, mvy)) = velocity_measurement {
            let sigma_v = (accuracy / 10.0).max(0.3);
            #[rustfmt::skip]
            let h_vel = Matrix2x4::new(
                0.0, 0.0, 1.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            );
            Self::joseph_update(state, h_vel, Vector2::new(mvx, mvy), sigma_v * sigma_v);
        }

        // Speed-gated heading blend: below the gate GPS course is unreliable
        // and is excluded outright.
        let speed = state.x[2].hypot(state.x[3]);
        if speed >= gate {
            if let Some(gps_heading) = heading_from_velocity(state.x[2], state.x[3]) {
                match state.heading_rad {
                    Some(current) if imu_assisted => {
                        let gps_blend = (1.0 - imu_weight).clamp(0.0, 1.0);
                        if gps_blend > 0.0 {
                            let delta = normalize_angle_rad(gps_heading - current);
                            let applied = delta * gps_blend;
                            state.heading_rad = Some(normalize_angle_rad(current + applied));
                            Self::rotate_velocity(state, applied);
                        }
                    }
                    _ => state.heading_rad = Some(gps_heading),
                }
            }
        }

        let post_speed = state.x[2].hypot(state.x[3]);
        self.record_speed(timestamp, post_speed);
        self.estimate()
    }

    pub fn estimate(&self) -> Option<KalmanEstimate> {
        let state = self.filter.as_ref()?;
        let position = from_meters(state.x[0], state.x[1], state.origin);
        Some(KalmanEstimate {
            timestamp: state.last_ts,
            position,
            local_position: (state.x[0], state.x[1]),
            velocity: (state.x[2], state.x[3]),
            speed: state.x[2].hypot(state.x[3]),
            heading_rad: state.heading_rad,
            accuracy: state.accuracy,
            covariance: CovarianceSummary {
                pos_xx: state.p[(0, 0)],
                pos_xy: (state.p[(0, 1)] + state.p[(1, 0)]) / 2.0,
                pos_yy: state.p[(1, 1)],
                trace: state.p.trace(),
            },
        })
    }

    /// Position covariance integrated `seconds` ahead without touching the
    /// live state. Used for the time-to-start projection.
    pub fn projected_position_covariance(&self, seconds: f64) -> Option<CovarianceSummary> {
        let state = self.filter.as_ref()?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return self.estimate().map(|e| e.covariance);
        }
        let (pos_cov, vel_cov) = self.noise_setup(state);
        let step = self.tuning.timing.covariance_predict_step_seconds;
        let mut scratch = FilterState {
            origin: state.origin,
            x: state.x,
            p: state.p,
            last_ts: state.last_ts,
            accuracy: state.accuracy,
            heading_rad: state.heading_rad,
        };
        let mut remaining = seconds;
        while remaining > 0.0 {
            let dt = step.min(remaining);
            remaining -= dt;
            Self::predict_step(&mut scratch, dt, pos_cov, vel_cov);
        }
        Some(CovarianceSummary {
            pos_xx: scratch.p[(0, 0)],
            pos_xy: (scratch.p[(0, 1)] + scratch.p[(1, 0)]) / 2.0,
            pos_yy: scratch.p[(1, 1)],
            trace: scratch.p.trace(),
        })
    }
}
