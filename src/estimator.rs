//! Pure computation layer for the race-start assistant.
//!
//! Everything in this module is independent of tokio, the sensor frontends,
//! and file I/O. Samples come in, estimates and events come out, so the whole
//! pipeline can be unit-tested with recorded data or driven from a simulator
//! without touching fusion logic.

use log::debug;
use serde::Serialize;

use crate::config::Tuning;
use crate::filters::{
    CalibrationOutcome, CalibrationSession, GpsKalmanFilter, GravityEstimate, GravityLowPass,
    ImuHeadingFusion, KalmanEstimate,
};
use crate::geo::{heading_from_velocity, normalize_heading_degrees, MS_TO_KNOTS};
use crate::types::{GpsSample, ImuSample};

/// Notable state transitions, surfaced to the caller for logging.
#[derive(Clone, Debug)]
pub enum EstimatorEvent {
    SessionStarted { lat: f64, lon: f64 },
    GpsDropped { timestamp: f64 },
    ImuDropped { timestamp: f64 },
    HeadingAligned { heading_deg: f64, speed: f64 },
    CalibrationStarted { timestamp: f64 },
    CalibrationAccepted { yaw_sign: f64, gravity_magnitude: f64 },
    CalibrationRejected { reason: String },
    SessionReset,
}

/// Self-consistent snapshot of the pipeline. Cloned out to readers; never a
/// view into live state.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EstimatorSnapshot {
    pub timestamp: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub local_east: Option<f64>,
    pub local_north: Option<f64>,
    pub velocity_east: f64,
    pub velocity_north: f64,
    pub speed_ms: f64,
    pub speed_knots: f64,
    pub heading_deg: Option<f64>,
    pub heading_confidence: f64,
    pub gravity_magnitude: Option<f64>,
    pub position_variance_trace: Option<f64>,
    pub accuracy_meters: Option<f64>,
    pub calibrated: bool,
    pub gps_count: u64,
    pub imu_count: u64,
    pub dropped_count: u64,
}

pub struct RaceEstimator {
    tuning: Tuning,
    boat_length_meters: f64,
    kalman: GpsKalmanFilter,
    heading: ImuHeadingFusion,
    gravity: GravityLowPass,
    gravity_reference: Option<GravityEstimate>,
    calibration: Option<CalibrationSession>,
    gps_count: u64,
    imu_count: u64,
    dropped_count: u64,
}

impl RaceEstimator {
    pub fn new(tuning: &Tuning, boat_length_meters: f64) -> Self {
        Self {
            kalman: GpsKalmanFilter::new(tuning, boat_length_meters),
            heading: ImuHeadingFusion::new(&tuning.imu),
            gravity: GravityLowPass::new(&tuning.imu.gravity_low_pass, boat_length_meters),
            gravity_reference: None,
            calibration: None,
            tuning: tuning.clone(),
            boat_length_meters,
            gps_count: 0,
            imu_count: 0,
            dropped_count: 0,
        }
    }

    pub fn gravity_reference(&self) -> Option<GravityEstimate> {
        self.gravity_reference
    }

    pub fn is_calibrated(&self) -> bool {
        self.heading.is_calibrated()
    }

    pub fn calibration_in_progress(&self) -> bool {
        self.calibration.is_some()
    }

    /// Ingest one GPS fix.
    pub fn feed_gps(&mut self, sample: &GpsSample) -> Vec<EstimatorEvent> {
        let mut events = Vec::new();
        let was_initialized = self.kalman.is_initialized();
        let heading_was_seeded = self.heading.state().is_some();

        match self.kalman.update(sample) {
            Some(estimate) => {
                self.gps_count += 1;
                if !was_initialized {
                    events.push(EstimatorEvent::SessionStarted {
                        lat: sample.latitude,
                        lon: sample.longitude,
                    });
                }
                if let Some(course) = heading_from_velocity(estimate.velocity.0, estimate.velocity.1)
                {
                    self.heading.blend_gps(course, estimate.speed, estimate.timestamp);
                    if !heading_was_seeded && self.heading.state().is_some() {
                        events.push(EstimatorEvent::HeadingAligned {
                            heading_deg: normalize_heading_degrees(course.to_degrees()),
                            speed: estimate.speed,
                        });
                    }
                }
            }
            None => {
                self.dropped_count += 1;
                debug!("dropping gps sample at t={}", sample.timestamp);
                events.push(EstimatorEvent::GpsDropped { timestamp: sample.timestamp });
            }
        }
        events
    }

    /// Ingest one IMU sample: gravity low-pass, any running calibration, and
    /// heading integration. The heading delta rotates the position filter's
    /// velocity in the same call, so the two stay aligned between fixes.
    pub fn feed_imu(&mut self, sample: &ImuSample) -> Vec<EstimatorEvent> {
        let mut events = Vec::new();
        if !sample.is_finite() {
            self.dropped_count += 1;
            debug!("dropping imu sample at t={}", sample.timestamp);
            events.push(EstimatorEvent::ImuDropped { timestamp: sample.timestamp });
            return events;
        }
        self.imu_count += 1;
        self.gravity.feed(sample.accel_vec());

        if let Some(session) = self.calibration.as_mut() {
            session.feed(sample);
        }
        if self
            .calibration
            .as_ref()
            .is_some_and(|s| s.is_complete(sample.timestamp))
        {
            events.extend(self.finish_calibration());
        }

        if self.heading.feed_gyro(sample).is_some() {
            let delta = self.heading.take_pending_delta();
            self.kalman.apply_heading_delta(delta);
        }
        events
    }

    /// Start (or restart) a calibration attempt at `now`.
    pub fn begin_calibration(&mut self, now: f64) -> Vec<EstimatorEvent> {
        self.calibration = Some(CalibrationSession::new(
            &self.tuning.imu.calibration,
            &self.tuning.imu.gravity_low_pass,
            self.boat_length_meters,
            now,
        ));
        vec![EstimatorEvent::CalibrationStarted { timestamp: now }]
    }

    /// Close the running calibration attempt, applying the acceptance guard.
    /// A rejected attempt leaves the committed gravity reference untouched.
    pub fn finish_calibration(&mut self) -> Vec<EstimatorEvent> {
        let Some(session) = self.calibration.take() else {
            return Vec::new();
        };
        match session.finish() {
            CalibrationOutcome::Accepted { gravity, yaw_sign } => {
                self.gravity_reference = Some(gravity);
                self.heading.apply_calibration(&gravity, yaw_sign);
                self.kalman.set_imu_assisted(true);
                vec![EstimatorEvent::CalibrationAccepted {
                    yaw_sign,
                    gravity_magnitude: gravity.magnitude(),
                }]
            }
            CalibrationOutcome::Rejected(failure) => {
                vec![EstimatorEvent::CalibrationRejected { reason: failure.to_string() }]
            }
        }
    }

    /// Propagate the position estimate to `timestamp` without a measurement.
    pub fn predict_to(&mut self, timestamp: f64) -> Option<KalmanEstimate> {
        self.kalman.predict_to(timestamp)
    }

    /// Drop the position session; calibration and gravity survive, they
    /// belong to the mount, not the race.
    pub fn reset_session(&mut self) -> Vec<EstimatorEvent> {
        self.kalman.reset();
        self.heading.reset();
        vec![EstimatorEvent::SessionReset]
    }

    pub fn snapshot(&self) -> EstimatorSnapshot {
        let estimate = self.kalman.estimate();
        let heading_state = self.heading.state();
        let heading_deg = heading_state
            .map(|s| normalize_heading_degrees(s.heading_rad.to_degrees()))
            .or_else(|| {
                estimate
                    .and_then(|e| e.heading_rad)
                    .map(|h| normalize_heading_degrees(h.to_degrees()))
            });
        EstimatorSnapshot {
            timestamp: estimate.map(|e| e.timestamp).unwrap_or(0.0),
            latitude: estimate.map(|e| e.position.lat),
            longitude: estimate.map(|e| e.position.lon),
            local_east: estimate.map(|e| e.local_position.0),
            local_north: estimate.map(|e| e.local_position.1),
            velocity_east: estimate.map(|e| e.velocity.0).unwrap_or(0.0),
            velocity_north: estimate.map(|e| e.velocity.1).unwrap_or(0.0),
            speed_ms: estimate.map(|e| e.speed).unwrap_or(0.0),
            speed_knots: estimate.map(|e| e.speed * MS_TO_KNOTS).unwrap_or(0.0),
            heading_deg,
            heading_confidence: heading_state.map(|s| s.confidence).unwrap_or(0.0),
            gravity_magnitude: self.gravity.estimate().map(|g| g.magnitude()),
            position_variance_trace: estimate.map(|e| e.covariance.pos_xx + e.covariance.pos_yy),
            accuracy_meters: estimate.map(|e| e.accuracy),
            calibrated: self.heading.is_calibrated(),
            gps_count: self.gps_count,
            imu_count: self.imu_count,
            dropped_count: self.dropped_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{from_meters, LatLon};
    use approx::assert_relative_eq;

    fn fix(timestamp: f64, lat: f64, lon: f64) -> GpsSample {
        GpsSample {
            timestamp,
            latitude: lat,
            longitude: lon,
            accuracy: Some(5.0),
            speed: None,
            course_deg: None,
        }
    }

    fn spin(timestamp: f64, yaw: f64) -> ImuSample {
        ImuSample { timestamp, accel: [0.0, 0.0, 9.81], gyro: [0.0, 0.0, yaw] }
    }

    fn estimator() -> RaceEstimator {
        RaceEstimator::new(&Tuning::default(), 8.0)
    }

    #[test]
    fn test_first_fix_starts_session() {
        let mut est = estimator();
        let events = est.feed_gps(&fix(0.0, 55.68, 12.59));
        assert!(matches!(events[0], EstimatorEvent::SessionStarted { .. }));
        // Subsequent fixes do not re-announce.
        let events = est.feed_gps(&fix(1.0, 55.6801, 12.59));
        assert!(!events.iter().any(|e| matches!(e, EstimatorEvent::SessionStarted { .. })));
        assert!(est.snapshot().latitude.is_some());
    }

    #[test]
    fn test_invalid_gps_is_dropped_and_counted() {
        let mut est = estimator();
        est.feed_gps(&fix(0.0, 55.68, 12.59));
        let events = est.feed_gps(&fix(1.0, f64::NAN, 12.59));
        assert!(matches!(events[0], EstimatorEvent::GpsDropped { .. }));
        let snap = est.snapshot();
        assert_eq!(snap.dropped_count, 1);
        assert_eq!(snap.gps_count, 1);
    }

    #[test]
    fn test_calibration_lifecycle_accepts_steady_spin() {
        let mut est = estimator();
        let events = est.begin_calibration(0.0);
        assert!(matches!(events[0], EstimatorEvent::CalibrationStarted { .. }));
        assert!(est.calibration_in_progress());

        let mut accepted = false;
        for i in 0..80 {
            let events = est.feed_imu(&spin(i as f64 * 0.05, 0.3));
            if events
                .iter()
                .any(|e| matches!(e, EstimatorEvent::CalibrationAccepted { .. }))
            {
                accepted = true;
            }
        }
        assert!(accepted);
        assert!(!est.calibration_in_progress());
        assert!(est.is_calibrated());
        assert!(est.gravity_reference().is_some());
    }

    #[test]
    fn test_rejected_calibration_keeps_prior_reference() {
        let mut est = estimator();
        // First, a good calibration.
        est.begin_calibration(0.0);
        for i in 0..80 {
            est.feed_imu(&spin(i as f64 * 0.05, 0.3));
        }
        let reference = est.gravity_reference().unwrap();

        // Then a failed attempt: only a handful of samples before finishing.
        est.begin_calibration(10.0);
        for i in 0..5 {
            est.feed_imu(&spin(10.0 + i as f64 * 0.05, 0.3));
        }
        let events = est.finish_calibration();
        assert!(matches!(events[0], EstimatorEvent::CalibrationRejected { .. }));
        assert_eq!(est.gravity_reference().unwrap(), reference);
        assert!(est.is_calibrated());
    }

    #[test]
    fn test_imu_heading_carries_between_fixes() {
        let mut est = estimator();
        est.begin_calibration(0.0);
        for i in 0..80 {
            est.feed_imu(&spin(i as f64 * 0.05, 0.3));
        }
        // Moving northeast fast enough to seed the heading.
        let origin = LatLon { lat: 55.68, lon: 12.59 };
        est.feed_gps(&fix(10.0, origin.lat, origin.lon));
        for i in 1..=5 {
            let pos = from_meters(1.5 * i as f64, 1.5 * i as f64, origin);
            est.feed_gps(&fix(10.0 + i as f64, pos.lat, pos.lon));
        }
        let before = est.snapshot().heading_deg.unwrap();
        // Turn right at ~11 deg/s for two seconds with no GPS.
        for i in 0..100 {
            est.feed_imu(&spin(16.0 + i as f64 * 0.02, 0.2));
        }
        let after = est.snapshot().heading_deg.unwrap();
        let turned = crate::geo::normalize_delta_degrees(after - before);
        assert!(turned > 15.0, "turned only {turned} deg");
    }

    #[test]
    fn test_reset_clears_position_but_not_calibration() {
        let mut est = estimator();
        est.begin_calibration(0.0);
        for i in 0..80 {
            est.feed_imu(&spin(i as f64 * 0.05, 0.3));
        }
        est.feed_gps(&fix(10.0, 55.68, 12.59));
        let events = est.reset_session();
        assert!(matches!(events[0], EstimatorEvent::SessionReset));
        let snap = est.snapshot();
        assert!(snap.latitude.is_none());
        assert!(snap.calibrated);
    }

    #[test]
    fn test_snapshot_reports_knots() {
        let mut est = estimator();
        est.feed_gps(&GpsSample {
            timestamp: 0.0,
            latitude: 55.68,
            longitude: 12.59,
            accuracy: Some(5.0),
            speed: Some(2.0),
            course_deg: Some(0.0),
        });
        let snap = est.snapshot();
        assert_relative_eq!(snap.speed_ms, 2.0, epsilon = 1e-9);
        assert_relative_eq!(snap.speed_knots, 2.0 * MS_TO_KNOTS, epsilon = 1e-9);
    }
}
