//! Raw sample types flowing in from the platform collaborators.
//!
//! Timestamps are seconds on a monotonically non-decreasing clock. Out-of-order
//! delivery is a caller bug; the filters only defend against non-finite values
//! and non-positive dt.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// One GPS fix from the location collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsSample {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// 1-sigma accuracy radius in meters; clamped by tuning before use.
    pub accuracy: Option<f64>,
    /// Ground speed in m/s, when the platform reports it.
    pub speed: Option<f64>,
    /// Course over ground in degrees (0 = north), when reported.
    pub course_deg: Option<f64>,
}

impl GpsSample {
    pub fn has_finite_position(&self) -> bool {
        self.timestamp.is_finite() && self.latitude.is_finite() && self.longitude.is_finite()
    }

    /// Reported velocity when both speed and course are usable.
    pub fn velocity(&self) -> Option<(f64, f64)> {
        match (self.speed, self.course_deg) {
            (Some(speed), Some(course)) if speed.is_finite() && course.is_finite() => {
                Some(crate::geo::velocity_from_heading(speed, course.to_radians()))
            }
            _ => None,
        }
    }
}

/// One inertial sample from the motion collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: f64,
    /// Acceleration including gravity, body frame, m/s^2.
    pub accel: [f64; 3],
    /// Angular rate, body frame, rad/s.
    pub gyro: [f64; 3],
}

impl ImuSample {
    pub fn accel_vec(&self) -> Vector3<f64> {
        Vector3::from(self.accel)
    }

    pub fn gyro_vec(&self) -> Vector3<f64> {
        Vector3::from(self.gyro)
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.accel.iter().all(|v| v.is_finite())
            && self.gyro.iter().all(|v| v.is_finite())
    }
}

/// One wind observation from the polling collaborator. Any channel may be
/// missing from a given fetch; an all-missing sample is skipped upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WindSample {
    pub timestamp: f64,
    pub speed: Option<f64>,
    pub gust: Option<f64>,
    pub direction_deg: Option<f64>,
}
