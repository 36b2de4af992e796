//! Stateful sensor filters: GPS position/velocity, fused heading, gravity
//! calibration. Each filter is owned by a single task and mutated only through
//! its feed methods.

pub mod gps_kalman;
pub mod gravity;
pub mod heading;

pub use gps_kalman::{
    boat_length_process_variance, predict_substep_count, speed_process_scale, CovarianceSummary,
    GpsKalmanFilter, KalmanEstimate,
};
pub use gravity::{
    adapted_alpha, CalibrationFailure, CalibrationOutcome, CalibrationSession, GravityEstimate,
    GravityLowPass,
};
pub use heading::{HeadingState, ImuHeadingFusion};
