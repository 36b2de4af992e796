//! Race-start assistant core: GPS/IMU position and heading fusion plus
//! wind-trend analysis for the minutes before a sailing race start.
//!
//! The crate splits into a pure computation layer (`analysis`, `filters`,
//! `estimator`, `wind`) and thin async frontends (`sensors`, the binary).
//! Nothing in the computation layer touches the runtime, so the whole
//! pipeline can be driven from recorded data in tests.

pub mod analysis;
pub mod config;
pub mod estimator;
pub mod filters;
pub mod geo;
pub mod sensors;
pub mod types;
pub mod wind;
