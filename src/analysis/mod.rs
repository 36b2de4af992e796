//! Numeric building blocks: dense solver, trend fitting, period detection,
//! robust summaries. Everything here is a pure function of its inputs.

pub mod linsys;
pub mod periodogram;
pub mod stats;
pub mod trend;

pub use linsys::solve_linear_system;
pub use periodogram::{analyze_periods, PeriodPower, PeriodogramResult};
pub use stats::median;
pub use trend::{evaluate_trend, fit_linear_trend, fit_polynomial_trend, PolyTrend, Trend};
