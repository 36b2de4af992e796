//! Least-squares trend fitting over irregularly sampled series.
//!
//! All fits anchor time to the first retained sample (`offset`) so the normal
//! equations never see large absolute epoch values, which would otherwise
//! cancel catastrophically in the higher-order sums.

use nalgebra::{DMatrix, DVector};

use super::linsys::solve_linear_system;

pub const MAX_FIT_ORDER: usize = 5;

/// Degree-1 trend. `offset` anchors time; `count` is the number of finite
/// points the fit actually used.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Trend {
    pub slope: f64,
    pub intercept: f64,
    pub offset: f64,
    pub count: usize,
}

impl Trend {
    pub fn flat() -> Self {
        Self { slope: 0.0, intercept: 0.0, offset: 0.0, count: 0 }
    }
}

/// Polynomial trend of order 1..=5, coefficients in ascending powers of
/// `t - offset`.
#[derive(Clone, Debug, PartialEq)]
pub struct PolyTrend {
    pub coefficients: Vec<f64>,
    pub offset: f64,
    pub count: usize,
}

impl PolyTrend {
    /// Evaluate via Horner's rule. Non-finite input or coefficients read as 0.
    pub fn evaluate(&self, time: f64) -> f64 {
        if !time.is_finite() {
            return 0.0;
        }
        let offset = if self.offset.is_finite() { self.offset } else { 0.0 };
        let x = time - offset;
        let mut acc = 0.0;
        for &c in self.coefficients.iter().rev() {
            let c = if c.is_finite() { c } else { 0.0 };
            acc = acc * x + c;
        }
        acc
    }
}

impl From<Trend> for PolyTrend {
    fn from(trend: Trend) -> Self {
        Self {
            coefficients: vec![trend.intercept, trend.slope],
            offset: trend.offset,
            count: trend.count,
        }
    }
}

fn finite_points(times: &[f64], values: &[f64]) -> Vec<(f64, f64)> {
    times
        .iter()
        .zip(values.iter())
        .filter(|(t, v)| t.is_finite() && v.is_finite())
        .map(|(&t, &v)| (t, v))
        .collect()
}

/// Closed-form least-squares line through `(times, values)`.
///
/// Pairs with a non-finite component are ignored. With no usable points the
/// result degenerates to a zero trend whose `offset` is the first raw time
/// value (or 0). A single distinct time yields slope 0.
pub fn fit_linear_trend(times: &[f64], values: &[f64]) -> Trend {
    let points = finite_points(times, values);
    if points.is_empty() {
        let offset = times.first().copied().filter(|t| t.is_finite()).unwrap_or(0.0);
        return Trend { slope: 0.0, intercept: 0.0, offset, count: 0 };
    }

    let offset = points[0].0;
    let count = points.len();
    let n = count as f64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for &(t, y) in &points {
        let x = t - offset;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }
    let denom = n * sum_xx - sum_x * sum_x;
    let slope = if denom != 0.0 { (n * sum_xy - sum_x * sum_y) / denom } else { 0.0 };
    let intercept = (sum_y - slope * sum_x) / n;
    Trend { slope, intercept, offset, count }
}

/// `intercept + slope * (t - offset)`; 0 for non-finite time, and non-finite
/// trend fields are treated as 0 for safety.
pub fn evaluate_trend(trend: &Trend, time: f64) -> f64 {
    if !time.is_finite() {
        return 0.0;
    }
    let slope = if trend.slope.is_finite() { trend.slope } else { 0.0 };
    let intercept = if trend.intercept.is_finite() { trend.intercept } else { 0.0 };
    let offset = if trend.offset.is_finite() { trend.offset } else { 0.0 };
    intercept + slope * (time - offset)
}

/// Least-squares polynomial of the requested order (clamped to 1..=5) via the
/// Vandermonde normal equations.
///
/// A singular system (too few distinct times for the order) falls back to the
/// closed-form linear fit rather than failing.
pub fn fit_polynomial_trend(times: &[f64], values: &[f64], order: usize) -> PolyTrend {
    let order = order.clamp(1, MAX_FIT_ORDER);
    if order == 1 {
        return fit_linear_trend(times, values).into();
    }

    let points = finite_points(times, values);
    if points.len() <= order {
        return fit_linear_trend(times, values).into();
    }

    let offset = points[0].0;
    let rows = points.len();
    let cols = order + 1;

    // Design matrix in x = t - offset, ascending powers per column.
    let mut design = DMatrix::zeros(rows, cols);
    let mut y = DVector::zeros(rows);
    for (r, &(t, v)) in points.iter().enumerate() {
        let x = t - offset;
        let mut power = 1.0;
        for c in 0..cols {
            design[(r, c)] = power;
            power *= x;
        }
        y[r] = v;
    }

    let normal = design.transpose() * &design;
    let rhs = design.transpose() * y;
    match solve_linear_system(&normal, &rhs) {
        Some(solution) => PolyTrend {
            coefficients: solution.iter().copied().collect(),
            offset,
            count: rows,
        },
        None => fit_linear_trend(times, values).into(),
    }
}
