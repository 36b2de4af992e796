//! Periodic-structure detection for detrended wind series.
//!
//! Raw wind series are dominated by slow drift, so callers fit a trend first
//! and hand the residuals in here. For each candidate period we regress the
//! residuals onto a sin/cos pair of that period (valid for uneven sampling)
//! and score the fraction of residual variance the sinusoid explains. Local
//! maxima of that score above a noise floor are the "significant periods".

use nalgebra::{DMatrix, DVector};

use super::linsys::solve_linear_system;

/// Shortest candidate period considered, in seconds.
const MIN_PERIOD_SECONDS: f64 = 120.0;
/// Candidate periods per sweep.
const CANDIDATE_COUNT: usize = 120;
/// Minimum usable samples before any period is reported.
const MIN_SAMPLES: usize = 8;
/// Explained-variance fraction below which a peak is considered noise.
const NOISE_FLOOR: f64 = 0.05;
/// How many significant periods are reported.
const TOP_PERIODS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeriodPower {
    pub period_seconds: f64,
    /// Fraction of residual variance explained by the best-fit sinusoid of
    /// this period, in [0, 1].
    pub power: f64,
}

#[derive(Clone, Debug, Default)]
pub struct PeriodogramResult {
    /// Power over the full candidate sweep, ordered by ascending period.
    pub spectrum: Vec<PeriodPower>,
    /// Top local maxima above the noise floor, strongest first; ties broken
    /// by the shorter period.
    pub significant: Vec<PeriodPower>,
}

impl PeriodogramResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

fn sinusoid_power(times: &[f64], residuals: &[f64], variance_sum: f64, period: f64) -> f64 {
    let omega = 2.0 * std::f64::consts::PI / period;
    let mut ss = 0.0;
    let mut sc = 0.0;
    let mut cc = 0.0;
    let mut sr = 0.0;
    let mut cr = 0.0;
    for (&t, &r) in times.iter().zip(residuals.iter()) {
        let s = (omega * t).sin();
        let c = (omega * t).cos();
        ss += s * s;
        sc += s * c;
        cc += c * c;
        sr += s * r;
        cr += c * r;
    }

    let normal = DMatrix::from_row_slice(2, 2, &[ss, sc, sc, cc]);
    let rhs = DVector::from_column_slice(&[sr, cr]);
    let Some(amplitudes) = solve_linear_system(&normal, &rhs) else {
        return 0.0;
    };

    let mut unexplained = 0.0;
    for (&t, &r) in times.iter().zip(residuals.iter()) {
        let fit = amplitudes[0] * (omega * t).sin() + amplitudes[1] * (omega * t).cos();
        let err = r - fit;
        unexplained += err * err;
    }
    if variance_sum <= 0.0 {
        return 0.0;
    }
    (1.0 - unexplained / variance_sum).clamp(0.0, 1.0)
}

/// Sweep candidate periods over a detrended residual series.
///
/// `max_period_seconds` of 0 (or below the minimum candidate period), or fewer
/// than the minimum sample count, yields an empty result — rendered upstream
/// as placeholders, never an error.
pub fn analyze_periods(times: &[f64], residuals: &[f64], max_period_seconds: f64) -> PeriodogramResult {
    let points: Vec<(f64, f64)> = times
        .iter()
        .zip(residuals.iter())
        .filter(|(t, r)| t.is_finite() && r.is_finite())
        .map(|(&t, &r)| (t, r))
        .collect();
    if points.len() < MIN_SAMPLES
        || !max_period_seconds.is_finite()
        || max_period_seconds <= MIN_PERIOD_SECONDS
    {
        return PeriodogramResult::empty();
    }

    let ts: Vec<f64> = points.iter().map(|p| p.0).collect();
    let mean = points.iter().map(|p| p.1).sum::<f64>() / points.len() as f64;
    let rs: Vec<f64> = points.iter().map(|p| p.1 - mean).collect();
    let variance_sum: f64 = rs.iter().map(|r| r * r).sum();
    if variance_sum <= 0.0 {
        return PeriodogramResult::empty();
    }

    let step = (max_period_seconds - MIN_PERIOD_SECONDS) / (CANDIDATE_COUNT - 1) as f64;
    let spectrum: Vec<PeriodPower> = (0..CANDIDATE_COUNT)
        .map(|i| {
            let period = MIN_PERIOD_SECONDS + step * i as f64;
            PeriodPower { period_seconds: period, power: sinusoid_power(&ts, &rs, variance_sum, period) }
        })
        .collect();

    // Local maxima above the floor; endpoints compare one-sided.
    let mut peaks: Vec<PeriodPower> = Vec::new();
    for i in 0..spectrum.len() {
        let here = spectrum[i].power;
        if here < NOISE_FLOOR {
            continue;
        }
        let left_ok = i == 0 || spectrum[i - 1].power <= here;
        let right_ok = i + 1 == spectrum.len() || spectrum[i + 1].power <= here;
        if left_ok && right_ok {
            peaks.push(spectrum[i]);
        }
    }
    peaks.sort_by(|a, b| {
        b.power
            .partial_cmp(&a.power)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.period_seconds.partial_cmp(&b.period_seconds).unwrap_or(std::cmp::Ordering::Equal))
    });
    peaks.truncate(TOP_PERIODS);

    PeriodogramResult { spectrum, significant: peaks }
}
