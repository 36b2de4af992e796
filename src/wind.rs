//! Wind-feed ingestion and analysis.
//!
//! A poller task fetches the station feed, parses it into [`WindSample`]s and
//! sends them down a channel. [`WindSeries`] keeps a bounded, time-windowed
//! history with the direction channel unwrapped (a 359 to 1 degree step reads
//! as +2, not -358) so trend fits over direction stay continuous across north.
//! [`analyze`] is pure: fit a trend, detrend, sweep the periodogram. A fresh
//! result supersedes the previous one wholesale.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::DateTime;
use log::{debug, warn};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::analysis::{
    analyze_periods, fit_polynomial_trend, median, PeriodPower, PolyTrend,
};
use crate::geo::unwrap_heading_degrees;
use crate::types::WindSample;

/// Station feed payload. Any field may be missing on a given fetch.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindFeedPayload {
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub wind_dir_deg: Option<f64>,
    pub updated_at: Option<String>,
}

impl WindFeedPayload {
    /// Convert to a sample, timestamped from `updatedAt` when it parses and
    /// from `fallback_now` otherwise. A payload with no usable channel at all
    /// yields `None`.
    pub fn into_sample(self, fallback_now: f64) -> Option<WindSample> {
        let finite = |v: Option<f64>| v.filter(|x| x.is_finite());
        let speed = finite(self.wind_speed);
        let gust = finite(self.wind_gust);
        let direction_deg = finite(self.wind_dir_deg);
        if speed.is_none() && gust.is_none() && direction_deg.is_none() {
            return None;
        }
        let timestamp = self
            .updated_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
            .unwrap_or(fallback_now);
        Some(WindSample { timestamp, speed, gust, direction_deg })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindChannel {
    Speed,
    Direction,
}

/// One retained observation. `direction_unwrapped` continues the running
/// unwrapped series and is what direction analysis consumes.
#[derive(Clone, Copy, Debug)]
pub struct WindPoint {
    pub timestamp: f64,
    pub speed: Option<f64>,
    pub gust: Option<f64>,
    pub direction_deg: Option<f64>,
    pub direction_unwrapped: Option<f64>,
}

pub struct WindSeries {
    window_seconds: f64,
    points: VecDeque<WindPoint>,
    /// (last wrapped, last unwrapped) direction, carried even across points
    /// with no direction channel.
    last_direction: Option<(f64, f64)>,
}

impl WindSeries {
    pub fn new(window_minutes: f64) -> Self {
        Self {
            window_seconds: window_minutes.max(0.0) * 60.0,
            points: VecDeque::new(),
            last_direction: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &WindPoint> {
        self.points.iter()
    }

    /// Append one sample. Stale or duplicate timestamps are skipped, so a
    /// feed that has not refreshed between polls adds nothing. Returns whether
    /// the sample was retained.
    pub fn push(&mut self, sample: &WindSample) -> bool {
        if !sample.timestamp.is_finite() {
            return false;
        }
        if let Some(last) = self.points.back() {
            if sample.timestamp <= last.timestamp {
                return false;
            }
        }
        let direction_unwrapped = sample.direction_deg.filter(|d| d.is_finite()).map(|d| {
            let unwrapped = unwrap_heading_degrees(d, self.last_direction);
            self.last_direction = Some((d, unwrapped));
            unwrapped
        });
        self.points.push_back(WindPoint {
            timestamp: sample.timestamp,
            speed: sample.speed.filter(|v| v.is_finite()),
            gust: sample.gust.filter(|v| v.is_finite()),
            direction_deg: sample.direction_deg.filter(|v| v.is_finite()),
            direction_unwrapped,
        });
        let newest = sample.timestamp;
        while let Some(front) = self.points.front() {
            if newest - front.timestamp > self.window_seconds {
                self.points.pop_front();
            } else {
                break;
            }
        }
        true
    }

    /// Times and values for one channel, skipping points where it is missing.
    pub fn channel_series(&self, channel: WindChannel) -> (Vec<f64>, Vec<f64>) {
        let mut times = Vec::with_capacity(self.points.len());
        let mut values = Vec::with_capacity(self.points.len());
        for point in &self.points {
            let value = match channel {
                WindChannel::Speed => point.speed,
                WindChannel::Direction => point.direction_unwrapped,
            };
            if let Some(v) = value {
                times.push(point.timestamp);
                values.push(v);
            }
        }
        (times, values)
    }
}

/// Result of one analysis pass over a channel. Latest wins; holders replace,
/// never merge.
#[derive(Clone, Debug)]
pub struct WindAnalysis {
    pub channel: WindChannel,
    pub trend: PolyTrend,
    pub significant_periods: Vec<PeriodPower>,
    pub median: Option<f64>,
    pub sample_count: usize,
}

/// Fit a trend of `fit_order` to the channel, then sweep the detrended
/// residuals for periodic structure up to `max_period_seconds`.
pub fn analyze(
    series: &WindSeries,
    channel: WindChannel,
    fit_order: usize,
    max_period_seconds: f64,
) -> WindAnalysis {
    let (times, values) = series.channel_series(channel);
    let trend = fit_polynomial_trend(&times, &values, fit_order);
    let residuals: Vec<f64> = times
        .iter()
        .zip(values.iter())
        .map(|(&t, &v)| v - trend.evaluate(t))
        .collect();
    let periodogram = analyze_periods(&times, &residuals, max_period_seconds);
    WindAnalysis {
        channel,
        median: median(&values),
        sample_count: values.len(),
        significant_periods: periodogram.significant,
        trend,
    }
}

/// Poll the wind feed forever, sending parsed samples down `tx`. Fetch and
/// parse failures are logged and skipped; the series simply gets a gap.
pub async fn wind_poll_loop(
    endpoint: String,
    poll_interval: Duration,
    tx: mpsc::Sender<WindSample>,
) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;
        let payload = match client.get(&endpoint).send().await {
            Ok(response) => match response.json::<WindFeedPayload>().await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("wind feed parse failed: {e}");
                    continue;
                }
            },
            Err(e) => {
                warn!("wind feed fetch failed: {e}");
                continue;
            }
        };
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        match payload.into_sample(now) {
            Some(sample) => {
                if tx.send(sample).await.is_err() {
                    return;
                }
            }
            None => debug!("wind feed returned an empty payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(timestamp: f64, speed: f64, direction: f64) -> WindSample {
        WindSample {
            timestamp,
            speed: Some(speed),
            gust: None,
            direction_deg: Some(direction),
        }
    }

    #[test]
    fn test_payload_parsing() {
        let payload = WindFeedPayload {
            wind_speed: Some(6.2),
            wind_gust: Some(8.4),
            wind_dir_deg: Some(215.0),
            updated_at: Some("2026-08-28T10:15:00Z".to_string()),
        };
        let s = payload.into_sample(0.0).unwrap();
        assert_eq!(s.speed, Some(6.2));
        assert_eq!(s.direction_deg, Some(215.0));
        assert!(s.timestamp > 1.7e9);
    }

    #[test]
    fn test_empty_payload_is_skipped() {
        let payload = WindFeedPayload {
            wind_speed: None,
            wind_gust: None,
            wind_dir_deg: Some(f64::NAN),
            updated_at: None,
        };
        assert!(payload.into_sample(100.0).is_none());
    }

    #[test]
    fn test_unparseable_timestamp_falls_back_to_now() {
        let payload = WindFeedPayload {
            wind_speed: Some(3.0),
            wind_gust: None,
            wind_dir_deg: None,
            updated_at: Some("not a date".to_string()),
        };
        let s = payload.into_sample(1234.5).unwrap();
        assert_eq!(s.timestamp, 1234.5);
    }

    #[test]
    fn test_series_dedups_and_trims() {
        let mut series = WindSeries::new(10.0);
        assert!(series.push(&sample(0.0, 5.0, 180.0)));
        // Same feed timestamp again: the station has not refreshed.
        assert!(!series.push(&sample(0.0, 5.0, 180.0)));
        assert_eq!(series.len(), 1);

        for i in 1..=30 {
            series.push(&sample(i as f64 * 60.0, 5.0, 180.0));
        }
        // 10 minute window: only the last ten minutes survive.
        assert!(series.points().all(|p| 1800.0 - p.timestamp <= 600.0));
    }

    #[test]
    fn test_direction_unwraps_across_north() {
        let mut series = WindSeries::new(60.0);
        series.push(&sample(0.0, 5.0, 358.0));
        series.push(&sample(60.0, 5.0, 2.0));
        series.push(&sample(120.0, 5.0, 6.0));
        let (_, values) = series.channel_series(WindChannel::Direction);
        assert_eq!(values, vec![358.0, 362.0, 366.0]);

        // The fit sees a smooth +4 deg/min veer, not a wrap discontinuity.
        let analysis = analyze(&series, WindChannel::Direction, 1, 0.0);
        assert_relative_eq!(analysis.trend.coefficients[1] * 60.0, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_missing_channel_points_are_skipped() {
        let mut series = WindSeries::new(60.0);
        series.push(&sample(0.0, 4.0, 90.0));
        series.push(&WindSample {
            timestamp: 60.0,
            speed: None,
            gust: Some(9.0),
            direction_deg: Some(92.0),
        });
        series.push(&sample(120.0, 6.0, 94.0));
        let (times, values) = series.channel_series(WindChannel::Speed);
        assert_eq!(times, vec![0.0, 120.0]);
        assert_eq!(values, vec![4.0, 6.0]);
    }

    #[test]
    fn test_analysis_finds_trend_and_oscillation() {
        let mut series = WindSeries::new(180.0);
        // 90 minutes of samples: slow build plus a 20 minute oscillation.
        for i in 0..180 {
            let t = i as f64 * 30.0;
            let speed = 5.0 + t / 1800.0 + (2.0 * std::f64::consts::PI * t / 1200.0).sin();
            series.push(&sample(t, speed, 200.0));
        }
        let analysis = analyze(&series, WindChannel::Speed, 1, 3600.0);
        assert_eq!(analysis.sample_count, 180);
        assert!(analysis.trend.coefficients[1] > 0.0);
        assert!(!analysis.significant_periods.is_empty());
        let top = analysis.significant_periods[0];
        let grid_step = (3600.0 - 120.0) / 119.0;
        assert!(
            (top.period_seconds - 1200.0).abs() <= grid_step,
            "top period {}",
            top.period_seconds
        );
        assert!(analysis.median.is_some());
    }
}
