//! Sensor frontends: interval-driven loops that feed samples into bounded
//! channels. Platform readers are not wired up in this build; each loop falls
//! back to a simulated boat working upwind, which exercises the whole pipeline
//! end to end.
//!
//! Delivery applies backpressure: a full channel makes the loop wait for the
//! consumer rather than drop the sample, so every sample reaches the
//! processing side in arrival order. Samples are only ever rejected for
//! validity, downstream. Loops exit when the channel closes.

use log::{debug, info};
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

use crate::types::{GpsSample, ImuSample};

/// Simulated course: close-hauled legs with a tack every `TACK_PERIOD_SECS`.
const TACK_PERIOD_SECS: f64 = 45.0;
const BOAT_SPEED_MS: f64 = 2.6;
const START_LAT: f64 = 55.6761;
const START_LON: f64 = 12.5683;

/// Deliver one sample, waiting for channel capacity if the consumer is
/// behind. Returns false once the channel has closed.
async fn deliver<T>(tx: &Sender<T>, sample: T) -> bool {
    tx.send(sample).await.is_ok()
}

pub async fn gps_loop(tx: Sender<GpsSample>) {
    let mut ticker = interval(Duration::from_secs(1));
    let mut fix_count = 0u64;
    let started = current_timestamp();

    loop {
        ticker.tick().await;
        let sample = mock_gps_sample(started);
        if !deliver(&tx, sample).await {
            info!("[gps] channel closed after {fix_count} fixes");
            break;
        }
        fix_count += 1;
        if fix_count % 30 == 0 {
            debug!("[gps] {fix_count} fixes");
        }
    }
}

pub async fn imu_loop(tx: Sender<ImuSample>) {
    let mut ticker = interval(Duration::from_millis(20)); // ~50 Hz
    let mut sample_count = 0u64;
    let started = current_timestamp();

    loop {
        ticker.tick().await;
        let sample = mock_imu_sample(started);
        if !deliver(&tx, sample).await {
            info!("[imu] channel closed after {sample_count} samples");
            break;
        }
        sample_count += 1;
        if sample_count % 1000 == 0 {
            debug!("[imu] {sample_count} samples");
        }
    }
}

/// Heading of the simulated boat at elapsed time `t`: alternating 40 deg
/// tacks around an upwind axis of 0 deg.
fn course_heading_deg(t: f64) -> f64 {
    let leg = (t / TACK_PERIOD_SECS) as u64;
    if leg % 2 == 0 {
        40.0
    } else {
        320.0
    }
}

fn mock_gps_sample(started: f64) -> GpsSample {
    let now = current_timestamp();
    let t = now - started;

    // Integrate the legs coarsely for a plausible track.
    let mut east = 0.0;
    let mut north = 0.0;
    let mut s = 0.0;
    while s < t {
        let step = 1.0_f64.min(t - s);
        let heading = course_heading_deg(s).to_radians();
        east += BOAT_SPEED_MS * heading.sin() * step;
        north += BOAT_SPEED_MS * heading.cos() * step;
        s += step;
    }

    GpsSample {
        timestamp: now,
        latitude: START_LAT + (north / 6_371_000.0).to_degrees(),
        longitude: START_LON
            + (east / (6_371_000.0 * START_LAT.to_radians().cos())).to_degrees(),
        accuracy: Some(4.0 + (t * 0.11).sin().abs() * 3.0),
        speed: Some(BOAT_SPEED_MS + (t * 0.4).sin() * 0.3),
        course_deg: Some(course_heading_deg(t)),
    }
}

fn mock_imu_sample(started: f64) -> ImuSample {
    let now = current_timestamp();
    let t = now - started;

    // Heel sway plus a yaw burst around each tack.
    let phase = (t % TACK_PERIOD_SECS) / TACK_PERIOD_SECS;
    let tacking = phase < 0.05 || phase > 0.95;
    let yaw = if tacking { 0.35 } else { (t * 0.7).sin() * 0.02 };

    ImuSample {
        timestamp: now,
        accel: [
            (t * 1.3).sin() * 0.4,
            (t * 0.9).cos() * 0.6,
            9.81 + (t * 2.1).sin() * 0.15,
        ],
        gyro: [(t * 0.5).sin() * 0.03, (t * 0.8).cos() * 0.04, yaw],
    }
}

fn current_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_alternates_tacks() {
        assert_eq!(course_heading_deg(0.0), 40.0);
        assert_eq!(course_heading_deg(TACK_PERIOD_SECS + 1.0), 320.0);
        assert_eq!(course_heading_deg(2.0 * TACK_PERIOD_SECS + 1.0), 40.0);
    }

    #[test]
    fn test_mock_samples_are_finite() {
        let started = current_timestamp() - 10.0;
        let gps = mock_gps_sample(started);
        assert!(gps.has_finite_position());
        let imu = mock_imu_sample(started);
        assert!(imu.is_finite());
    }

    #[tokio::test]
    async fn test_full_channel_waits_instead_of_dropping() {
        // Capacity 1 with a slow consumer: every sample must still arrive,
        // in order.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u64>(1);
        let producer = tokio::spawn(async move {
            for i in 0..20 {
                if !deliver(&tx, i).await {
                    return i;
                }
            }
            20
        });
        let mut received = Vec::new();
        while let Some(i) = rx.recv().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
            received.push(i);
        }
        assert_eq!(producer.await.unwrap(), 20);
        assert_eq!(received, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_delivery_stops_on_closed_channel() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u64>(1);
        drop(rx);
        assert!(!deliver(&tx, 1).await);
    }
}
