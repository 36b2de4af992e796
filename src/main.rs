use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use racetimer_rs::config::Tuning;
use racetimer_rs::estimator::{EstimatorEvent, RaceEstimator};
use racetimer_rs::types::{GpsSample, ImuSample, WindSample};
use racetimer_rs::wind::{self, WindChannel, WindSeries};
use racetimer_rs::sensors;

#[derive(Parser, Debug)]
#[command(name = "racetimer")]
#[command(about = "Sailing race-start assistant: GPS/IMU fusion and wind analysis", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Tuning overrides (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Boat length in meters
    #[arg(long, default_value = "8.0")]
    boat_length: f64,

    /// Wind feed endpoint; omit to run without wind analysis
    #[arg(long)]
    wind_url: Option<String>,

    /// Wind poll interval in seconds
    #[arg(long, default_value = "60")]
    wind_poll_secs: u64,

    /// Wind history window in minutes
    #[arg(long, default_value = "180")]
    wind_window_minutes: f64,

    /// Trend fit order (1-5)
    #[arg(long, default_value = "3")]
    fit_order: usize,

    /// Longest period searched for, in minutes (0 = skip period analysis)
    #[arg(long, default_value = "60")]
    max_period_minutes: f64,

    /// Run the mount calibration spin at startup
    #[arg(long)]
    calibrate: bool,

    /// Output directory for periodic snapshots
    #[arg(long, default_value = "racetimer_sessions")]
    output_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let tuning = match &args.config {
        Some(path) => Tuning::from_file(path)?,
        None => Tuning::default(),
    };

    info!("racetimer starting: boat {} m, fit order {}", args.boat_length, args.fit_order);
    std::fs::create_dir_all(&args.output_dir)?;

    let mut estimator = RaceEstimator::new(&tuning, args.boat_length);
    let mut wind_series = WindSeries::new(args.wind_window_minutes);
    let mut wind_analysis = None;

    let (gps_tx, mut gps_rx) = mpsc::channel::<GpsSample>(100);
    let (imu_tx, mut imu_rx) = mpsc::channel::<ImuSample>(500);
    let (wind_tx, mut wind_rx) = mpsc::channel::<WindSample>(100);

    let _gps_handle = tokio::spawn(sensors::gps_loop(gps_tx));
    let _imu_handle = tokio::spawn(sensors::imu_loop(imu_tx));
    if let Some(url) = args.wind_url.clone() {
        tokio::spawn(wind::wind_poll_loop(
            url,
            Duration::from_secs(args.wind_poll_secs.max(1)),
            wind_tx,
        ));
    } else {
        drop(wind_tx);
    }

    if args.calibrate {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        for event in estimator.begin_calibration(now) {
            log_event(&event);
        }
    }

    let start = Utc::now();
    let mut last_status = Utc::now();
    let mut last_save = Utc::now();

    loop {
        if args.duration > 0 {
            let elapsed = Utc::now().signed_duration_since(start);
            if elapsed.num_seconds() as u64 >= args.duration {
                info!("duration reached, stopping");
                break;
            }
        }

        while let Ok(sample) = imu_rx.try_recv() {
            for event in estimator.feed_imu(&sample) {
                log_event(&event);
            }
        }

        while let Ok(sample) = gps_rx.try_recv() {
            for event in estimator.feed_gps(&sample) {
                log_event(&event);
            }
        }

        let mut wind_changed = false;
        while let Ok(sample) = wind_rx.try_recv() {
            if wind_series.push(&sample) {
                wind_changed = true;
            }
        }
        if wind_changed {
            // A fresh analysis replaces the previous one wholesale.
            let analysis = wind::analyze(
                &wind_series,
                WindChannel::Speed,
                args.fit_order,
                args.max_period_minutes * 60.0,
            );
            if let Some(top) = analysis.significant_periods.first() {
                info!(
                    "wind: {} samples, period {:.0} s (power {:.2})",
                    analysis.sample_count, top.period_seconds, top.power
                );
            }
            wind_analysis = Some(analysis);
        }

        let now = Utc::now();
        if now.signed_duration_since(last_status).num_seconds() >= 2 {
            let snap = estimator.snapshot();
            info!(
                "pos=({:?}, {:?}) speed={:.2} kn heading={:?} gps={} imu={} dropped={}",
                snap.latitude, snap.longitude, snap.speed_knots, snap.heading_deg,
                snap.gps_count, snap.imu_count, snap.dropped_count
            );
            last_status = now;
        }

        if now.signed_duration_since(last_save).num_seconds() >= 15 {
            if let Err(e) = save_snapshot(&args.output_dir, &estimator) {
                warn!("snapshot save failed: {e}");
            }
            last_save = now;
        }

        sleep(Duration::from_millis(1)).await;
    }

    save_snapshot(&args.output_dir, &estimator)?;
    let snap = estimator.snapshot();
    info!(
        "final: {} fixes, {} imu samples, {} dropped",
        snap.gps_count, snap.imu_count, snap.dropped_count
    );
    if let Some(analysis) = &wind_analysis {
        info!(
            "final wind: {} samples, median {:?}, {} significant periods",
            analysis.sample_count,
            analysis.median,
            analysis.significant_periods.len()
        );
    }
    Ok(())
}

fn log_event(event: &EstimatorEvent) {
    match event {
        EstimatorEvent::SessionStarted { lat, lon } => {
            info!("session started at ({lat:.5}, {lon:.5})")
        }
        EstimatorEvent::HeadingAligned { heading_deg, speed } => {
            info!("heading aligned to {heading_deg:.1} deg at {speed:.1} m/s")
        }
        EstimatorEvent::CalibrationStarted { timestamp } => {
            info!("calibration started at t={timestamp:.1}")
        }
        EstimatorEvent::CalibrationAccepted { yaw_sign, gravity_magnitude } => {
            info!("calibration accepted: yaw sign {yaw_sign}, |g| {gravity_magnitude:.2}")
        }
        EstimatorEvent::CalibrationRejected { reason } => {
            warn!("calibration rejected: {reason}")
        }
        EstimatorEvent::GpsDropped { timestamp } => {
            warn!("gps sample dropped at t={timestamp:.1}")
        }
        EstimatorEvent::ImuDropped { timestamp } => {
            warn!("imu sample dropped at t={timestamp:.1}")
        }
        EstimatorEvent::SessionReset => info!("session reset"),
    }
}

fn save_snapshot(output_dir: &str, estimator: &RaceEstimator) -> Result<()> {
    let snap = estimator.snapshot();
    let path = format!("{output_dir}/snapshot.json");
    let json = serde_json::to_string_pretty(&snap)?;
    std::fs::write(&path, json)?;
    Ok(())
}
