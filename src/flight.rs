use std::path::PathBuf;

use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::calibration::{pixels_per_cm, CALIBRATED_HEIGHT_CM};
use crate::errors::Result;
use crate::mission::{MissionProgram, SearchOutcome};
use crate::mission_log::{write_mission_log, TickRecord};
use crate::options::secs;
use crate::servo::{ServoConfig, ServoOutcome, VisualServo};
use crate::tello::{Connected, Tello};
use crate::video::FrameSlot;

/// Settings for a whole mission, from takeoff to landing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    /// Approach settings. The scale is replaced by the calibrated one.
    pub servo: ServoConfig,
    /// Used when the drone does not report its height.
    pub default_height_cm: u32,
    /// Upper bound on waiting for the first video frame.
    #[serde(with = "secs")]
    pub stream_settle: Duration,
    #[serde(with = "secs")]
    pub takeoff_settle: Duration,
    /// Pause between finding the landing marker and starting the approach.
    #[serde(with = "secs")]
    pub handoff_settle: Duration,
    pub mission_log_path: PathBuf,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            servo: ServoConfig::default(),
            default_height_cm: 100,
            stream_settle: Duration::from_secs(5),
            takeoff_settle: Duration::from_secs(10),
            handoff_settle: Duration::from_secs(5),
            mission_log_path: PathBuf::from("mission_data.csv"),
        }
    }
}

impl MissionConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[derive(Debug, Clone)]
pub struct FlightReport {
    pub height_cm: u32,
    pub pixels_per_cm: f64,
    pub search: SearchOutcome,
    /// `None` when the landing marker was never found.
    pub approach: Option<ServoOutcome>,
    pub log_written: bool,
}

/// Flies `program` and then lands on its landing marker.
///
/// Whatever happens, the mission log gathered so far is written and the
/// link is closed, which lands the drone if it is still flying.
pub async fn fly_mission(
    drone: &Tello<Connected>,
    frames: &FrameSlot,
    program: &mut MissionProgram,
    config: &MissionConfig,
) -> Result<FlightReport> {
    let mut log = vec![];
    let result = fly(drone, frames, program, config, &mut log).await;
    if let Err(err) = &result {
        warn!("[Flight] mission aborted ({err})");
    }

    let log_written = match write_mission_log(&config.mission_log_path, &log) {
        Ok(written) => written,
        Err(err) => {
            warn!("[Flight] could not save mission log ({err})");
            false
        }
    };

    if let Err(err) = drone.close().await {
        warn!("[Flight] close failed ({err})");
    }

    result.map(|report| FlightReport { log_written, ..report })
}

async fn fly(
    drone: &Tello<Connected>,
    frames: &FrameSlot,
    program: &mut MissionProgram,
    config: &MissionConfig,
    log: &mut Vec<TickRecord>,
) -> Result<FlightReport> {
    drone.start_video().await?;
    frames.wait_for_frame(config.stream_settle).await?;

    drone.take_off().await?;
    sleep(config.takeoff_settle).await;

    let height_cm = match drone.query_height().await? {
        Some(height) => height,
        None => {
            warn!("[Flight] no height reported, assuming {} cm", config.default_height_cm);
            config.default_height_cm
        }
    };
    let (lowest, highest) = CALIBRATED_HEIGHT_CM;
    let height_cm = if (lowest..=highest).contains(&height_cm) {
        height_cm
    } else {
        let clamped = height_cm.clamp(lowest, highest);
        warn!("[Flight] height {height_cm} cm outside calibration, using {clamped} cm");
        clamped
    };
    let scale = pixels_per_cm(height_cm as f64);
    info!("[Flight] height: {height_cm} cm | pixels_per_cm: {scale:.2}");

    let search = program.run(drone, frames).await?;

    let approach = match search {
        SearchOutcome::LandingMarkerFound { elapsed } => {
            info!("[Flight] search took {}s", elapsed.as_secs_f64().round());
            sleep(config.handoff_settle).await;

            let servo_config = ServoConfig { pixels_per_cm: scale, ..config.servo.clone() };
            let outcome = VisualServo::new(servo_config, elapsed).run(drone, frames, log).await?;
            info!("[Flight] approach ended {:?} after {:?}", outcome.state, outcome.elapsed);
            Some(outcome)
        }
        SearchOutcome::TimedOut { .. } => {
            warn!("[Flight] landing marker never seen, landing in place");
            drone.land().await?;
            None
        }
    };

    Ok(FlightReport { height_cm, pixels_per_cm: scale, search, approach, log_written: false })
}
