use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::errors::Result;

/// One control loop tick. Fields are empty when the tick had no marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickRecord {
    /// Seconds spent searching for the landing marker before the approach.
    pub search_time: f64,
    /// Seconds since the approach began.
    pub timestamp: f64,
    pub error_x: Option<f64>,
    pub error_y: Option<f64>,
    pub pid_error_x: Option<f64>,
    pub pid_error_y: Option<f64>,
    pub marker_center_x: Option<f64>,
    pub marker_center_y: Option<f64>,
    pub frame_center_x: Option<f64>,
    pub frame_center_y: Option<f64>,
}

/// Writes the records as CSV with a header row. Nothing is written when
/// there are no records.
pub fn write_mission_log(path: impl AsRef<Path>, records: &[TickRecord]) -> Result<bool> {
    let path = path.as_ref();
    if records.is_empty() {
        warn!("[Log] no mission data to save");
        return Ok(false);
    }

    info!("[Log] saving {} records to {}", records.len(), path.display());
    let mut wtr = csv::Writer::from_path(path)?;
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp: f64, error_x: Option<f64>) -> TickRecord {
        TickRecord {
            search_time: 42.0,
            timestamp,
            error_x,
            error_y: error_x,
            pid_error_x: None,
            pid_error_y: None,
            marker_center_x: Some(470.0),
            marker_center_y: Some(350.0),
            frame_center_x: Some(480.0),
            frame_center_y: Some(360.0),
        }
    }

    #[test]
    fn writes_header_and_rows() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("tello-lander-log-{}.csv", std::process::id()));
        let written = write_mission_log(&path, &[record(0.0, Some(1.5)), record(2.05, None)])?;
        assert!(written);

        let text = std::fs::read_to_string(&path)?;
        std::fs::remove_file(&path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "search_time,timestamp,error_x,error_y,pid_error_x,pid_error_y,\
             marker_center_x,marker_center_y,frame_center_x,frame_center_y"
        );
        assert_eq!(lines[1], "42.0,0.0,1.5,1.5,,,470.0,350.0,480.0,360.0");
        assert_eq!(lines[2], "42.0,2.05,,,,,470.0,350.0,480.0,360.0");
        Ok(())
    }

    #[test]
    fn empty_log_writes_nothing() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("tello-lander-empty-{}.csv", std::process::id()));
        assert!(!write_mission_log(&path, &[])?);
        assert!(!path.exists());
        Ok(())
    }
}
