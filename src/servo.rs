use serde::Deserialize;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::TelloCommand;
use crate::errors::{Result, TelloError};
use crate::marker::Point;
use crate::mission_log::TickRecord;
use crate::options::secs;
use crate::pid::{Pid, PidGains};
use crate::tello::CommandLink;
use crate::video::FrameSlot;

/// Largest rate the drone accepts in a remote control command.
const MAX_RC_RATE: f64 = 100.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub pixels_per_cm: f64,
    pub tolerance_cm: f64,
    /// Limit on each remote control rate component.
    pub max_speed: f64,
    pub gains_x: PidGains,
    pub gains_y: PidGains,
    #[serde(with = "secs")]
    pub stabilization: Duration,
    /// How long a correction is flown before rates are zeroed again.
    #[serde(with = "secs")]
    pub actuation: Duration,
    #[serde(with = "secs")]
    pub timeout: Duration,
    #[serde(with = "secs")]
    pub tick_interval: Duration,
    /// Older observations count as no sighting.
    #[serde(with = "secs")]
    pub max_frame_age: Duration,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            pixels_per_cm: 10.02,
            tolerance_cm: 8.0,
            max_speed: 3.0,
            gains_x: PidGains::new(0.2, 0.002, 0.0),
            gains_y: PidGains::new(0.2, 0.003, 0.0),
            stabilization: Duration::from_secs(5),
            actuation: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
            tick_interval: Duration::from_millis(50),
            max_frame_age: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoState {
    Searching,
    Centering,
    Stabilizing,
    Landed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServoOutcome {
    pub state: ServoState,
    pub elapsed: Duration,
    /// Ticks without a marker over the whole approach.
    pub lost_ticks: u32,
}

pub fn centralized(error: f64, tolerance: f64) -> bool {
    error.abs() <= tolerance
}

/// Tracks how long both axes have been centralized without a break.
#[derive(Debug, Clone)]
pub struct StabilizationDwell {
    required: Duration,
    since: Option<Instant>,
}

impl StabilizationDwell {
    pub fn new(required: Duration) -> Self {
        Self { required, since: None }
    }

    /// Returns true once the dwell is complete. Any tick off tolerance
    /// restarts it.
    pub fn update(&mut self, centralized: bool, now: Instant) -> bool {
        if !centralized {
            self.since = None;
            return false;
        }
        let since = *self.since.get_or_insert(now);
        now.saturating_duration_since(since) >= self.required
    }

    #[cfg(test)]
    fn since(&self) -> Option<Instant> {
        self.since
    }
}

/// Visual servoing onto the landing marker.
///
/// The marker's offset from the frame center, converted to centimetres,
/// drives one PID controller per axis. The drone lands once both axes have
/// stayed within tolerance for an unbroken dwell, or when the approach
/// runs out of time, whichever comes first. Built when the approach begins
/// and consumed by [`VisualServo::run`].
#[derive(Debug)]
pub struct VisualServo {
    config: ServoConfig,
    pid_x: Pid,
    pid_y: Pid,
    dwell: StabilizationDwell,
    state: ServoState,
    lost_in_a_row: u32,
    lost_ticks: u32,
    search_time: f64,
}

impl VisualServo {
    /// `search_time` is how long the search phase took, carried into the log.
    pub fn new(config: ServoConfig, search_time: Duration) -> Self {
        Self {
            pid_x: Pid::new(config.gains_x),
            pid_y: Pid::new(config.gains_y),
            dwell: StabilizationDwell::new(config.stabilization),
            state: ServoState::Searching,
            lost_in_a_row: 0,
            lost_ticks: 0,
            search_time: search_time.as_secs_f64().round(),
            config,
        }
    }

    pub fn state(&self) -> ServoState {
        self.state
    }

    /// Runs the approach to a terminal state. Each tick with a marker, and
    /// the timeout tick, is appended to `log` as it happens so a failed
    /// approach still leaves its partial record.
    pub async fn run<L: CommandLink>(
        mut self,
        link: &L,
        frames: &FrameSlot,
        log: &mut Vec<TickRecord>,
    ) -> Result<ServoOutcome> {
        let start = Instant::now();
        let deadline = start + self.config.timeout;
        let mut last_tick = start;

        info!(
            "[Servo] approach started - tolerance {} cm at {:.2} px/cm",
            self.config.tolerance_cm, self.config.pixels_per_cm
        );

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!("[Servo] timeout after {:?}, landing with partial precision", self.config.timeout);
                self.state = ServoState::TimedOut;
                let frame_center = frames.latest().map(|o| o.frame.center());
                log.push(self.record(start, now, frame_center, None, None, None));
                link.send(&TelloCommand::Land).await?;
                return Ok(self.outcome(start));
            }

            let dt = now.duration_since(last_tick).as_secs_f64();
            last_tick = now;

            let sighting = frames
                .latest()
                .filter(|o| o.frame.age(now) <= self.config.max_frame_age)
                .and_then(|o| o.marker.as_ref().map(|m| (o.frame.center(), m.center())));

            let Some((frame_center, marker_center)) = sighting else {
                if let Some(msg) = frames.failure() {
                    warn!("[Servo] video lost ({msg}), landing");
                    link.send(&TelloCommand::Land).await?;
                    return Err(TelloError::VideoFailed { msg });
                }
                self.lost_in_a_row += 1;
                self.lost_ticks += 1;
                debug!("[Servo] marker lost, trying to find... attempt {}", self.lost_in_a_row);
                sleep_until(deadline.min(now + self.config.tick_interval)).await;
                continue;
            };
            self.lost_in_a_row = 0;

            let error = Point::new(
                (frame_center.x - marker_center.x) / self.config.pixels_per_cm,
                (frame_center.y - marker_center.y) / self.config.pixels_per_cm,
            );
            let centralized_x = centralized(error.x, self.config.tolerance_cm);
            let centralized_y = centralized(error.y, self.config.tolerance_cm);
            let both = centralized_x && centralized_y;

            if self.dwell.update(both, now) {
                info!(
                    "[Servo] marker centralized and stable for {:?}, landing",
                    self.config.stabilization
                );
                self.state = ServoState::Landed;
                log.push(self.record(start, now, Some(frame_center), Some(marker_center), Some(error), None));
                link.send(&TelloCommand::Land).await?;
                return Ok(self.outcome(start));
            }

            if both {
                if self.state != ServoState::Stabilizing {
                    debug!("[Servo] marker centralized, stabilizing");
                }
                self.state = ServoState::Stabilizing;
                log.push(self.record(start, now, Some(frame_center), Some(marker_center), Some(error), None));
                sleep_until(deadline.min(now + self.config.tick_interval)).await;
                continue;
            }

            self.state = ServoState::Centering;
            let correction = Point::new(self.pid_x.compute(error.x, dt), self.pid_y.compute(error.y, dt));
            log.push(self.record(
                start,
                now,
                Some(frame_center),
                Some(marker_center),
                Some(error),
                Some(correction),
            ));

            let limit = self.config.max_speed.min(MAX_RC_RATE);
            let rate = |output: f64, centered: bool| if centered { 0 } else { output.clamp(-limit, limit) as i8 };
            let left_right = rate(correction.x, centralized_x);
            let forwards_backwards = rate(correction.y, centralized_y);
            debug!(
                "[Servo] error ({:.2}, {:.2}) cm → rc {left_right} {forwards_backwards}",
                error.x, error.y
            );

            link.send(&TelloCommand::RemoteControl { left_right, forwards_backwards, up_down: 0, yaw: 0 })
                .await?;
            sleep_until(deadline.min(Instant::now() + self.config.actuation)).await;
            link.send(&TelloCommand::hold()).await?;
        }
    }

    fn outcome(&self, start: Instant) -> ServoOutcome {
        ServoOutcome { state: self.state, elapsed: start.elapsed(), lost_ticks: self.lost_ticks }
    }

    fn record(
        &self,
        start: Instant,
        now: Instant,
        frame_center: Option<Point>,
        marker_center: Option<Point>,
        error: Option<Point>,
        correction: Option<Point>,
    ) -> TickRecord {
        let elapsed = now.duration_since(start).as_secs_f64();
        TickRecord {
            search_time: self.search_time,
            timestamp: (elapsed * 1000.0).round() / 1000.0,
            error_x: error.map(|e| e.x),
            error_y: error.map(|e| e.y),
            pid_error_x: correction.map(|c| c.x),
            pid_error_y: correction.map(|c| c.y),
            marker_center_x: marker_center.map(|m| m.x),
            marker_center_y: marker_center.map(|m| m.y),
            frame_center_x: frame_center.map(|f| f.x),
            frame_center_y: frame_center.map(|f| f.y),
        }
    }
}
