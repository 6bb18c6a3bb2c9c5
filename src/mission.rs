use std::path::Path;

use serde::Deserialize;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::{Direction, Rotation, TelloCommand, MAX_SPEED, MIN_SPEED};
use crate::errors::{Result, TelloError};
use crate::options::secs;
use crate::tello::CommandLink;
use crate::video::FrameSlot;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Rotate { rotation: Rotation, degrees: u16 },
    Translate { direction: Direction, distance_cm: u16 },
}

impl Action {
    pub fn command(&self) -> TelloCommand {
        match *self {
            Action::Rotate { rotation, degrees } => TelloCommand::Turn { rotation, degrees },
            Action::Translate { direction, distance_cm } => TelloCommand::Move { direction, distance: distance_cm },
        }
    }
}

/// An action and the time to let the drone finish it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Step {
    pub action: Action,
    #[serde(rename = "settle_secs", with = "secs")]
    pub settle: Duration,
}

impl Step {
    pub fn rotate(rotation: Rotation, degrees: u16, settle_secs: u64) -> Self {
        Self { action: Action::Rotate { rotation, degrees }, settle: Duration::from_secs(settle_secs) }
    }

    pub fn translate(direction: Direction, distance_cm: u16, settle_secs: u64) -> Self {
        Self {
            action: Action::Translate { direction, distance_cm },
            settle: Duration::from_secs(settle_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MissionEntry {
    pub marker: String,
    pub steps: Vec<Step>,
    #[serde(skip)]
    executed: bool,
}

impl MissionEntry {
    pub fn new(marker: impl Into<String>, steps: Vec<Step>) -> Self {
        Self { marker: marker.into(), steps, executed: false }
    }

    pub fn executed(&self) -> bool {
        self.executed
    }
}

/// How the search phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    LandingMarkerFound { elapsed: Duration },
    TimedOut { elapsed: Duration },
}

/// Marker-triggered flight program.
///
/// Each entry maps a marker value to a sequence of discrete moves that is
/// flown the first time that marker is seen, and never again in the same
/// run. Seeing the landing marker ends the search.
#[derive(Debug, Clone, Deserialize)]
pub struct MissionProgram {
    pub landing_marker: String,
    /// Set before the search starts, cm/s.
    #[serde(default)]
    pub cruise_speed: Option<i32>,
    #[serde(default, with = "optional_secs")]
    pub search_timeout: Option<Duration>,
    #[serde(default = "default_poll_interval", with = "secs")]
    pub poll_interval: Duration,
    pub entries: Vec<MissionEntry>,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

mod optional_secs {
    use serde::{Deserialize, Deserializer};
    use tokio::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl MissionProgram {
    pub fn new(landing_marker: impl Into<String>, entries: Vec<MissionEntry>) -> Result<Self> {
        let program = Self {
            landing_marker: landing_marker.into(),
            cruise_speed: None,
            search_timeout: None,
            poll_interval: default_poll_interval(),
            entries,
        };
        program.validate()?;
        Ok(program)
    }

    /// The square search course: forward from marker 1, a left turn and
    /// forward at each of 2, 3 and 4, landing marker 5.
    pub fn default_course() -> Self {
        use Direction::Forward;
        use Rotation::CounterClockwise as Ccw;

        let step = 200;
        let entries = vec![
            MissionEntry::new("1", vec![Step::translate(Forward, step, 15)]),
            MissionEntry::new("2", vec![Step::rotate(Ccw, 90, 6), Step::translate(Forward, step, 15)]),
            MissionEntry::new("3", vec![Step::rotate(Ccw, 90, 6), Step::translate(Forward, step, 15)]),
            MissionEntry::new(
                "4",
                vec![
                    Step::rotate(Ccw, 90, 6),
                    Step::translate(Forward, 100, 10),
                    Step::rotate(Ccw, 90, 5),
                    Step::translate(Forward, 100, 10),
                ],
            ),
        ];

        Self {
            landing_marker: "5".to_string(),
            cruise_speed: Some(20),
            search_timeout: None,
            poll_interval: default_poll_interval(),
            entries,
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let program: Self = serde_json::from_str(s)?;
        program.validate()?;
        Ok(program)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TelloError::InvalidProgram { msg });

        if let Some(speed) = self.cruise_speed {
            if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
                return invalid(format!("cruise speed {speed} outside {MIN_SPEED}-{MAX_SPEED} cm/s"));
            }
        }
        if self.poll_interval.is_zero() {
            return invalid("poll interval must be positive".to_string());
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.marker == self.landing_marker {
                return invalid(format!("marker {} is the landing marker", entry.marker));
            }
            if self.entries[..i].iter().any(|e| e.marker == entry.marker) {
                return invalid(format!("marker {} listed twice", entry.marker));
            }
        }
        Ok(())
    }

    pub fn entry(&self, marker: &str) -> Option<&MissionEntry> {
        self.entries.iter().find(|e| e.marker == marker)
    }

    /// Flies the program until the landing marker is seen. Each tick looks
    /// at the latest detection once; a matching entry that has not run yet
    /// is flown to completion, settle delays included, before the next tick.
    pub async fn run<L: CommandLink>(&mut self, link: &L, frames: &FrameSlot) -> Result<SearchOutcome> {
        if let Some(speed) = self.cruise_speed {
            link.send(&TelloCommand::speed(speed)?).await?;
        }

        let start = Instant::now();
        let deadline = self.search_timeout.map(|t| start + t);
        info!("[Mission] searching for landing marker {}", self.landing_marker);

        loop {
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                warn!("[Mission] landing marker not found within {:?}", self.search_timeout);
                return Ok(SearchOutcome::TimedOut { elapsed: start.elapsed() });
            }

            match frames.latest_marker() {
                Some(marker) if marker.value == self.landing_marker => {
                    let elapsed = start.elapsed();
                    info!("[Mission] landing marker {} found after {elapsed:?}", marker.value);
                    return Ok(SearchOutcome::LandingMarkerFound { elapsed });
                }
                Some(marker) => self.trigger(link, &marker.value).await?,
                None => {
                    if let Some(msg) = frames.failure() {
                        return Err(TelloError::VideoFailed { msg });
                    }
                }
            }

            let next = now + self.poll_interval;
            sleep_until(deadline.map_or(next, |d| d.min(next))).await;
        }
    }

    async fn trigger<L: CommandLink>(&mut self, link: &L, marker: &str) -> Result<()> {
        let Some(entry) = self.entries.iter_mut().find(|e| e.marker == marker) else {
            return Ok(());
        };
        if entry.executed {
            return Ok(());
        }

        info!("[Mission] marker {marker} seen, flying {} steps", entry.steps.len());
        // marked first so a failed step is not retried
        entry.executed = true;
        for step in &entry.steps {
            link.send(&step.action.command()).await?;
            debug!("[Mission] settling for {:?}", step.settle);
            sleep(step.settle).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::{MarkerDetection, Point};
    use crate::testing::RecordingLink;
    use crate::video::{make_frame_slot, Frame, FrameFeed, FramePublisher, Observation};
    use std::sync::Arc;

    fn show(publisher: &FramePublisher, value: &str) {
        let polygon = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        let observation = Observation::new(Frame::new(960, 720, vec![]), MarkerDetection::new(value, polygon));
        publisher.send_replace(FrameFeed::Live(Arc::new(observation)));
    }

    #[tokio::test(start_paused = true)]
    async fn marker_triggers_its_steps_once() {
        let (publisher, frames) = make_frame_slot();
        show(&publisher, "1");

        tokio::spawn(async move {
            // marker 1 stays in view well past its 15 s settle
            sleep(Duration::from_secs(40)).await;
            show(&publisher, "5");
            sleep(Duration::from_secs(60)).await;
        });

        let link = RecordingLink::default();
        let mut program = MissionProgram::default_course();
        let outcome = program.run(&link, &frames).await.unwrap();

        assert!(matches!(outcome, SearchOutcome::LandingMarkerFound { .. }));
        assert_eq!(
            link.commands(),
            vec![TelloCommand::SetSpeed(20), TelloCommand::Move { direction: Direction::Forward, distance: 200 }]
        );
        assert!(program.entry("1").unwrap().executed());
        assert!(!program.entry("2").unwrap().executed());
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_flown_in_order_with_settle() {
        let (publisher, frames) = make_frame_slot();
        show(&publisher, "4");

        let start = Instant::now();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            show(&publisher, "5");
            sleep(Duration::from_secs(60)).await;
        });

        let link = RecordingLink::default();
        let mut program = MissionProgram::default_course();
        let outcome = program.run(&link, &frames).await.unwrap();

        // the tick is blocked for all four settle delays
        let SearchOutcome::LandingMarkerFound { .. } = outcome else { panic!("{outcome:?}") };
        assert!(start.elapsed() >= Duration::from_secs(6 + 10 + 5 + 10));
        let sent = link.commands();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[1].to_string(), "ccw 90");
        assert_eq!(sent[2].to_string(), "forward 100");
        assert_eq!(sent[3].to_string(), "ccw 90");
        assert_eq!(sent[4].to_string(), "forward 100");
    }

    #[tokio::test(start_paused = true)]
    async fn search_can_time_out() {
        let (_publisher, frames) = make_frame_slot();
        let link = RecordingLink::default();
        let mut program = MissionProgram::new("5", vec![]).unwrap();
        program.search_timeout = Some(Duration::from_secs(30));

        let outcome = program.run(&link, &frames).await.unwrap();
        let SearchOutcome::TimedOut { elapsed } = outcome else { panic!("{outcome:?}") };
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_millis(30_010));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn loads_program_from_json() {
        let program = MissionProgram::from_json(
            r#"{
                "landing_marker": "L",
                "cruise_speed": 30,
                "search_timeout": 120,
                "entries": [
                    { "marker": "A", "steps": [
                        { "action": { "kind": "rotate", "rotation": "clockwise", "degrees": 45 }, "settle_secs": 4 },
                        { "action": { "kind": "translate", "direction": "left", "distance_cm": 50 }, "settle_secs": 7.5 }
                    ] }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(program.cruise_speed, Some(30));
        assert_eq!(program.search_timeout, Some(Duration::from_secs(120)));
        assert_eq!(program.poll_interval, Duration::from_millis(50));
        let steps = &program.entry("A").unwrap().steps;
        assert_eq!(steps[0].action.command().to_string(), "cw 45");
        assert_eq!(steps[1].action.command().to_string(), "left 50");
        assert_eq!(steps[1].settle, Duration::from_millis(7_500));
    }

    #[test]
    fn rejects_inconsistent_programs() {
        let dup = vec![MissionEntry::new("1", vec![]), MissionEntry::new("1", vec![])];
        assert!(matches!(MissionProgram::new("5", dup), Err(TelloError::InvalidProgram { .. })));

        let landing = vec![MissionEntry::new("5", vec![])];
        assert!(matches!(MissionProgram::new("5", landing), Err(TelloError::InvalidProgram { .. })));

        let slow = r#"{ "landing_marker": "5", "cruise_speed": 5, "entries": [] }"#;
        assert!(matches!(MissionProgram::from_json(slow), Err(TelloError::InvalidProgram { .. })));
    }
}
