mod errors;
mod options;
mod command;
mod tello;
mod marker;
mod video;
mod pid;
mod servo;
mod mission;
mod mission_log;
mod calibration;
mod flight;

#[cfg(test)]
mod testing;

pub use errors::{TelloError, Result};
pub use options::{TelloOptions, LinkTiming};
pub use command::{TelloCommand, Direction, Rotation, parse_height_reply};
pub use tello::{Tello, Connected, Disconnected, LinkState, CommandLink};
pub use marker::{MarkerDetection, Point};
pub use video::{
    Frame, FrameDecoder, MarkerDetector, Observation, FrameFeed, FramePublisher, FrameSlot,
    VideoPipeline, make_frame_slot, VIDEO_WIDTH, VIDEO_HEIGHT,
};
pub use pid::{Pid, PidGains};
pub use servo::{ServoConfig, ServoState, ServoOutcome, StabilizationDwell, VisualServo, centralized};
pub use mission::{Action, Step, MissionEntry, MissionProgram, SearchOutcome};
pub use mission_log::{TickRecord, write_mission_log};
pub use calibration::pixels_per_cm;
pub use flight::{MissionConfig, FlightReport, fly_mission};
