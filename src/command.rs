use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TelloError};

pub const MIN_SPEED: i32 = 10;
pub const MAX_SPEED: i32 = 100;

/// Direction of a relative move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Back,
    Left,
    Right,
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Forward => "forward",
            Direction::Back => "back",
            Direction::Left => "left",
            Direction::Right => "right",
            Direction::Up => "up",
            Direction::Down => "down",
        };
        f.write_str(s)
    }
}

/// Sense of a relative yaw rotation, seen from above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}

/// A command for the drone, sent as one text datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum TelloCommand {
    /// Enter SDK mode. Also used as the keepalive no-op.
    EnterSdkMode,
    TakeOff,
    Land,
    StopAndHover,
    EmergencyStop,
    StartVideo,
    StopVideo,
    Move { direction: Direction, distance: u16 },
    Turn { rotation: Rotation, degrees: u16 },
    RemoteControl { left_right: i8, forwards_backwards: i8, up_down: i8, yaw: i8 },
    SetSpeed(u8),
    QueryHeight,
}

impl TelloCommand {
    /// Cruise speed command, rejected locally unless 10-100 cm/s.
    pub fn speed(value: i32) -> Result<Self> {
        if (MIN_SPEED..=MAX_SPEED).contains(&value) {
            Ok(TelloCommand::SetSpeed(value as u8))
        } else {
            Err(TelloError::InvalidSpeed { value })
        }
    }

    /// Remote control with all rates at zero, to arrest drift.
    pub fn hold() -> Self {
        TelloCommand::RemoteControl { left_right: 0, forwards_backwards: 0, up_down: 0, yaw: 0 }
    }
}

impl fmt::Display for TelloCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelloCommand::EnterSdkMode => f.write_str("command"),
            TelloCommand::TakeOff => f.write_str("takeoff"),
            TelloCommand::Land => f.write_str("land"),
            TelloCommand::StopAndHover => f.write_str("stop"),
            TelloCommand::EmergencyStop => f.write_str("emergency"),
            TelloCommand::StartVideo => f.write_str("streamon"),
            TelloCommand::StopVideo => f.write_str("streamoff"),
            TelloCommand::Move { direction, distance } => write!(f, "{direction} {distance}"),
            TelloCommand::Turn { rotation: Rotation::Clockwise, degrees } => write!(f, "cw {degrees}"),
            TelloCommand::Turn { rotation: Rotation::CounterClockwise, degrees } => write!(f, "ccw {degrees}"),
            TelloCommand::RemoteControl { left_right, forwards_backwards, up_down, yaw } => {
                write!(f, "rc {left_right} {forwards_backwards} {up_down} {yaw}")
            }
            TelloCommand::SetSpeed(speed) => write!(f, "speed {speed}"),
            TelloCommand::QueryHeight => f.write_str("height?"),
        }
    }
}

/// Parses a `height?` reply, eg "9dm", into centimetres.
pub fn parse_height_reply(reply: &str) -> Result<u32> {
    let digits = reply
        .trim()
        .strip_suffix("dm")
        .ok_or_else(|| TelloError::ParseError { msg: reply.to_string() })?;

    let decimetres: u32 = digits
        .trim()
        .parse()
        .map_err(|_| TelloError::ParseError { msg: reply.to_string() })?;

    Ok(decimetres * 10)
}
