use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{validate_segment, PathError};

pub const MAX_MOTOR_SPEED: u8 = 255;
pub const DEFAULT_MOTOR_SPEED: u8 = 255;
pub const SPEED_STEP: u8 = 25;
pub const TEST_MOTOR_SPEED: u8 = 150;

pub const STOP_SYMBOL: &str = "S";
pub const TEST_SYMBOL: &str = "TEST";
pub const SPEED_UP_DIRECTIVE: &str = "SPEED_UP";
pub const SPEED_DOWN_DIRECTIVE: &str = "SPEED_DOWN";

const GUEST_PREFIX: &str = "guest_";
const GUEST_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        validate_segment(raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operator label must not be empty")]
pub struct EmptyOperatorLabel;

/// Self-declared operator label. Nothing verifies it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperatorId(String);

impl OperatorId {
    pub fn parse(raw: &str) -> Result<Self, EmptyOperatorLabel> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EmptyOperatorLabel);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn guest() -> Self {
        let suffix: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(GUEST_SUFFIX_LEN)
            .collect();
        Self(format!("{GUEST_PREFIX}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OperatorId {
    type Error = EmptyOperatorLabel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OperatorId> for String {
    fn from(value: OperatorId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command symbol '{0}'")]
pub struct UnknownSymbol(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveCommand {
    Forward,
    Backward,
    Left,
    Right,
}

impl MoveCommand {
    pub const ALL: [MoveCommand; 4] = [
        MoveCommand::Forward,
        MoveCommand::Backward,
        MoveCommand::Left,
        MoveCommand::Right,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            MoveCommand::Forward => "F",
            MoveCommand::Backward => "B",
            MoveCommand::Left => "L",
            MoveCommand::Right => "R",
        }
    }
}

impl fmt::Display for MoveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for MoveCommand {
    type Err = UnknownSymbol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f" | "forward" => Ok(MoveCommand::Forward),
            "b" | "back" | "backward" => Ok(MoveCommand::Backward),
            "l" | "left" => Ok(MoveCommand::Left),
            "r" | "right" => Ok(MoveCommand::Right),
            _ => Err(UnknownSymbol(s.to_string())),
        }
    }
}

/// Symbols the device firmware consumes from `rover/command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Move(MoveCommand),
    Stop,
    Test,
}

impl Command {
    pub fn symbol(self) -> &'static str {
        match self {
            Command::Move(movement) => movement.symbol(),
            Command::Stop => STOP_SYMBOL,
            Command::Test => TEST_SYMBOL,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Command {
    type Err = UnknownSymbol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            STOP_SYMBOL => Ok(Command::Stop),
            TEST_SYMBOL => Ok(Command::Test),
            other => other.parse().map(Command::Move),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedDirection {
    Up,
    Down,
}

impl SpeedDirection {
    pub fn directive(self) -> &'static str {
        match self {
            SpeedDirection::Up => SPEED_UP_DIRECTIVE,
            SpeedDirection::Down => SPEED_DOWN_DIRECTIVE,
        }
    }

    /// Applies one step, saturating at `0` and [`MAX_MOTOR_SPEED`].
    pub fn apply(self, current: u8, step: u8) -> u8 {
        match self {
            SpeedDirection::Up => current.saturating_add(step).min(MAX_MOTOR_SPEED),
            SpeedDirection::Down => current.saturating_sub(step),
        }
    }
}

impl FromStr for SpeedDirection {
    type Err = UnknownSymbol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            SPEED_UP_DIRECTIVE => Ok(SpeedDirection::Up),
            SPEED_DOWN_DIRECTIVE => Ok(SpeedDirection::Down),
            other => match other.to_ascii_lowercase().as_str() {
                "up" | "+" => Ok(SpeedDirection::Up),
                "down" | "-" => Ok(SpeedDirection::Down),
                _ => Err(UnknownSymbol(other.to_string())),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Available,
    Busy,
    Offline,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoverState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motor_speed: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arduino_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rover: Option<RoverState>,
}

impl DeviceRecord {
    pub fn available(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: DeviceStatus::Available,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub display_name: String,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.display_name)
    }
}
