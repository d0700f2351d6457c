//! Path layout of the shared device store.
//!
//! Paths are `/`-separated; every segment must be non-empty and free of the
//! characters the hosted store reserves.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::DeviceId;

pub const DEVICES_ROOT: &str = "devices";
const RESERVED_CHARS: &[char] = &['/', '.', '#', '$', '[', ']'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path must not be empty")]
    Empty,
    #[error("path segment must not be empty in '{0}'")]
    EmptySegment(String),
    #[error("path segment '{0}' contains a reserved character or whitespace")]
    InvalidSegment(String),
}

pub(crate) fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment(segment.to_string()));
    }
    if segment
        .chars()
        .any(|c| RESERVED_CHARS.contains(&c) || c.is_whitespace() || c.is_control())
    {
        return Err(PathError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath(String);

impl StorePath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(PathError::EmptySegment(trimmed.to_string()));
            }
            validate_segment(segment)?;
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn child(&self, segment: &str) -> Result<Self, PathError> {
        validate_segment(segment)?;
        Ok(Self(format!("{}/{segment}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn contains(&self, other: &StorePath) -> bool {
        let mut mine = self.segments();
        let mut theirs = other.segments();
        loop {
            match (mine.next(), theirs.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(a), Some(b)) if a != b => return false,
                _ => {}
            }
        }
    }

    /// True when a write to one path can change the value observed at the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.contains(other) || other.contains(self)
    }

    fn joined(&self, tail: &str) -> Self {
        Self(format!("{}/{tail}", self.0))
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StorePath> for String {
    fn from(value: StorePath) -> Self {
        value.0
    }
}

pub fn devices_root() -> StorePath {
    StorePath(DEVICES_ROOT.to_string())
}

/// Every store location that belongs to one device record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    root: StorePath,
}

impl DevicePaths {
    pub fn new(device_id: &DeviceId) -> Self {
        // DeviceId is validated with the same segment rules.
        Self {
            root: devices_root().joined(device_id.as_str()),
        }
    }

    pub fn root(&self) -> &StorePath {
        &self.root
    }

    pub fn name(&self) -> StorePath {
        self.root.joined("name")
    }

    pub fn status(&self) -> StorePath {
        self.root.joined("status")
    }

    pub fn controller(&self) -> StorePath {
        self.root.joined("controller")
    }

    pub fn last_activity(&self) -> StorePath {
        self.root.joined("lastActivity")
    }

    pub fn rover(&self) -> StorePath {
        self.root.joined("rover")
    }

    pub fn command(&self) -> StorePath {
        self.root.joined("rover/command")
    }

    pub fn command_timestamp(&self) -> StorePath {
        self.root.joined("rover/commandTimestamp")
    }

    pub fn motor_speed(&self) -> StorePath {
        self.root.joined("rover/motorSpeed")
    }

    pub fn rover_status(&self) -> StorePath {
        self.root.joined("rover/status")
    }

    pub fn arduino_status(&self) -> StorePath {
        self.root.joined("rover/arduinoStatus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_slashes_and_rejects_reserved_characters() {
        assert_eq!(
            StorePath::parse("/devices/rover_01/").expect("path").as_str(),
            "devices/rover_01"
        );
        assert_eq!(StorePath::parse("  "), Err(PathError::Empty));
        assert!(matches!(
            StorePath::parse("devices//rover"),
            Err(PathError::EmptySegment(_))
        ));
        assert!(matches!(
            StorePath::parse("devices/rover.01"),
            Err(PathError::InvalidSegment(_))
        ));
    }

    #[test]
    fn ancestor_checks_are_segment_aware() {
        let devices = StorePath::parse("devices").expect("path");
        let rover = StorePath::parse("devices/rover_01/rover/command").expect("path");
        let lookalike = StorePath::parse("devices_backup").expect("path");

        assert!(devices.contains(&rover));
        assert!(!rover.contains(&devices));
        assert!(rover.overlaps(&devices));
        assert!(!lookalike.overlaps(&devices));
    }

    #[test]
    fn device_paths_follow_record_layout() {
        let id = DeviceId::parse("rover_01").expect("id");
        let paths = DevicePaths::new(&id);
        assert_eq!(paths.controller().as_str(), "devices/rover_01/controller");
        assert_eq!(
            paths.arduino_status().as_str(),
            "devices/rover_01/rover/arduinoStatus"
        );
        assert!(paths.rover().contains(&paths.motor_speed()));
    }
}
