//! Change events as seen by consumers

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::flags::ChangeFlags;

/// One notification exactly as the platform watch API reported it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub sequence_id: u64,
    pub path: PathBuf,
    pub raw_flags: u32,
}

/// An immutable change record.
///
/// `sequence_id` is monotonic within one watched path-set only; two
/// path-sets may hand out the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence_id: u64,
    pub path: PathBuf,
    pub flags: ChangeFlags,
}

impl ChangeEvent {
    pub fn new(sequence_id: u64, path: impl Into<PathBuf>, flags: ChangeFlags) -> Self {
        Self {
            sequence_id,
            path: path.into(),
            flags,
        }
    }

    /// Last path component, if it is valid UTF-8
    pub fn filename(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    /// Directory that owns the changed item
    pub fn directory(&self) -> Option<&Path> {
        self.path.parent()
    }

    /// `"<path> (<sequence_id>) changed: <facets>"`
    pub fn description(&self) -> String {
        self.to_string()
    }
}

impl From<RawNotification> for ChangeEvent {
    fn from(raw: RawNotification) -> Self {
        Self {
            sequence_id: raw.sequence_id,
            path: raw.path,
            flags: ChangeFlags::from_raw(raw.raw_flags),
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) changed: {}",
            self.path.display(),
            self.sequence_id,
            self.flags
        )
    }
}
