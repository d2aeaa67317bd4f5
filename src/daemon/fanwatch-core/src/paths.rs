//! Watch requests: normalized path-sets, resume cursors and monitor options

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{PathSetError, WatchError};

/// A validated, normalized set of absolute paths.
///
/// Paths are sorted and de-duplicated, so two requests naming the same paths
/// in a different order compare equal and share one watch resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathSet {
    paths: Vec<PathBuf>,
}

impl PathSet {
    pub fn new<I, P>(paths: I) -> Result<Self, WatchError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        if paths.is_empty() {
            return Err(PathSetError::Empty.into());
        }
        if let Some(relative) = paths.iter().find(|path| !path.is_absolute()) {
            return Err(PathSetError::NotAbsolute(relative.clone()).into());
        }

        paths.sort();
        paths.dedup();
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Never true for a constructed set; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Sorted paths joined with `:`
    pub fn key(&self) -> String {
        self.paths
            .iter()
            .map(|path| path.to_string_lossy())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for PathSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Where a new watch starts delivering from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCursor {
    /// Only changes that happen after the watch starts
    #[default]
    Now,
    /// Resume after a previously observed sequence id
    Since(u64),
}

impl EventCursor {
    /// Resume token for a consumer that has processed `sequence_id`
    pub fn after_event(sequence_id: u64) -> Self {
        Self::Since(sequence_id)
    }

    /// Last sequence id considered already seen
    pub fn floor(&self) -> u64 {
        match self {
            Self::Now => 0,
            Self::Since(id) => *id,
        }
    }
}

/// Per-request monitoring options
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonitorOptions {
    pub start_cursor: EventCursor,
    /// How long the platform may coalesce notifications into one batch
    pub latency: Duration,
}

impl MonitorOptions {
    pub fn since(mut self, cursor: EventCursor) -> Self {
        self.start_cursor = cursor;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}
