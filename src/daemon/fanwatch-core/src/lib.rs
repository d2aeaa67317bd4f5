//! fanwatch Core - value types shared by every fanwatch layer
//!
//! Pure data only: change flags, change events, normalized path-sets and the
//! error taxonomy. Nothing in here touches the filesystem or spawns work.

use std::path::PathBuf;

use thiserror::Error;

pub mod event;
pub mod flags;
pub mod paths;

pub use event::{ChangeEvent, RawNotification};
pub use flags::ChangeFlags;
pub use paths::{EventCursor, MonitorOptions, PathSet};

/// Boxed error from a platform watch backend
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a path list was rejected before any resource was touched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathSetError {
    #[error("no paths given")]
    Empty,
    #[error("path is not absolute: {}", .0.display())]
    NotAbsolute(PathBuf),
}

/// Errors that can occur while setting up a watch
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("invalid path set: {0}")]
    InvalidPathSet(#[from] PathSetError),
    #[error("watch resource could not be created: {0}")]
    ResourceCreation(#[source] BackendError),
    #[error("watch resource could not be started: {0}")]
    ResourceStart(#[source] BackendError),
    #[error("monitoring requires a running tokio runtime")]
    NoRuntime,
}

impl WatchError {
    pub fn creation(err: impl Into<BackendError>) -> Self {
        Self::ResourceCreation(err.into())
    }

    pub fn start(err: impl Into<BackendError>) -> Self {
        Self::ResourceStart(err.into())
    }
}
