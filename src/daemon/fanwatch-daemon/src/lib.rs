//! fanwatch Daemon Library
//!
//! Console front end for the fanwatch change broadcaster

pub mod config;
pub mod daemon;
pub mod metrics;

pub use config::{CompiledPatterns, ConfigManager, DaemonConfig, LogFormat};
pub use daemon::{resolve_paths, Daemon, OutputFormat};
pub use metrics::{MetricsCollector, MetricsStats};
