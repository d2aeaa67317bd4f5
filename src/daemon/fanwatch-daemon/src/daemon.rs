//! Console watcher
//! Subscribes to one path-set through the registry and streams each change
//! to an output sink until shutdown.

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use fanwatch_core::{ChangeEvent, MonitorOptions, PathSet};
use fanwatch_system::Registry;
use tracing::{debug, info, trace, warn};

use crate::config::{CompiledPatterns, DaemonConfig};
use crate::metrics::{MetricsCollector, MetricsStats};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// How each event is written to the output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `<path> (<id>) changed: <flags>`
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl OutputFormat {
    pub fn render(&self, event: &ChangeEvent) -> Result<String> {
        match self {
            Self::Text => Ok(event.description()),
            Self::Json => serde_json::to_string(event).context("Failed to encode event"),
        }
    }
}

/// Make every path absolute against the current directory and require that
/// it exists
pub fn resolve_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;

    paths
        .iter()
        .map(|path| {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                cwd.join(path)
            };
            anyhow::ensure!(
                absolute.exists(),
                "Path does not exist: {}",
                absolute.display()
            );
            Ok(absolute)
        })
        .collect()
}

pub struct Daemon {
    registry: Registry,
    paths: PathSet,
    options: MonitorOptions,
    patterns: CompiledPatterns,
    format: OutputFormat,
    metrics: Arc<MetricsCollector>,
}

impl Daemon {
    /// Watch `paths` through the process-wide registry
    pub fn new(
        config: &DaemonConfig,
        patterns: CompiledPatterns,
        paths: Vec<PathBuf>,
        format: OutputFormat,
    ) -> Result<Self> {
        Self::with_registry(Registry::global().clone(), config, patterns, paths, format)
    }

    pub fn with_registry(
        registry: Registry,
        config: &DaemonConfig,
        patterns: CompiledPatterns,
        paths: Vec<PathBuf>,
        format: OutputFormat,
    ) -> Result<Self> {
        let paths = PathSet::new(paths).context("Invalid watch paths")?;

        Ok(Self {
            registry,
            paths,
            options: config.watcher.monitor_options(),
            patterns,
            format,
            metrics: Arc::new(MetricsCollector::new()),
        })
    }

    pub fn paths(&self) -> &PathSet {
        &self.paths
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// Stream events to `out` until `shutdown` resolves or the subscription
    /// ends. Dropping the subscription on return releases the watch.
    pub async fn run<W, F>(&self, out: &mut W, shutdown: F) -> Result<MetricsStats>
    where
        W: Write,
        F: Future<Output = ()>,
    {
        let mut subscription = self
            .registry
            .subscribe(&self.paths, &self.options)
            .with_context(|| format!("Failed to monitor {}", self.paths))?;
        info!("Monitoring {} ({})", self.paths, subscription.id());
        self.metrics.update_registry_stats(&self.registry.stats());

        let mut stats_interval = tokio::time::interval(STATS_INTERVAL);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
                event = subscription.recv() => {
                    match event {
                        Some(event) => self.handle_event(out, &event)?,
                        None => {
                            warn!("Event stream for {} ended", self.paths);
                            break;
                        }
                    }
                }
                _ = stats_interval.tick() => {
                    self.metrics.update_registry_stats(&self.registry.stats());
                    debug!("Events per second: {:.2}", self.metrics.events_per_second());
                }
            }
        }

        subscription.cancel();
        out.flush().context("Failed to flush output")?;

        let stats = self.metrics.get_stats();
        info!(
            "Stopped monitoring {}: {} events, {} filtered",
            self.paths, stats.events_seen, stats.events_filtered
        );
        Ok(stats)
    }

    fn handle_event<W: Write>(&self, out: &mut W, event: &ChangeEvent) -> Result<()> {
        self.metrics.record_event(event);

        if !self.patterns.should_watch(&event.path) {
            trace!("Filtered {}", event.path.display());
            self.metrics.record_filtered();
            return Ok(());
        }

        let line = match self.format.render(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Skipping event {}: {:#}", event.sequence_id, e);
                self.metrics.record_error();
                return Ok(());
            }
        };

        writeln!(out, "{line}").context("Failed to write event")?;
        self.metrics.record_emitted();
        Ok(())
    }
}
