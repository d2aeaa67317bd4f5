//! Configuration loading and validation
//! Follows SRP: Only handles configuration loading and validation

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fanwatch_core::{EventCursor, MonitorOptions};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Upper bound for the coalescing window
const MAX_LATENCY_MS: u64 = 60_000;

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Main fanwatch configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub watcher: WatcherConfig,
    pub logging: LoggingConfig,
    pub patterns: PatternConfig,
    pub metrics: MetricsConfig,
}

/// What to watch and how the watch is created
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Paths watched when none are given on the command line
    pub watch_paths: Vec<PathBuf>,
    /// Coalescing window in milliseconds (0 = deliver immediately)
    pub latency_ms: u64,
    /// Resume numbering after this event id
    pub since: Option<u64>,
}

impl WatcherConfig {
    pub fn monitor_options(&self) -> MonitorOptions {
        let cursor = match self.since {
            Some(id) => EventCursor::after_event(id),
            None => EventCursor::Now,
        };
        MonitorOptions::default()
            .since(cursor)
            .with_latency(Duration::from_millis(self.latency_ms))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    pub format: LogFormat,
}

/// File pattern configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Patterns to include (glob format)
    pub include: Vec<String>,
    /// Patterns to exclude (glob format)
    pub exclude: Vec<String>,
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*".to_string()],
            exclude: vec![
                "**/.git/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
            ],
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9091,
        }
    }
}

/// Compiled pattern matcher
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    include: GlobSet,
    exclude: GlobSet,
}

impl CompiledPatterns {
    pub fn new(config: &PatternConfig) -> Result<Self> {
        Ok(Self {
            include: build_set(&config.include, "include")?,
            exclude: build_set(&config.exclude, "exclude")?,
        })
    }

    /// Check if a changed path should be reported based on patterns.
    /// An empty include list admits everything.
    pub fn should_watch(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();

        if !self.include.is_empty() && !self.include.is_match(&*path_str) {
            return false;
        }

        !self.exclude.is_match(&*path_str)
    }
}

fn build_set(patterns: &[String], kind: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("Invalid {kind} pattern: {pattern}"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Owns the active configuration and its compiled patterns
pub struct ConfigManager {
    config: DaemonConfig,
    patterns: CompiledPatterns,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        let config = DaemonConfig::default();
        let patterns =
            CompiledPatterns::new(&config.patterns).expect("Default patterns should be valid");

        Self {
            config,
            patterns,
            config_path: None,
        }
    }

    /// Load configuration from file
    pub async fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config_str = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let new_config: DaemonConfig = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        self.set_config(new_config)?;
        self.config_path = Some(path.to_path_buf());

        info!("Loaded configuration from: {}", path.display());
        Ok(())
    }

    /// Save current configuration to file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(&self.config)?;

        tokio::fs::write(path.as_ref(), config_str)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        info!("Saved configuration to: {}", path.as_ref().display());
        Ok(())
    }

    /// Replace the configuration, recompiling patterns. The previous
    /// configuration is kept if the new patterns do not compile.
    pub fn set_config(&mut self, config: DaemonConfig) -> Result<()> {
        self.patterns = CompiledPatterns::new(&config.patterns)?;
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn patterns(&self) -> &CompiledPatterns {
        &self.patterns
    }

    /// File the configuration was loaded from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Validate configuration
    pub fn validate(config: &DaemonConfig) -> Result<()> {
        if config.watcher.latency_ms > MAX_LATENCY_MS {
            anyhow::bail!(
                "latency_ms must be <= {}, got {}",
                MAX_LATENCY_MS,
                config.watcher.latency_ms
            );
        }

        for path in &config.watcher.watch_paths {
            if path.as_os_str().is_empty() {
                anyhow::bail!("watch_paths must not contain empty paths");
            }
        }

        let level = config.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            anyhow::bail!("Invalid log level: {}", config.logging.level);
        }

        if config.metrics.enabled && config.metrics.port == 0 {
            anyhow::bail!("Invalid metrics port: {}", config.metrics.port);
        }

        CompiledPatterns::new(&config.patterns)?;

        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
