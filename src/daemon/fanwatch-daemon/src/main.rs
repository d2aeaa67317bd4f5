//! fanwatch - stream filesystem changes to the console
//!
//! Watches one set of paths through the shared change broadcaster and prints
//! one line per change until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fanwatch_daemon::{
    resolve_paths, ConfigManager, Daemon, DaemonConfig, LogFormat, OutputFormat,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// fanwatch - multicast filesystem change watcher
#[derive(Parser)]
#[command(name = "fanwatch")]
#[command(about = "Stream filesystem changes for a set of paths")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch paths and print every change
    Watch(WatchArgs),
    /// Validate configuration
    Validate(ValidateArgs),
    /// Generate default configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct WatchArgs {
    /// Paths to watch (defaults to `watcher.watch_paths` from the config)
    paths: Vec<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Resume numbering after this event id
    #[arg(long)]
    since: Option<u64>,

    /// Coalescing window in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Only report paths matching these globs
    #[arg(long)]
    include: Vec<String>,

    /// Never report paths matching these globs
    #[arg(long)]
    exclude: Vec<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl WatchArgs {
    /// Command-line values win over the configuration file
    fn apply_overrides(&self, config: &mut DaemonConfig) {
        if !self.paths.is_empty() {
            config.watcher.watch_paths = self.paths.clone();
        }
        if let Some(since) = self.since {
            config.watcher.since = Some(since);
        }
        if let Some(latency_ms) = self.latency_ms {
            config.watcher.latency_ms = latency_ms;
        }
        if !self.include.is_empty() {
            config.patterns.include = self.include.clone();
        }
        if !self.exclude.is_empty() {
            config.patterns.exclude = self.exclude.clone();
        }
        if self.debug {
            config.logging.level = "debug".to_string();
        }
        if let Some(port) = self.metrics_port {
            config.metrics.enabled = true;
            config.metrics.port = port;
        }
    }
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file to validate
    #[arg(short, long, default_value = "fanwatch.toml")]
    config: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output file for generated config
    #[arg(short, long, default_value = "fanwatch.toml")]
    output: PathBuf,

    /// Overwrite existing file
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch(args) => watch(args).await,
        Commands::Validate(args) => validate_config(args).await,
        Commands::Config(args) => generate_config(args).await,
    }
}

/// Watch paths until Ctrl+C or SIGTERM
async fn watch(args: WatchArgs) -> Result<()> {
    let mut config_manager = ConfigManager::new();
    if let Some(path) = &args.config {
        config_manager
            .load_from_file(path)
            .await
            .with_context(|| "Failed to load configuration")?;
    }

    let mut config = config_manager.config().clone();
    args.apply_overrides(&mut config);
    ConfigManager::validate(&config)?;
    config_manager.set_config(config)?;
    let config = config_manager.config();

    init_tracing(&config.logging.level, config.logging.format)?;
    info!("Starting fanwatch v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = config_manager.config_path() {
        info!("Using configuration: {}", path.display());
    }

    if config.watcher.watch_paths.is_empty() {
        anyhow::bail!("No paths to watch: pass them as arguments or set watcher.watch_paths");
    }
    let paths = resolve_paths(&config.watcher.watch_paths)?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    let daemon = Daemon::new(
        config,
        config_manager.patterns().clone(),
        paths,
        args.format,
    )?;

    let mut stdout = std::io::stdout();
    let stats = daemon.run(&mut stdout, shutdown_signal()).await?;
    info!(
        "Printed {} of {} events in {}s",
        stats.events_emitted, stats.events_seen, stats.uptime_seconds
    );

    Ok(())
}

/// Validate configuration file
async fn validate_config(args: ValidateArgs) -> Result<()> {
    let mut config_manager = ConfigManager::new();
    config_manager.load_from_file(&args.config).await?;

    ConfigManager::validate(config_manager.config())?;

    println!("✓ Configuration is valid");
    Ok(())
}

/// Generate default configuration file
async fn generate_config(args: ConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "Configuration file already exists: {}",
            args.output.display()
        );
    }

    let config_manager = ConfigManager::new();
    config_manager.save_to_file(&args.output).await?;

    println!("Generated configuration file: {}", args.output.display());
    Ok(())
}

/// Initialize tracing/logging. Events go to stderr so stdout carries only
/// change lines.
fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
        LogFormat::Json => registry.with(layer.json()).try_init(),
    }
    .context("Failed to initialize logging")?;

    Ok(())
}

/// Initialize Prometheus metrics
fn init_metrics(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to start metrics endpoint")?;

    info!("Metrics endpoint started on port {}", port);
    Ok(())
}

/// Handle graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
