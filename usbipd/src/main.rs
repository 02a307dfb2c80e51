use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;
use usbip::config::{Config, LogLevel};
use usbip::request::RequestProcessor;
use usbip::server::ServerCoordinator;

#[cfg(target_os = "macos")]
use usbip::discovery::macos::MacosDiscovery;

#[derive(Debug, clap::Parser)]
#[clap(name = "usbipd")]
struct Args {
    /// Path to a JSON config file. Falls back to built-in defaults when
    /// absent.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Listen on TCP port PORT, overriding the config file.
    #[arg(short = 't', long = "tcp-port")]
    port: Option<u16>,
    /// Overrides the config file's log level.
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<LogLevel>,
    /// Print verbose diagnostics, overriding the config file.
    #[arg(short = 'd', long)]
    debug: bool,
    /// Run in the foreground instead of detaching.
    #[arg(short = 'f', long)]
    foreground: bool,
}

fn load_config(args: &Args) -> Config {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path).unwrap_or_else(|e| {
            eprintln!("failed to load config from {}: {e}; using defaults", path.display());
            Config::default()
        }),
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.debug {
        config.debug_mode = true;
    }

    config
}

fn level_name(config: &Config) -> &'static str {
    if config.debug_mode {
        return "debug";
    }

    match config.log_level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
        LogLevel::Error => "error",
        LogLevel::Critical => "error",
    }
}

/// Installs a `stderr` subscriber and, when `logFilePath` is configured, a
/// second non-blocking file sink alongside it. The returned guard must be
/// held for the process lifetime: dropping it stops the background flush
/// thread and silently truncates any log lines still in flight.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = level_name(config);
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let Some(path) = &config.log_file_path else {
        tracing_subscriber::registry().with(stderr_layer).init();
        return None;
    };

    let path = std::path::Path::new(path);
    let (dir, file_name) = (
        path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new(".")),
        path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("usbipd.log")),
    );
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = EnvFilter::new(default_level);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

fn main() {
    let args = Args::parse();
    let config = load_config(&args);

    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }

    let _log_guard = init_tracing(&config);

    #[cfg(not(target_os = "macos"))]
    {
        eprintln!("usbipd only ships for macOS");
        std::process::exit(1);
    }

    #[cfg(target_os = "macos")]
    run(config);
}

#[cfg(target_os = "macos")]
fn run(config: Config) {
    let discovery = Arc::new(MacosDiscovery::new());
    let processor = RequestProcessor::new(
        discovery.clone(),
        config.allowed_devices.clone(),
        config.auto_bind_devices,
    );

    let coordinator = Arc::new(ServerCoordinator::new(
        discovery,
        processor,
        config.port,
        config.max_connections as usize,
        Duration::from_secs(config.connection_timeout as u64),
    ));

    if let Err(e) = coordinator.start() {
        tracing::error!(error = %e, "failed to start usbipd");
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let fired = Arc::new(AtomicBool::new(false));
    let fired_for_handler = fired.clone();

    ctrlc::set_handler(move || {
        if !fired_for_handler.swap(true, Ordering::SeqCst) {
            let _ = shutdown_tx.send(());
        }
    })
    .expect("failed to install signal handler");

    let _ = shutdown_rx.recv();
    tracing::info!("shutdown signal received");

    coordinator.stop();
}
