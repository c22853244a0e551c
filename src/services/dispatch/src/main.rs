//! Main binary for the dispatch worker
//!
//! Loads configuration, starts the worker pool draining the dispatch queue
//! and runs until Ctrl+C or SIGTERM, then drains in-flight items and stops.

use dispatch_service::{DispatchConfig, DispatchService, SERVICE_NAME, VERSION};

use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let matches = create_cli().get_matches();
    let config = load_config(&matches)?;

    init_tracing(&config.logging.level, &config.logging.format)?;

    config
        .validate()
        .context("Configuration validation failed")?;

    info!(
        version = VERSION,
        queue = ?config.queue.kind,
        min_workers = config.worker_pool.min_workers,
        max_workers = config.worker_pool.max_workers,
        platforms = config.platforms.len(),
        "Starting {}", SERVICE_NAME
    );

    let service = Arc::new(
        DispatchService::new(config)
            .await
            .context("Failed to initialize dispatch service")?,
    );
    service.start().await.context("Failed to start worker pool")?;

    let cancellation_token = CancellationToken::new();
    let status_task = start_status_task(service.clone(), cancellation_token.clone());

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received, draining workers...");

    cancellation_token.cancel();
    if let Err(e) = status_task.await {
        warn!(error = %e, "Status task ended abnormally");
    }

    if let Err(e) = service.stop().await {
        error!(error = %e, "Dispatch service did not stop cleanly");
        return Err(e.into());
    }

    info!("{} stopped gracefully", SERVICE_NAME);
    Ok(())
}

/// Initialize tracing with the given level filter and output format
fn init_tracing(level: &str, format: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match format {
        "json" => fmt::layer().json().boxed(),
        "pretty" => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .boxed(),
        _ => fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Create CLI argument parser
fn create_cli() -> Command {
    Command::new("dispatch-worker")
        .version(VERSION)
        .about("Multi-channel notification dispatch worker")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["json", "pretty", "compact"])
                .help("Log output format"),
        )
        .arg(
            Arg::new("min-workers")
                .long("min-workers")
                .value_name("NUM")
                .value_parser(clap::value_parser!(usize))
                .help("Minimum number of workers"),
        )
        .arg(
            Arg::new("max-workers")
                .long("max-workers")
                .value_name("NUM")
                .value_parser(clap::value_parser!(usize))
                .help("Maximum number of workers"),
        )
}

/// Load configuration from file and environment, then apply CLI overrides
fn load_config(matches: &ArgMatches) -> anyhow::Result<DispatchConfig> {
    if let Some(config_file) = matches.get_one::<String>("config") {
        std::env::set_var("DISPATCH_CONFIG_FILE", config_file);
    }

    let mut config = DispatchConfig::from_env().context("Failed to load configuration")?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.clone();
    }
    if let Some(min) = matches.get_one::<usize>("min-workers") {
        config.worker_pool.min_workers = *min;
    }
    if let Some(max) = matches.get_one::<usize>("max-workers") {
        config.worker_pool.max_workers = *max;
    }

    Ok(config)
}

/// Periodically log pool and receipt counters
fn start_status_task(
    service: Arc<DispatchService>,
    cancellation_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let health = service.health().await;
                    info!(
                        status = %health.status,
                        queue_size = health.queue_size,
                        dead_letter_size = health.dead_letter_size,
                        workers = health.workers.total_workers,
                        active = health.workers.active_workers,
                        processed = health.workers.processed,
                        errors = health.workers.errors,
                        receipts = health.receipts.processed,
                        "Dispatch status"
                    );
                }
                _ = cancellation_token.cancelled() => break,
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_cli() {
        let matches = create_cli()
            .try_get_matches_from(vec!["dispatch-worker", "--min-workers", "3", "--log-format", "json"])
            .unwrap();
        assert_eq!(matches.get_one::<usize>("min-workers"), Some(&3));
        assert_eq!(matches.get_one::<String>("log-format"), Some(&"json".to_string()));
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        let result = create_cli().try_get_matches_from(vec!["dispatch-worker", "--log-format", "xml"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_with_overrides() {
        let matches = create_cli().get_matches_from(vec![
            "dispatch-worker",
            "--log-level",
            "debug",
            "--min-workers",
            "4",
            "--max-workers",
            "12",
        ]);

        let config = load_config(&matches).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.worker_pool.min_workers, 4);
        assert_eq!(config.worker_pool.max_workers, 12);
        assert!(config.validate().is_ok());
    }
}
