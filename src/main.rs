mod archive;
mod config;
mod detection;
mod downloader;
mod drive;
mod metadata;
mod monitor;
mod notify;
mod orchestrator;
mod pcd;
mod processing;
mod sheets;
mod tracker;
mod types;
mod validation;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::Config;
use detection::{DetectorConfig, ObjectDetector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "metacam-intake",
    about = "Watches a drive folder for MetaCam capture packages, validates them, drives the reconstruction binaries and records results to a tracking sheet"
)]
struct Cli {
    /// Run a single poll cycle and exit.
    #[arg(long)]
    once: bool,

    /// Poll interval in seconds (overrides CHECK_INTERVAL).
    #[arg(long)]
    interval: Option<u64>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<String>,

    /// Verify drive and sheets reachability, then exit 0/1.
    #[arg(long)]
    test_connection: bool,

    /// Process a local archive and exit, skipping the drive monitor.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(interval) = cli.interval {
        config.drive.check_interval_s = interval;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    let _log_guard = init_logging(&config);
    info!("🛰  MetaCam intake starting");

    let local_only = cli.file.is_some();
    config
        .validate(!local_only)
        .context("configuration invalid")?;
    let config = Arc::new(config);

    let orchestrator = build_orchestrator(config.clone())?;

    if cli.test_connection {
        let ok = orchestrator.test_connection().await;
        std::process::exit(if ok { 0 } else { 1 });
    }

    if let Some(file) = cli.file {
        let ok = orchestrator.process_local_file(file).await?;
        std::process::exit(if ok { 0 } else { 1 });
    }

    if cli.once {
        let handled = orchestrator.run_once().await;
        info!("Single pass complete: {handled} package(s) handled");
        return Ok(());
    }

    // Graceful shutdown on ctrl-c: stop intake, drain, then abort.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    orchestrator.run(shutdown_rx).await
}

fn build_orchestrator(config: Arc<Config>) -> Result<Arc<orchestrator::Orchestrator>> {
    let client = Arc::new(
        drive::HttpDriveClient::new(
            config.drive.api_base_url.clone(),
            Duration::from_secs(config.download.timeout_s),
        )
        .map_err(|e| anyhow!("drive client: {e}"))?,
    );
    let sheets_api = Arc::new(
        sheets::HttpSheetsClient::new(
            config.sheets.api_base_url.clone(),
            Duration::from_secs(config.sheets.write_timeout_s),
        )
        .map_err(|e| anyhow!("sheets client: {e}"))?,
    );

    let tracker = Arc::new(
        tracker::Tracker::open(&config.tracker_file, config.tracker_retain_days)
            .context("opening tracker file")?,
    );
    let inspector = Arc::new(archive::ArchiveInspector::new(
        config.archive.temp_dir.clone(),
        config.archive.default_passwords.clone(),
        config.max_archive_bytes(),
    ));

    let detector_config = DetectorConfig::from_config(&config.detection);
    let load_timeout = Duration::from_secs(config.detection.model_load_timeout_s);
    let factory: validation::transient::DetectorFactory = Box::new(move || {
        load_detector_with_timeout(detector_config.clone(), load_timeout)
    });
    let manager = Arc::new(validation::ValidationManager::new(
        validation::MetaCamValidator::new(config.scoring),
        validation::TransientValidator::new(factory),
    ));

    let driver = Arc::new(processing::ProcessingDriver::new(config.processing.clone()));
    let sheets = Arc::new(sheets::SheetsWriter::new(sheets_api, config.sheets.clone()));

    let notifier: Arc<dyn notify::Notifier> = if config.smtp.enabled {
        // The SMTP transport is deployment-provided; until one is wired
        // in, notifications degrade to the log with full context.
        Arc::new(notify::EmailNotifier::new(
            config.smtp.clone(),
            Box::new(|sender, recipients, subject, _body| {
                error!(
                    "SMTP transport not wired; would send {subject:?} from {sender} to {recipients:?}"
                );
                Ok(())
            }),
        ))
    } else {
        Arc::new(notify::LogNotifier)
    };

    Ok(orchestrator::Orchestrator::new(
        config,
        client,
        tracker,
        inspector,
        manager,
        driver,
        sheets,
        notifier,
    ))
}

/// Model loading happens on a throwaway thread so a hung runtime cannot
/// stall the validator past the configured budget.
fn load_detector_with_timeout(
    config: DetectorConfig,
    timeout: Duration,
) -> Result<ObjectDetector> {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(ObjectDetector::load(&config));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "model load exceeded {:.0}s budget",
            timeout.as_secs_f64()
        )),
    }
}

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "metacam_intake={level},processing={level},ort=warn",
            level = config.log_level
        ))
    });

    match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "monitor.log".to_string());
            let _ = std::fs::create_dir_all(dir);
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
