// src/orchestrator.rs
//
// Long-running supervisor gluing monitor, downloader, inspector,
// validation, processing and recording together. Each package walks the
// stage machine NEW -> DOWNLOADING -> EXTRACTING -> VALIDATING ->
// PROCESSING -> RECORDING -> DONE, and any stage can divert to
// FAILED(stage). Terminal states always produce a sheet row and a
// tracker mark; one bad package can never take the loop down.

use crate::archive::ArchiveInspector;
use crate::config::Config;
use crate::downloader::Downloader;
use crate::drive::DriveClient;
use crate::monitor::DriveMonitor;
use crate::notify::Notifier;
use crate::processing::{select_scene, ProcessingDriver};
use crate::sheets::{RowData, SheetsWriter};
use crate::tracker::{TrackRecord, Tracker};
use crate::types::{PackageDescriptor, ValidationLevel, ValidationResult};
use crate::validation::ValidationManager;
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long shutdown waits for in-flight packages before aborting them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

pub struct Orchestrator {
    config: Arc<Config>,
    client: Arc<dyn DriveClient>,
    tracker: Arc<Tracker>,
    monitor: Arc<DriveMonitor>,
    downloader: Arc<Downloader>,
    inspector: Arc<ArchiveInspector>,
    manager: Arc<ValidationManager>,
    driver: Arc<ProcessingDriver>,
    sheets: Arc<SheetsWriter>,
    notifier: Arc<dyn Notifier>,
    slots: Arc<Semaphore>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn DriveClient>,
        tracker: Arc<Tracker>,
        inspector: Arc<ArchiveInspector>,
        manager: Arc<ValidationManager>,
        driver: Arc<ProcessingDriver>,
        sheets: Arc<SheetsWriter>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let monitor = Arc::new(DriveMonitor::new(
            client.clone(),
            tracker.clone(),
            config.drive.clone(),
        ));
        let downloader = Arc::new(Downloader::new(client.clone(), config.download.clone()));
        let slots = Arc::new(Semaphore::new(config.drive.max_concurrent_downloads));
        Arc::new(Self {
            config,
            client,
            tracker,
            monitor,
            downloader,
            inspector,
            manager,
            driver,
            sheets,
            notifier,
            slots,
        })
    }

    /// Verifies both external surfaces are reachable.
    pub async fn test_connection(&self) -> bool {
        let drive_ok = match self.client.ping().await {
            Ok(()) => true,
            Err(e) => {
                error!("Drive unreachable: {e}");
                false
            }
        };
        let sheets_ok = match self.sheets.ping().await {
            Ok(()) => true,
            Err(e) => {
                error!("Sheets unreachable: {e}");
                false
            }
        };
        info!(
            "Connection test: drive={} sheets={}",
            if drive_ok { "ok" } else { "FAIL" },
            if sheets_ok { "ok" } else { "FAIL" }
        );
        drive_ok && sheets_ok
    }

    /// Supervisor loop: poll, fan packages out to workers, repeat until
    /// the shutdown signal flips. In-flight work drains with a bound.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.sheets.replay_dead_letters().await;
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            for descriptor in self.monitor.poll_new().await {
                let this = self.clone();
                workers.spawn(async move {
                    this.process_package(descriptor).await;
                });
            }
            // Reap whatever finished while we were polling.
            while workers.try_join_next().is_some() {}
            self.sheets.flush().await;

            let wait =
                Duration::from_secs(self.config.drive.check_interval_s) + self.monitor.backoff_delay();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Shutdown requested: draining {} in-flight package(s)", workers.len());
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Drain timeout hit; aborting remaining workers");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        self.sheets.flush().await;

        let stats = self.tracker.statistics();
        info!("Orchestrator stopped; tracker totals by status: {stats:?}");
        Ok(())
    }

    /// One poll cycle, fully drained. Used by --once and the tests.
    pub async fn run_once(self: &Arc<Self>) -> usize {
        self.sheets.replay_dead_letters().await;
        let fresh = self.monitor.poll_new().await;
        let count = fresh.len();

        let mut workers: JoinSet<()> = JoinSet::new();
        for descriptor in fresh {
            let this = self.clone();
            workers.spawn(async move {
                this.process_package(descriptor).await;
            });
        }
        while workers.join_next().await.is_some() {}
        self.sheets.flush().await;
        count
    }

    /// Local-archive mode: everything after the download stage, driven
    /// from a file on disk.
    pub async fn process_local_file(self: &Arc<Self>, path: PathBuf) -> Result<bool> {
        let meta = std::fs::metadata(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local-file".to_string());
        let descriptor = PackageDescriptor {
            remote_id: format!("local:{name}"),
            name,
            size_bytes: meta.len(),
            remote_mtime: Utc::now().to_rfc3339(),
            mime: "application/octet-stream".to_string(),
        };

        let status = self.run_pipeline(&descriptor, Some(path)).await;
        self.sheets.flush().await;
        Ok(status == "success")
    }

    async fn process_package(self: &Arc<Self>, descriptor: PackageDescriptor) {
        info!("▶ {} entering pipeline", descriptor.name);
        let status = self.run_pipeline(&descriptor, None).await;
        info!("◀ {} left pipeline with status {status}", descriptor.name);
    }

    /// Runs the stage machine and performs the terminal bookkeeping.
    /// `local_archive` skips the download stage.
    async fn run_pipeline(
        self: &Arc<Self>,
        descriptor: &PackageDescriptor,
        local_archive: Option<PathBuf>,
    ) -> &'static str {
        let mut row = RowData::new(
            &descriptor.remote_id,
            &descriptor.name,
            &descriptor.remote_mtime,
        );
        row.file_size_mib = Some(descriptor.size_bytes as f64 / (1024.0 * 1024.0));

        let mut scratch: Option<PathBuf> = None;
        let mut archive_file: Option<PathBuf> = None;
        let is_local = local_archive.is_some();

        let verdict = self
            .run_stages(descriptor, local_archive, &mut row, &mut scratch, &mut archive_file)
            .await;

        let status = match &verdict {
            Ok(()) => "success",
            Err((stage, reason)) => {
                self.notifier
                    .notify_failure(&descriptor.name, stage, reason);
                if row.error_message.is_none() {
                    row.error_message = Some(format!("{stage}: {reason}"));
                }
                row.notes = Some(match row.notes.take() {
                    Some(n) => format!("{n}; failed at {stage}"),
                    None => format!("failed at {stage}"),
                });
                "failed"
            }
        };

        // RECORDING: terminal states always emit a row and a mark.
        row.process_time = Some(Utc::now().to_rfc3339());
        self.sheets.enqueue(row.to_row()).await;
        if let Err(e) = self.tracker.mark(TrackRecord {
            file_id: descriptor.remote_id.clone(),
            file_name: descriptor.name.clone(),
            status: status.to_string(),
            processed_at: Utc::now(),
            notes: row.notes.clone(),
        }) {
            error!("Tracker mark failed for {}: {e:#}", descriptor.remote_id);
        }

        // Scratch ownership ends here, in the worker that created it.
        if let Some(dir) = scratch {
            let _ = std::fs::remove_dir_all(&dir);
        }
        if !self.config.processing.keep_original_data && !is_local {
            if let Some(file) = archive_file {
                let _ = std::fs::remove_file(&file);
            }
        }
        status
    }

    async fn run_stages(
        self: &Arc<Self>,
        descriptor: &PackageDescriptor,
        local_archive: Option<PathBuf>,
        row: &mut RowData,
        scratch: &mut Option<PathBuf>,
        archive_file: &mut Option<PathBuf>,
    ) -> Result<(), (&'static str, String)> {
        // DOWNLOADING. The slot is held only while bytes move; it must
        // be free again before this worker blocks on subprocess waits.
        let archive_path = match local_archive {
            Some(path) => path,
            None => {
                let _permit = self.slots.clone().acquire_owned().await.ok();
                self.downloader
                    .download(descriptor)
                    .await
                    .map_err(|e| ("DOWNLOADING", e.to_string()))?
            }
        };
        *archive_file = Some(archive_path.clone());

        // EXTRACTING (blocking: decompression is CPU + disk)
        let inspector = self.inspector.clone();
        let for_inspect = archive_path.clone();
        let inspection = tokio::task::spawn_blocking(move || inspector.inspect(&for_inspect))
            .await
            .map_err(|e| ("EXTRACTING", format!("extraction task panicked: {e}")))?;
        let inspection = match inspection {
            Ok(i) => i,
            Err(e) => {
                row.extract_status = Some(format!("failed: {e}"));
                return Err(("EXTRACTING", e.to_string()));
            }
        };
        row.file_type = Some(inspection.package.format.to_string());
        row.extract_status = Some("success".to_string());
        row.file_count = Some(inspection.package.file_count());
        row.size_status = Some(inspection.size_status.to_string());
        if let Some(w) = &inspection.size_warning {
            row.notes = Some(w.clone());
        }
        *scratch = Some(inspection.package.root_path.clone());
        let root = inspection.package.root_path.clone();

        // VALIDATING (blocking: file scans and model inference)
        let manager = self.manager.clone();
        let for_validate = root.clone();
        let validation = tokio::time::timeout(
            Duration::from_secs(self.config.validation_timeout_s),
            tokio::task::spawn_blocking(move || {
                manager.validate(&for_validate, ValidationLevel::Standard, Some("metacam"))
            }),
        )
        .await;
        let validation: ValidationResult = match validation {
            Err(_) => return Err(("VALIDATING", "validation timed out".to_string())),
            Ok(Err(e)) => return Err(("VALIDATING", format!("validation task panicked: {e}"))),
            Ok(Ok(result)) => result,
        };
        row.apply_validation(&validation);

        if !validation.is_valid {
            // A validation failure is a normal terminal outcome, not an
            // orchestrator error; the row carries the details.
            return Err(("VALIDATING", validation.summary.clone()));
        }

        // PROCESSING
        if self.config.processing.auto_start {
            let scene = select_scene(
                &validation,
                self.config.processing.indoor_scale_threshold_m,
            );
            row.scene_type = Some(scene.describe().to_string());
            let outcome = self
                .driver
                .process(&root, &descriptor.stem(), scene)
                .await;
            row.apply_processing(&outcome);
            if !outcome.success {
                let reason = if outcome.missing_outputs.is_empty() {
                    "processing failed".to_string()
                } else {
                    format!("missing outputs: {:?}", outcome.missing_outputs)
                };
                return Err(("PROCESSING", reason));
            }
        }

        Ok(())
    }
}
