// src/sheets.rs
//
// One row per package. The spreadsheet SDK sits behind `SheetsApi`;
// this module owns the column schema, the value-to-cell mapping with
// its status colors, batching, and the dead-letter spool for rows that
// outlive every retry.

use crate::config::SheetsConfig;
use crate::types::{ProcessingOutcome, ValidationResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const WRITE_RETRIES: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Fixed, ordered schema. Rows are always exactly this wide.
pub const SHEET_COLUMNS: [&str; 23] = [
    "File ID",
    "File Name",
    "Upload Time",
    "File Size (MiB)",
    "File Type",
    "Extract Status",
    "File Count",
    "Process Time",
    "Validation Score",
    "Start Time",
    "Duration (HH:MM:SS)",
    "Location",
    "Scene Type",
    "Size Status",
    "PCD Scale",
    "Device ID",
    "Transient Decision",
    "WDD",
    "WPO",
    "SAI",
    "Error Message",
    "Warning Message",
    "Notes",
];

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("sheets API error: {0}")]
    Api(String),
    #[error("sheets write timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellColor {
    Green,
    Yellow,
    Red,
    Gray,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetRow {
    pub cells: Vec<String>,
    pub colors: Vec<Option<CellColor>>,
}

#[async_trait]
pub trait SheetsApi: Send + Sync {
    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        sheet_name: &str,
        rows: &[SheetRow],
    ) -> Result<(), SheetsError>;

    async fn ping(&self) -> Result<(), SheetsError>;
}

/// REST gateway implementation; the Google SDK itself stays outside
/// the crate, fronted by a proxy speaking this shape.
pub struct HttpSheetsClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSheetsClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SheetsError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SheetsError::Api(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl SheetsApi for HttpSheetsClient {
    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        sheet_name: &str,
        rows: &[SheetRow],
    ) -> Result<(), SheetsError> {
        let url = self.url(&format!("spreadsheets/{spreadsheet_id}/sheets/{sheet_name}/rows"));
        self.http
            .post(&url)
            .json(&rows)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SheetsError::Api(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), SheetsError> {
        self.http
            .get(self.url("healthz"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SheetsError::Api(e.to_string()))?;
        Ok(())
    }
}

// ============================================================================
// Row construction
// ============================================================================

/// Everything a package's journey produced, gathered by the
/// orchestrator and mapped into one row.
#[derive(Debug, Default, Clone)]
pub struct RowData {
    pub file_id: String,
    pub file_name: String,
    pub upload_time: String,
    pub file_size_mib: Option<f64>,
    pub file_type: Option<String>,
    pub extract_status: Option<String>,
    pub file_count: Option<usize>,
    pub process_time: Option<String>,
    pub validation_score: Option<f64>,
    pub validation_ok: Option<bool>,
    pub start_time: Option<String>,
    pub duration_s: Option<u64>,
    pub duration_status: Option<String>,
    pub location: Option<String>,
    pub scene_type: Option<String>,
    pub size_status: Option<String>,
    pub pcd_scale: Option<String>,
    pub device_id: Option<String>,
    pub transient_decision: Option<String>,
    pub wdd: Option<f64>,
    pub wpo: Option<f64>,
    pub sai: Option<f64>,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
    pub notes: Option<String>,
}

impl RowData {
    pub fn new(file_id: &str, file_name: &str, upload_time: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            file_name: file_name.to_string(),
            upload_time: upload_time.to_string(),
            ..Default::default()
        }
    }

    /// Pulls everything the validators recorded into row fields.
    pub fn apply_validation(&mut self, result: &ValidationResult) {
        self.validation_score = Some(result.score);
        self.validation_ok = Some(result.is_valid);

        if let Some(extracted) = &result.metadata.extracted_metadata {
            self.start_time = extracted.start_time.clone();
            self.duration_s = extracted.duration_seconds;
            self.duration_status = extracted.duration_status.clone();
            if let Some(location) = &extracted.location {
                self.location = Some(format!("{}, {}", location.lat, location.lon));
            }
            if let Some(device) = &extracted.device {
                self.device_id = device.id.clone();
            }
        }
        if let Some(scale) = &result.metadata.pcd_scale {
            self.pcd_scale = Some(format!(
                "{:.1}x{:.1}m ({})",
                scale.width_m, scale.height_m, scale.status
            ));
        }
        if let Some(transient) = &result.metadata.transient_validation {
            self.transient_decision = Some(transient.decision.as_str().to_string());
            self.wdd = Some(transient.metrics.wdd);
            self.wpo = Some(transient.metrics.wpo);
            self.sai = Some(transient.metrics.sai);
        }

        if !result.errors.is_empty() {
            self.error_message = Some(join_issues(
                result.errors.iter().map(|e| e.message.as_str()),
            ));
        }
        if !result.warnings.is_empty() {
            self.warning_message = Some(join_issues(
                result.warnings.iter().map(|w| w.message.as_str()),
            ));
        }
    }

    pub fn apply_processing(&mut self, outcome: &ProcessingOutcome) {
        let note = if outcome.success {
            format!(
                "processed in {:.0}s (generator {:.0}s, cli {:.0}s)",
                outcome.stage_durations.generator_s
                    + outcome.stage_durations.cli_s
                    + outcome.stage_durations.postprocess_s,
                outcome.stage_durations.generator_s,
                outcome.stage_durations.cli_s
            )
        } else if !outcome.missing_outputs.is_empty() {
            format!("processing missing outputs: {:?}", outcome.missing_outputs)
        } else {
            "processing failed".to_string()
        };
        self.notes = Some(match self.notes.take() {
            Some(existing) => format!("{existing}; {note}"),
            None => note,
        });
    }

    pub fn to_row(&self) -> SheetRow {
        let score_status = match self.validation_ok {
            Some(true) => "success",
            Some(false) => "failed",
            None => "",
        };
        let duration_text = self.duration_s.map(format_hms);

        let cells_with_colors: Vec<(String, Option<CellColor>)> = vec![
            (self.file_id.clone(), None),
            (self.file_name.clone(), None),
            (self.upload_time.clone(), None),
            (opt_fmt(self.file_size_mib.map(|v| format!("{v:.1}"))), None),
            (opt_fmt(self.file_type.clone()), None),
            (
                opt_fmt(self.extract_status.clone()),
                self.extract_status.as_deref().and_then(status_color),
            ),
            (opt_fmt(self.file_count.map(|c| c.to_string())), None),
            (opt_fmt(self.process_time.clone()), None),
            (
                opt_fmt(self.validation_score.map(|s| format!("{s:.1}/100"))),
                status_color(score_status),
            ),
            (opt_fmt(self.start_time.clone()), None),
            (
                opt_fmt(duration_text),
                self.duration_status.as_deref().and_then(status_color),
            ),
            (opt_fmt(self.location.clone()), None),
            (opt_fmt(self.scene_type.clone()), None),
            (
                opt_fmt(self.size_status.clone()),
                self.size_status.as_deref().and_then(status_color),
            ),
            (
                opt_fmt(self.pcd_scale.clone()),
                self.pcd_scale.as_deref().and_then(pcd_cell_color),
            ),
            (opt_fmt(self.device_id.clone()), None),
            (
                opt_fmt(self.transient_decision.clone()),
                self.transient_decision.as_deref().and_then(status_color),
            ),
            (opt_fmt(self.wdd.map(|v| format!("{v:.2}"))), None),
            (opt_fmt(self.wpo.map(|v| format!("{v:.2}%"))), None),
            (opt_fmt(self.sai.map(|v| format!("{v:.2}%"))), None),
            (opt_fmt(self.error_message.clone()), None),
            (opt_fmt(self.warning_message.clone()), None),
            (opt_fmt(self.notes.clone()), None),
        ];

        let (cells, colors) = cells_with_colors.into_iter().unzip();
        SheetRow { cells, colors }
    }
}

fn opt_fmt(value: Option<String>) -> String {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => "N/A".to_string(),
    }
}

fn join_issues<'a>(messages: impl Iterator<Item = &'a str>) -> String {
    let joined = messages.collect::<Vec<_>>().join("; ");
    if joined.chars().count() > 500 {
        let mut s: String = joined.chars().take(497).collect();
        s.push_str("...");
        s
    } else {
        joined
    }
}

fn format_hms(total_seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60
    )
}

/// Known statuses map to background colors; anything else reads as
/// unknown gray.
fn status_color(status: &str) -> Option<CellColor> {
    let s = status.to_ascii_lowercase();
    if s.is_empty() {
        None
    } else if s.starts_with("optimal") || s.starts_with("success") || s == "pass" {
        Some(CellColor::Green)
    } else if s.starts_with("warning") || s == "need_review" {
        Some(CellColor::Yellow)
    } else if s.starts_with("error") || s.starts_with("failed") || s == "reject" {
        Some(CellColor::Red)
    } else {
        Some(CellColor::Gray)
    }
}

/// The PCD cell embeds its status in parentheses.
fn pcd_cell_color(cell: &str) -> Option<CellColor> {
    let status = cell.rsplit_once('(')?.1.trim_end_matches(')');
    status_color(status)
}

// ============================================================================
// Writer
// ============================================================================

pub struct SheetsWriter {
    api: Arc<dyn SheetsApi>,
    config: SheetsConfig,
    queue: tokio::sync::Mutex<Vec<SheetRow>>,
    retry_backoff: Duration,
}

impl SheetsWriter {
    pub fn new(api: Arc<dyn SheetsApi>, config: SheetsConfig) -> Self {
        Self {
            api,
            config,
            queue: tokio::sync::Mutex::new(Vec::new()),
            retry_backoff: RETRY_BACKOFF_BASE,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Queues one row; a full batch flushes immediately. Rows append in
    /// enqueue order.
    pub async fn enqueue(&self, row: SheetRow) {
        let ready = {
            let mut queue = self.queue.lock().await;
            queue.push(row);
            queue.len() >= self.config.batch_write_size.max(1)
        };
        if ready {
            self.flush().await;
        }
    }

    pub async fn flush(&self) {
        let rows: Vec<SheetRow> = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect()
        };
        if rows.is_empty() {
            return;
        }
        self.write_with_retry(rows).await;
    }

    async fn write_with_retry(&self, rows: Vec<SheetRow>) {
        for attempt in 0..=WRITE_RETRIES {
            let write = tokio::time::timeout(
                Duration::from_secs(self.config.write_timeout_s),
                self.api
                    .append_rows(&self.config.spreadsheet_id, &self.config.sheet_name, &rows),
            )
            .await;

            match write {
                Ok(Ok(())) => {
                    info!("Appended {} row(s) to {}", rows.len(), self.config.sheet_name);
                    return;
                }
                Ok(Err(e)) => warn!("Sheets append failed (attempt {}): {e}", attempt + 1),
                Err(_) => warn!("Sheets append timed out (attempt {})", attempt + 1),
            }
            if attempt < WRITE_RETRIES {
                tokio::time::sleep(self.retry_backoff * 2u32.saturating_pow(attempt)).await;
            }
        }
        error!(
            "Sheets append exhausted retries; spooling {} row(s) to dead letter",
            rows.len()
        );
        self.spool_dead_letters(&rows);
    }

    /// JSON-lines spool for rows that could not be written; replayed on
    /// the next startup.
    fn spool_dead_letters(&self, rows: &[SheetRow]) {
        use std::io::Write;
        let open = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.dead_letter_file);
        match open {
            Ok(mut file) => {
                for row in rows {
                    if let Ok(line) = serde_json::to_string(row) {
                        let _ = writeln!(file, "{line}");
                    }
                }
            }
            Err(e) => error!(
                "Cannot open dead-letter file {}: {e}",
                self.config.dead_letter_file.display()
            ),
        }
    }

    /// Re-queues spooled rows ahead of new traffic. The file is removed
    /// first; rows that fail again simply spool anew.
    pub async fn replay_dead_letters(&self) {
        let Ok(text) = std::fs::read_to_string(&self.config.dead_letter_file) else {
            return;
        };
        let _ = std::fs::remove_file(&self.config.dead_letter_file);

        let rows: Vec<SheetRow> = text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if rows.is_empty() {
            return;
        }
        info!("Replaying {} dead-letter row(s)", rows.len());
        self.write_with_retry(rows).await;
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Reachability probe for --test-connection.
    pub async fn ping(&self) -> Result<(), SheetsError> {
        self.api.ping().await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeSheets {
        pub rows: Mutex<Vec<SheetRow>>,
        pub failures_remaining: Mutex<u32>,
    }

    impl FakeSheets {
        pub fn new() -> Self {
            Self {
                rows: Mutex::new(Vec::new()),
                failures_remaining: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl SheetsApi for FakeSheets {
        async fn append_rows(
            &self,
            _spreadsheet_id: &str,
            _sheet_name: &str,
            rows: &[SheetRow],
        ) -> Result<(), SheetsError> {
            {
                let mut failures = self.failures_remaining.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SheetsError::Api("injected failure".into()));
                }
            }
            self.rows.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }

        async fn ping(&self) -> Result<(), SheetsError> {
            Ok(())
        }
    }
}
