// src/config.rs
//
// Environment-driven configuration. Every knob has a default so the
// process can start from a bare environment; `validate()` fails fast on
// the combinations that cannot work.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{name} is required when {feature} is enabled")]
    MissingRequired {
        name: &'static str,
        feature: &'static str,
    },
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    env_str(name, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct DriveConfig {
    pub folder_id: String,
    pub service_account_file: PathBuf,
    /// Base URL of the drive gateway the HTTP client talks to.
    pub api_base_url: String,
    /// Poll interval in seconds.
    pub check_interval_s: u64,
    pub max_concurrent_downloads: usize,
    pub allowed_extensions: Vec<String>,
    pub max_file_size_mb: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadConfig {
    pub download_path: PathBuf,
    pub chunk_size_mb: u64,
    pub timeout_s: u64,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveConfig {
    pub temp_dir: PathBuf,
    pub default_passwords: Vec<String>,
    pub max_file_size_mb: u64,
}

/// Scoring weights for the validator framework. Reconstructable defaults;
/// every weight is overridable from the environment.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScoringConfig {
    pub missing_required: f64,
    pub size_breach: f64,
    pub parse_failure: f64,
    pub optional_missing: f64,
    pub warning: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionConfig {
    pub model_name: String,
    pub confidence_threshold: f32,
    /// "cpu", "cuda", or a GPU index.
    pub device: String,
    pub batch_size_detection: usize,
    pub batch_size_segmentation: usize,
    pub target_detection_frames: usize,
    pub target_segmentation_frames: usize,
    pub enable_early_termination: bool,
    pub model_load_timeout_s: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingConfig {
    pub exe_path: PathBuf,
    pub generator_timeout_s: u64,
    pub cli_timeout_s: u64,
    pub output_path: PathBuf,
    pub processed_path: PathBuf,
    pub auto_start: bool,
    pub retry_attempts: u32,
    pub keep_original_data: bool,
    /// `-mode` argument for the CLI binary: 0=fast, 1=precision.
    pub cli_mode: String,
    /// `-color` argument for the CLI binary: 0=no, 1=yes.
    pub cli_color: String,
    pub indoor_scale_threshold_m: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    /// Base URL of the sheets gateway the HTTP client talks to.
    pub api_base_url: String,
    pub sheet_name: String,
    pub batch_write_size: usize,
    pub write_timeout_s: u64,
    pub dead_letter_file: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub drive: DriveConfig,
    pub download: DownloadConfig,
    pub archive: ArchiveConfig,
    pub scoring: ScoringConfig,
    pub detection: DetectionConfig,
    pub processing: ProcessingConfig,
    pub sheets: SheetsConfig,
    pub smtp: SmtpConfig,
    pub tracker_file: PathBuf,
    pub tracker_retain_days: i64,
    pub validation_timeout_s: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            drive: DriveConfig {
                folder_id: env_str("DRIVE_FOLDER_ID", ""),
                service_account_file: env_str("SERVICE_ACCOUNT_FILE", "service-account.json")
                    .into(),
                api_base_url: env_str("DRIVE_API_BASE_URL", "http://127.0.0.1:8787/drive"),
                check_interval_s: env_u64("CHECK_INTERVAL", 30),
                max_concurrent_downloads: env_u64("MAX_CONCURRENT_DOWNLOADS", 3) as usize,
                allowed_extensions: env_list("ALLOWED_EXTENSIONS", ".zip,.rar,.7z,.tar,.gz"),
                max_file_size_mb: env_u64("MAX_FILE_SIZE_MB", 6144),
            },
            download: DownloadConfig {
                download_path: env_str("DOWNLOAD_PATH", "./downloads").into(),
                chunk_size_mb: env_u64("DOWNLOAD_CHUNK_SIZE_MB", 32),
                timeout_s: env_u64("DOWNLOAD_TIMEOUT", 300),
                retries: env_u64("DOWNLOAD_RETRIES", 3) as u32,
            },
            archive: ArchiveConfig {
                temp_dir: env_str("TEMP_DIR", "./temp").into(),
                default_passwords: env_list("DEFAULT_PASSWORDS", "123456,password"),
                max_file_size_mb: env_u64("MAX_FILE_SIZE_MB", 6144),
            },
            scoring: ScoringConfig {
                missing_required: env_f64("SCORE_MISSING_REQUIRED", 20.0),
                size_breach: env_f64("SCORE_SIZE_BREACH", 10.0),
                parse_failure: env_f64("SCORE_PARSE_FAILURE", 10.0),
                optional_missing: env_f64("SCORE_OPTIONAL_MISSING", 5.0),
                warning: env_f64("SCORE_WARNING", 2.0),
            },
            detection: DetectionConfig {
                model_name: env_str("YOLO_MODEL_NAME", "yolo11n"),
                confidence_threshold: env_f64("YOLO_CONF_THRESHOLD", 0.4) as f32,
                device: env_str("YOLO_DEVICE", "cpu"),
                batch_size_detection: env_u64("DETECTION_BATCH_SIZE", 16) as usize,
                batch_size_segmentation: env_u64("SEGMENTATION_BATCH_SIZE", 8) as usize,
                target_detection_frames: env_u64("DETECTION_TARGET_DETECTION_FRAMES", 200)
                    as usize,
                target_segmentation_frames: env_u64("DETECTION_TARGET_SEGMENTATION_FRAMES", 100)
                    as usize,
                enable_early_termination: env_bool("DETECTION_ENABLE_EARLY_TERMINATION", true),
                model_load_timeout_s: env_u64("MODEL_LOAD_TIMEOUT", 120),
            },
            processing: ProcessingConfig {
                exe_path: env_str("PROCESSORS_EXE_PATH", "./processors/exe_packages").into(),
                generator_timeout_s: env_u64("PROCESSING_TIMEOUT_SECONDS", 600),
                cli_timeout_s: env_u64("METACAM_CLI_TIMEOUT_SECONDS", 3600),
                output_path: env_str("PROCESSING_OUTPUT_PATH", "./processed/output").into(),
                processed_path: env_str("PROCESSED_PATH", "./processed").into(),
                auto_start: env_bool("AUTO_START_PROCESSING", true),
                retry_attempts: env_u64("PROCESSING_RETRY_ATTEMPTS", 2) as u32,
                keep_original_data: env_bool("KEEP_ORIGINAL_DATA", true),
                cli_mode: env_str("METACAM_CLI_MODE", "1"),
                cli_color: env_str("METACAM_CLI_COLOR", "1"),
                indoor_scale_threshold_m: env_f64("INDOOR_SCALE_THRESHOLD_M", 30.0),
            },
            sheets: SheetsConfig {
                spreadsheet_id: env_str("SPREADSHEET_ID", ""),
                api_base_url: env_str("SHEETS_API_BASE_URL", "http://127.0.0.1:8787/sheets"),
                sheet_name: env_str("SHEET_NAME", "Sheet1"),
                batch_write_size: env_u64("BATCH_WRITE_SIZE", 10) as usize,
                write_timeout_s: env_u64("SHEETS_WRITE_TIMEOUT", 30),
                dead_letter_file: env_str("SHEETS_DEAD_LETTER_FILE", "data/dead_letter.jsonl")
                    .into(),
            },
            smtp: SmtpConfig {
                enabled: env_bool("ENABLE_EMAIL_NOTIFICATIONS", false),
                server: env_str("SMTP_SERVER", "smtp.gmail.com"),
                port: env_u64("SMTP_PORT", 587) as u16,
                username: env_str("SMTP_USERNAME", ""),
                password: env_str("SMTP_PASSWORD", ""),
                sender: env_opt("SENDER_EMAIL")
                    .unwrap_or_else(|| env_str("SMTP_USERNAME", "")),
                recipients: env_list("RECIPIENT_EMAILS", ""),
            },
            tracker_file: env_str("TRACKER_FILE", "data/processed_files.json").into(),
            tracker_retain_days: env_u64("KEEP_PROCESSED_DAYS", 30) as i64,
            validation_timeout_s: env_u64("VALIDATION_TIMEOUT_SECONDS", 1800),
            log_level: env_str("LOG_LEVEL", "info"),
            log_file: env_opt("LOG_FILE").map(PathBuf::from),
        }
    }

    /// Startup gate: reject configurations that cannot possibly run.
    /// Directory creation happens here so later stages can assume their
    /// paths exist.
    pub fn validate(&self, require_remote: bool) -> Result<(), ConfigError> {
        if require_remote && self.drive.folder_id.is_empty() {
            return Err(ConfigError::MissingRequired {
                name: "DRIVE_FOLDER_ID",
                feature: "drive monitoring",
            });
        }
        if require_remote && self.sheets.spreadsheet_id.is_empty() {
            return Err(ConfigError::MissingRequired {
                name: "SPREADSHEET_ID",
                feature: "sheet recording",
            });
        }
        if self.drive.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_CONCURRENT_DOWNLOADS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.download.chunk_size_mb == 0 {
            return Err(ConfigError::Invalid {
                name: "DOWNLOAD_CHUNK_SIZE_MB",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.smtp.enabled && self.smtp.recipients.is_empty() {
            return Err(ConfigError::MissingRequired {
                name: "RECIPIENT_EMAILS",
                feature: "email notifications",
            });
        }

        for dir in [
            &self.download.download_path,
            &self.archive.temp_dir,
            &self.processing.output_path,
            &self.processing.processed_path,
        ] {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Some(parent) = self.tracker_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Some(parent) = self.sheets.dead_letter_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Ok(())
    }

    pub fn download_chunk_bytes(&self) -> u64 {
        self.download.chunk_size_mb * 1024 * 1024
    }

    pub fn max_archive_bytes(&self) -> u64 {
        self.archive.max_file_size_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::from_env();
        assert_eq!(config.drive.check_interval_s, 30);
        assert_eq!(config.drive.max_concurrent_downloads, 3);
        assert_eq!(config.download.chunk_size_mb, 32);
        assert_eq!(config.download.retries, 3);
        assert_eq!(config.processing.generator_timeout_s, 600);
        assert_eq!(config.processing.cli_timeout_s, 3600);
        assert!((config.scoring.missing_required - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn remote_config_requires_folder_and_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.download.download_path = dir.path().join("downloads");
        config.archive.temp_dir = dir.path().join("temp");
        config.processing.output_path = dir.path().join("out");
        config.processing.processed_path = dir.path().join("processed");
        config.tracker_file = dir.path().join("data/tracker.json");
        config.sheets.dead_letter_file = dir.path().join("data/dead.jsonl");

        config.drive.folder_id.clear();
        assert!(config.validate(true).is_err());
        assert!(config.validate(false).is_ok());
    }
}
