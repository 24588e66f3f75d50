// src/validation/metacam.rs
//
// Structural and content validation of an extracted MetaCam package.
// Checks run in a fixed order, accumulating onto one ledger: directory
// structure, required files with size windows, content parses, point
// cloud scale, recording duration, device identity. The validator
// always returns a result; nothing escapes as a panic or error.

use crate::config::ScoringConfig;
use crate::metadata::{self, DurationStatus};
use crate::pcd;
use crate::types::{
    DeviceIdentity, ExtractedMetadata, ResultMetadata, Severity, ValidationIssue,
    ValidationLevel, ValidationResult,
};
use crate::validation::{IssueLog, Penalty, Validator};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Presence of at least two of these marks a directory as a package
/// root, which tolerates one wrapper folder from the archiver.
const ROOT_INDICATORS: [&str; 4] = ["metadata.yaml", "camera", "data", "info"];

const REQUIRED_DIRECTORIES: [&str; 3] = ["images", "data", "info"];

struct FileRule {
    path: &'static str,
    /// Flexible-naming alternative (`data_0` may carry a `.bag` suffix).
    alt_path: Option<&'static str>,
    min_size: u64,
    max_size: u64,
}

const REQUIRED_FILES: [FileRule; 5] = [
    FileRule {
        path: "colorized-realtime.las",
        alt_path: None,
        min_size: MIB,
        max_size: GIB,
    },
    FileRule {
        path: "metadata.yaml",
        alt_path: None,
        min_size: 100,
        max_size: 10 * KIB,
    },
    FileRule {
        path: "Preview.jpg",
        alt_path: None,
        min_size: KIB,
        max_size: 10 * MIB,
    },
    FileRule {
        path: "Preview.pcd",
        alt_path: None,
        min_size: KIB,
        max_size: 100 * MIB,
    },
    FileRule {
        path: "data/data_0",
        alt_path: Some("data/data_0.bag"),
        min_size: MIB,
        max_size: 2 * GIB,
    },
];

const INFO_FILES: [&str; 3] = ["calibration.json", "device_info.json", "rtk_info.json"];

pub struct MetaCamValidator {
    scoring: ScoringConfig,
}

impl MetaCamValidator {
    pub fn new(scoring: ScoringConfig) -> Self {
        Self { scoring }
    }

    /// The extracted tree may wrap the real package in a single folder.
    pub fn find_actual_root(path: &Path) -> Option<PathBuf> {
        if is_package_root(path) {
            return Some(path.to_path_buf());
        }
        let entries = std::fs::read_dir(path).ok()?;
        for entry in entries.flatten() {
            let candidate = entry.path();
            if candidate.is_dir() && is_package_root(&candidate) {
                debug!("Package root found one level down: {}", candidate.display());
                return Some(candidate);
            }
        }
        None
    }

    fn check_structure(root: &Path, log: &mut IssueLog) {
        for dir in REQUIRED_DIRECTORIES {
            if !root.join(dir).is_dir() {
                log.error(
                    ValidationIssue::new(
                        "MISSING_DIRECTORY",
                        format!("missing required directory: {dir}/"),
                        Severity::Critical,
                    )
                    .with_path(dir),
                    Penalty::MissingRequired,
                );
            }
        }
        if !root.join("camera").is_dir() {
            log.warning_with(
                ValidationIssue::new(
                    "MISSING_CAMERA_DIR",
                    "camera/ directory absent; transient assessment will be skipped",
                    Severity::Warning,
                )
                .with_path("camera"),
                Penalty::OptionalMissing,
            );
        }
    }

    fn check_required_files(root: &Path, log: &mut IssueLog) {
        for rule in &REQUIRED_FILES {
            let primary = root.join(rule.path);
            let resolved = if primary.is_file() {
                Some((primary, rule.path))
            } else {
                rule.alt_path.and_then(|alt| {
                    let p = root.join(alt);
                    p.is_file().then_some((p, alt))
                })
            };

            let (path, rel) = match resolved {
                Some(found) => found,
                None => {
                    log.error(
                        ValidationIssue::new(
                            "MISSING_REQUIRED_FILE",
                            format!("missing required file: {}", rule.path),
                            Severity::Critical,
                        )
                        .with_path(rule.path),
                        Penalty::MissingRequired,
                    );
                    continue;
                }
            };

            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if size < rule.min_size {
                log.error(
                    ValidationIssue::new(
                        "FILE_TOO_SMALL",
                        format!("{rel} is {size} bytes, below the {} byte minimum", rule.min_size),
                        Severity::Critical,
                    )
                    .with_path(rel),
                    Penalty::SizeBreach,
                );
            } else if size > rule.max_size {
                log.error(
                    ValidationIssue::new(
                        "FILE_TOO_LARGE",
                        format!("{rel} is {size} bytes, above the {} byte maximum", rule.max_size),
                        Severity::Critical,
                    )
                    .with_path(rel),
                    Penalty::SizeBreach,
                );
            }
        }

        for name in INFO_FILES {
            let rel = format!("info/{name}");
            if !root.join(&rel).is_file() {
                log.error(
                    ValidationIssue::new(
                        "MISSING_REQUIRED_FILE",
                        format!("missing required file: {rel}"),
                        Severity::Critical,
                    )
                    .with_path(rel),
                    Penalty::MissingRequired,
                );
            }
        }
    }

    fn check_json_files(root: &Path, log: &mut IssueLog) {
        for name in ["calibration.json", "rtk_info.json"] {
            let rel = format!("info/{name}");
            let path = root.join(&rel);
            if !path.is_file() {
                continue; // presence already reported
            }
            let parse = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    serde_json::from_str::<serde_json::Value>(&text).map_err(|e| e.to_string())
                });
            if let Err(e) = parse {
                log.error(
                    ValidationIssue::new(
                        "JSON_PARSE_ERROR",
                        format!("{rel} is not valid JSON: {e}"),
                        Severity::Error,
                    )
                    .with_path(rel),
                    Penalty::ContentParse,
                );
            }
        }
    }

    fn check_recording(root: &Path, log: &mut IssueLog) -> ExtractedMetadata {
        let mut extracted = ExtractedMetadata::default();
        let info = metadata::probe_recording(&root.join("metadata.yaml"));

        if let Some(e) = &info.parse_error {
            log.error(
                ValidationIssue::new("METADATA_PARSE_ERROR", e.clone(), Severity::Error)
                    .with_path("metadata.yaml"),
                Penalty::ContentParse,
            );
        }
        for field in &info.missing_fields {
            log.error(
                ValidationIssue::new(
                    "METADATA_MISSING_FIELD",
                    format!("metadata.yaml missing required field: {field}"),
                    Severity::Error,
                )
                .with_path("metadata.yaml"),
                Penalty::ContentParse,
            );
        }

        extracted.start_time = info.start_time.clone();
        extracted.duration_seconds = info.duration_seconds;
        extracted.location = info.location.clone();

        if let (Some(seconds), Some(status)) = (info.duration_seconds, info.duration_status) {
            extracted.duration_status = Some(status.as_str().to_string());
            let minutes = seconds as f64 / 60.0;
            match status {
                DurationStatus::ErrorTooShort => log.error(
                    ValidationIssue::new(
                        "DURATION_TOO_SHORT",
                        format!("recording is {minutes:.1} min, under the 3 minute floor"),
                        Severity::Critical,
                    ),
                    Penalty::ContentParse,
                ),
                DurationStatus::ErrorTooLong => log.error(
                    ValidationIssue::new(
                        "DURATION_TOO_LONG",
                        format!("recording is {minutes:.1} min, over the 9 minute ceiling"),
                        Severity::Critical,
                    ),
                    Penalty::ContentParse,
                ),
                DurationStatus::WarningShort => log.warning(ValidationIssue::new(
                    "DURATION_SHORT",
                    format!("recording is {minutes:.1} min, below the optimal window"),
                    Severity::Warning,
                )),
                DurationStatus::WarningLong => log.warning(ValidationIssue::new(
                    "DURATION_LONG",
                    format!("recording is {minutes:.1} min, above the optimal window"),
                    Severity::Warning,
                )),
                DurationStatus::Optimal => {
                    info!("Recording duration optimal: {minutes:.1} min");
                }
            }
        }

        extracted
    }

    fn check_device(root: &Path, log: &mut IssueLog) -> Option<DeviceIdentity> {
        let path = root.join("info/device_info.json");
        if !path.is_file() {
            return None; // presence already reported
        }
        match metadata::probe_device(&path) {
            Ok(device) => {
                if device.id.is_none() {
                    log.warning(ValidationIssue::new(
                        "DEVICE_ID_ABSENT",
                        "device_info.json carries neither model nor SN",
                        Severity::Warning,
                    ));
                } else if device.model.is_none() || device.sn.is_none() {
                    log.warning(ValidationIssue::new(
                        "DEVICE_ID_PARTIAL",
                        "device id built from a partial model/SN pair",
                        Severity::Warning,
                    ));
                }
                Some(device)
            }
            Err(e) => {
                log.error(
                    ValidationIssue::new("DEVICE_INFO_PARSE_ERROR", e, Severity::Error)
                        .with_path("info/device_info.json"),
                    Penalty::ContentParse,
                );
                None
            }
        }
    }

    fn check_pcd_scale(root: &Path, log: &mut IssueLog) -> crate::types::PcdScale {
        let scale = pcd::probe(&root.join("Preview.pcd"));
        match scale.status.as_str() {
            "error_too_small" | "error_too_large" => log.error(
                ValidationIssue::new(
                    "PCD_SCALE_OUT_OF_RANGE",
                    format!(
                        "point cloud footprint {:.1}x{:.1} m is {}",
                        scale.width_m, scale.height_m, scale.status
                    ),
                    Severity::Error,
                )
                .with_path("Preview.pcd"),
                Penalty::ContentParse,
            ),
            "warning_small" | "warning_large" | "warning_narrow" => {
                log.warning(
                    ValidationIssue::new(
                        "PCD_SCALE_SUBOPTIMAL",
                        format!(
                            "point cloud footprint {:.1}x{:.1} m is {}",
                            scale.width_m, scale.height_m, scale.status
                        ),
                        Severity::Warning,
                    )
                    .with_path("Preview.pcd"),
                );
            }
            // Probe trouble degrades to a warning, never fails the package.
            "not_found" | "error" => log.warning(ValidationIssue::new(
                "PCD_PROBE_FAILED",
                scale
                    .error
                    .clone()
                    .unwrap_or_else(|| "point cloud probe failed".into()),
                Severity::Warning,
            )),
            _ => {}
        }
        scale
    }
}

impl Validator for MetaCamValidator {
    fn name(&self) -> &'static str {
        "MetaCamValidator"
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["metacam", "metacam_3d", "reconstruction_data"]
    }

    fn validate(&self, root: &Path, level: ValidationLevel) -> ValidationResult {
        info!(
            "Starting MetaCam validation: {} (level {})",
            root.display(),
            level.as_str()
        );

        let actual_root = match Self::find_actual_root(root) {
            Some(r) => r,
            None => {
                return ValidationResult {
                    is_valid: false,
                    score: 0.0,
                    errors: vec![ValidationIssue::new(
                        "NO_METACAM_ROOT",
                        "no directory with the MetaCam layout found",
                        Severity::Critical,
                    )],
                    warnings: Vec::new(),
                    summary: "Validation FAIL - no MetaCam data root found".into(),
                    validator_type: self.name().to_string(),
                    metadata: ResultMetadata::default(),
                };
            }
        };

        let mut log = IssueLog::new(self.scoring);
        Self::check_structure(&actual_root, &mut log);
        Self::check_required_files(&actual_root, &mut log);
        Self::check_json_files(&actual_root, &mut log);
        let mut extracted = Self::check_recording(&actual_root, &mut log);
        extracted.device = Self::check_device(&actual_root, &mut log);
        let pcd_scale = Self::check_pcd_scale(&actual_root, &mut log);

        let total_bytes: u64 = WalkDir::new(&actual_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();

        let mut meta = ResultMetadata {
            extracted_metadata: Some(extracted),
            pcd_scale: Some(pcd_scale),
            ..Default::default()
        };
        meta.insert_extra(
            "actual_root",
            serde_json::json!(actual_root.display().to_string()),
        );
        meta.insert_extra("size", serde_json::json!({ "total_bytes": total_bytes }));

        let result = log.finish(level, self.name(), meta);
        info!("MetaCam validation completed: {}", result.summary);
        result
    }
}

fn is_package_root(path: &Path) -> bool {
    ROOT_INDICATORS
        .iter()
        .filter(|name| path.join(name).exists())
        .count()
        >= 2
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::io::Write;

    /// Builds a fully valid MetaCam layout under `root`.
    pub fn build_package(root: &Path) {
        build_package_with_duration(root, "00:05:30");
    }

    pub fn build_package_with_duration(root: &Path, duration: &str) {
        for dir in ["images", "data", "info", "camera/left", "camera/right"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        std::fs::write(root.join("colorized-realtime.las"), vec![0u8; MIB as usize + 64]).unwrap();
        std::fs::write(root.join("Preview.jpg"), vec![0xffu8; 2 * KIB as usize]).unwrap();
        std::fs::write(root.join("images/frame_000001.jpg"), vec![0xffu8; 512]).unwrap();
        std::fs::write(root.join("data/data_0"), vec![0u8; MIB as usize + 64]).unwrap();
        std::fs::write(
            root.join("metadata.yaml"),
            format!(
                "record:\n  start_time: \"2025-08-10 07:40:52\"\n  duration: \"{duration}\"\n  location:\n    lat: \"40.692N\"\n    lon: \"73.989W\"\n# capture descriptor\n"
            ),
        )
        .unwrap();
        std::fs::write(
            root.join("info/calibration.json"),
            r#"{"camera_matrix": [1, 0, 0]}"#,
        )
        .unwrap();
        std::fs::write(
            root.join("info/device_info.json"),
            r#"{"model": "MetaCam-X1", "SN": "A100"}"#,
        )
        .unwrap();
        std::fs::write(root.join("info/rtk_info.json"), r#"{"fix": "rtk"}"#).unwrap();

        // 100x80 m footprint, comfortably in the optimal band, padded
        // past the 1 KiB floor.
        let mut pcd = std::fs::File::create(root.join("Preview.pcd")).unwrap();
        writeln!(pcd, "# .PCD v0.7 - Point Cloud Data file format").unwrap();
        writeln!(pcd, "VERSION 0.7\nFIELDS x y z\nSIZE 4 4 4\nTYPE F F F\nCOUNT 1 1 1").unwrap();
        writeln!(pcd, "WIDTH 64\nHEIGHT 1\nVIEWPOINT 0 0 0 1 0 0 0\nPOINTS 64\nDATA ascii").unwrap();
        for i in 0..64 {
            let t = i as f32 / 63.0;
            writeln!(pcd, "{:.4} {:.4} {:.4}", t * 100.0, t * 80.0, t * 5.0).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::validation::test_scoring;
    use tempfile::tempdir;

    fn validator() -> MetaCamValidator {
        MetaCamValidator::new(test_scoring())
    }

    #[test]
    fn valid_package_passes_standard() {
        let dir = tempdir().unwrap();
        build_package(dir.path());

        let result = validator().validate(dir.path(), ValidationLevel::Standard);
        assert!(result.is_valid, "errors: {:?}", result.errors);
        assert!(result.score > 90.0);

        let extracted = result.metadata.extracted_metadata.unwrap();
        assert_eq!(extracted.duration_seconds, Some(330));
        assert_eq!(extracted.duration_status.as_deref(), Some("optimal"));
        assert_eq!(
            extracted.device.unwrap().id.as_deref(),
            Some("MetaCam-X1-A100")
        );
        assert_eq!(result.metadata.pcd_scale.unwrap().status, "optimal");
    }

    #[test]
    fn wrapped_root_is_discovered() {
        let dir = tempdir().unwrap();
        let inner = dir.path().join("upload_2025_08_10");
        build_package(&inner);

        let result = validator().validate(dir.path(), ValidationLevel::Standard);
        assert!(result.is_valid, "errors: {:?}", result.errors);
        let root = result.metadata.extra["actual_root"].as_str().unwrap();
        assert!(root.contains("upload_2025_08_10"));
    }

    #[test]
    fn duration_too_short_is_fatal() {
        let dir = tempdir().unwrap();
        build_package_with_duration(dir.path(), "00:02:30");

        let result = validator().validate(dir.path(), ValidationLevel::Standard);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.code == "DURATION_TOO_SHORT"));
        assert_eq!(
            result
                .metadata
                .extracted_metadata
                .unwrap()
                .duration_status
                .as_deref(),
            Some("error_too_short")
        );
    }

    #[test]
    fn missing_required_file_fails_and_scores_down() {
        let dir = tempdir().unwrap();
        build_package(dir.path());
        std::fs::remove_file(dir.path().join("colorized-realtime.las")).unwrap();

        let result = validator().validate(dir.path(), ValidationLevel::Standard);
        assert!(!result.is_valid);
        assert!(result
            .errors
            .iter()
            .any(|e| e.code == "MISSING_REQUIRED_FILE"
                && e.path.as_deref() == Some("colorized-realtime.las")));
        assert!(result.score <= 80.0);
    }

    #[test]
    fn data_bag_suffix_is_accepted() {
        let dir = tempdir().unwrap();
        build_package(dir.path());
        std::fs::rename(
            dir.path().join("data/data_0"),
            dir.path().join("data/data_0.bag"),
        )
        .unwrap();

        let result = validator().validate(dir.path(), ValidationLevel::Standard);
        assert!(result.is_valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn undersized_file_is_a_size_breach() {
        let dir = tempdir().unwrap();
        build_package(dir.path());
        std::fs::write(dir.path().join("data/data_0"), b"tiny").unwrap();

        let result = validator().validate(dir.path(), ValidationLevel::Standard);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.code == "FILE_TOO_SMALL"));
    }

    #[test]
    fn non_package_directory_scores_zero() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("random.txt"), b"hello").unwrap();

        let result = validator().validate(dir.path(), ValidationLevel::Standard);
        assert!(!result.is_valid);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.errors[0].code, "NO_METACAM_ROOT");
    }

    #[test]
    fn corrupt_json_is_nonfatal_parse_error() {
        let dir = tempdir().unwrap();
        build_package(dir.path());
        std::fs::write(dir.path().join("info/calibration.json"), b"{ nope").unwrap();

        let result = validator().validate(dir.path(), ValidationLevel::Standard);
        assert!(result.errors.iter().any(|e| e.code == "JSON_PARSE_ERROR"));
        // A lone parse error costs 10 points but does not sink the run.
        assert!(result.is_valid);
    }
}
