// src/types.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// Remote package identity
// ============================================================================

/// Identity of a remote artifact as observed by the drive monitor.
/// Immutable once read from the drive listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDescriptor {
    /// Opaque remote identifier (stable across polls).
    pub remote_id: String,
    pub name: String,
    pub size_bytes: u64,
    /// Remote modification time, RFC 3339.
    pub remote_mtime: String,
    pub mime: String,
}

impl PackageDescriptor {
    /// Package name without the archive extension, used for scratch dirs,
    /// output search and the final archive name.
    pub fn stem(&self) -> String {
        let name = self.name.trim_end_matches(".tar.gz");
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && ext.len() <= 4 => stem.to_string(),
            _ => name.to_string(),
        }
    }
}

// ============================================================================
// Extracted package handle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    Zip,
    Rar,
    SevenZ,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Rar => "rar",
            ArchiveFormat::SevenZ => "7z",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Post-decompression handle. The scratch directory under `root_path` is
/// owned by exactly one worker; see the orchestrator for the cleanup scope.
#[derive(Debug, Clone)]
pub struct ExtractedPackage {
    pub root_path: PathBuf,
    /// Relative paths, in the order the archive listed them.
    pub files: Vec<PathBuf>,
    pub total_bytes: u64,
    pub format: ArchiveFormat,
    pub password_used: Option<String>,
}

impl ExtractedPackage {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

// ============================================================================
// Validation value types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationLevel {
    Strict,
    Standard,
    Lenient,
}

impl ValidationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationLevel::Strict => "strict",
            ValidationLevel::Standard => "standard",
            ValidationLevel::Lenient => "lenient",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// A single finding produced by a validator. `code` is stable and
/// machine-readable; `message` is for humans and the sheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn new(code: &str, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            path: None,
            severity,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Metadata extracted from the recording descriptor and device manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    pub start_time: Option<String>,
    pub duration_seconds: Option<u64>,
    pub duration_status: Option<String>,
    pub location: Option<GeoLocation>,
    pub device: Option<DeviceIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: String,
    pub lon: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub model: Option<String>,
    pub sn: Option<String>,
    /// `"{model}-{SN}"` when both are present.
    pub id: Option<String>,
}

/// Bounding-box summary of the preview point cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcdScale {
    pub status: String,
    pub width_m: f64,
    pub height_m: f64,
    pub depth_m: f64,
    pub area_sqm: f64,
    pub points_parsed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sub-scores recorded when the manager composes two validators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineScores {
    pub basic_score: f64,
    pub transient_score: f64,
    pub basic_weight: f64,
    pub transient_weight: f64,
    pub combined_score: f64,
}

/// Well-known metadata nodes plus an extension map. Stages append; a later
/// stage never overwrites a key an earlier stage set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_metadata: Option<ExtractedMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcd_scale: Option<PcdScale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transient_validation: Option<TransientAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_pipeline: Option<PipelineScores>,
    /// Producer-defined extras, ordered for deterministic output.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ResultMetadata {
    /// Additive merge: takes from `other` only what `self` does not
    /// already carry.
    pub fn merge_from(&mut self, other: &ResultMetadata) {
        if self.extracted_metadata.is_none() {
            self.extracted_metadata = other.extracted_metadata.clone();
        }
        if self.pcd_scale.is_none() {
            self.pcd_scale = other.pcd_scale.clone();
        }
        if self.transient_validation.is_none() {
            self.transient_validation = other.transient_validation.clone();
        }
        if self.validation_pipeline.is_none() {
            self.validation_pipeline = other.validation_pipeline.clone();
        }
        for (k, v) in &other.extra {
            self.extra.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn insert_extra(&mut self, key: &str, value: serde_json::Value) {
        self.extra.entry(key.to_string()).or_insert(value);
    }
}

/// The single value exchanged between validators and consumers.
/// Immutable once returned; the pipeline composes new values instead of
/// mutating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Numeric quality in [0, 100]; never NaN.
    pub score: f64,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub summary: String,
    pub validator_type: String,
    pub metadata: ResultMetadata,
}

impl ValidationResult {
    pub fn has_critical(&self) -> bool {
        self.errors.iter().any(|e| e.severity == Severity::Critical)
    }

    /// One-line summaries are capped at 240 characters.
    pub fn clamp_summary(summary: String) -> String {
        if summary.chars().count() <= 240 {
            summary
        } else {
            let mut s: String = summary.chars().take(237).collect();
            s.push_str("...");
            s
        }
    }
}

// ============================================================================
// Transient assessment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransientDecision {
    Pass,
    NeedReview,
    Reject,
}

impl TransientDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientDecision::Pass => "PASS",
            TransientDecision::NeedReview => "NEED_REVIEW",
            TransientDecision::Reject => "REJECT",
        }
    }
}

impl std::fmt::Display for TransientDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Weighted quality metrics over the sampled camera frames.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransientMetrics {
    /// Weighted Detection Density: detections per sampled frame, weighted
    /// by image-plane location.
    pub wdd: f64,
    /// Weighted Pixel Occupancy, percent of frame area.
    pub wpo: f64,
    /// Self-Appearance Index, percent of sampled frames.
    pub sai: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientAssessment {
    pub decision: TransientDecision,
    pub metrics: TransientMetrics,
    pub frames_sampled: usize,
    pub frames_total: usize,
    pub sampling_rate_detection: usize,
    pub sampling_rate_segmentation: usize,
    pub early_terminated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

// ============================================================================
// Processing outcome
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageDurations {
    pub generator_s: f64,
    pub cli_s: f64,
    pub postprocess_s: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitCodes {
    pub generator: Option<i32>,
    pub cli: Option<i32>,
}

/// Result of driving the two reconstruction binaries and assembling the
/// final archive. Produced once per package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub success: bool,
    pub stage_durations: StageDurations,
    pub final_archive_path: Option<PathBuf>,
    pub missing_outputs: Vec<String>,
    pub exit_codes: ExitCodes,
    /// Last 64 KiB of combined subprocess output.
    pub log_tail: String,
}

impl ProcessingOutcome {
    pub fn failed(reason: &str) -> Self {
        Self {
            success: false,
            stage_durations: StageDurations::default(),
            final_archive_path: None,
            missing_outputs: Vec::new(),
            exit_codes: ExitCodes::default(),
            log_tail: reason.to_string(),
        }
    }
}

// ============================================================================
// Scene classification
// ============================================================================

/// Reconstruction mode passed to the CLI binary via `-s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SceneKind {
    Balance = 0,
    Open = 1,
    Narrow = 2,
}

impl SceneKind {
    pub fn as_arg(&self) -> &'static str {
        match self {
            SceneKind::Balance => "0",
            SceneKind::Open => "1",
            SceneKind::Narrow => "2",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            SceneKind::Balance => "Balance",
            SceneKind::Open => "Open",
            SceneKind::Narrow => "Narrow",
        }
    }
}

/// Threshold preset for the transient metrics engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenePreset {
    Indoor,
    Outdoor,
    Default,
}

impl ScenePreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenePreset::Indoor => "indoor",
            ScenePreset::Outdoor => "outdoor",
            ScenePreset::Default => "default",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_stem_strips_archive_extension() {
        let d = PackageDescriptor {
            remote_id: "abc".into(),
            name: "pkg42.zip".into(),
            size_bytes: 10,
            remote_mtime: "2025-08-10T07:40:52Z".into(),
            mime: "application/zip".into(),
        };
        assert_eq!(d.stem(), "pkg42");

        let d2 = PackageDescriptor {
            name: "site_scan.tar.gz".into(),
            ..d.clone()
        };
        assert_eq!(d2.stem(), "site_scan");
    }

    #[test]
    fn metadata_merge_never_overwrites() {
        let mut a = ResultMetadata::default();
        a.insert_extra("size", serde_json::json!({"total_bytes": 1}));
        let mut b = ResultMetadata::default();
        b.insert_extra("size", serde_json::json!({"total_bytes": 2}));
        b.insert_extra("other", serde_json::json!(true));

        a.merge_from(&b);
        assert_eq!(a.extra["size"]["total_bytes"], 1);
        assert_eq!(a.extra["other"], serde_json::json!(true));
    }

    #[test]
    fn summary_clamped_to_240_chars() {
        let long = "x".repeat(500);
        let clamped = ValidationResult::clamp_summary(long);
        assert_eq!(clamped.chars().count(), 240);
    }
}
