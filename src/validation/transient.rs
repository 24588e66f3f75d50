// src/validation/transient.rs
//
// Transient-obstacle validator. Walks the camera frame sequence, feeds
// sampled frames through the detector facade and aggregates the
// weighted metrics into a PASS / NEED_REVIEW / REJECT verdict. Runs
// only when the package actually carries camera frames; a detector that
// cannot initialize produces a zero-score result but never blocks the
// structural validator.

use crate::detection::sampling::SamplingPlan;
use crate::detection::{FrameImage, MetricsEngine, ObjectDetector};
use crate::types::{
    ResultMetadata, ScenePreset, Severity, TransientDecision, ValidationIssue, ValidationLevel,
    ValidationResult,
};
use crate::validation::Validator;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
/// `camera/left` and `camera/right` are searched for at most this many
/// levels below the package root.
const CAMERA_SEARCH_DEPTH: usize = 3;

const SCORE_PASS: f64 = 100.0;
const SCORE_REVIEW: f64 = 75.0;
const SCORE_REJECT: f64 = 50.0;

/// Builds the detector on first use so a missing model only fails the
/// packages that actually need it.
pub type DetectorFactory = Box<dyn Fn() -> Result<ObjectDetector> + Send + Sync>;

pub struct TransientValidator {
    factory: DetectorFactory,
    detector: Mutex<Option<ObjectDetector>>,
}

impl TransientValidator {
    pub fn new(factory: DetectorFactory) -> Self {
        Self {
            factory,
            detector: Mutex::new(None),
        }
    }

    /// True when the package has a camera/left or camera/right directory
    /// with at least one supported image, within the search depth.
    pub fn applicable(root: &Path) -> bool {
        !find_camera_dirs(root).is_empty()
    }

    pub fn validate_with_preset(
        &self,
        root: &Path,
        _level: ValidationLevel,
        preset: ScenePreset,
    ) -> ValidationResult {
        let camera_dirs = find_camera_dirs(root);
        if camera_dirs.is_empty() {
            return skip_result("no camera frame directories found");
        }

        let frames = collect_frames(&camera_dirs);
        if frames.is_empty() {
            return skip_result("camera directories contain no supported images");
        }
        info!(
            "Transient assessment over {} frames from {} camera dirs ({} preset)",
            frames.len(),
            camera_dirs.len(),
            preset.as_str()
        );

        let mut guard = self.detector.lock().unwrap();
        if guard.is_none() {
            match (self.factory)() {
                Ok(d) => *guard = Some(d),
                Err(e) => {
                    warn!("Detector initialization failed: {e:#}");
                    return detector_failed_result(&e);
                }
            }
        }
        let detector = guard.as_mut().unwrap();

        let plan = SamplingPlan::for_frames(frames.len());
        let assessment = run_assessment(detector, &frames, &plan, preset);

        let decision = assessment.decision;
        let mut errors: Vec<ValidationIssue> = Vec::new();
        let mut warnings: Vec<ValidationIssue> = Vec::new();
        let score = match decision {
            TransientDecision::Pass => SCORE_PASS,
            TransientDecision::NeedReview => {
                warnings.push(ValidationIssue::new(
                    "TRANSIENT_NEEDS_REVIEW",
                    format!(
                        "transient metrics need review: WDD={:.2} WPO={:.2}% SAI={:.2}%",
                        assessment.metrics.wdd, assessment.metrics.wpo, assessment.metrics.sai
                    ),
                    Severity::Warning,
                ));
                SCORE_REVIEW
            }
            TransientDecision::Reject => {
                errors.push(ValidationIssue::new(
                    "TRANSIENT_REJECTED",
                    format!(
                        "transient obstacles reject the capture: WDD={:.2} WPO={:.2}% SAI={:.2}%",
                        assessment.metrics.wdd, assessment.metrics.wpo, assessment.metrics.sai
                    ),
                    Severity::Error,
                ));
                SCORE_REJECT
            }
        };

        let summary = ValidationResult::clamp_summary(format!(
            "Transient {} - WDD={:.2} WPO={:.2}% SAI={:.2}% over {}/{} frames{}",
            decision,
            assessment.metrics.wdd,
            assessment.metrics.wpo,
            assessment.metrics.sai,
            assessment.frames_sampled,
            assessment.frames_total,
            if assessment.early_terminated {
                " (early terminated)"
            } else {
                ""
            }
        ));

        ValidationResult {
            is_valid: decision != TransientDecision::Reject,
            score,
            errors,
            warnings,
            summary,
            validator_type: self.name().to_string(),
            metadata: ResultMetadata {
                transient_validation: Some(assessment),
                ..Default::default()
            },
        }
    }
}

impl Validator for TransientValidator {
    fn name(&self) -> &'static str {
        "TransientValidator"
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["camera_frames", "transient"]
    }

    fn validate(&self, root: &Path, level: ValidationLevel) -> ValidationResult {
        self.validate_with_preset(root, level, ScenePreset::Default)
    }
}

fn run_assessment(
    detector: &mut ObjectDetector,
    frames: &[PathBuf],
    plan: &SamplingPlan,
    preset: ScenePreset,
) -> crate::types::TransientAssessment {
    let mut engine = MetricsEngine::new(preset);
    let planned = plan.detection_indices.len();

    // Detection pass, in batches sized for the model.
    let mut early_stop = false;
    for batch in plan.detection_indices.chunks(detector.batch_size_detection.max(1)) {
        let images = load_batch(frames, batch);
        if images.is_empty() {
            continue;
        }
        match detector.detect(&images) {
            Ok(per_frame) => {
                for (frame, detections) in images.iter().zip(per_frame.iter()) {
                    engine.record_detection_frame(frame.width, frame.height, detections);
                }
            }
            Err(e) => {
                warn!("Detection batch failed: {e:#}");
                continue;
            }
        }
        if engine.check_early_termination(planned) {
            early_stop = true;
            break;
        }
    }

    // Segmentation pass only when the capture was not already rejected.
    if !early_stop {
        for batch in plan
            .segmentation_indices
            .chunks(detector.batch_size_segmentation.max(1))
        {
            let images = load_batch(frames, batch);
            if images.is_empty() {
                continue;
            }
            match detector.segment(&images) {
                Ok(per_frame) => {
                    for (frame, instances) in images.iter().zip(per_frame.iter()) {
                        engine.record_segmentation_frame(frame.width, frame.height, instances);
                    }
                }
                Err(e) => {
                    warn!("Segmentation batch failed: {e:#}");
                    continue;
                }
            }
            if engine.check_early_termination(planned) {
                break;
            }
        }
    }

    engine.finalize(
        plan.total_frames,
        plan.detection_stride,
        plan.segmentation_stride,
    )
}

fn load_batch(frames: &[PathBuf], indices: &[usize]) -> Vec<FrameImage> {
    let mut images = Vec::with_capacity(indices.len());
    for &idx in indices {
        let Some(path) = frames.get(idx) else { continue };
        match image::open(path) {
            Ok(img) => {
                let rgb = img.to_rgb8();
                images.push(FrameImage {
                    width: rgb.width() as usize,
                    height: rgb.height() as usize,
                    data: rgb.into_raw(),
                    index: idx,
                });
            }
            Err(e) => {
                debug!("Skipping unreadable frame {}: {e}", path.display());
            }
        }
    }
    images
}

fn find_camera_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root)
        .max_depth(CAMERA_SEARCH_DEPTH)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if name != "left" && name != "right" {
            continue;
        }
        let parent_is_camera = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_ascii_lowercase() == "camera")
            .unwrap_or(false);
        if parent_is_camera && dir_has_images(entry.path()) {
            dirs.push(entry.path().to_path_buf());
        }
    }
    dirs.sort();
    dirs
}

fn dir_has_images(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| entries.flatten().any(|e| is_supported_image(&e.path())))
        .unwrap_or(false)
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let ext = e.to_string_lossy().to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// All frames across the camera dirs, in a stable order.
fn collect_frames(camera_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut frames = Vec::new();
    for dir in camera_dirs {
        if let Ok(entries) = std::fs::read_dir(dir) {
            let mut batch: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_supported_image(p))
                .collect();
            batch.sort();
            frames.extend(batch);
        }
    }
    frames
}

fn skip_result(reason: &str) -> ValidationResult {
    ValidationResult {
        is_valid: true,
        score: 100.0,
        errors: Vec::new(),
        warnings: Vec::new(),
        summary: format!("Transient assessment skipped: {reason}"),
        validator_type: "TransientValidator".into(),
        metadata: ResultMetadata::default(),
    }
}

fn detector_failed_result(e: &anyhow::Error) -> ValidationResult {
    ValidationResult {
        is_valid: false,
        score: 0.0,
        errors: vec![ValidationIssue::new(
            "DETECTOR_INIT_FAILED",
            format!("object detector failed to initialize: {e:#}"),
            Severity::Critical,
        )],
        warnings: Vec::new(),
        summary: "Transient assessment unavailable: detector failed to initialize".into(),
        validator_type: "TransientValidator".into(),
        metadata: ResultMetadata::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{class_name, Detection, SegInstance, VisionBackend, CLASS_PERSON};
    use image::RgbImage;
    use tempfile::tempdir;

    /// Deterministic backend: `dets_per_frame` lower-center persons on
    /// every frame.
    struct FakeBackend {
        dets_per_frame: usize,
        large_person: bool,
    }

    impl FakeBackend {
        fn detection(&self, w: usize, h: usize) -> Detection {
            let (w, h) = (w as f32, h as f32);
            let bbox = if self.large_person {
                [w * 0.3, h * 0.7, w * 0.7, h * 1.0]
            } else {
                [w * 0.45, h * 0.75, w * 0.55, h * 0.9]
            };
            Detection {
                bbox,
                confidence: 0.9,
                class_id: CLASS_PERSON,
                class_name: class_name(CLASS_PERSON),
            }
        }
    }

    impl VisionBackend for FakeBackend {
        fn detect(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<Detection>>> {
            Ok(frames
                .iter()
                .map(|f| {
                    (0..self.dets_per_frame)
                        .map(|_| self.detection(f.width, f.height))
                        .collect()
                })
                .collect())
        }

        fn segment(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<SegInstance>>> {
            let detected = self.detect(frames)?;
            Ok(detected
                .into_iter()
                .map(|d| d.into_iter().map(SegInstance::from_detection).collect())
                .collect())
        }

        fn degraded(&self) -> bool {
            false
        }
    }

    fn write_frames(dir: &Path, count: usize) {
        std::fs::create_dir_all(dir).unwrap();
        let img = RgbImage::from_pixel(8, 8, image::Rgb([40, 40, 40]));
        for i in 0..count {
            img.save(dir.join(format!("frame_{i:04}.png"))).unwrap();
        }
    }

    fn validator_with(dets_per_frame: usize, large_person: bool) -> TransientValidator {
        TransientValidator::new(Box::new(move || {
            Ok(ObjectDetector::from_backend(
                Box::new(FakeBackend {
                    dets_per_frame,
                    large_person,
                }),
                4,
                4,
            ))
        }))
    }

    #[test]
    fn applicable_requires_camera_images() {
        let dir = tempdir().unwrap();
        assert!(!TransientValidator::applicable(dir.path()));

        std::fs::create_dir_all(dir.path().join("camera/left")).unwrap();
        assert!(!TransientValidator::applicable(dir.path()));

        write_frames(&dir.path().join("camera/left"), 1);
        assert!(TransientValidator::applicable(dir.path()));
    }

    #[test]
    fn camera_dirs_found_one_level_down() {
        let dir = tempdir().unwrap();
        write_frames(&dir.path().join("wrapper/camera/right"), 2);
        assert!(TransientValidator::applicable(dir.path()));
    }

    #[test]
    fn empty_scene_passes() {
        let dir = tempdir().unwrap();
        write_frames(&dir.path().join("camera/left"), 12);

        let v = validator_with(0, false);
        let result = v.validate(dir.path(), ValidationLevel::Standard);
        assert!(result.is_valid);
        assert_eq!(result.score, 100.0);
        let assessment = result.metadata.transient_validation.unwrap();
        assert_eq!(assessment.decision, crate::types::TransientDecision::Pass);
        assert_eq!(assessment.frames_total, 12);
        assert_eq!(assessment.frames_sampled, 12);
    }

    #[test]
    fn crowded_scene_rejects() {
        let dir = tempdir().unwrap();
        write_frames(&dir.path().join("camera/left"), 20);

        // Enough lower-center persons per frame to push WDD past reject.
        let v = validator_with(8, false);
        let result = v.validate(dir.path(), ValidationLevel::Standard);
        assert!(!result.is_valid);
        assert_eq!(result.score, 50.0);
        assert!(result.errors.iter().any(|e| e.code == "TRANSIENT_REJECTED"));
    }

    #[test]
    fn self_appearance_drives_review_or_reject() {
        let dir = tempdir().unwrap();
        write_frames(&dir.path().join("camera/left"), 10);

        // One large lower-band person per frame: SAI = 100%.
        let v = validator_with(1, true);
        let result = v.validate(dir.path(), ValidationLevel::Standard);
        let assessment = result.metadata.transient_validation.unwrap();
        assert!(assessment.metrics.sai > 25.0);
        assert_eq!(assessment.decision, crate::types::TransientDecision::Reject);
    }

    #[test]
    fn detector_failure_scores_zero_without_panic() {
        let dir = tempdir().unwrap();
        write_frames(&dir.path().join("camera/left"), 3);

        let v = TransientValidator::new(Box::new(|| {
            Err(anyhow::anyhow!("model file not found"))
        }));
        let result = v.validate(dir.path(), ValidationLevel::Standard);
        assert!(!result.is_valid);
        assert_eq!(result.score, 0.0);
        assert!(result.has_critical());
        assert_eq!(result.errors[0].code, "DETECTOR_INIT_FAILED");
    }

    #[test]
    fn no_camera_dir_yields_skip() {
        let dir = tempdir().unwrap();
        let v = validator_with(0, false);
        let result = v.validate(dir.path(), ValidationLevel::Standard);
        assert!(result.is_valid);
        assert!(result.summary.contains("skipped"));
        assert!(result.metadata.transient_validation.is_none());
    }
}
