// src/validation/manager.rs
//
// Selects validators by format and composes the MetaCam + transient
// pipeline. New validators register against the formats they support;
// "metacam" routes through the two-stage pipeline whenever camera
// frames are present.

use crate::types::{
    PipelineScores, ResultMetadata, ScenePreset, ValidationLevel, ValidationResult,
};
use crate::validation::{MetaCamValidator, TransientValidator, Validator};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const BASIC_WEIGHT: f64 = 0.7;
const TRANSIENT_WEIGHT: f64 = 0.3;

pub struct ValidationManager {
    metacam: Arc<MetaCamValidator>,
    transient: Arc<TransientValidator>,
    registry: HashMap<String, Arc<dyn Validator>>,
}

impl ValidationManager {
    pub fn new(metacam: MetaCamValidator, transient: TransientValidator) -> Self {
        let metacam = Arc::new(metacam);
        let transient = Arc::new(transient);
        let mut manager = Self {
            metacam: metacam.clone(),
            transient: transient.clone(),
            registry: HashMap::new(),
        };
        manager.register(metacam);
        manager.register(transient);
        manager
    }

    /// Adds a validator for every format it reports.
    pub fn register(&mut self, validator: Arc<dyn Validator>) {
        for format in validator.supported_formats() {
            self.registry.insert(format.to_string(), validator.clone());
        }
        info!(
            "Registered validator {} for {:?}",
            validator.name(),
            validator.supported_formats()
        );
    }

    /// Runs the right validator(s) for the package. MetaCam packages get
    /// the structural validator plus, when camera frames exist, the
    /// transient assessment composed into a pipeline result.
    pub fn validate(
        &self,
        root: &Path,
        level: ValidationLevel,
        format_hint: Option<&str>,
    ) -> ValidationResult {
        let format = format_hint
            .map(str::to_string)
            .or_else(|| self.detect_format(root))
            .unwrap_or_else(|| "metacam".to_string());
        debug!("Validating {} as format {format:?}", root.display());

        if self.metacam.supported_formats().contains(&format.as_str()) {
            return self.run_metacam_pipeline(root, level);
        }

        match self.registry.get(format.as_str()) {
            Some(validator) => validator.validate(root, level),
            // Unknown formats fall back to the default pipeline.
            None => self.run_metacam_pipeline(root, level),
        }
    }

    fn run_metacam_pipeline(&self, root: &Path, level: ValidationLevel) -> ValidationResult {
        let basic = self.metacam.validate(root, level);

        if !TransientValidator::applicable(root) {
            debug!("No camera frames; returning structural result unchanged");
            return basic;
        }

        let preset = infer_scene_preset(&basic);
        let transient = self.transient.validate_with_preset(root, level, preset);
        compose(basic, transient)
    }

    fn detect_format(&self, root: &Path) -> Option<String> {
        MetaCamValidator::find_actual_root(root).map(|_| "metacam".to_string())
    }
}

/// Threshold preset from what the structural pass learned: small indoor
/// footprints are judged tighter, open outdoor captures looser.
pub fn infer_scene_preset(basic: &ValidationResult) -> ScenePreset {
    let scale = match &basic.metadata.pcd_scale {
        Some(s) if s.points_parsed > 0 => s,
        _ => return ScenePreset::Default,
    };
    let max_dim = scale.width_m.max(scale.height_m);
    if max_dim >= 50.0 {
        ScenePreset::Outdoor
    } else if max_dim > 0.0 && max_dim < 30.0 {
        ScenePreset::Indoor
    } else {
        ScenePreset::Default
    }
}

/// Weighted composition of the two stages. The structural validator
/// alone gates validity; the transient score shifts the number, and
/// metadata merges additively (the basic stage's keys win).
pub fn compose(basic: ValidationResult, transient: ValidationResult) -> ValidationResult {
    let combined_score =
        ((BASIC_WEIGHT * basic.score + TRANSIENT_WEIGHT * transient.score) * 100.0).round() / 100.0;

    let mut metadata = basic.metadata.clone();
    metadata.merge_from(&transient.metadata);
    metadata.validation_pipeline = Some(PipelineScores {
        basic_score: basic.score,
        transient_score: transient.score,
        basic_weight: BASIC_WEIGHT,
        transient_weight: TRANSIENT_WEIGHT,
        combined_score,
    });

    let mut errors = basic.errors;
    errors.extend(transient.errors);
    let mut warnings = basic.warnings;
    warnings.extend(transient.warnings);

    let summary = ValidationResult::clamp_summary(format!(
        "Pipeline {} - combined {:.2}/100 (basic {:.1}, transient {:.1})",
        if basic.is_valid { "PASS" } else { "FAIL" },
        combined_score,
        basic.score,
        transient.score
    ));

    ValidationResult {
        is_valid: basic.is_valid,
        score: combined_score,
        errors,
        warnings,
        summary,
        validator_type: "Pipeline(MetaCam+Transient)".to_string(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{ObjectDetector, SegInstance, VisionBackend};
    use crate::types::PcdScale;
    use crate::validation::metacam::fixtures::build_package;
    use crate::validation::test_scoring;
    use crate::validation::transient::DetectorFactory;
    use tempfile::tempdir;

    fn result_with_score(score: f64, is_valid: bool) -> ValidationResult {
        ValidationResult {
            is_valid,
            score,
            errors: Vec::new(),
            warnings: Vec::new(),
            summary: String::new(),
            validator_type: "test".into(),
            metadata: ResultMetadata::default(),
        }
    }

    struct EmptyBackend;
    impl VisionBackend for EmptyBackend {
        fn detect(
            &mut self,
            frames: &[crate::detection::FrameImage],
        ) -> anyhow::Result<Vec<Vec<crate::detection::Detection>>> {
            Ok(frames.iter().map(|_| Vec::new()).collect())
        }
        fn segment(
            &mut self,
            frames: &[crate::detection::FrameImage],
        ) -> anyhow::Result<Vec<Vec<SegInstance>>> {
            Ok(frames.iter().map(|_| Vec::new()).collect())
        }
        fn degraded(&self) -> bool {
            false
        }
    }

    fn empty_factory() -> DetectorFactory {
        Box::new(|| Ok(ObjectDetector::from_backend(Box::new(EmptyBackend), 4, 4)))
    }

    fn manager() -> ValidationManager {
        ValidationManager::new(
            MetaCamValidator::new(test_scoring()),
            TransientValidator::new(empty_factory()),
        )
    }

    #[test]
    fn combined_score_is_weighted_and_rounded() {
        let composed = compose(
            result_with_score(80.0, true),
            result_with_score(60.0, true),
        );
        assert_eq!(composed.score, 74.00);
        assert!(composed.is_valid);
        assert_eq!(composed.validator_type, "Pipeline(MetaCam+Transient)");

        let scores = composed.metadata.validation_pipeline.unwrap();
        assert_eq!(scores.basic_score, 80.0);
        assert_eq!(scores.transient_score, 60.0);
        assert_eq!(scores.combined_score, 74.00);
    }

    #[test]
    fn validity_follows_basic_only() {
        let composed = compose(
            result_with_score(90.0, true),
            result_with_score(0.0, false),
        );
        assert!(composed.is_valid);

        let composed = compose(
            result_with_score(20.0, false),
            result_with_score(100.0, true),
        );
        assert!(!composed.is_valid);
    }

    #[test]
    fn package_without_camera_frames_returns_basic_unchanged() {
        let dir = tempdir().unwrap();
        build_package(dir.path());

        let result = manager().validate(dir.path(), ValidationLevel::Standard, Some("metacam"));
        assert_eq!(result.validator_type, "MetaCamValidator");
        assert!(result.is_valid);
    }

    #[test]
    fn package_with_camera_frames_composes_pipeline() {
        let dir = tempdir().unwrap();
        build_package(dir.path());
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 10, 10]));
        for i in 0..4 {
            img.save(dir.path().join(format!("camera/left/f{i}.png"))).unwrap();
        }

        let result = manager().validate(dir.path(), ValidationLevel::Standard, None);
        assert_eq!(result.validator_type, "Pipeline(MetaCam+Transient)");
        assert!(result.is_valid);
        assert!(result.metadata.validation_pipeline.is_some());
        assert!(result.metadata.transient_validation.is_some());
        // Clean capture on both stages: 0.7*100 + 0.3*100.
        assert_eq!(result.score, 100.0);
    }

    #[test]
    fn scene_preset_inferred_from_pcd_scale() {
        let mut basic = result_with_score(100.0, true);
        basic.metadata.pcd_scale = Some(PcdScale {
            status: "optimal".into(),
            width_m: 120.0,
            height_m: 60.0,
            depth_m: 10.0,
            area_sqm: 7200.0,
            points_parsed: 500,
            error: None,
        });
        assert_eq!(infer_scene_preset(&basic), ScenePreset::Outdoor);

        basic.metadata.pcd_scale.as_mut().unwrap().width_m = 20.0;
        basic.metadata.pcd_scale.as_mut().unwrap().height_m = 15.0;
        assert_eq!(infer_scene_preset(&basic), ScenePreset::Indoor);

        basic.metadata.pcd_scale = None;
        assert_eq!(infer_scene_preset(&basic), ScenePreset::Default);
    }
}
