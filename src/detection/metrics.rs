// src/detection/metrics.rs
//
// Streaming computation of the three transient-obstacle metrics and the
// final verdict. Frames arrive in sampling order; the engine keeps
// running sums so an obviously bad capture can be rejected before the
// whole sequence is scanned.

use crate::types::{ScenePreset, TransientAssessment, TransientDecision, TransientMetrics};
use tracing::{info, warn};

use super::{Detection, RegionWeightMap, SegInstance, CLASS_PERSON};

/// A person counts as self-appearance when its footprint center sits in
/// the lower band and covers more than this fraction of the frame.
const SELF_BAND_V: f64 = 0.7;
const SELF_AREA_FRACTION: f64 = 0.05;

/// Early-termination guards. Fixed, not preset-scaled: a capture this
/// far over the line is unusable under any preset.
const EARLY_WDD: f64 = 12.0;
const EARLY_WPO: f64 = 40.0;
const EARLY_SAI: f64 = 35.0;
/// Fraction of planned frames that must be seen before the guards fire.
const EARLY_MIN_PROGRESS: f64 = 0.2;

/// Per-metric decision lines. A value at or above `reject` rejects the
/// package outright; at or above `review` it goes to a human; below
/// `acceptable` it is optimal.
#[derive(Debug, Clone, Copy)]
pub struct MetricBand {
    pub acceptable: f64,
    pub review: f64,
    pub reject: f64,
}

impl MetricBand {
    fn scaled(&self, factor: f64) -> Self {
        Self {
            acceptable: self.acceptable * factor,
            review: self.review * factor,
            reject: self.reject * factor,
        }
    }

    pub fn level(&self, value: f64) -> &'static str {
        if value >= self.reject {
            "reject"
        } else if value >= self.review {
            "review"
        } else if value >= self.acceptable {
            "acceptable"
        } else {
            "optimal"
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionThresholds {
    pub wdd: MetricBand,
    pub wpo: MetricBand,
    pub sai: MetricBand,
}

impl DecisionThresholds {
    pub fn default_preset() -> Self {
        Self {
            wdd: MetricBand {
                acceptable: 1.0,
                review: 1.5,
                reject: 8.0,
            },
            wpo: MetricBand {
                acceptable: 1.0,
                review: 5.0,
                reject: 30.0,
            },
            sai: MetricBand {
                acceptable: 5.0,
                review: 15.0,
                reject: 25.0,
            },
        }
    }

    /// Indoor scenes tighten by 20%, outdoor loosen by 20%.
    pub fn for_preset(preset: ScenePreset) -> Self {
        let base = Self::default_preset();
        let factor = match preset {
            ScenePreset::Indoor => 0.8,
            ScenePreset::Outdoor => 1.2,
            ScenePreset::Default => 1.0,
        };
        Self {
            wdd: base.wdd.scaled(factor),
            wpo: base.wpo.scaled(factor),
            sai: base.sai.scaled(factor),
        }
    }

    pub fn decide(&self, metrics: &TransientMetrics) -> TransientDecision {
        let values = [
            (metrics.wdd, &self.wdd),
            (metrics.wpo, &self.wpo),
            (metrics.sai, &self.sai),
        ];
        if values.iter().any(|(v, band)| *v >= band.reject) {
            TransientDecision::Reject
        } else if values.iter().any(|(v, band)| *v >= band.review) {
            TransientDecision::NeedReview
        } else {
            TransientDecision::Pass
        }
    }
}

pub struct MetricsEngine {
    weights: RegionWeightMap,
    thresholds: DecisionThresholds,
    preset: ScenePreset,
    detection_frames: usize,
    segmentation_frames: usize,
    wdd_sum: f64,
    /// Sum over segmentation frames of weighted area fractions.
    wpo_sum: f64,
    self_frames: usize,
    early_terminated: bool,
    termination_reason: Option<String>,
}

impl MetricsEngine {
    pub fn new(preset: ScenePreset) -> Self {
        Self {
            weights: RegionWeightMap::new(),
            thresholds: DecisionThresholds::for_preset(preset),
            preset,
            detection_frames: 0,
            segmentation_frames: 0,
            wdd_sum: 0.0,
            wpo_sum: 0.0,
            self_frames: 0,
            early_terminated: false,
            termination_reason: None,
        }
    }

    pub fn preset(&self) -> ScenePreset {
        self.preset
    }

    pub fn record_detection_frame(
        &mut self,
        frame_width: usize,
        frame_height: usize,
        detections: &[Detection],
    ) {
        self.detection_frames += 1;
        for detection in detections {
            let (cx, cy) = detection.center();
            self.wdd_sum += self
                .weights
                .weight_at_px(cx, cy, frame_width, frame_height);
        }
    }

    pub fn record_segmentation_frame(
        &mut self,
        frame_width: usize,
        frame_height: usize,
        instances: &[SegInstance],
    ) {
        self.segmentation_frames += 1;
        let frame_area = (frame_width * frame_height) as f64;
        if frame_area <= 0.0 {
            return;
        }

        let mut self_appeared = false;
        for instance in instances {
            let (cx, cy) = instance.footprint_center();
            let weight = self
                .weights
                .weight_at_px(cx, cy, frame_width, frame_height);
            let area_fraction = (instance.footprint_area() as f64 / frame_area).clamp(0.0, 1.0);
            self.wpo_sum += weight * area_fraction;

            if instance.detection.class_id == CLASS_PERSON
                && (cy as f64 / frame_height as f64) >= SELF_BAND_V
                && area_fraction > SELF_AREA_FRACTION
            {
                self_appeared = true;
            }
        }
        if self_appeared {
            self.self_frames += 1;
        }
    }

    pub fn running_metrics(&self) -> TransientMetrics {
        TransientMetrics {
            wdd: if self.detection_frames > 0 {
                self.wdd_sum / self.detection_frames as f64
            } else {
                0.0
            },
            wpo: if self.segmentation_frames > 0 {
                100.0 * self.wpo_sum / self.segmentation_frames as f64
            } else {
                0.0
            },
            sai: if self.segmentation_frames > 0 {
                100.0 * self.self_frames as f64 / self.segmentation_frames as f64
            } else {
                0.0
            },
        }
    }

    /// After at least 20% of planned frames, a running metric far past
    /// every reject line lets the caller stop sampling. Returns true
    /// once tripped; the final decision is then always REJECT.
    pub fn check_early_termination(&mut self, planned_detection_frames: usize) -> bool {
        if self.early_terminated {
            return true;
        }
        if planned_detection_frames == 0 {
            return false;
        }
        let progress = self.detection_frames as f64 / planned_detection_frames as f64;
        if progress < EARLY_MIN_PROGRESS {
            return false;
        }

        let metrics = self.running_metrics();
        let mut reasons = Vec::new();
        if metrics.wdd > EARLY_WDD {
            reasons.push(format!("WDD={:.1}", metrics.wdd));
        }
        if metrics.wpo > EARLY_WPO {
            reasons.push(format!("WPO={:.1}%", metrics.wpo));
        }
        if metrics.sai > EARLY_SAI {
            reasons.push(format!("SAI={:.1}%", metrics.sai));
        }
        if reasons.is_empty() {
            return false;
        }

        let reason = format!("early termination: {}", reasons.join(", "));
        warn!("{reason}");
        self.early_terminated = true;
        self.termination_reason = Some(reason);
        true
    }

    pub fn finalize(
        &self,
        frames_total: usize,
        sampling_rate_detection: usize,
        sampling_rate_segmentation: usize,
    ) -> TransientAssessment {
        let metrics = self.running_metrics();
        let decision = if self.early_terminated {
            TransientDecision::Reject
        } else {
            self.thresholds.decide(&metrics)
        };

        let mut details = vec![
            format!("WDD {:.2} ({})", metrics.wdd, self.thresholds.wdd.level(metrics.wdd)),
            format!("WPO {:.2}% ({})", metrics.wpo, self.thresholds.wpo.level(metrics.wpo)),
            format!("SAI {:.2}% ({})", metrics.sai, self.thresholds.sai.level(metrics.sai)),
        ];
        if let Some(reason) = &self.termination_reason {
            details.push(reason.clone());
        }

        info!(
            "Transient assessment ({} preset): WDD={:.2} WPO={:.2}% SAI={:.2}% -> {}",
            self.preset.as_str(),
            metrics.wdd,
            metrics.wpo,
            metrics.sai,
            decision
        );

        TransientAssessment {
            decision,
            metrics,
            frames_sampled: self.detection_frames,
            frames_total,
            sampling_rate_detection,
            sampling_rate_segmentation,
            early_terminated: self.early_terminated,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{class_name, CLASS_DOG};

    fn metrics(wdd: f64, wpo: f64, sai: f64) -> TransientMetrics {
        TransientMetrics { wdd, wpo, sai }
    }

    fn person(bbox: [f32; 4]) -> Detection {
        Detection {
            bbox,
            confidence: 0.9,
            class_id: CLASS_PERSON,
            class_name: class_name(CLASS_PERSON),
        }
    }

    #[test]
    fn decision_bands_default_preset() {
        let t = DecisionThresholds::default_preset();
        assert_eq!(t.decide(&metrics(0.5, 0.4, 2.0)), TransientDecision::Pass);
        assert_eq!(
            t.decide(&metrics(1.8, 3.0, 4.0)),
            TransientDecision::NeedReview
        );
        assert_eq!(t.decide(&metrics(9.0, 1.0, 1.0)), TransientDecision::Reject);
    }

    #[test]
    fn decision_is_monotone_in_each_metric() {
        let t = DecisionThresholds::default_preset();
        let rank = |d: TransientDecision| match d {
            TransientDecision::Pass => 0,
            TransientDecision::NeedReview => 1,
            TransientDecision::Reject => 2,
        };
        let base = metrics(0.5, 0.4, 2.0);
        for wdd in [0.5, 1.2, 1.8, 5.0, 9.0] {
            for wpo in [0.4, 2.0, 7.0, 35.0] {
                let bigger = metrics(wdd, wpo, base.sai);
                assert!(rank(t.decide(&bigger)) >= rank(t.decide(&base)));
            }
        }
    }

    #[test]
    fn indoor_tightens_outdoor_loosens() {
        let value = metrics(1.3, 0.1, 0.1);
        assert_eq!(
            DecisionThresholds::for_preset(ScenePreset::Default).decide(&value),
            TransientDecision::Pass
        );
        assert_eq!(
            DecisionThresholds::for_preset(ScenePreset::Indoor).decide(&value),
            TransientDecision::NeedReview
        );

        let borderline = metrics(1.6, 0.1, 0.1);
        assert_eq!(
            DecisionThresholds::for_preset(ScenePreset::Outdoor).decide(&borderline),
            TransientDecision::Pass
        );
    }

    #[test]
    fn wdd_counts_weighted_detections_per_frame() {
        let mut engine = MetricsEngine::new(ScenePreset::Default);
        // Two frames, one lower-center person each; weights there are
        // above the mean so WDD lands above 1 detection/frame.
        for _ in 0..2 {
            engine.record_detection_frame(1000, 1000, &[person([400.0, 700.0, 600.0, 950.0])]);
        }
        let m = engine.running_metrics();
        assert!(m.wdd > 1.0);

        // An empty third frame dilutes the density.
        engine.record_detection_frame(1000, 1000, &[]);
        assert!(engine.running_metrics().wdd < m.wdd);
    }

    #[test]
    fn sai_counts_lower_band_large_persons() {
        let mut engine = MetricsEngine::new(ScenePreset::Default);
        // 300x300 box in a 1000x1000 frame = 9% area, center y = 850.
        let inst = SegInstance::from_detection(person([350.0, 700.0, 650.0, 1000.0]));
        engine.record_segmentation_frame(1000, 1000, &[inst]);
        // Small person near the top does not count.
        let small = SegInstance::from_detection(person([0.0, 0.0, 50.0, 50.0]));
        engine.record_segmentation_frame(1000, 1000, &[small]);

        let m = engine.running_metrics();
        assert!((m.sai - 50.0).abs() < 1e-6);
    }

    #[test]
    fn dogs_do_not_count_toward_sai() {
        let mut engine = MetricsEngine::new(ScenePreset::Default);
        let dog = Detection {
            bbox: [350.0, 700.0, 650.0, 1000.0],
            confidence: 0.9,
            class_id: CLASS_DOG,
            class_name: class_name(CLASS_DOG),
        };
        engine.record_segmentation_frame(1000, 1000, &[SegInstance::from_detection(dog)]);
        assert_eq!(engine.running_metrics().sai, 0.0);
    }

    #[test]
    fn early_termination_needs_progress_then_trips() {
        let mut engine = MetricsEngine::new(ScenePreset::Default);
        // Saturate WDD with many lower-center persons per frame.
        let crowd: Vec<Detection> = (0..20)
            .map(|_| person([400.0, 700.0, 600.0, 950.0]))
            .collect();

        engine.record_detection_frame(1000, 1000, &crowd);
        // 1 of 100 planned frames: too early regardless of the value.
        assert!(!engine.check_early_termination(100));

        for _ in 0..24 {
            engine.record_detection_frame(1000, 1000, &crowd);
        }
        // 25% progress with WDD far over the line.
        assert!(engine.check_early_termination(100));

        let assessment = engine.finalize(100, 1, 2);
        assert!(assessment.early_terminated);
        assert_eq!(assessment.decision, TransientDecision::Reject);
    }

    #[test]
    fn finalize_reports_sampling_context() {
        let mut engine = MetricsEngine::new(ScenePreset::Default);
        engine.record_detection_frame(100, 100, &[]);
        engine.record_segmentation_frame(100, 100, &[]);
        let assessment = engine.finalize(400, 2, 3);
        assert_eq!(assessment.frames_sampled, 1);
        assert_eq!(assessment.frames_total, 400);
        assert_eq!(assessment.sampling_rate_detection, 2);
        assert_eq!(assessment.sampling_rate_segmentation, 3);
        assert_eq!(assessment.decision, TransientDecision::Pass);
    }
}
