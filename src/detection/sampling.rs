// src/detection/sampling.rs
//
// Chooses how densely the camera sequence is sampled for detection and
// segmentation. Deterministic: the same frame count always produces the
// same plan.

use tracing::debug;

/// Nominal frame budgets; the plan never exceeds what the strides yield.
pub const TARGET_DETECTION_FRAMES: usize = 200;
pub const TARGET_SEGMENTATION_FRAMES: usize = 100;

#[derive(Debug, Clone)]
pub struct SamplingPlan {
    pub detection_stride: usize,
    pub segmentation_stride: usize,
    pub detection_indices: Vec<usize>,
    pub segmentation_indices: Vec<usize>,
    pub total_frames: usize,
}

impl SamplingPlan {
    /// Stride table: short sequences are sampled densely, long ones
    /// thinned. Segmentation is strictly at most as dense as detection.
    pub fn for_frames(total_frames: usize) -> Self {
        Self::with_targets(
            total_frames,
            TARGET_DETECTION_FRAMES,
            TARGET_SEGMENTATION_FRAMES,
        )
    }

    pub fn with_targets(
        total_frames: usize,
        target_detection: usize,
        target_segmentation: usize,
    ) -> Self {
        let detection_stride: usize = match total_frames {
            0..=200 => 1,
            201..=500 => 2,
            501..=1000 => 4,
            _ => 6,
        };
        let segmentation_stride =
            detection_stride.max((detection_stride * 3).div_ceil(2));

        let detection_raw: Vec<usize> =
            (0..total_frames).step_by(detection_stride).collect();
        // Segmentation frames must be a subset of detection frames so a
        // sampled frame is never segmented without having been detected.
        let segmentation_raw: Vec<usize> = (0..total_frames)
            .step_by(segmentation_stride)
            .filter(|i| i % detection_stride == 0)
            .collect();

        let detection_indices = thin_to(detection_raw, target_detection);
        let segmentation_indices = thin_to(segmentation_raw, target_segmentation);

        debug!(
            "Sampling plan for {} frames: stride d={} s={}, {} detection / {} segmentation frames",
            total_frames,
            detection_stride,
            segmentation_stride,
            detection_indices.len(),
            segmentation_indices.len()
        );

        Self {
            detection_stride,
            segmentation_stride,
            detection_indices,
            segmentation_indices,
            total_frames,
        }
    }

    pub fn frames_planned(&self) -> usize {
        self.detection_indices.len()
    }
}

/// Uniformly thin a sorted index list down to at most `target` entries.
fn thin_to(indices: Vec<usize>, target: usize) -> Vec<usize> {
    if target == 0 || indices.len() <= target {
        return indices;
    }
    let keep_every = indices.len().div_ceil(target);
    indices.into_iter().step_by(keep_every).collect()
}
