// src/detection/region.rs
//
// Spatial weight map over the normalized image plane. Obstacles close to
// the capturer (lower-center of the frame) matter most for
// reconstruction quality; the map weights detections accordingly and
// decays toward the corners.

const GRID_W: usize = 16;
const GRID_H: usize = 16;

/// Anchor of the high-weight zone in normalized (u, v); v grows downward.
const ANCHOR_U: f64 = 0.5;
const ANCHOR_V: f64 = 0.85;

/// Ring radii and raw weights, before normalization. Inherited from the
/// tuned core/middle/edge split of the capture-quality model.
const CORE_RADIUS: f64 = 0.35;
const MIDDLE_RADIUS: f64 = 0.65;
const CORE_WEIGHT: f64 = 3.0;
const MIDDLE_WEIGHT: f64 = 1.5;
const EDGE_WEIGHT: f64 = 0.5;

/// Immutable after construction; the detector side reads it only.
#[derive(Debug, Clone)]
pub struct RegionWeightMap {
    cells: Vec<f64>,
}

impl Default for RegionWeightMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionWeightMap {
    pub fn new() -> Self {
        let mut cells = vec![0.0; GRID_W * GRID_H];
        for row in 0..GRID_H {
            for col in 0..GRID_W {
                let u = (col as f64 + 0.5) / GRID_W as f64;
                let v = (row as f64 + 0.5) / GRID_H as f64;
                cells[row * GRID_W + col] = raw_weight(u, v);
            }
        }

        // Normalize so a uniform field averages to 1: a detection in an
        // "average" location contributes exactly its unweighted value.
        let mean = cells.iter().sum::<f64>() / cells.len() as f64;
        for cell in &mut cells {
            *cell /= mean;
        }
        Self { cells }
    }

    /// Weight at normalized coordinates; inputs outside [0, 1] clamp to
    /// the border cells.
    pub fn weight_at(&self, u: f64, v: f64) -> f64 {
        let col = ((u.clamp(0.0, 1.0) * GRID_W as f64) as usize).min(GRID_W - 1);
        let row = ((v.clamp(0.0, 1.0) * GRID_H as f64) as usize).min(GRID_H - 1);
        self.cells[row * GRID_W + col]
    }

    /// Weight for a point in pixel coordinates.
    pub fn weight_at_px(&self, x: f32, y: f32, width: usize, height: usize) -> f64 {
        if width == 0 || height == 0 {
            return 0.0;
        }
        self.weight_at(x as f64 / width as f64, y as f64 / height as f64)
    }
}

fn raw_weight(u: f64, v: f64) -> f64 {
    let d = ((u - ANCHOR_U).powi(2) + (v - ANCHOR_V).powi(2)).sqrt();
    if d <= CORE_RADIUS {
        CORE_WEIGHT
    } else if d <= MIDDLE_RADIUS {
        MIDDLE_WEIGHT
    } else {
        EDGE_WEIGHT
    }
}
