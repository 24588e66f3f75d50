// src/detection/detector.rs
//
// Uniform detect/segment facade over the ONNX vision models. Two
// concrete capabilities exist behind the `VisionBackend` seam: full
// (detection + instance segmentation) and degraded (detection with
// synthetic empty masks), chosen once at load time. Downstream code
// never branches on which one is live.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ort::{
    execution_providers::{ExecutionProviderDispatch, CUDA as CUDAExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::{class_name, Detection, FrameImage, SegInstance, CLASS_DOG, CLASS_PERSON};

const MODEL_INPUT_SIZE: usize = 640;
const MODEL_CLASSES: usize = 80;
const MASK_COEFFS: usize = 32;
const PROTO_SIZE: usize = 160;
const NMS_IOU_THRESHOLD: f32 = 0.45;
const MASK_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Detection model name or path; `.onnx` is appended when absent.
    pub model_name: String,
    pub confidence_threshold: f32,
    /// "cpu", "cuda", or a GPU index.
    pub device: String,
    pub batch_size_detection: usize,
    pub batch_size_segmentation: usize,
    /// Base URL for the one-shot segmentation model download; None
    /// disables the attempt.
    pub download_base_url: Option<String>,
}

impl DetectorConfig {
    pub fn from_config(c: &crate::config::DetectionConfig) -> Self {
        Self {
            model_name: c.model_name.clone(),
            confidence_threshold: c.confidence_threshold,
            device: c.device.clone(),
            batch_size_detection: c.batch_size_detection,
            batch_size_segmentation: c.batch_size_segmentation,
            download_base_url: std::env::var("MODEL_DOWNLOAD_BASE_URL").ok(),
        }
    }
}

/// Capability seam between the metrics side and the model runtime.
/// Implementations may serialize calls internally; callers treat both
/// methods as potentially expensive.
pub trait VisionBackend: Send {
    fn detect(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<Detection>>>;
    fn segment(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<SegInstance>>>;
    /// True when segmentation is synthesized from detection.
    fn degraded(&self) -> bool;
}

pub struct ObjectDetector {
    backend: Box<dyn VisionBackend>,
    pub batch_size_detection: usize,
    pub batch_size_segmentation: usize,
}

impl ObjectDetector {
    /// Startup sequence: the detection model must load or this fails;
    /// the segmentation model is best-effort with a single download
    /// attempt before falling back to degraded mode.
    pub fn load(config: &DetectorConfig) -> Result<Self> {
        let det_path = resolve_model_path(&config.model_name);
        let detection = OrtModel::load(&det_path, &config.device, config.confidence_threshold)
            .with_context(|| format!("loading detection model {}", det_path.display()))?;
        info!("Detection model ready: {}", det_path.display());

        let seg_path = segmentation_model_path(&det_path);
        let backend: Box<dyn VisionBackend> = match Self::load_segmentation(config, &seg_path) {
            Some(segmentation) => {
                info!("Segmentation model ready: {}", seg_path.display());
                Box::new(FullVision {
                    detection,
                    segmentation,
                })
            }
            None => {
                warn!(
                    "Segmentation model unavailable ({}), running detection-only",
                    seg_path.display()
                );
                Box::new(DegradedVision { detection })
            }
        };

        Ok(Self {
            backend,
            batch_size_detection: config.batch_size_detection.max(1),
            batch_size_segmentation: config.batch_size_segmentation.max(1),
        })
    }

    fn load_segmentation(config: &DetectorConfig, seg_path: &Path) -> Option<OrtModel> {
        if !seg_path.exists() {
            let base = config.download_base_url.as_deref()?;
            let name = seg_path.file_name()?.to_string_lossy().to_string();
            let url = format!("{}/{}", base.trim_end_matches('/'), name);
            info!("Fetching segmentation model from {url}");
            if let Err(e) = fetch_model(&url, seg_path) {
                warn!("Segmentation model download failed: {e}");
                return None;
            }
        }
        match OrtModel::load(seg_path, &config.device, config.confidence_threshold) {
            Ok(model) => Some(model),
            Err(e) => {
                warn!("Segmentation model failed to load: {e}");
                None
            }
        }
    }

    /// Test constructor: run the facade over an arbitrary backend.
    pub fn from_backend(
        backend: Box<dyn VisionBackend>,
        batch_size_detection: usize,
        batch_size_segmentation: usize,
    ) -> Self {
        Self {
            backend,
            batch_size_detection: batch_size_detection.max(1),
            batch_size_segmentation: batch_size_segmentation.max(1),
        }
    }

    pub fn degraded(&self) -> bool {
        self.backend.degraded()
    }

    pub fn detect(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<Detection>>> {
        self.backend.detect(frames)
    }

    pub fn segment(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<SegInstance>>> {
        self.backend.segment(frames)
    }
}

fn resolve_model_path(name: &str) -> PathBuf {
    if name.ends_with(".onnx") {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!("{name}.onnx"))
    }
}

/// Segmentation sibling by convention: `<stem>-seg.onnx`.
fn segmentation_model_path(det_path: &Path) -> PathBuf {
    let stem = det_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    det_path.with_file_name(format!("{stem}-seg.onnx"))
}

fn fetch_model(url: &str, dest: &Path) -> Result<()> {
    let response = reqwest::blocking::get(url)?.error_for_status()?;
    let bytes = response.bytes()?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, &bytes)?;
    Ok(())
}

// ============================================================================
// Backend variants
// ============================================================================

struct FullVision {
    detection: OrtModel,
    segmentation: OrtModel,
}

impl VisionBackend for FullVision {
    fn detect(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<Detection>>> {
        frames.iter().map(|f| self.detection.detect_one(f)).collect()
    }

    fn segment(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<SegInstance>>> {
        frames.iter().map(|f| self.segmentation.segment_one(f)).collect()
    }

    fn degraded(&self) -> bool {
        false
    }
}

struct DegradedVision {
    detection: OrtModel,
}

impl VisionBackend for DegradedVision {
    fn detect(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<Detection>>> {
        frames.iter().map(|f| self.detection.detect_one(f)).collect()
    }

    fn segment(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<SegInstance>>> {
        error!("segment() called in detection-only mode; returning empty masks");
        let detected = self.detect(frames)?;
        Ok(detected
            .into_iter()
            .map(|dets| dets.into_iter().map(SegInstance::from_detection).collect())
            .collect())
    }

    fn degraded(&self) -> bool {
        true
    }
}

// ============================================================================
// ONNX model wrapper
// ============================================================================

struct OrtModel {
    session: Session,
    confidence_threshold: f32,
}

impl OrtModel {
    fn load(path: &Path, device: &str, confidence_threshold: f32) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("model file not found: {}", path.display()));
        }
        let session: Session = (|| -> ort::Result<Session> {
            Session::builder()?
                .with_execution_providers(execution_providers(device))?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(4)?
                .commit_from_file(path)
        })()
        .map_err(|e| anyhow!(e.to_string()))?;
        Ok(Self {
            session,
            confidence_threshold,
        })
    }

    fn detect_one(&mut self, frame: &FrameImage) -> Result<Vec<Detection>> {
        let prep = letterbox(frame)?;
        let output = self.run_model(&prep.input)?;
        let rows = 4 + MODEL_CLASSES;
        let anchors = output.len() / rows;
        let detections = parse_predictions(
            &output,
            anchors,
            self.confidence_threshold,
            &prep,
            frame,
            None,
        );
        let kept = nms(detections, NMS_IOU_THRESHOLD);
        debug!("Frame {}: {} transient detections", frame.index, kept.len());
        Ok(kept.into_iter().map(|c| c.detection).collect())
    }

    fn segment_one(&mut self, frame: &FrameImage) -> Result<Vec<SegInstance>> {
        let prep = letterbox(frame)?;
        let (preds, protos) = self.run_seg_model(&prep.input)?;
        let rows = 4 + MODEL_CLASSES + MASK_COEFFS;
        let anchors = preds.len() / rows;
        let candidates = parse_predictions(
            &preds,
            anchors,
            self.confidence_threshold,
            &prep,
            frame,
            Some(MASK_COEFFS),
        );
        let kept = nms(candidates, NMS_IOU_THRESHOLD);

        let mut instances = Vec::with_capacity(kept.len());
        for candidate in kept {
            let instance = decode_mask(&candidate, &protos, &prep, frame);
            instances.push(instance);
        }
        Ok(instances)
    }

    fn run_model(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1usize, 3, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE];
        let value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs!["images" => value])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }

    fn run_seg_model(&mut self, input: &[f32]) -> Result<(Vec<f32>, Vec<f32>)> {
        let shape = [1usize, 3, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE];
        let value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs!["images" => value])?;
        let (_, preds) = outputs[0].try_extract_tensor::<f32>()?;
        let (_, protos) = outputs[1].try_extract_tensor::<f32>()?;
        Ok((preds.to_vec(), protos.to_vec()))
    }
}

fn execution_providers(device: &str) -> Vec<ExecutionProviderDispatch> {
    match device {
        "cpu" | "" => Vec::new(),
        "cuda" => vec![CUDAExecutionProvider::default().build()],
        other => match other.parse::<i32>() {
            Ok(idx) => vec![CUDAExecutionProvider::default().with_device_id(idx).build()],
            Err(_) => {
                warn!("Unknown device hint {other:?}, falling back to CPU");
                Vec::new()
            }
        },
    }
}

// ============================================================================
// Pre/post-processing
// ============================================================================

struct Letterboxed {
    input: Vec<f32>,
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Fit the frame into the square model input, preserving aspect ratio
/// and padding with neutral gray, then normalize HWC u8 to CHW f32.
fn letterbox(frame: &FrameImage) -> Result<Letterboxed> {
    let target = MODEL_INPUT_SIZE as u32;
    let scale = (target as f32 / frame.width as f32).min(target as f32 / frame.height as f32);
    let scaled_w = ((frame.width as f32 * scale) as u32).max(1);
    let scaled_h = ((frame.height as f32 * scale) as u32).max(1);
    let pad_x = (target - scaled_w) as f32 / 2.0;
    let pad_y = (target - scaled_h) as f32 / 2.0;

    let src = RgbImage::from_raw(frame.width as u32, frame.height as u32, frame.data.clone())
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    let resized =
        image::imageops::resize(&src, scaled_w, scaled_h, image::imageops::FilterType::Triangle);

    let mut canvas = vec![114u8; (target * target * 3) as usize];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let dst_x = x + pad_x as u32;
        let dst_y = y + pad_y as u32;
        let idx = ((dst_y * target + dst_x) * 3) as usize;
        canvas[idx..idx + 3].copy_from_slice(&pixel.0);
    }

    let size = MODEL_INPUT_SIZE;
    let mut input = vec![0.0f32; 3 * size * size];
    for c in 0..3 {
        for h in 0..size {
            for w in 0..size {
                let hwc = (h * size + w) * 3 + c;
                input[c * size * size + h * size + w] = canvas[hwc] as f32 / 255.0;
            }
        }
    }

    Ok(Letterboxed {
        input,
        scale,
        pad_x,
        pad_y,
    })
}

struct Candidate {
    detection: Detection,
    /// Mask coefficients for segmentation outputs.
    coeffs: Vec<f32>,
    /// Bbox in letterbox coordinates, kept for mask cropping.
    letterbox_bbox: [f32; 4],
}

/// Shared parser for the detection head: `[cx cy w h | class scores |
/// optional mask coeffs]` per anchor, transposed anchor-major. Only
/// person and dog survive.
fn parse_predictions(
    output: &[f32],
    anchors: usize,
    conf_threshold: f32,
    prep: &Letterboxed,
    frame: &FrameImage,
    mask_coeffs: Option<usize>,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let at = |row: usize, anchor: usize| output[row * anchors + anchor];

    for i in 0..anchors {
        let mut best_conf = 0.0f32;
        let mut best_class = 0usize;
        for c in 0..MODEL_CLASSES {
            let conf = at(4 + c, i);
            if conf > best_conf {
                best_conf = conf;
                best_class = c;
            }
        }
        if best_conf < conf_threshold || (best_class != CLASS_PERSON && best_class != CLASS_DOG) {
            continue;
        }

        let cx = at(0, i);
        let cy = at(1, i);
        let w = at(2, i);
        let h = at(3, i);
        let letterbox_bbox = [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0];

        // Undo the letterbox transform and clamp to the source frame.
        let unmap_x = |x: f32| ((x - prep.pad_x) / prep.scale).clamp(0.0, frame.width as f32);
        let unmap_y = |y: f32| ((y - prep.pad_y) / prep.scale).clamp(0.0, frame.height as f32);
        let bbox = [
            unmap_x(letterbox_bbox[0]),
            unmap_y(letterbox_bbox[1]),
            unmap_x(letterbox_bbox[2]),
            unmap_y(letterbox_bbox[3]),
        ];

        let coeffs = match mask_coeffs {
            Some(n) => (0..n).map(|k| at(4 + MODEL_CLASSES + k, i)).collect(),
            None => Vec::new(),
        };

        candidates.push(Candidate {
            detection: Detection {
                bbox,
                confidence: best_conf,
                class_id: best_class,
                class_name: class_name(best_class),
            },
            coeffs,
            letterbox_bbox,
        });
    }
    candidates
}

fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.detection
            .confidence
            .partial_cmp(&a.detection.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Candidate> = Vec::new();
    'outer: for candidate in candidates {
        for existing in &kept {
            if iou(&existing.detection.bbox, &candidate.detection.bbox) >= iou_threshold {
                continue 'outer;
            }
        }
        kept.push(candidate);
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Combine the anchor's mask coefficients with the prototype masks,
/// threshold, and crop to the detection box. Proto space is the
/// letterbox at quarter resolution.
fn decode_mask(
    candidate: &Candidate,
    protos: &[f32],
    prep: &Letterboxed,
    frame: &FrameImage,
) -> SegInstance {
    let proto_px = PROTO_SIZE * PROTO_SIZE;
    if protos.len() < MASK_COEFFS * proto_px || candidate.coeffs.len() != MASK_COEFFS {
        return SegInstance::from_detection(candidate.detection.clone());
    }

    let downscale = MODEL_INPUT_SIZE as f32 / PROTO_SIZE as f32;
    let bx0 = (candidate.letterbox_bbox[0] / downscale).floor().max(0.0) as usize;
    let by0 = (candidate.letterbox_bbox[1] / downscale).floor().max(0.0) as usize;
    let bx1 = ((candidate.letterbox_bbox[2] / downscale).ceil() as usize).min(PROTO_SIZE);
    let by1 = ((candidate.letterbox_bbox[3] / downscale).ceil() as usize).min(PROTO_SIZE);

    let mut count = 0usize;
    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    for py in by0..by1 {
        for px in bx0..bx1 {
            let mut logit = 0.0f32;
            for k in 0..MASK_COEFFS {
                logit += candidate.coeffs[k] * protos[k * proto_px + py * PROTO_SIZE + px];
            }
            let prob = 1.0 / (1.0 + (-logit).exp());
            if prob > MASK_THRESHOLD {
                count += 1;
                // Back through proto -> letterbox -> source coordinates.
                let lx = (px as f32 + 0.5) * downscale;
                let ly = (py as f32 + 0.5) * downscale;
                sum_x += ((lx - prep.pad_x) / prep.scale) as f64;
                sum_y += ((ly - prep.pad_y) / prep.scale) as f64;
            }
        }
    }

    if count == 0 {
        return SegInstance::from_detection(candidate.detection.clone());
    }

    // Each proto cell covers downscale^2 letterbox pixels; dividing by
    // scale^2 converts to source-image pixels.
    let cell_area = (downscale / prep.scale).powi(2);
    let mask_area = (count as f32 * cell_area)
        .min(frame.width as f32 * frame.height as f32);
    SegInstance {
        detection: candidate.detection.clone(),
        has_mask: true,
        mask_area,
        mask_center: (
            (sum_x / count as f64) as f32,
            (sum_y / count as f64) as f32,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: usize, bbox: [f32; 4], confidence: f32) -> Detection {
        Detection {
            bbox,
            confidence,
            class_id,
            class_name: class_name(class_id),
        }
    }

    fn candidate(d: Detection) -> Candidate {
        Candidate {
            letterbox_bbox: d.bbox,
            detection: d,
            coeffs: Vec::new(),
        }
    }

    #[test]
    fn nms_suppresses_overlapping_lower_confidence() {
        let kept = nms(
            vec![
                candidate(det(CLASS_PERSON, [0.0, 0.0, 10.0, 10.0], 0.9)),
                candidate(det(CLASS_PERSON, [1.0, 1.0, 11.0, 11.0], 0.5)),
                candidate(det(CLASS_DOG, [100.0, 100.0, 120.0, 120.0], 0.7)),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].detection.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(
            iou(&[0.0, 0.0, 1.0, 1.0], &[5.0, 5.0, 6.0, 6.0]),
            0.0
        );
    }

    #[test]
    fn letterbox_preserves_aspect_ratio() {
        let frame = FrameImage {
            data: vec![0; 320 * 240 * 3],
            width: 320,
            height: 240,
            index: 0,
        };
        let prep = letterbox(&frame).unwrap();
        assert!((prep.scale - 2.0).abs() < 1e-6);
        assert_eq!(prep.pad_x, 0.0);
        assert!((prep.pad_y - 80.0).abs() < 1.0);
        assert_eq!(prep.input.len(), 3 * 640 * 640);
    }

    #[test]
    fn degraded_backend_synthesizes_empty_masks() {
        struct FakeDet;
        impl VisionBackend for FakeDet {
            fn detect(&mut self, frames: &[FrameImage]) -> Result<Vec<Vec<Detection>>> {
                Ok(frames
                    .iter()
                    .map(|_| vec![det(CLASS_PERSON, [0.0, 0.0, 10.0, 10.0], 0.8)])
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
                true
            }
        }

        let mut facade = ObjectDetector::from_backend(Box::new(FakeDet), 16, 8);
        let frame = FrameImage {
            data: vec![0; 12],
            width: 2,
            height: 2,
            index: 0,
        };
        let masks = facade.segment(&[frame]).unwrap();
        assert_eq!(masks.len(), 1);
        assert!(!masks[0][0].has_mask);
        assert_eq!(masks[0][0].mask_area, 0.0);
        assert!(facade.degraded());
    }
}
