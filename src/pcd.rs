// src/pcd.rs
//
// Preview point-cloud scale probe. Parses a PCD v0.7 header (ascii or
// uncompressed little-endian binary), scans up to PARSE_POINT_CAP points
// and classifies the XYZ bounding box. Probe failures degrade to a
// warning-grade status, never an error that fails validation.

use crate::types::PcdScale;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Bounding-box scan stops after this many points.
const PARSE_POINT_CAP: usize = 100_000;

const OPTIMAL_MIN_M: f64 = 50.0;
const OPTIMAL_MAX_M: f64 = 200.0;
const NARROW_MIN_M: f64 = 25.0;
const SMALL_MIN_M: f64 = 10.0;
const LARGE_MAX_M: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataKind {
    Ascii,
    Binary,
    BinaryCompressed,
}

#[derive(Debug)]
struct PcdHeader {
    fields: Vec<String>,
    sizes: Vec<usize>,
    types: Vec<char>,
    counts: Vec<usize>,
    points: usize,
    data: DataKind,
    /// Byte offset where point data starts (binary only).
    data_offset: usize,
}

pub fn probe(path: &Path) -> PcdScale {
    if !path.exists() {
        return not_found(path);
    }
    match probe_inner(path) {
        Ok(scale) => scale,
        Err(reason) => {
            warn!("PCD probe failed for {}: {}", path.display(), reason);
            PcdScale {
                status: "error".into(),
                width_m: 0.0,
                height_m: 0.0,
                depth_m: 0.0,
                area_sqm: 0.0,
                points_parsed: 0,
                error: Some(reason),
            }
        }
    }
}

fn not_found(path: &Path) -> PcdScale {
    PcdScale {
        status: "not_found".into(),
        width_m: 0.0,
        height_m: 0.0,
        depth_m: 0.0,
        area_sqm: 0.0,
        points_parsed: 0,
        error: Some(format!("{} not found", path.display())),
    }
}

fn probe_inner(path: &Path) -> Result<PcdScale, String> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| format!("read failed: {e}"))?;

    let header = parse_header(&bytes)?;
    if header.data == DataKind::BinaryCompressed {
        return Err("binary_compressed PCD data is not supported".into());
    }

    let (xi, yi, zi) = xyz_indices(&header)?;
    let cap = header.points.min(PARSE_POINT_CAP);

    let mut bbox = BoundingBox::new();
    let parsed = match header.data {
        DataKind::Ascii => scan_ascii(&bytes[header.data_offset..], xi, yi, zi, cap, &mut bbox),
        DataKind::Binary => scan_binary(&bytes[header.data_offset..], &header, xi, yi, zi, cap, &mut bbox)?,
        DataKind::BinaryCompressed => unreachable!(),
    };

    if parsed == 0 {
        return Err("no parseable points".into());
    }

    let width = (bbox.max[0] - bbox.min[0]) as f64;
    let height = (bbox.max[1] - bbox.min[1]) as f64;
    let depth = (bbox.max[2] - bbox.min[2]) as f64;
    let status = classify(width, height);
    debug!(
        "PCD scale: {:.1}x{:.1}x{:.1} m over {} points -> {}",
        width, height, depth, parsed, status
    );

    Ok(PcdScale {
        status,
        width_m: width,
        height_m: height,
        depth_m: depth,
        area_sqm: width * height,
        points_parsed: parsed,
        error: None,
    })
}

/// Horizontal-footprint classification. The max dimension drives the
/// coarse buckets; the narrow check fires when one side is under 25 m
/// while the other sits in the optimal band.
fn classify(width: f64, height: f64) -> String {
    let max_dim = width.max(height);
    let min_dim = width.min(height);

    if max_dim < SMALL_MIN_M {
        return "error_too_small".into();
    }
    if max_dim > LARGE_MAX_M {
        return "error_too_large".into();
    }
    if min_dim < NARROW_MIN_M && (OPTIMAL_MIN_M..=OPTIMAL_MAX_M).contains(&max_dim) {
        return "warning_narrow".into();
    }
    if (OPTIMAL_MIN_M..=OPTIMAL_MAX_M).contains(&min_dim)
        && (OPTIMAL_MIN_M..=OPTIMAL_MAX_M).contains(&max_dim)
    {
        return "optimal".into();
    }
    if max_dim > OPTIMAL_MAX_M {
        "warning_large".into()
    } else {
        "warning_small".into()
    }
}

fn parse_header(bytes: &[u8]) -> Result<PcdHeader, String> {
    let mut fields = Vec::new();
    let mut sizes = Vec::new();
    let mut types = Vec::new();
    let mut counts = Vec::new();
    let mut width = 0usize;
    let mut height = 1usize;
    let mut points = None;
    let mut data = None;

    let mut offset = 0usize;
    while offset < bytes.len() {
        let end = bytes[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| offset + p)
            .unwrap_or(bytes.len());
        let line = String::from_utf8_lossy(&bytes[offset..end]);
        let line = line.trim();
        offset = end + 1;

        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or("");
        match key {
            "VERSION" => {}
            "FIELDS" => fields = parts.map(|s| s.to_ascii_lowercase()).collect(),
            "SIZE" => {
                sizes = parts
                    .map(|s| s.parse().map_err(|_| format!("bad SIZE entry {s}")))
                    .collect::<Result<_, _>>()?
            }
            "TYPE" => types = parts.filter_map(|s| s.chars().next()).collect(),
            "COUNT" => {
                counts = parts
                    .map(|s| s.parse().map_err(|_| format!("bad COUNT entry {s}")))
                    .collect::<Result<_, _>>()?
            }
            "WIDTH" => width = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0),
            "HEIGHT" => height = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1),
            "VIEWPOINT" => {}
            "POINTS" => points = parts.next().and_then(|s| s.parse().ok()),
            "DATA" => {
                data = Some(match parts.next() {
                    Some("ascii") => DataKind::Ascii,
                    Some("binary") => DataKind::Binary,
                    Some("binary_compressed") => DataKind::BinaryCompressed,
                    other => return Err(format!("unknown DATA kind {other:?}")),
                });
                // Point data starts on the next line.
                return finish_header(
                    fields,
                    sizes,
                    types,
                    counts,
                    width,
                    height,
                    points,
                    data,
                    offset.min(bytes.len()),
                );
            }
            _ => {}
        }
    }
    Err("truncated header: no DATA line".into())
}

#[allow(clippy::too_many_arguments)]
fn finish_header(
    fields: Vec<String>,
    sizes: Vec<usize>,
    types: Vec<char>,
    counts: Vec<usize>,
    width: usize,
    height: usize,
    points: Option<usize>,
    data: Option<DataKind>,
    data_offset: usize,
) -> Result<PcdHeader, String> {
    if fields.is_empty() {
        return Err("header has no FIELDS".into());
    }
    let counts = if counts.is_empty() {
        vec![1; fields.len()]
    } else {
        counts
    };
    if sizes.len() != fields.len() || types.len() != fields.len() || counts.len() != fields.len() {
        return Err("FIELDS/SIZE/TYPE/COUNT lengths disagree".into());
    }
    let points = points.unwrap_or(width * height);
    Ok(PcdHeader {
        fields,
        sizes,
        types,
        counts,
        points,
        data: data.unwrap(),
        data_offset,
    })
}

fn xyz_indices(header: &PcdHeader) -> Result<(usize, usize, usize), String> {
    let find = |name: &str| {
        header
            .fields
            .iter()
            .position(|f| f == name)
            .ok_or_else(|| format!("header missing {name} field"))
    };
    Ok((find("x")?, find("y")?, find("z")?))
}

struct BoundingBox {
    min: [f32; 3],
    max: [f32; 3],
}

impl BoundingBox {
    fn new() -> Self {
        Self {
            min: [f32::MAX; 3],
            max: [f32::MIN; 3],
        }
    }

    fn update(&mut self, x: f32, y: f32, z: f32) {
        for (i, v) in [x, y, z].into_iter().enumerate() {
            if v.is_finite() {
                self.min[i] = self.min[i].min(v);
                self.max[i] = self.max[i].max(v);
            }
        }
    }
}

fn scan_ascii(
    body: &[u8],
    xi: usize,
    yi: usize,
    zi: usize,
    cap: usize,
    bbox: &mut BoundingBox,
) -> usize {
    let text = String::from_utf8_lossy(body);
    let mut parsed = 0;
    for line in text.lines() {
        if parsed >= cap {
            break;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        let max_idx = xi.max(yi).max(zi);
        if cols.len() <= max_idx {
            continue;
        }
        let (x, y, z) = match (
            cols[xi].parse::<f32>(),
            cols[yi].parse::<f32>(),
            cols[zi].parse::<f32>(),
        ) {
            (Ok(x), Ok(y), Ok(z)) => (x, y, z),
            _ => continue,
        };
        bbox.update(x, y, z);
        parsed += 1;
    }
    parsed
}

fn scan_binary(
    body: &[u8],
    header: &PcdHeader,
    xi: usize,
    yi: usize,
    zi: usize,
    cap: usize,
    bbox: &mut BoundingBox,
) -> Result<usize, String> {
    // Byte offset of each field within a point record.
    let mut offsets = Vec::with_capacity(header.fields.len());
    let mut stride = 0usize;
    for i in 0..header.fields.len() {
        offsets.push(stride);
        stride += header.sizes[i] * header.counts[i];
    }
    if stride == 0 {
        return Err("zero-stride point record".into());
    }
    for &i in &[xi, yi, zi] {
        if header.types[i] != 'F' || header.sizes[i] != 4 {
            return Err(format!(
                "field {} is not a 32-bit float (TYPE {} SIZE {})",
                header.fields[i], header.types[i], header.sizes[i]
            ));
        }
    }

    let available = body.len() / stride;
    let n = available.min(cap);
    let mut parsed = 0;
    for p in 0..n {
        let base = p * stride;
        let read_f32 = |off: usize| {
            let s = &body[base + off..base + off + 4];
            f32::from_le_bytes([s[0], s[1], s[2], s[3]])
        };
        bbox.update(read_f32(offsets[xi]), read_f32(offsets[yi]), read_f32(offsets[zi]));
        parsed += 1;
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_ascii_pcd(dir: &Path, points: &[(f32, f32, f32)]) -> std::path::PathBuf {
        let path = dir.join("Preview.pcd");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# .PCD v0.7 - Point Cloud Data file format").unwrap();
        writeln!(f, "VERSION 0.7").unwrap();
        writeln!(f, "FIELDS x y z").unwrap();
        writeln!(f, "SIZE 4 4 4").unwrap();
        writeln!(f, "TYPE F F F").unwrap();
        writeln!(f, "COUNT 1 1 1").unwrap();
        writeln!(f, "WIDTH {}", points.len()).unwrap();
        writeln!(f, "HEIGHT 1").unwrap();
        writeln!(f, "VIEWPOINT 0 0 0 1 0 0 0").unwrap();
        writeln!(f, "POINTS {}", points.len()).unwrap();
        writeln!(f, "DATA ascii").unwrap();
        for (x, y, z) in points {
            writeln!(f, "{x} {y} {z}").unwrap();
        }
        path
    }

    fn write_binary_pcd(dir: &Path, points: &[(f32, f32, f32)]) -> std::path::PathBuf {
        let path = dir.join("Preview.pcd");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            "VERSION 0.7\nFIELDS x y z\nSIZE 4 4 4\nTYPE F F F\nCOUNT 1 1 1\n\
             WIDTH {n}\nHEIGHT 1\nVIEWPOINT 0 0 0 1 0 0 0\nPOINTS {n}\nDATA binary\n",
            n = points.len()
        )
        .unwrap();
        for (x, y, z) in points {
            f.write_all(&x.to_le_bytes()).unwrap();
            f.write_all(&y.to_le_bytes()).unwrap();
            f.write_all(&z.to_le_bytes()).unwrap();
        }
        path
    }

    #[test]
    fn ascii_bbox_optimal() {
        let dir = tempdir().unwrap();
        let path = write_ascii_pcd(dir.path(), &[(0.0, 0.0, 0.0), (100.0, 80.0, 5.0)]);
        let scale = probe(&path);
        assert_eq!(scale.status, "optimal");
        assert!((scale.width_m - 100.0).abs() < 1e-6);
        assert!((scale.height_m - 80.0).abs() < 1e-6);
        assert_eq!(scale.points_parsed, 2);
    }

    #[test]
    fn tiny_cloud_is_error_too_small() {
        let dir = tempdir().unwrap();
        let path = write_ascii_pcd(dir.path(), &[(0.0, 0.0, 0.0), (8.0, 5.0, 1.0)]);
        assert_eq!(probe(&path).status, "error_too_small");
    }

    #[test]
    fn narrow_corridor_flagged() {
        let dir = tempdir().unwrap();
        let path = write_ascii_pcd(dir.path(), &[(0.0, 0.0, 0.0), (120.0, 10.0, 3.0)]);
        assert_eq!(probe(&path).status, "warning_narrow");
    }

    #[test]
    fn huge_extent_is_error_too_large() {
        let dir = tempdir().unwrap();
        let path = write_ascii_pcd(dir.path(), &[(0.0, 0.0, 0.0), (600.0, 100.0, 3.0)]);
        assert_eq!(probe(&path).status, "error_too_large");
    }

    #[test]
    fn binary_le_floats_parse() {
        let dir = tempdir().unwrap();
        let path = write_binary_pcd(dir.path(), &[(-30.0, -20.0, 0.0), (30.0, 40.0, 8.0)]);
        let scale = probe(&path);
        assert_eq!(scale.status, "optimal");
        assert!((scale.width_m - 60.0).abs() < 1e-6);
        assert!((scale.height_m - 60.0).abs() < 1e-6);
        assert_eq!(scale.points_parsed, 2);
    }

    #[test]
    fn compressed_binary_degrades_to_error_status() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Preview.pcd");
        std::fs::write(
            &path,
            "VERSION 0.7\nFIELDS x y z\nSIZE 4 4 4\nTYPE F F F\nCOUNT 1 1 1\n\
             WIDTH 1\nHEIGHT 1\nPOINTS 1\nDATA binary_compressed\n",
        )
        .unwrap();
        let scale = probe(&path);
        assert_eq!(scale.status, "error");
        assert!(scale.error.unwrap().contains("binary_compressed"));
    }

    #[test]
    fn missing_file_reports_not_found() {
        let dir = tempdir().unwrap();
        assert_eq!(probe(&dir.path().join("nope.pcd")).status, "not_found");
    }
}
