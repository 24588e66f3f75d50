// src/metadata.rs
//
// Recording-descriptor probe. Reads `metadata.yaml` for start time,
// duration and location, and `info/device_info.json` for the device
// identity. Parsing problems surface as issues on the caller's ledger,
// never as panics.

use crate::types::{DeviceIdentity, GeoLocation};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationStatus {
    Optimal,
    WarningShort,
    WarningLong,
    ErrorTooShort,
    ErrorTooLong,
}

impl DurationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationStatus::Optimal => "optimal",
            DurationStatus::WarningShort => "warning_short",
            DurationStatus::WarningLong => "warning_long",
            DurationStatus::ErrorTooShort => "error_too_short",
            DurationStatus::ErrorTooLong => "error_too_long",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, DurationStatus::ErrorTooShort | DurationStatus::ErrorTooLong)
    }
}

/// Recording length buckets, in seconds.
pub fn classify_duration(seconds: u64) -> DurationStatus {
    match seconds {
        s if s < 180 => DurationStatus::ErrorTooShort,
        s if s < 270 => DurationStatus::WarningShort,
        s if s <= 420 => DurationStatus::Optimal,
        s if s <= 540 => DurationStatus::WarningLong,
        _ => DurationStatus::ErrorTooLong,
    }
}

/// Accepts `HH:MM:SS`, `MM:SS`, or a bare seconds count.
pub fn parse_duration_seconds(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.contains(':') {
        let parts: Vec<&str> = raw.split(':').collect();
        let nums: Option<Vec<u64>> = parts.iter().map(|p| p.trim().parse().ok()).collect();
        return match nums?.as_slice() {
            [h, m, s] => Some(h * 3600 + m * 60 + s),
            [m, s] => Some(m * 60 + s),
            _ => None,
        };
    }
    raw.parse::<f64>().ok().map(|s| s.max(0.0).round() as u64)
}

#[derive(Debug, Default, Deserialize)]
struct RecordSection {
    start_time: Option<serde_yaml::Value>,
    duration: Option<serde_yaml::Value>,
    location: Option<LocationSection>,
}

#[derive(Debug, Default, Deserialize)]
struct LocationSection {
    lat: Option<serde_yaml::Value>,
    lon: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct MetadataYaml {
    record: Option<RecordSection>,
}

/// Everything the recording descriptor yields; each field is independent
/// so one bad value does not lose the rest.
#[derive(Debug, Default)]
pub struct RecordingInfo {
    pub start_time: Option<String>,
    pub duration_raw: Option<String>,
    pub duration_seconds: Option<u64>,
    pub duration_status: Option<DurationStatus>,
    pub location: Option<GeoLocation>,
    pub missing_fields: Vec<&'static str>,
    pub parse_error: Option<String>,
}

pub fn probe_recording(metadata_yaml: &Path) -> RecordingInfo {
    let mut out = RecordingInfo::default();

    let text = match std::fs::read_to_string(metadata_yaml) {
        Ok(t) => t,
        Err(e) => {
            out.parse_error = Some(format!("cannot read metadata.yaml: {e}"));
            return out;
        }
    };
    let parsed: MetadataYaml = match serde_yaml::from_str(&text) {
        Ok(p) => p,
        Err(e) => {
            out.parse_error = Some(format!("metadata.yaml is not valid YAML: {e}"));
            return out;
        }
    };
    let record = match parsed.record {
        Some(r) => r,
        None => {
            out.missing_fields
                .extend(["record.start_time", "record.duration"]);
            return out;
        }
    };

    match record.start_time.as_ref().map(yaml_to_string) {
        Some(s) if !s.is_empty() => {
            debug!("Extracted start_time: {s}");
            out.start_time = Some(s);
        }
        _ => out.missing_fields.push("record.start_time"),
    }

    match record.duration.as_ref().map(yaml_to_string) {
        Some(raw) if !raw.is_empty() => {
            out.duration_raw = Some(raw.clone());
            if let Some(seconds) = parse_duration_seconds(&raw) {
                let status = classify_duration(seconds);
                info!(
                    "Recording duration {:.1} min -> {}",
                    seconds as f64 / 60.0,
                    status.as_str()
                );
                out.duration_seconds = Some(seconds);
                out.duration_status = Some(status);
            } else {
                out.parse_error = Some(format!("unparseable duration: {raw}"));
            }
        }
        _ => out.missing_fields.push("record.duration"),
    }

    if let Some(loc) = record.location {
        let lat = loc.lat.as_ref().map(yaml_to_string).unwrap_or_default();
        let lon = loc.lon.as_ref().map(yaml_to_string).unwrap_or_default();
        if !lat.is_empty() && !lon.is_empty() && lat != "null" && lon != "null" {
            out.location = Some(GeoLocation {
                lat: clean_degrees(&lat),
                lon: clean_degrees(&lon),
            });
        }
    }

    out
}

/// Degree symbols arrive double-encoded from some firmware revisions.
fn clean_degrees(s: &str) -> String {
    s.replace("\u{00B0}\u{00B0}", "\u{00B0}")
}

fn yaml_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

#[derive(Debug, Deserialize)]
struct DeviceInfoJson {
    #[serde(default)]
    model: Option<String>,
    #[serde(default, rename = "SN")]
    sn: Option<String>,
}

/// Device id is `"{model}-{SN}"` when both are present; partial identity
/// is reported with whatever half exists so the sheet still shows it.
pub fn probe_device(device_info_json: &Path) -> Result<DeviceIdentity, String> {
    let text = std::fs::read_to_string(device_info_json)
        .map_err(|e| format!("cannot read device_info.json: {e}"))?;
    let parsed: DeviceInfoJson =
        serde_json::from_str(&text).map_err(|e| format!("device_info.json parse error: {e}"))?;

    let model = parsed.model.filter(|m| !m.is_empty());
    let sn = parsed.sn.filter(|s| !s.is_empty());
    let id = match (&model, &sn) {
        (Some(m), Some(s)) => Some(format!("{m}-{s}")),
        (Some(m), None) => Some(m.clone()),
        (None, Some(s)) => Some(s.clone()),
        (None, None) => None,
    };
    Ok(DeviceIdentity { model, sn, id })
}
