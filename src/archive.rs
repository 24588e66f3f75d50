// src/archive.rs
//
// Archive inspection and extraction. Format identification goes by magic
// bytes first and extension second; decompression backends are pluggable
// so formats this build does not carry (rar, 7z) fail cleanly with
// UnknownFormat instead of dragging in native libraries.

use crate::types::{ArchiveFormat, ExtractedPackage};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("unknown or unsupported archive format: {0}")]
    UnknownFormat(String),
    #[error("archive is corrupt: {0}")]
    Corrupt(String),
    #[error("archive requires a password and no candidate matched")]
    PasswordRequired,
    #[error("archive is {actual_mb} MiB, over the {limit_mb} MiB pre-extraction limit")]
    OversizedBefore { actual_mb: u64, limit_mb: u64 },
    #[error("extracted contents are {actual_gib:.2} GiB, outside the acceptable window [{min_gib:.1}, {max_gib:.1}] GiB")]
    OversizedAfter {
        actual_gib: f64,
        min_gib: f64,
        max_gib: f64,
    },
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracted-size gates, in bytes. Outside `acceptable` is an error;
/// inside `acceptable` but outside `optimal` is a warning.
#[derive(Debug, Clone, Copy)]
pub struct SizeWindow {
    pub acceptable_min: u64,
    pub optimal_min: u64,
    pub optimal_max: u64,
    pub acceptable_max: u64,
}

impl Default for SizeWindow {
    fn default() -> Self {
        const GIB: u64 = 1024 * 1024 * 1024;
        Self {
            acceptable_min: GIB / 2,
            optimal_min: GIB * 8 / 10,
            optimal_max: GIB * 35 / 10,
            acceptable_max: GIB * 6,
        }
    }
}

impl SizeWindow {
    pub fn status(&self, total_bytes: u64) -> &'static str {
        if total_bytes < self.acceptable_min || total_bytes > self.acceptable_max {
            "error"
        } else if total_bytes < self.optimal_min || total_bytes > self.optimal_max {
            "warning"
        } else {
            "optimal"
        }
    }
}

/// Result of a successful inspection. The size warning (if any) rides
/// alongside the package because the package itself is immutable.
#[derive(Debug)]
pub struct Inspection {
    pub package: ExtractedPackage,
    pub size_status: &'static str,
    pub size_warning: Option<String>,
}

// ============================================================================
// Format detection
// ============================================================================

pub fn detect_format(path: &Path) -> std::io::Result<Option<ArchiveFormat>> {
    let mut head = [0u8; 512];
    let read = {
        let mut f = std::fs::File::open(path)?;
        let mut total = 0;
        while total < head.len() {
            let n = f.read(&mut head[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    };

    let by_magic = if read >= 4 && (&head[..4] == b"PK\x03\x04" || &head[..4] == b"PK\x05\x06") {
        Some(ArchiveFormat::Zip)
    } else if read >= 6 && &head[..6] == b"Rar!\x1a\x07" {
        Some(ArchiveFormat::Rar)
    } else if read >= 6 && &head[..6] == b"7z\xbc\xaf\x27\x1c" {
        Some(ArchiveFormat::SevenZ)
    } else if read >= 2 && head[..2] == [0x1f, 0x8b] {
        Some(ArchiveFormat::TarGz)
    } else if read >= 262 && &head[257..262] == b"ustar" {
        Some(ArchiveFormat::Tar)
    } else {
        None
    };
    if by_magic.is_some() {
        return Ok(by_magic);
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    Ok(if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".gz") {
        Some(ArchiveFormat::TarGz)
    } else if name.ends_with(".zip") {
        Some(ArchiveFormat::Zip)
    } else if name.ends_with(".rar") {
        Some(ArchiveFormat::Rar)
    } else if name.ends_with(".7z") {
        Some(ArchiveFormat::SevenZ)
    } else if name.ends_with(".tar") {
        Some(ArchiveFormat::Tar)
    } else {
        None
    })
}

// ============================================================================
// Decompression backends
// ============================================================================

/// One archive family. Implementations must be pure extractors: no
/// knowledge of the MetaCam layout, no writes outside `dest`.
pub trait Decompressor: Send + Sync {
    fn handles(&self, format: ArchiveFormat) -> bool;

    /// Extract everything under `dest`, returning relative paths in
    /// archive order where the format preserves one.
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        password: Option<&str>,
    ) -> Result<Vec<PathBuf>, ArchiveError>;
}

pub struct ZipDecompressor;

impl ZipDecompressor {
    fn map_err(e: zip::result::ZipError) -> ArchiveError {
        use zip::result::ZipError;
        match e {
            ZipError::InvalidPassword => ArchiveError::PasswordRequired,
            ZipError::UnsupportedArchive(msg) if msg.contains("Password") => {
                ArchiveError::PasswordRequired
            }
            ZipError::Io(e) => ArchiveError::Io(e),
            other => ArchiveError::Corrupt(other.to_string()),
        }
    }
}

impl Decompressor for ZipDecompressor {
    fn handles(&self, format: ArchiveFormat) -> bool {
        format == ArchiveFormat::Zip
    }

    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        password: Option<&str>,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let file = std::fs::File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file).map_err(Self::map_err)?;
        let mut files = Vec::new();

        for i in 0..zip.len() {
            let mut entry = match password {
                Some(p) => zip.by_index_decrypt(i, p.as_bytes()).map_err(Self::map_err)?,
                None => zip.by_index(i).map_err(Self::map_err)?,
            };
            let rel = entry
                .enclosed_name()
                .ok_or_else(|| ArchiveError::Corrupt(format!("unsafe path {:?}", entry.name())))?
                .to_path_buf();
            let out = dest.join(&rel);
            if entry.is_dir() {
                std::fs::create_dir_all(&out)?;
                continue;
            }
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut writer = std::fs::File::create(&out)?;
            std::io::copy(&mut entry, &mut writer)?;
            files.push(rel);
        }
        Ok(files)
    }
}

pub struct TarDecompressor;

impl Decompressor for TarDecompressor {
    fn handles(&self, format: ArchiveFormat) -> bool {
        matches!(format, ArchiveFormat::Tar | ArchiveFormat::TarGz)
    }

    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        _password: Option<&str>,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let file = std::fs::File::open(archive)?;
        let gz = detect_format(archive)?.map(|f| f == ArchiveFormat::TarGz).unwrap_or(false);
        let result = if gz {
            tar::Archive::new(GzDecoder::new(file)).unpack(dest)
        } else {
            tar::Archive::new(file).unpack(dest)
        };
        result.map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

        // tar unpack does not report entries; walk the destination.
        let mut files = Vec::new();
        for entry in WalkDir::new(dest).sort_by_file_name() {
            let entry = entry.map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(dest) {
                    files.push(rel.to_path_buf());
                }
            }
        }
        Ok(files)
    }
}

// ============================================================================
// Inspector
// ============================================================================

pub struct ArchiveInspector {
    temp_dir: PathBuf,
    passwords: Vec<String>,
    max_archive_bytes: u64,
    size_window: SizeWindow,
    backends: Vec<Box<dyn Decompressor>>,
}

impl ArchiveInspector {
    pub fn new(temp_dir: impl Into<PathBuf>, passwords: Vec<String>, max_archive_bytes: u64) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            passwords,
            max_archive_bytes,
            size_window: SizeWindow::default(),
            backends: vec![Box::new(ZipDecompressor), Box::new(TarDecompressor)],
        }
    }

    #[cfg(test)]
    pub fn with_size_window(mut self, window: SizeWindow) -> Self {
        self.size_window = window;
        self
    }

    pub fn size_window(&self) -> &SizeWindow {
        &self.size_window
    }

    /// Identify, extract to a fresh scratch directory, and gate on the
    /// extracted size. The scratch directory is removed on every failure
    /// path; on success its ownership passes to the caller.
    pub fn inspect(&self, path: &Path) -> Result<Inspection, ArchiveError> {
        let archive_bytes = std::fs::metadata(path)?.len();
        let limit = self.max_archive_bytes;
        if archive_bytes > limit {
            return Err(ArchiveError::OversizedBefore {
                actual_mb: archive_bytes / (1024 * 1024),
                limit_mb: limit / (1024 * 1024),
            });
        }

        let format = detect_format(path)?
            .ok_or_else(|| ArchiveError::UnknownFormat(path.display().to_string()))?;
        let backend = self
            .backends
            .iter()
            .find(|b| b.handles(format))
            .ok_or_else(|| {
                ArchiveError::UnknownFormat(format!("no extractor registered for {format}"))
            })?;

        std::fs::create_dir_all(&self.temp_dir)?;
        let scratch = self.temp_dir.join(Uuid::new_v4().to_string());
        std::fs::create_dir(&scratch)?;

        let extraction = self.extract_with_passwords(backend.as_ref(), path, &scratch);
        let (files, password_used) = match extraction {
            Ok(v) => v,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&scratch);
                return Err(e);
            }
        };

        let total_bytes = dir_size(&scratch);
        let window = &self.size_window;
        if total_bytes < window.acceptable_min || total_bytes > window.acceptable_max {
            let _ = std::fs::remove_dir_all(&scratch);
            const GIB: f64 = (1024u64 * 1024 * 1024) as f64;
            return Err(ArchiveError::OversizedAfter {
                actual_gib: total_bytes as f64 / GIB,
                min_gib: window.acceptable_min as f64 / GIB,
                max_gib: window.acceptable_max as f64 / GIB,
            });
        }
        let size_status = window.status(total_bytes);
        let size_warning = (size_status == "warning").then(|| {
            format!(
                "extracted size {:.2} GiB is outside the optimal window",
                total_bytes as f64 / (1024u64 * 1024 * 1024) as f64
            )
        });
        if let Some(w) = &size_warning {
            warn!("{w}");
        }

        info!(
            "Extracted {} ({} files, {} bytes, format {})",
            path.display(),
            files.len(),
            total_bytes,
            format
        );
        Ok(Inspection {
            package: ExtractedPackage {
                root_path: scratch,
                files,
                total_bytes,
                format,
                password_used,
            },
            size_status,
            size_warning,
        })
    }

    /// No password first, then the candidate list in order; the first
    /// success wins. Any non-password failure aborts immediately.
    fn extract_with_passwords(
        &self,
        backend: &dyn Decompressor,
        path: &Path,
        scratch: &Path,
    ) -> Result<(Vec<PathBuf>, Option<String>), ArchiveError> {
        match backend.extract(path, scratch, None) {
            Ok(files) => return Ok((files, None)),
            Err(ArchiveError::PasswordRequired) => {}
            Err(e) => return Err(e),
        }

        for candidate in &self.passwords {
            // A half-written attempt from the previous password must not
            // leak into the next one.
            let _ = std::fs::remove_dir_all(scratch);
            std::fs::create_dir_all(scratch)?;
            debug!("Trying archive password candidate");
            match backend.extract(path, scratch, Some(candidate)) {
                Ok(files) => return Ok((files, Some(candidate.clone()))),
                Err(ArchiveError::PasswordRequired) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ArchiveError::PasswordRequired)
    }
}

fn dir_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn small_window() -> SizeWindow {
        SizeWindow {
            acceptable_min: 0,
            optimal_min: 0,
            optimal_max: 1024 * 1024,
            acceptable_max: 10 * 1024 * 1024,
        }
    }

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn detects_zip_by_magic_despite_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.bin");
        build_zip(&path, &[("a.txt", b"hello")]);
        assert_eq!(detect_format(&path).unwrap(), Some(ArchiveFormat::Zip));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.weird");
        std::fs::write(&path, b"not an archive at all").unwrap();

        let inspector =
            ArchiveInspector::new(dir.path().join("tmp"), vec![], u64::MAX).with_size_window(small_window());
        match inspector.inspect(&path) {
            Err(ArchiveError::UnknownFormat(_)) => {}
            other => panic!("expected UnknownFormat, got {other:?}"),
        }
    }

    #[test]
    fn zip_extraction_lists_files_in_archive_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        build_zip(
            &path,
            &[("metadata.yaml", b"record: {}"), ("data/data_0", b"payload")],
        );

        let inspector =
            ArchiveInspector::new(dir.path().join("tmp"), vec![], u64::MAX).with_size_window(small_window());
        let inspection = inspector.inspect(&path).unwrap();
        let package = inspection.package;
        assert_eq!(package.format, ArchiveFormat::Zip);
        assert_eq!(package.files[0], PathBuf::from("metadata.yaml"));
        assert_eq!(package.files[1], PathBuf::from("data/data_0"));
        assert!(package.root_path.join("data/data_0").exists());
        assert!(package.password_used.is_none());
        let _ = std::fs::remove_dir_all(&package.root_path);
    }

    #[test]
    fn oversized_archive_rejected_before_extraction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        build_zip(&path, &[("a.txt", &[0u8; 4096])]);

        // Any zip container is bigger than this limit.
        let inspector = ArchiveInspector::new(dir.path().join("tmp"), vec![], 64);
        match inspector.inspect(&path) {
            Err(ArchiveError::OversizedBefore { .. }) => {}
            other => panic!("expected OversizedBefore, got {other:?}"),
        }
    }

    #[test]
    fn undersized_extraction_is_error_and_scratch_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        build_zip(&path, &[("a.txt", b"tiny")]);

        let window = SizeWindow {
            acceptable_min: 1024 * 1024,
            optimal_min: 2 * 1024 * 1024,
            optimal_max: 3 * 1024 * 1024,
            acceptable_max: 4 * 1024 * 1024,
        };
        let temp = dir.path().join("tmp");
        let inspector =
            ArchiveInspector::new(&temp, vec![], u64::MAX).with_size_window(window);
        match inspector.inspect(&path) {
            Err(ArchiveError::OversizedAfter { .. }) => {}
            other => panic!("expected OversizedAfter, got {other:?}"),
        }
        // Scratch dirs from the failed inspection must be gone.
        let leftovers: Vec<_> = std::fs::read_dir(&temp).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn size_window_status_bands() {
        let w = SizeWindow {
            acceptable_min: 10,
            optimal_min: 20,
            optimal_max: 30,
            acceptable_max: 40,
        };
        assert_eq!(w.status(5), "error");
        assert_eq!(w.status(15), "warning");
        assert_eq!(w.status(25), "optimal");
        assert_eq!(w.status(35), "warning");
        assert_eq!(w.status(45), "error");
    }
}
