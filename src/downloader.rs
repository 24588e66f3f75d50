// src/downloader.rs
//
// Chunked download through the drive seam, with resume from a partial
// file, retry with backoff, and progress reporting. The .part file is
// only renamed into place once the byte count matches the remote size.

use crate::config::DownloadConfig;
use crate::drive::{DriveClient, DriveError};
use crate::types::PackageDescriptor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download of {name} incomplete: {actual} of {expected} bytes")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("download timed out after {0:.0}s")]
    Timeout(f64),
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Progress snapshot emitted once per chunk.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub bytes_per_sec: f64,
    pub eta_s: f64,
}

impl DownloadProgress {
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        100.0 * self.bytes_done as f64 / self.bytes_total as f64
    }
}

pub struct Downloader {
    client: Arc<dyn DriveClient>,
    config: DownloadConfig,
    retry_backoff: Duration,
}

impl Downloader {
    pub fn new(client: Arc<dyn DriveClient>, config: DownloadConfig) -> Self {
        Self {
            client,
            config,
            retry_backoff: RETRY_BACKOFF_BASE,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Fetches the package to `<download_path>/<name>`, resuming a
    /// matching partial file when the remote is unchanged.
    pub async fn download(
        &self,
        descriptor: &PackageDescriptor,
    ) -> Result<PathBuf, DownloadError> {
        std::fs::create_dir_all(&self.config.download_path)?;
        let final_path = self.config.download_path.join(&descriptor.name);
        let part_path = self
            .config
            .download_path
            .join(format!("{}.part", descriptor.name));

        let mut offset = self.resume_offset(descriptor, &part_path).await;
        if offset > 0 {
            info!(
                "Resuming {} from {:.1}%",
                descriptor.name,
                100.0 * offset as f64 / descriptor.size_bytes.max(1) as f64
            );
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .await?;

        let chunk_size = (self.config.chunk_size_mb * 1024 * 1024).max(1);
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_s);
        let started = Instant::now();
        let start_offset = offset;
        let mut retries_left = self.config.retries;

        while offset < descriptor.size_bytes {
            if Instant::now() > deadline {
                return Err(DownloadError::Timeout(self.config.timeout_s as f64));
            }

            let want = chunk_size.min(descriptor.size_bytes - offset);
            match self
                .client
                .fetch_chunk(&descriptor.remote_id, offset, want)
                .await
            {
                Ok(chunk) if chunk.is_empty() => break, // remote EOF
                Ok(chunk) => {
                    file.write_all(&chunk).await?;
                    offset += chunk.len() as u64;
                    self.report_progress(descriptor, offset, start_offset, started);
                }
                Err(e) => {
                    if retries_left == 0 {
                        file.flush().await?;
                        return Err(e.into());
                    }
                    let attempt = self.config.retries - retries_left;
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
                    retries_left -= 1;
                    warn!(
                        "Chunk at offset {offset} failed ({e}); retrying in {:.1}s ({} retries left)",
                        delay.as_secs_f64(),
                        retries_left
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = std::fs::metadata(&part_path)?.len();
        if actual != descriptor.size_bytes {
            return Err(DownloadError::SizeMismatch {
                name: descriptor.name.clone(),
                expected: descriptor.size_bytes,
                actual,
            });
        }

        std::fs::rename(&part_path, &final_path)?;
        info!(
            "⬇ Downloaded {} ({} bytes in {:.1}s)",
            descriptor.name,
            actual,
            started.elapsed().as_secs_f64()
        );
        Ok(final_path)
    }

    /// A partial file counts only when the remote still matches the
    /// descriptor we started from; any change restarts from zero.
    async fn resume_offset(&self, descriptor: &PackageDescriptor, part_path: &PathBuf) -> u64 {
        let Ok(meta) = std::fs::metadata(part_path) else {
            return 0;
        };
        let partial = meta.len();
        if partial == 0 || partial > descriptor.size_bytes {
            let _ = std::fs::remove_file(part_path);
            return 0;
        }

        match self.client.stat(&descriptor.remote_id).await {
            Ok(current)
                if current.size_bytes == descriptor.size_bytes
                    && current.remote_mtime == descriptor.remote_mtime =>
            {
                partial
            }
            _ => {
                debug!("Remote changed since partial download; restarting");
                let _ = std::fs::remove_file(part_path);
                0
            }
        }
    }

    fn report_progress(
        &self,
        descriptor: &PackageDescriptor,
        offset: u64,
        start_offset: u64,
        started: Instant,
    ) {
        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        let bytes_per_sec = (offset - start_offset) as f64 / elapsed;
        let remaining = descriptor.size_bytes.saturating_sub(offset) as f64;
        let progress = DownloadProgress {
            bytes_done: offset,
            bytes_total: descriptor.size_bytes,
            bytes_per_sec,
            eta_s: if bytes_per_sec > 0.0 {
                remaining / bytes_per_sec
            } else {
                0.0
            },
        };
        debug!(
            "{}: {:.1}% ({}/{} bytes, {:.1} MiB/s, ETA {:.0}s)",
            descriptor.name,
            progress.percent(),
            progress.bytes_done,
            progress.bytes_total,
            progress.bytes_per_sec / (1024.0 * 1024.0),
            progress.eta_s
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::fake::FakeDrive;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> DownloadConfig {
        DownloadConfig {
            download_path: dir.to_path_buf(),
            chunk_size_mb: 1,
            timeout_s: 30,
            retries: 2,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn full_download_roundtrip() {
        let dir = tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let content = payload(3 * 1024 * 1024 + 17);
        let descriptor = drive.add_file("pkg.zip", "id-1", content.clone());

        let downloader = Downloader::new(drive, config(dir.path()));
        let path = downloader.download(&descriptor).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), content);
        assert!(!dir.path().join("pkg.zip.part").exists());
    }

    #[tokio::test]
    async fn resumes_from_partial_when_remote_unchanged() {
        let dir = tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let content = payload(2 * 1024 * 1024);
        let descriptor = drive.add_file("pkg.zip", "id-1", content.clone());

        // Simulated interrupt: half the file is already on disk.
        let half = content.len() / 2;
        std::fs::write(dir.path().join("pkg.zip.part"), &content[..half]).unwrap();

        let downloader = Downloader::new(drive.clone(), config(dir.path()));
        let path = downloader.download(&descriptor).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), content);

        // Every chunk request started at or past the resume point.
        let offsets = drive.offsets_requested.lock().unwrap();
        assert!(offsets.iter().all(|&o| o >= half as u64));
    }

    #[tokio::test]
    async fn partial_discarded_when_remote_changed() {
        let dir = tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let content = payload(1024 * 1024);
        let mut descriptor = drive.add_file("pkg.zip", "id-1", content.clone());
        // The caller's descriptor carries an older mtime than the drive.
        descriptor.remote_mtime = "2025-08-01T00:00:00Z".to_string();

        std::fs::write(dir.path().join("pkg.zip.part"), &content[..1000]).unwrap();

        let downloader = Downloader::new(drive.clone(), config(dir.path()));
        let path = downloader.download(&descriptor).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), content);

        let offsets = drive.offsets_requested.lock().unwrap();
        assert_eq!(offsets.first(), Some(&0));
    }

    #[tokio::test]
    async fn transient_chunk_failures_are_retried() {
        let dir = tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let content = payload(512 * 1024);
        let descriptor = drive.add_file("pkg.zip", "id-1", content.clone());
        *drive.chunk_failures.lock().unwrap() = 2;

        let downloader = Downloader::new(drive, config(dir.path()))
            .with_backoff(Duration::from_millis(1));
        let path = downloader.download(&descriptor).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), content);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let dir = tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let descriptor = drive.add_file("pkg.zip", "id-1", payload(1024));
        *drive.chunk_failures.lock().unwrap() = 10;

        let downloader = Downloader::new(drive, config(dir.path()))
            .with_backoff(Duration::from_millis(1));
        assert!(matches!(
            downloader.download(&descriptor).await,
            Err(DownloadError::Drive(_))
        ));
    }

    #[tokio::test]
    async fn truncated_remote_is_a_size_mismatch() {
        let dir = tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let mut descriptor = drive.add_file("pkg.zip", "id-1", payload(1000));
        // Descriptor promises more bytes than the drive will serve.
        descriptor.size_bytes = 2000;

        let downloader = Downloader::new(drive, config(dir.path()));
        assert!(matches!(
            downloader.download(&descriptor).await,
            Err(DownloadError::SizeMismatch { actual: 1000, .. })
        ));
    }
}
