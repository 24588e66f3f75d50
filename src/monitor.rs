// src/monitor.rs
//
// Polls the watched drive folder and yields descriptors for packages
// nobody has handled yet. Dedup is two-layered: the persistent tracker
// across restarts, and an in-process seen set so one run never emits
// the same remote id twice even before its tracker mark lands.

use crate::config::DriveConfig;
use crate::drive::DriveClient;
use crate::tracker::Tracker;
use crate::types::PackageDescriptor;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const BACKOFF_MAX: Duration = Duration::from_secs(300);

pub struct DriveMonitor {
    client: Arc<dyn DriveClient>,
    tracker: Arc<Tracker>,
    config: DriveConfig,
    seen: Mutex<HashSet<String>>,
    consecutive_errors: Mutex<u32>,
}

impl DriveMonitor {
    pub fn new(client: Arc<dyn DriveClient>, tracker: Arc<Tracker>, config: DriveConfig) -> Self {
        Self {
            client,
            tracker,
            config,
            seen: Mutex::new(HashSet::new()),
            consecutive_errors: Mutex::new(0),
        }
    }

    /// One poll of the remote folder. SDK errors are swallowed into a
    /// growing backoff; the monitor never takes the process down.
    pub async fn poll_new(&self) -> Vec<PackageDescriptor> {
        let listing = match self.client.list_folder(&self.config.folder_id).await {
            Ok(listing) => {
                *self.consecutive_errors.lock().unwrap() = 0;
                listing
            }
            Err(e) => {
                let mut errors = self.consecutive_errors.lock().unwrap();
                *errors = errors.saturating_add(1);
                warn!(
                    "Drive poll failed ({e}); {} consecutive errors, backing off {:?}",
                    *errors,
                    self.backoff_delay()
                );
                return Vec::new();
            }
        };
        if let Err(e) = self.tracker.touch_check_time() {
            warn!("Could not persist last check time: {e:#}");
        }

        let mut fresh = Vec::new();
        for descriptor in listing {
            if !self.is_allowed(&descriptor) {
                continue;
            }
            if self.tracker.seen(&descriptor.remote_id) {
                continue;
            }
            let mut seen = self.seen.lock().unwrap();
            if !seen.insert(descriptor.remote_id.clone()) {
                continue;
            }
            drop(seen);
            info!(
                "📦 New package: {} ({}, {:.1} MiB)",
                descriptor.name,
                descriptor.remote_id,
                descriptor.size_bytes as f64 / (1024.0 * 1024.0)
            );
            fresh.push(descriptor);
        }
        fresh
    }

    /// Extension whitelist and size ceiling, matching the original
    /// monitor's allow rules.
    fn is_allowed(&self, descriptor: &PackageDescriptor) -> bool {
        let name = descriptor.name.to_ascii_lowercase();
        let extension_ok = self
            .config
            .allowed_extensions
            .iter()
            .any(|ext| name.ends_with(&ext.to_ascii_lowercase()));
        if !extension_ok {
            debug!("Skipping {}: extension not allowed", descriptor.name);
            return false;
        }

        let limit = self.config.max_file_size_mb * 1024 * 1024;
        if descriptor.size_bytes > limit {
            warn!(
                "Skipping {}: {} bytes exceeds MAX_FILE_SIZE_MB",
                descriptor.name, descriptor.size_bytes
            );
            return false;
        }
        true
    }

    /// Extra delay to add to the poll interval after SDK errors:
    /// doubles per consecutive failure, capped at five minutes.
    pub fn backoff_delay(&self) -> Duration {
        let errors = *self.consecutive_errors.lock().unwrap();
        if errors == 0 {
            return Duration::ZERO;
        }
        let exp = errors.min(8);
        let delay = self.config.check_interval_s.max(1) * 2u64.saturating_pow(exp - 1);
        Duration::from_secs(delay).min(BACKOFF_MAX)
    }
}
