// src/tracker.rs
//
// Persistent set of already-processed package identifiers. The JSON file
// is the source of truth across restarts; writes go through a temp file
// and an atomic rename so a crash can never leave a torn file behind.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRecord {
    pub file_id: String,
    pub file_name: String,
    pub status: String,
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// On-disk layout. Unknown fields in older or newer files are ignored on
/// load and dropped on the next write.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerFile {
    #[serde(default)]
    processed_files: Vec<TrackRecord>,
    #[serde(default)]
    last_check_time: Option<DateTime<Utc>>,
    #[serde(default)]
    total_processed: u64,
}

struct TrackerState {
    records: HashMap<String, TrackRecord>,
    last_check_time: Option<DateTime<Utc>>,
    total_processed: u64,
}

pub struct Tracker {
    path: PathBuf,
    state: Mutex<TrackerState>,
}

impl Tracker {
    /// Loads the tracker file, pruning entries older than `retain_days`.
    /// A missing file starts an empty tracker; a corrupt file is renamed
    /// aside rather than silently truncated.
    pub fn open(path: impl Into<PathBuf>, retain_days: i64) -> Result<Self> {
        let path = path.into();
        let mut file = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<TrackerFile>(&text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let aside = path.with_extension("json.corrupt");
                    warn!(
                        "Tracker file unreadable ({}), moving aside to {}",
                        e,
                        aside.display()
                    );
                    let _ = std::fs::rename(&path, &aside);
                    TrackerFile::default()
                }
            },
            Err(_) => TrackerFile::default(),
        };

        let cutoff = Utc::now() - Duration::days(retain_days.max(0));
        let before = file.processed_files.len();
        file.processed_files.retain(|r| r.processed_at >= cutoff);
        let pruned = before - file.processed_files.len();
        if pruned > 0 {
            info!("Pruned {} tracker records older than {} days", pruned, retain_days);
        }

        let mut records = HashMap::with_capacity(file.processed_files.len());
        for record in file.processed_files {
            // Latest-only on duplicate ids.
            records.insert(record.file_id.clone(), record);
        }

        let tracker = Self {
            path,
            state: Mutex::new(TrackerState {
                records,
                last_check_time: file.last_check_time,
                total_processed: file.total_processed,
            }),
        };
        if pruned > 0 {
            tracker.persist()?;
        }
        Ok(tracker)
    }

    pub fn seen(&self, remote_id: &str) -> bool {
        self.state.lock().unwrap().records.contains_key(remote_id)
    }

    /// Records a terminal state for a package. A second mark for the same
    /// id replaces the earlier record; the set never holds duplicates.
    pub fn mark(&self, record: TrackRecord) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let replaced = state
                .records
                .insert(record.file_id.clone(), record.clone())
                .is_some();
            if !replaced {
                state.total_processed += 1;
            }
            debug!(
                "Tracker mark: {} ({}) status={}",
                record.file_id, record.file_name, record.status
            );
        }
        self.persist()
    }

    pub fn touch_check_time(&self) -> Result<()> {
        self.state.lock().unwrap().last_check_time = Some(Utc::now());
        self.persist()
    }

    pub fn snapshot(&self) -> Vec<TrackRecord> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.processed_at.cmp(&b.processed_at));
        records
    }

    /// Counts by status, used by the shutdown summary.
    pub fn statistics(&self) -> HashMap<String, usize> {
        let state = self.state.lock().unwrap();
        let mut counts = HashMap::new();
        for record in state.records.values() {
            *counts.entry(record.status.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn persist(&self) -> Result<()> {
        let file = {
            let state = self.state.lock().unwrap();
            let mut processed_files: Vec<_> = state.records.values().cloned().collect();
            processed_files.sort_by(|a, b| a.processed_at.cmp(&b.processed_at));
            TrackerFile {
                processed_files,
                last_check_time: state.last_check_time,
                total_processed: state.total_processed,
            }
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)
    }
}

/// Write-to-temp, fsync, rename. The rename is atomic on POSIX
/// filesystems, so readers observe either the old or the new file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut f = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str, status: &str) -> TrackRecord {
        TrackRecord {
            file_id: id.to_string(),
            file_name: format!("{id}.zip"),
            status: status.to_string(),
            processed_at: Utc::now(),
            notes: None,
        }
    }

    #[test]
    fn mark_then_seen_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("processed_files.json");
        let tracker = Tracker::open(&path, 30).unwrap();

        assert!(!tracker.seen("f1"));
        tracker.mark(record("f1", "success")).unwrap();
        assert!(tracker.seen("f1"));

        // Survives reopen.
        drop(tracker);
        let tracker = Tracker::open(&path, 30).unwrap();
        assert!(tracker.seen("f1"));
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[test]
    fn duplicate_mark_replaces_not_duplicates() {
        let dir = tempdir().unwrap();
        let tracker = Tracker::open(dir.path().join("t.json"), 30).unwrap();
        tracker.mark(record("f1", "failed")).unwrap();
        tracker.mark(record("f1", "success")).unwrap();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, "success");
    }

    #[test]
    fn old_records_pruned_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.json");
        let tracker = Tracker::open(&path, 30).unwrap();
        let mut old = record("ancient", "success");
        old.processed_at = Utc::now() - Duration::days(45);
        tracker.mark(old).unwrap();
        tracker.mark(record("recent", "success")).unwrap();
        drop(tracker);

        let tracker = Tracker::open(&path, 30).unwrap();
        assert!(!tracker.seen("ancient"));
        assert!(tracker.seen("recent"));
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let tracker = Tracker::open(&path, 30).unwrap();
        assert!(tracker.snapshot().is_empty());
        assert!(path.with_extension("json.corrupt").exists());
    }
}
