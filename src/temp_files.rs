//! Tracks objects opened for editing through temp-mirror downloads and
//! detects local/remote divergence by mtime comparison.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant, UNIX_EPOCH},
};
use tokio::sync::mpsc;

use crate::errors::{OpError, OpResult};
use crate::events::{EngineEvent, TempFileStatusPayload};
use crate::store::RemoteStore;

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TempFileStatus {
    pub locally_modified: bool,
    pub remote_newer: bool,
    pub remote_mtime: Option<DateTime<Utc>>,
    pub local_mtime: f64,
}

#[derive(Clone, Debug)]
pub struct TempFileEntry {
    pub remote_key: String,
    pub bucket: String,
    pub local_path: PathBuf,
    pub remote_mtime_at_open: Option<DateTime<Utc>>,
    pub local_mtime_at_open: f64,
    /// Self-triggered filesystem events are ignored until this deadline.
    pub ignore_until: Option<Instant>,
}

pub struct TempFileTracker {
    entries: Mutex<HashMap<String, TempFileEntry>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    /// Filesystems round mtimes differently; comparisons inside this window
    /// count as unchanged.
    tolerance_secs: f64,
}

pub(crate) fn file_mtime_secs(path: &Path) -> OpResult<f64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|err| OpError::LocalIo(format!("File mtime before epoch: {err}")))?;
    Ok(since_epoch.as_secs_f64())
}

impl TempFileTracker {
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>, tolerance_secs: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            tolerance_secs,
        }
    }

    /// Starts tracking an opened file, recording its on-disk mtime and the
    /// remote mtime as the sync baseline.
    pub fn track(
        &self,
        bucket: &str,
        remote_key: &str,
        local_path: &Path,
        remote_mtime: Option<DateTime<Utc>>,
    ) -> OpResult<()> {
        let local_mtime = file_mtime_secs(local_path)?;
        let entry = TempFileEntry {
            remote_key: remote_key.to_string(),
            bucket: bucket.to_string(),
            local_path: local_path.to_path_buf(),
            remote_mtime_at_open: remote_mtime,
            local_mtime_at_open: local_mtime,
            ignore_until: None,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(remote_key.to_string(), entry);
        }
        Ok(())
    }

    pub fn get(&self, remote_key: &str) -> Option<TempFileEntry> {
        self.entries.lock().ok()?.get(remote_key).cloned()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<TempFileEntry> {
        let entries = self.entries.lock().ok()?;
        entries.values().find(|e| e.local_path == path).cloned()
    }

    pub fn tracked_keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Compares the file against its baselines. Remote metadata is only
    /// fetched when the file changed locally, since that is the only case
    /// where a conflict is possible. A vanished file is silently untracked.
    pub async fn check(
        &self,
        remote_key: &str,
        store: &dyn RemoteStore,
    ) -> OpResult<Option<TempFileStatus>> {
        let Some(entry) = self.get(remote_key) else {
            return Ok(None);
        };

        let current_mtime = match file_mtime_secs(&entry.local_path) {
            Ok(mtime) => mtime,
            Err(OpError::FileNotFound(_)) => {
                self.untrack(remote_key);
                let status = TempFileStatus::default();
                self.emit_status(&entry, &status);
                return Ok(Some(status));
            }
            Err(err) => return Err(err),
        };

        let locally_modified =
            current_mtime > entry.local_mtime_at_open + self.tolerance_secs;

        let mut remote_newer = false;
        let mut remote_mtime = entry.remote_mtime_at_open;
        if locally_modified {
            match store.head_object(&entry.bucket, &entry.remote_key).await {
                Ok(meta) => {
                    remote_mtime = meta.last_modified;
                    // Remote timestamps arrive without a meaningful offset
                    // from some providers, so compare naive instants.
                    if let (Some(remote), Some(opened)) =
                        (meta.last_modified, entry.remote_mtime_at_open)
                    {
                        let delta = (remote.naive_utc() - opened.naive_utc()).num_milliseconds()
                            as f64
                            / 1000.0;
                        remote_newer = delta > self.tolerance_secs;
                    }
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        let status = TempFileStatus {
            locally_modified,
            remote_newer,
            remote_mtime,
            local_mtime: current_mtime,
        };
        self.emit_status(&entry, &status);
        Ok(Some(status))
    }

    /// After a successful upload, the file's current state becomes the new
    /// baseline on both sides.
    pub fn mark_synced(&self, remote_key: &str, remote_mtime: Option<DateTime<Utc>>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let Some(entry) = entries.get_mut(remote_key) else {
            return;
        };
        if let Ok(mtime) = file_mtime_secs(&entry.local_path) {
            entry.local_mtime_at_open = mtime;
        }
        if remote_mtime.is_some() {
            entry.remote_mtime_at_open = remote_mtime;
        } else {
            entry.remote_mtime_at_open = Some(Utc::now());
        }
        let snapshot = entry.clone();
        drop(entries);

        let status = TempFileStatus {
            locally_modified: false,
            remote_newer: false,
            remote_mtime: snapshot.remote_mtime_at_open,
            local_mtime: snapshot.local_mtime_at_open,
        };
        self.emit_status(&snapshot, &status);
    }

    pub fn set_ignore_for_path(&self, path: &Path, window: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.values_mut().find(|e| e.local_path == path) {
                entry.ignore_until = Some(Instant::now() + window);
            }
        }
    }

    pub fn is_ignored_path(&self, path: &Path) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        entries
            .values()
            .find(|e| e.local_path == path)
            .and_then(|e| e.ignore_until)
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    pub fn untrack(&self, remote_key: &str) -> Option<TempFileEntry> {
        self.entries.lock().ok()?.remove(remote_key)
    }

    /// Stops tracking and removes the mirrored file from disk.
    pub fn cleanup(&self, remote_key: &str) {
        if let Some(entry) = self.untrack(remote_key) {
            let _ = std::fs::remove_file(&entry.local_path);
        }
    }

    pub fn cleanup_all(&self) {
        let entries: Vec<TempFileEntry> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, entry)| entry).collect(),
            Err(_) => return,
        };
        for entry in entries {
            let _ = std::fs::remove_file(&entry.local_path);
        }
    }

    fn emit_status(&self, entry: &TempFileEntry, status: &TempFileStatus) {
        let _ = self
            .events
            .send(EngineEvent::TempFileStatusChanged(TempFileStatusPayload {
                remote_key: entry.remote_key.clone(),
                bucket: entry.bucket.clone(),
                status: status.clone(),
            }));
    }
}
