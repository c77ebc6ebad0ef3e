//! Asynchronous operation engine for S3-compatible buckets: a coordinator in
//! front of a fixed worker pool, with batch tracking, a temp-file mirror for
//! in-place editing, and a debounced live-edit sync trigger.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

pub mod archive;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod live_edit;
pub mod mirror_paths;
pub mod operation;
pub mod store;
pub mod temp_files;
pub mod worker;

pub use archive::download_archive_tar_gz;
pub use coordinator::{ConflictChoice, Coordinator};
pub use errors::{OpError, OpResult};
pub use events::{BatchExtra, CutBatchExtra, EngineEvent, SourceEntry};
pub use live_edit::{spawn_mirror_watcher, FsChange, FsChangeKind, LiveEditSync};
pub use mirror_paths::{mirror_path_for, mirror_path_in, mirror_root_dir};
pub use operation::{plan_folder_upload, OpContext, Operation, OperationKind};
pub use store::{RemoteStore, S3ConnectionSettings, S3Store};
pub use temp_files::{TempFileStatus, TempFileTracker};
pub use worker::{CopyResult, ListResult, OperationOutput, TransferResult};

/// What happens to the local file when the user discards their edits in a
/// conflict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDiscardPolicy {
    /// Keep the edited file and re-baseline it, so the conflict stops being
    /// reported without an upload.
    #[default]
    KeepLocal,
    /// Re-download the remote object over the local copy and keep tracking.
    RefetchRemote,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub queue_poll_timeout_ms: u64,
    /// Quiet period after the last save before a live-edit upload fires.
    pub debounce_ms: u64,
    /// Window after an engine-initiated write during which watcher events for
    /// that path are discarded.
    pub ignore_window_ms: u64,
    pub mtime_tolerance_secs: f64,
    pub conflict_discard_policy: ConflictDiscardPolicy,
    /// Overrides the OS-derived mirror root when set.
    pub mirror_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_poll_timeout_ms: 500,
            debounce_ms: 1500,
            ignore_window_ms: 5000,
            mtime_tolerance_secs: 0.5,
            conflict_discard_policy: ConflictDiscardPolicy::default(),
            mirror_root: None,
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, String> {
    mutex.lock().map_err(|err| format!("Lock poisoned: {err}"))
}

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_timings() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_poll_timeout_ms, 500);
        assert_eq!(config.debounce_ms, 1500);
        assert_eq!(config.ignore_window_ms, 5000);
        assert!((config.mtime_tolerance_secs - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            config.conflict_discard_policy,
            ConflictDiscardPolicy::KeepLocal
        );
    }

    #[test]
    fn config_deserializes_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"workerCount": 2, "conflictDiscardPolicy": "refetch_remote"}"#)
                .expect("config");
        assert_eq!(config.worker_count, 2);
        assert_eq!(
            config.conflict_discard_policy,
            ConflictDiscardPolicy::RefetchRemote
        );
        assert_eq!(config.debounce_ms, 1500);
    }
}
