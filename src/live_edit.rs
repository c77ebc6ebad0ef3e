//! Watches the local mirror and re-uploads tracked files after edits settle.
//! Saves are debounced per path; uploads the engine itself causes are masked
//! by a short ignore window so they cannot re-trigger themselves.

use notify::{
    event::{EventKind, ModifyKind},
    RecommendedWatcher, RecursiveMode, Watcher,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::coordinator::Coordinator;
use crate::errors::{OpError, OpResult};
use crate::lock;
use crate::operation::Operation;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

#[derive(Clone, Debug)]
pub struct FsChange {
    pub kind: FsChangeKind,
    pub path: PathBuf,
    pub is_directory: bool,
}

pub struct LiveEditSync {
    coordinator: Arc<Coordinator>,
    debounce: Duration,
    ignore_window: Duration,
    timers: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
}

/// Editors save through renames and scratch files; those intermediates never
/// map to a tracked object.
fn is_backup_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return true;
    };
    name.starts_with('~') || name.ends_with('~') || name.ends_with(".tmp")
}

impl LiveEditSync {
    pub fn new(coordinator: Arc<Coordinator>, debounce: Duration, ignore_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            debounce,
            ignore_window,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Consumes filesystem changes until the channel closes.
    pub async fn run(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<FsChange>) {
        while let Some(change) = changes.recv().await {
            self.handle_change(change);
        }
    }

    pub fn handle_change(self: &Arc<Self>, change: FsChange) {
        if change.is_directory || is_backup_name(&change.path) {
            return;
        }

        let tracker = self.coordinator.temp_files();
        match change.kind {
            FsChangeKind::Deleted | FsChangeKind::Moved => {
                if let Some(entry) = tracker.find_by_path(&change.path) {
                    tracker.untrack(&entry.remote_key);
                    tracing::debug!(key = %entry.remote_key, "tracked file removed locally; untracked");
                }
                self.clear_timer(&change.path);
                return;
            }
            FsChangeKind::Created | FsChangeKind::Modified => {}
        }

        if tracker.find_by_path(&change.path).is_none() {
            return;
        }
        if tracker.is_ignored_path(&change.path) {
            tracing::debug!(path = %change.path.display(), "change inside ignore window dropped");
            return;
        }

        self.schedule(change.path);
    }

    /// Restarts the per-path debounce timer; only the last save in a burst
    /// fires an upload.
    fn schedule(self: &Arc<Self>, path: PathBuf) {
        let sync = Arc::clone(self);
        let timer_path = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(sync.debounce).await;
            sync.fire(&timer_path).await;
        });

        if let Ok(mut timers) = lock(&self.timers) {
            if let Some(previous) = timers.insert(path, handle) {
                previous.abort();
            }
        }
    }

    fn clear_timer(&self, path: &Path) {
        if let Ok(mut timers) = lock(&self.timers) {
            if let Some(handle) = timers.remove(path) {
                handle.abort();
            }
        }
    }

    async fn fire(self: &Arc<Self>, path: &Path) {
        if let Ok(mut timers) = lock(&self.timers) {
            timers.remove(path);
        }

        // The file may have vanished while the debounce ran.
        if !path.is_file() {
            return;
        }
        let tracker = self.coordinator.temp_files();
        let Some(entry) = tracker.find_by_path(path) else {
            return;
        };

        // Masked before the upload is queued, otherwise the engine's own
        // write-back would loop through the watcher.
        tracker.set_ignore_for_path(path, self.ignore_window);

        let mut operation =
            Operation::upload_file(&entry.bucket, &entry.remote_key, entry.local_path.clone());
        operation.context.temp_file_update = true;
        operation.context.live_edit = true;
        tracing::debug!(key = %entry.remote_key, "live edit upload queued");
        self.coordinator.submit(operation).await;
    }
}

fn change_kind(kind: &EventKind) -> Option<FsChangeKind> {
    match kind {
        EventKind::Create(_) => Some(FsChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FsChangeKind::Moved),
        EventKind::Modify(_) => Some(FsChangeKind::Modified),
        EventKind::Remove(_) => Some(FsChangeKind::Deleted),
        _ => None,
    }
}

/// Starts a recursive watcher on the mirror directory, forwarding changes to
/// `changes`. The watcher stops when the returned handle is dropped.
pub fn spawn_mirror_watcher(
    dir: &Path,
    changes: mpsc::UnboundedSender<FsChange>,
) -> OpResult<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let Ok(event) = result else {
            return;
        };
        let Some(kind) = change_kind(&event.kind) else {
            return;
        };
        for path in event.paths {
            let is_directory = path.is_dir();
            let _ = changes.send(FsChange {
                kind,
                path,
                is_directory,
            });
        }
    })
    .map_err(|err| OpError::LocalIo(format!("Failed to create watcher: {err}")))?;

    watcher
        .watch(dir, RecursiveMode::Recursive)
        .map_err(|err| OpError::LocalIo(format!("Failed to watch {}: {err}", dir.display())))?;

    Ok(watcher)
}
