//! Operation coordinator: owns the worker pool, routes completions, keeps
//! batch registries, and drives the cascading cleanup after cut-paste moves.

use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex as TokioMutex},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::archive::download_archive_tar_gz;
use crate::errors::{OpError, OpResult};
use crate::events::{
    ArchiveCompletedPayload, ArchiveProgressPayload, BatchDonePayload, BatchExtra,
    BatchProgressPayload, EngineEvent, OperationCompletion,
};
use crate::mirror_paths::{mirror_path_for, mirror_path_in};
use crate::operation::{Operation, OperationKind};
use crate::store::RemoteStore;
use crate::temp_files::{TempFileStatus, TempFileTracker};
use crate::worker::{run_worker, CancelFlags, Completion, QueueItem, WorkerContext};
use crate::{lock, now_iso, ConflictDiscardPolicy, EngineConfig};

/// How the user resolved an edit conflict on a tracked temp file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Push the local edits, replacing the newer remote object.
    OverwriteRemote,
    /// Drop the local edits; what happens to the file follows
    /// `EngineConfig::conflict_discard_policy`.
    Discard,
}

struct BatchState {
    display_name: String,
    total: usize,
    completed: usize,
    failed: usize,
    extra: BatchExtra,
}

struct WorkerPool {
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    worker_count: usize,
}

pub struct Coordinator {
    config: EngineConfig,
    store: Mutex<Option<Arc<dyn RemoteStore>>>,
    pool: TokioMutex<Option<WorkerPool>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    batches: Mutex<HashMap<String, BatchState>>,
    completed_list_ids: Mutex<HashSet<Uuid>>,
    cancel_flags: CancelFlags,
    events: mpsc::UnboundedSender<EngineEvent>,
    temp_files: Arc<TempFileTracker>,
}

impl Coordinator {
    /// Builds the coordinator and spawns its completion loop. Completions
    /// from all workers funnel through one consumer, so registry updates
    /// never race. Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();

        let temp_files = Arc::new(TempFileTracker::new(
            events_tx.clone(),
            config.mtime_tolerance_secs,
        ));

        let coordinator = Arc::new(Self {
            config,
            store: Mutex::new(None),
            pool: TokioMutex::new(None),
            completion_tx,
            batches: Mutex::new(HashMap::new()),
            completed_list_ids: Mutex::new(HashSet::new()),
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
            events: events_tx,
            temp_files,
        });

        let loop_coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(completion) = completion_rx.recv().await {
                loop_coordinator.on_operation_finished(completion).await;
            }
        });

        (coordinator, events_rx)
    }

    pub fn temp_files(&self) -> &TempFileTracker {
        &self.temp_files
    }

    fn current_store(&self) -> Option<Arc<dyn RemoteStore>> {
        lock(&self.store).ok().and_then(|guard| guard.clone())
    }

    /// Swaps the remote client and restarts the worker pool against it.
    /// Completed-LIST memory is profile-scoped, so it resets here.
    pub async fn set_store(&self, store: Arc<dyn RemoteStore>) {
        self.stop_workers().await;

        if let Ok(mut slot) = lock(&self.store) {
            *slot = Some(Arc::clone(&store));
        }
        if let Ok(mut ids) = lock(&self.completed_list_ids) {
            ids.clear();
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue_rx = Arc::new(TokioMutex::new(queue_rx));
        let stop = Arc::new(AtomicBool::new(false));
        let worker_count = self.config.worker_count.max(1);

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let ctx = WorkerContext {
                store: Arc::clone(&store),
                queue: Arc::clone(&queue_rx),
                stop: Arc::clone(&stop),
                completions: self.completion_tx.clone(),
                events: self.events.clone(),
                cancel_flags: Arc::clone(&self.cancel_flags),
                poll_timeout: Duration::from_millis(self.config.queue_poll_timeout_ms),
            };
            handles.push(tokio::spawn(run_worker(index, ctx)));
        }

        let mut pool = self.pool.lock().await;
        *pool = Some(WorkerPool {
            queue_tx,
            stop,
            handles,
            worker_count,
        });
    }

    /// Stops the pool: raises the stop flag, wakes every worker with a
    /// shutdown sentinel, then waits briefly before aborting stragglers.
    pub async fn stop_workers(&self) {
        let Some(pool) = self.pool.lock().await.take() else {
            return;
        };

        pool.stop.store(true, Ordering::SeqCst);
        for _ in 0..pool.worker_count {
            let _ = pool.queue_tx.send(QueueItem::Shutdown);
        }

        for mut handle in pool.handles {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }

    /// Stops workers and removes every mirrored temp file from disk.
    pub async fn shutdown(&self) {
        self.stop_workers().await;
        self.temp_files.cleanup_all();
    }

    /// Enqueues one operation. Without a configured store the operation
    /// short-circuits to a failed completion instead of sitting in a queue
    /// nobody drains.
    pub async fn submit(&self, operation: Operation) {
        let queued = {
            let pool = self.pool.lock().await;
            match pool.as_ref() {
                Some(pool) => pool
                    .queue_tx
                    .send(QueueItem::Work(Box::new(operation.clone())))
                    .is_ok(),
                None => false,
            }
        };

        if !queued {
            let _ = self.completion_tx.send(Completion {
                operation,
                output: None,
                error: OpError::ClientNotConfigured.to_string(),
            });
        }
    }

    /// Registers a batch and enqueues its members. An empty batch completes
    /// immediately.
    pub async fn submit_batch(
        &self,
        batch_id: &str,
        operations: Vec<Operation>,
        display_name: &str,
        extra: BatchExtra,
    ) {
        if operations.is_empty() {
            self.emit_batch_done(batch_id, display_name, 0, 0, extra);
            return;
        }

        if let Ok(mut batches) = lock(&self.batches) {
            batches.insert(
                batch_id.to_string(),
                BatchState {
                    display_name: display_name.to_string(),
                    total: operations.len(),
                    completed: 0,
                    failed: 0,
                    extra,
                },
            );
        }

        for operation in operations {
            self.submit(operation.with_batch_id(batch_id)).await;
        }
    }

    /// Downloads an object into the local mirror and starts tracking it for
    /// live editing. Returns the operation id.
    pub async fn open_for_edit(&self, bucket: &str, key: &str) -> OpResult<Uuid> {
        let local_path = match self.config.mirror_root.as_deref() {
            Some(root) => mirror_path_in(root, bucket, key)?,
            None => mirror_path_for(bucket, key)?,
        };
        let mut operation = Operation::download_to_temp(bucket, key, local_path);
        operation.context.temp_file_update = true;
        let id = operation.id;
        self.submit(operation).await;
        Ok(id)
    }

    /// Requests cancellation of a queued or running operation.
    pub fn cancel(&self, operation_id: Uuid) {
        if let Ok(mut flags) = lock(&self.cancel_flags) {
            flags
                .entry(operation_id)
                .or_insert_with(|| Arc::new(AtomicBool::new(false)))
                .store(true, Ordering::SeqCst);
        }
    }

    pub fn clear_completed_list_ids(&self) {
        if let Ok(mut ids) = lock(&self.completed_list_ids) {
            ids.clear();
        }
    }

    pub async fn check_temp_file(&self, remote_key: &str) -> OpResult<Option<TempFileStatus>> {
        let store = self.current_store().ok_or(OpError::ClientNotConfigured)?;
        self.temp_files.check(remote_key, store.as_ref()).await
    }

    /// Sweeps every tracked file. Files are evaluated independently; one
    /// failing check does not stop the rest of the sweep.
    pub async fn check_temp_files(&self) -> OpResult<()> {
        let store = self.current_store().ok_or(OpError::ClientNotConfigured)?;
        for key in self.temp_files.tracked_keys() {
            if let Err(err) = self.temp_files.check(&key, store.as_ref()).await {
                tracing::warn!(key, error = %err, "temp file check failed");
            }
        }
        Ok(())
    }

    /// Applies the user's decision on a conflicted temp file.
    pub async fn resolve_temp_conflict(
        &self,
        remote_key: &str,
        choice: ConflictChoice,
    ) -> OpResult<()> {
        let entry = self
            .temp_files
            .get(remote_key)
            .ok_or_else(|| OpError::FileNotFound(remote_key.to_string()))?;

        match choice {
            ConflictChoice::OverwriteRemote => {
                let mut operation =
                    Operation::upload_file(&entry.bucket, remote_key, entry.local_path.clone());
                operation.context.temp_file_update = true;
                self.submit(operation).await;
            }
            ConflictChoice::Discard => match self.config.conflict_discard_policy {
                ConflictDiscardPolicy::KeepLocal => {
                    // Re-baseline without uploading; the conflict stops being
                    // reported but the local edits stay on disk.
                    let remote_mtime =
                        self.fresh_remote_mtime(&entry.bucket, remote_key).await;
                    self.temp_files.mark_synced(remote_key, remote_mtime);
                }
                ConflictDiscardPolicy::RefetchRemote => {
                    let mut operation = Operation::download_to_temp(
                        &entry.bucket,
                        remote_key,
                        entry.local_path.clone(),
                    );
                    operation.context.temp_file_update = true;
                    self.submit(operation).await;
                }
            },
        }
        Ok(())
    }

    pub async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> OpResult<String> {
        let store = self.current_store().ok_or(OpError::ClientNotConfigured)?;
        store.presign_get(bucket, key, expires_in).await
    }

    /// Starts an archive download in the background. Progress and completion
    /// surface on the event stream; the returned id can be cancelled like any
    /// operation.
    pub fn download_archive(
        self: &Arc<Self>,
        bucket: &str,
        keys: Vec<String>,
        common_prefix: &str,
        destination: PathBuf,
    ) -> OpResult<Uuid> {
        let store = self.current_store().ok_or(OpError::ClientNotConfigured)?;

        let archive_id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        if let Ok(mut flags) = lock(&self.cancel_flags) {
            flags.insert(archive_id, Arc::clone(&cancel));
        }

        let coordinator = Arc::clone(self);
        let bucket = bucket.to_string();
        let common_prefix = common_prefix.to_string();
        tokio::spawn(async move {
            let events = coordinator.events.clone();
            let progress_events = events.clone();
            let total = keys.len();
            let mut on_progress = move |key: &str, done: usize, _total: usize| {
                let _ = progress_events.send(EngineEvent::ArchiveProgress(ArchiveProgressPayload {
                    archive_id,
                    current_key: key.to_string(),
                    completed_objects: done,
                    total_objects: total,
                }));
            };

            let result = download_archive_tar_gz(
                store.as_ref(),
                &bucket,
                &keys,
                &common_prefix,
                &destination,
                cancel.as_ref(),
                &mut on_progress,
            )
            .await;

            if let Ok(mut flags) = lock(&coordinator.cancel_flags) {
                flags.remove(&archive_id);
            }

            let _ = events.send(EngineEvent::ArchiveCompleted(ArchiveCompletedPayload {
                archive_id,
                destination: destination.display().to_string(),
                error: result.err().map(|err| err.to_string()).unwrap_or_default(),
            }));
        });

        Ok(archive_id)
    }

    /// Single consumer for worker completions. LIST results are de-duplicated
    /// by operation id so a retried listing cannot double-apply.
    pub(crate) async fn on_operation_finished(&self, completion: Completion) {
        let Completion {
            operation,
            output,
            error,
        } = completion;

        if operation.kind == OperationKind::List {
            if let Ok(mut ids) = lock(&self.completed_list_ids) {
                if !ids.insert(operation.id) {
                    tracing::debug!(operation = %operation.id, "duplicate list completion dropped");
                    return;
                }
            }
        }

        match operation.kind {
            OperationKind::DownloadToTemp => {
                if error.is_empty() {
                    self.track_temp_download(&operation).await;
                } else if let Some(path) = operation.local_path.as_deref() {
                    // Half-written temp files must never be offered for edit.
                    let _ = std::fs::remove_file(path);
                }
            }
            OperationKind::UploadFile => {
                if error.is_empty() && operation.context.temp_file_update {
                    if let Some(key) = operation.key.as_deref() {
                        // Re-baseline against what the server actually
                        // recorded, not the local clock.
                        let remote_mtime = self.fresh_remote_mtime(&operation.bucket, key).await;
                        self.temp_files.mark_synced(key, remote_mtime);
                    }
                }
            }
            _ => {}
        }

        let _ = self
            .events
            .send(EngineEvent::for_completion(OperationCompletion {
                operation: operation.clone(),
                output,
                error: error.clone(),
            }));

        let Some(batch_id) = operation.context.batch_id.clone() else {
            return;
        };
        self.account_batch_member(&batch_id, &operation, &error).await;
    }

    async fn fresh_remote_mtime(&self, bucket: &str, key: &str) -> Option<DateTime<Utc>> {
        let store = self.current_store()?;
        store
            .head_object(bucket, key)
            .await
            .ok()
            .and_then(|meta| meta.last_modified)
    }

    async fn track_temp_download(&self, operation: &Operation) {
        let (Some(key), Some(path)) = (operation.key.as_deref(), operation.local_path.as_deref())
        else {
            return;
        };
        let remote_mtime = self.fresh_remote_mtime(&operation.bucket, key).await;
        if let Err(err) = self
            .temp_files
            .track(&operation.bucket, key, path, remote_mtime)
        {
            tracing::warn!(key, error = %err, "failed to track temp download");
        }
    }

    async fn account_batch_member(&self, batch_id: &str, operation: &Operation, error: &str) {
        let finished = {
            let Ok(mut batches) = lock(&self.batches) else {
                return;
            };
            let Some(state) = batches.get_mut(batch_id) else {
                return;
            };

            state.completed += 1;
            // Cleanup deletes are best-effort; their failures never taint the
            // batch outcome.
            if !error.is_empty() && !operation.context.cleanup_delete {
                state.failed += 1;
            }

            let _ = self.events.send(EngineEvent::BatchProgress(BatchProgressPayload {
                batch_id: batch_id.to_string(),
                display_name: state.display_name.clone(),
                completed: state.completed,
                total: state.total,
                failed: state.failed,
                label: format!(
                    "{}: {} ({}/{})",
                    state.display_name,
                    operation.display_name(),
                    state.completed,
                    state.total
                ),
            }));

            state.completed >= state.total
        };

        if finished {
            self.finish_batch(batch_id).await;
        }
    }

    async fn finish_batch(&self, batch_id: &str) {
        let Some(state) = lock(&self.batches)
            .ok()
            .and_then(|mut batches| batches.remove(batch_id))
        else {
            return;
        };

        let cut = state.extra.cut.clone();
        let clears_clipboard = state.extra.clears_clipboard;
        self.emit_batch_done(
            batch_id,
            &state.display_name,
            state.total,
            state.failed,
            state.extra,
        );

        if clears_clipboard {
            let _ = self.events.send(EngineEvent::ClipboardCleared {
                batch_id: batch_id.to_string(),
            });
            return;
        }

        let Some(cut) = cut else {
            return;
        };

        if state.failed > 0 {
            // A partial move must not delete source folders that may still
            // hold undelivered objects. The clipboard is released regardless.
            tracing::warn!(batch = batch_id, failed = state.failed, "cut batch had failures; skipping cleanup");
            let _ = self.events.send(EngineEvent::ClipboardCleared {
                batch_id: batch_id.to_string(),
            });
            return;
        }

        let folder_ops: Vec<Operation> = cut
            .original_top_level_sources
            .iter()
            .filter(|source| source.is_folder)
            .map(|source| {
                let mut op = Operation::delete_folder(&cut.source_bucket, &source.key);
                op.context.cleanup_delete = true;
                op
            })
            .collect();

        if folder_ops.is_empty() {
            let _ = self.events.send(EngineEvent::ClipboardCleared {
                batch_id: batch_id.to_string(),
            });
            return;
        }

        let cleanup_batch_id = format!("cleanup-after-cut-{}", Uuid::new_v4());
        let extra = BatchExtra {
            refresh_source_bucket: Some(cut.source_bucket.clone()),
            clears_clipboard: true,
            ..BatchExtra::default()
        };
        self.submit_batch(
            &cleanup_batch_id,
            folder_ops,
            "Deleting original cut folders",
            extra,
        )
        .await;
    }

    fn emit_batch_done(
        &self,
        batch_id: &str,
        display_name: &str,
        total: usize,
        failed: usize,
        extra: BatchExtra,
    ) {
        let _ = self.events.send(EngineEvent::BatchDone(BatchDonePayload {
            batch_id: batch_id.to_string(),
            display_name: display_name.to_string(),
            total,
            failed,
            finished_at: now_iso(),
            extra,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CutBatchExtra, SourceEntry};
    use crate::store::mock::MockStore;
    use crate::worker::OperationOutput;
    use std::fs;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    fn test_config() -> EngineConfig {
        EngineConfig::default()
    }

    #[tokio::test]
    async fn submit_without_store_fails_the_operation() {
        let (coordinator, mut rx) = Coordinator::new(test_config());
        coordinator.submit(Operation::list("bucket", "")).await;

        let EngineEvent::ListCompleted(completion) = next_event(&mut rx).await else {
            panic!("expected list completion");
        };
        assert!(completion.error.contains("not configured"));
    }

    #[tokio::test]
    async fn batch_of_uploads_completes_with_one_batch_done() {
        let (coordinator, mut rx) = Coordinator::new(test_config());
        let store = Arc::new(MockStore::new());
        coordinator.set_store(store.clone()).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut ops = Vec::new();
        for index in 0..5 {
            let path = dir.path().join(format!("f{index}.txt"));
            fs::write(&path, b"body").expect("write");
            ops.push(Operation::upload_file("bucket", &format!("up/f{index}.txt"), &path));
        }
        coordinator
            .submit_batch("batch-upload", ops, "Uploading files", BatchExtra::default())
            .await;

        let mut uploads = 0;
        let mut batch_done = 0;
        loop {
            match next_event(&mut rx).await {
                EngineEvent::UploadCompleted(completion) => {
                    assert_eq!(completion.error, "");
                    uploads += 1;
                }
                EngineEvent::BatchProgress(progress) => {
                    assert_eq!(progress.display_name, "Uploading files");
                    assert!(
                        progress.label.starts_with("Uploading files: "),
                        "unexpected label: {}",
                        progress.label
                    );
                }
                EngineEvent::BatchDone(done) => {
                    assert_eq!(done.batch_id, "batch-upload");
                    assert_eq!(done.display_name, "Uploading files");
                    assert_eq!(done.total, 5);
                    assert_eq!(done.failed, 0);
                    batch_done += 1;
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(uploads, 5);
        assert_eq!(batch_done, 1);
        assert_eq!(store.objects.lock().unwrap().len(), 5);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_list_completion_is_dropped() {
        let (coordinator, mut rx) = Coordinator::new(test_config());

        let operation = Operation::list("bucket", "docs/");
        let completion = || Completion {
            operation: operation.clone(),
            output: Some(OperationOutput::List(crate::worker::ListResult {
                requested_prefix: "docs/".to_string(),
                folders: Vec::new(),
                files: Vec::new(),
            })),
            error: String::new(),
        };

        coordinator.on_operation_finished(completion()).await;
        coordinator.on_operation_finished(completion()).await;
        coordinator
            .on_operation_finished(Completion {
                operation: Operation::delete_object("bucket", "x"),
                output: None,
                error: String::new(),
            })
            .await;

        assert!(matches!(
            next_event(&mut rx).await,
            EngineEvent::ListCompleted(_)
        ));
        // The duplicate must have been swallowed, so the next event is the
        // unrelated delete.
        assert!(matches!(
            next_event(&mut rx).await,
            EngineEvent::DeleteCompleted(_)
        ));
    }

    #[tokio::test]
    async fn successful_cut_runs_cleanup_then_clears_clipboard() {
        let (coordinator, mut rx) = Coordinator::new(test_config());
        let store = Arc::new(MockStore::new());
        store.insert_object("src-bucket", "folder/", b"");
        store.insert_object("src-bucket", "folder/a.txt", b"a");
        store.insert_object("src-bucket", "folder/b.txt", b"b");
        coordinator.set_store(store.clone()).await;

        let mut ops = Vec::new();
        for name in ["a.txt", "b.txt"] {
            let mut op = Operation::move_object(
                "dst-bucket",
                &format!("folder/{name}"),
                &format!("pasted/{name}"),
            );
            op.context.source_bucket_override = Some("src-bucket".to_string());
            ops.push(op);
        }
        let extra = BatchExtra {
            target_bucket: Some("dst-bucket".to_string()),
            cut: Some(CutBatchExtra {
                source_bucket: "src-bucket".to_string(),
                original_top_level_sources: vec![SourceEntry {
                    key: "folder/".to_string(),
                    is_folder: true,
                }],
            }),
            ..BatchExtra::default()
        };
        coordinator
            .submit_batch("batch-cut", ops, "Moving items", extra)
            .await;

        let mut saw_cut_done = false;
        let mut saw_cleanup_done = false;
        loop {
            match next_event(&mut rx).await {
                EngineEvent::BatchDone(done) if done.batch_id == "batch-cut" => {
                    assert_eq!(done.failed, 0);
                    saw_cut_done = true;
                }
                EngineEvent::BatchDone(done) => {
                    assert!(done.batch_id.starts_with("cleanup-after-cut-"));
                    assert_eq!(done.display_name, "Deleting original cut folders");
                    assert!(saw_cut_done, "cleanup finished before the cut batch");
                    assert_eq!(
                        done.extra.refresh_source_bucket.as_deref(),
                        Some("src-bucket")
                    );
                    saw_cleanup_done = true;
                }
                EngineEvent::ClipboardCleared { .. } => {
                    assert!(saw_cleanup_done, "clipboard cleared before cleanup finished");
                    break;
                }
                _ => {}
            }
        }

        assert!(store.contains("dst-bucket", "pasted/a.txt"));
        assert!(store.contains("dst-bucket", "pasted/b.txt"));
        assert!(!store.contains("src-bucket", "folder/"));
        assert!(!store.contains("src-bucket", "folder/a.txt"));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn failed_cut_skips_cleanup_but_clears_clipboard() {
        let (coordinator, mut rx) = Coordinator::new(test_config());
        let store = Arc::new(MockStore::new());
        store.insert_object("bucket", "folder/", b"");
        store.insert_object("bucket", "folder/a.txt", b"a");
        store.fail_copies_from("folder/a.txt");
        coordinator.set_store(store.clone()).await;

        let op = Operation::move_object("bucket", "folder/a.txt", "pasted/a.txt");
        let extra = BatchExtra {
            cut: Some(CutBatchExtra {
                source_bucket: "bucket".to_string(),
                original_top_level_sources: vec![SourceEntry {
                    key: "folder/".to_string(),
                    is_folder: true,
                }],
            }),
            ..BatchExtra::default()
        };
        coordinator
            .submit_batch("batch-cut", vec![op], "Moving items", extra)
            .await;

        let mut saw_done = false;
        loop {
            match next_event(&mut rx).await {
                EngineEvent::BatchDone(done) => {
                    assert_eq!(done.batch_id, "batch-cut");
                    assert_eq!(done.failed, 1);
                    saw_done = true;
                }
                EngineEvent::ClipboardCleared { batch_id } => {
                    assert!(saw_done);
                    assert_eq!(batch_id, "batch-cut");
                    break;
                }
                _ => {}
            }
        }

        // The source folder survives a failed move.
        assert!(store.contains("bucket", "folder/a.txt"));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let (coordinator, mut rx) = Coordinator::new(test_config());
        coordinator
            .submit_batch("batch-empty", Vec::new(), "Nothing to do", BatchExtra::default())
            .await;

        let EngineEvent::BatchDone(done) = next_event(&mut rx).await else {
            panic!("expected batch done");
        };
        assert_eq!(done.batch_id, "batch-empty");
        assert_eq!(done.total, 0);
    }

    #[tokio::test]
    async fn cleanup_delete_failures_do_not_count_as_batch_failures() {
        let (coordinator, mut rx) = Coordinator::new(test_config());

        let mut op = Operation::delete_folder("bucket", "gone/");
        op.context.cleanup_delete = true;
        coordinator
            .submit_batch(
                "batch-cleanup",
                vec![op.clone()],
                "Deleting original cut folders",
                BatchExtra::default(),
            )
            .await;

        // The worker pool is not running; feed the failure directly.
        let mut queued = op.with_batch_id("batch-cleanup");
        queued.context.cleanup_delete = true;
        coordinator
            .on_operation_finished(Completion {
                operation: queued,
                output: None,
                error: "AccessDenied".to_string(),
            })
            .await;

        loop {
            match next_event(&mut rx).await {
                EngineEvent::BatchDone(done) => {
                    assert_eq!(done.batch_id, "batch-cleanup");
                    assert_eq!(done.failed, 0);
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn open_for_edit_downloads_and_tracks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config();
        config.mirror_root = Some(dir.path().to_path_buf());

        let (coordinator, mut rx) = Coordinator::new(config);
        let store = Arc::new(MockStore::new());
        store.insert_object("bucket", "docs/note.txt", b"hello");
        coordinator.set_store(store.clone()).await;

        coordinator
            .open_for_edit("bucket", "docs/note.txt")
            .await
            .expect("submit");

        loop {
            if let EngineEvent::DownloadToTempCompleted(completion) = next_event(&mut rx).await {
                assert_eq!(completion.error, "");
                break;
            }
        }

        let entry = coordinator
            .temp_files()
            .get("docs/note.txt")
            .expect("tracked");
        assert!(entry.local_path.starts_with(dir.path()));
        assert!(entry.local_path.exists());
        assert_eq!(fs::read(&entry.local_path).expect("read"), b"hello");

        coordinator.shutdown().await;
        assert!(!entry.local_path.exists());
    }

    #[tokio::test]
    async fn tracked_upload_rebaselines_from_remote_metadata() {
        let (coordinator, mut rx) = Coordinator::new(test_config());
        let store = Arc::new(MockStore::new());
        coordinator.set_store(store.clone()).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("note.txt");
        fs::write(&path, b"edited").expect("write");
        let opened_at = Utc::now() - chrono::Duration::seconds(60);
        coordinator
            .temp_files()
            .track("bucket", "docs/note.txt", &path, Some(opened_at))
            .expect("track");

        let server_mtime = Utc::now() + chrono::Duration::seconds(30);
        let mut operation = Operation::upload_file("bucket", "docs/note.txt", &path);
        operation.context.temp_file_update = true;
        coordinator.submit(operation).await;

        loop {
            if let EngineEvent::UploadCompleted(completion) = next_event(&mut rx).await {
                assert_eq!(completion.error, "");
                break;
            }
        }
        // The server's recorded mtime, not the local clock, becomes the new
        // baseline.
        store.set_last_modified("bucket", "docs/note.txt", server_mtime);
        coordinator
            .on_operation_finished(Completion {
                operation: {
                    let mut op = Operation::upload_file("bucket", "docs/note.txt", &path);
                    op.context.temp_file_update = true;
                    op
                },
                output: None,
                error: String::new(),
            })
            .await;

        let entry = coordinator
            .temp_files()
            .get("docs/note.txt")
            .expect("tracked");
        assert_eq!(entry.remote_mtime_at_open, Some(server_mtime));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn temp_file_sweep_survives_a_failing_check() {
        let mut config = test_config();
        config.mtime_tolerance_secs = 0.05;
        let (coordinator, mut rx) = Coordinator::new(config);
        let store = Arc::new(MockStore::new());
        store.insert_object("bucket", "docs/good.txt", b"good");
        store.insert_object("bucket", "docs/bad.txt", b"bad");
        store.fail_heads_of("docs/bad.txt");
        coordinator.set_store(store.clone()).await;

        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["good.txt", "bad.txt"] {
            let path = dir.path().join(name);
            fs::write(&path, b"x").expect("write");
            coordinator
                .temp_files()
                .track(
                    "bucket",
                    &format!("docs/{name}"),
                    &path,
                    Some(Utc::now() - chrono::Duration::seconds(60)),
                )
                .expect("track");
        }
        // Edit both files so the sweep has to consult the remote, where one
        // head lookup is rigged to fail.
        tokio::time::sleep(Duration::from_millis(200)).await;
        for name in ["good.txt", "bad.txt"] {
            fs::write(dir.path().join(name), b"edited").expect("rewrite");
        }

        coordinator.check_temp_files().await.expect("sweep");

        // The good file's status still arrived despite the failing head.
        let mut saw_good = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if let EngineEvent::TempFileStatusChanged(payload) = event {
                if payload.remote_key == "docs/good.txt" {
                    saw_good = true;
                }
            }
        }
        assert!(saw_good);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_workers_promptly() {
        let (coordinator, _rx) = Coordinator::new(test_config());
        coordinator.set_store(Arc::new(MockStore::new())).await;

        tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown())
            .await
            .expect("shutdown hung");
    }
}
