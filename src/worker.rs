//! Worker pool internals: queue items, per-kind execution, and the completion
//! tuple workers hand back to the coordinator.

use futures_util::StreamExt;
use serde::Serialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    fs as tokio_fs,
    io::AsyncWriteExt,
    sync::{mpsc, Mutex as TokioMutex},
};
use uuid::Uuid;

use crate::errors::{OpError, OpResult};
use crate::events::{EngineEvent, TransferProgressPayload};
use crate::operation::{Operation, OperationKind};
use crate::store::{RemoteObject, RemoteStore};

/// Queue entries. `Shutdown` is a sentinel the coordinator pushes once per
/// worker so idle workers wake and exit promptly.
pub(crate) enum QueueItem {
    Work(Box<Operation>),
    Shutdown,
}

/// What a worker sends back for every dequeued operation, success or failure.
#[derive(Debug)]
pub(crate) struct Completion {
    pub operation: Operation,
    pub output: Option<OperationOutput>,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub requested_prefix: String,
    pub folders: Vec<String>,
    pub files: Vec<RemoteObject>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub bytes: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyResult {
    pub source_bucket: String,
    pub source_key: String,
    pub dest_bucket: String,
    pub dest_key: String,
    /// Move only: whether the post-copy delete of the original succeeded.
    pub original_deleted: bool,
    pub original_delete_error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "result")]
pub enum OperationOutput {
    List(ListResult),
    ObjectDeleted { key: String },
    #[serde(rename_all = "camelCase")]
    FolderDeleted { key: String, deleted_count: usize },
    Download(TransferResult),
    Upload(TransferResult),
    FolderCreated { key: String },
    Copy(CopyResult),
}

pub(crate) type CancelFlags = Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>;

pub(crate) struct WorkerContext {
    pub store: Arc<dyn RemoteStore>,
    pub queue: Arc<TokioMutex<mpsc::UnboundedReceiver<QueueItem>>>,
    pub stop: Arc<AtomicBool>,
    pub completions: mpsc::UnboundedSender<Completion>,
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub cancel_flags: CancelFlags,
    pub poll_timeout: Duration,
}

/// One worker loop. Workers share the receiver behind an async mutex and poll
/// with a timeout so a raised stop flag is noticed even when the queue is
/// quiet.
pub(crate) async fn run_worker(index: usize, ctx: WorkerContext) {
    tracing::debug!(worker = index, "worker started");
    loop {
        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        let item = {
            let mut receiver = ctx.queue.lock().await;
            match tokio::time::timeout(ctx.poll_timeout, receiver.recv()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => continue,
            }
        };

        // A dequeued operation always runs to completion; shutdown only
        // retires workers between operations.
        let operation = match item {
            QueueItem::Work(operation) => *operation,
            QueueItem::Shutdown => break,
        };

        let cancel = cancel_flag_for(&ctx.cancel_flags, operation.id);
        let (output, error) = execute(&ctx, &operation, &cancel).await;
        if let Ok(mut flags) = ctx.cancel_flags.lock() {
            flags.remove(&operation.id);
        }

        if !error.is_empty() {
            tracing::warn!(
                worker = index,
                operation = %operation.id,
                kind = ?operation.kind,
                error = %error,
                "operation failed"
            );
        }

        if ctx
            .completions
            .send(Completion {
                operation,
                output,
                error,
            })
            .is_err()
        {
            break;
        }
    }
    tracing::debug!(worker = index, "worker stopped");
}

fn cancel_flag_for(flags: &CancelFlags, id: Uuid) -> Arc<AtomicBool> {
    match flags.lock() {
        Ok(mut flags) => flags
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone(),
        Err(_) => Arc::new(AtomicBool::new(false)),
    }
}

/// Runs one operation to completion. Never panics or propagates; the error
/// half of the pair is empty on success and display text otherwise.
pub(crate) async fn execute(
    ctx: &WorkerContext,
    operation: &Operation,
    cancel: &AtomicBool,
) -> (Option<OperationOutput>, String) {
    let result: OpResult<OperationOutput> = async {
        match operation.kind {
            OperationKind::List => execute_list(ctx, operation).await,
            OperationKind::DeleteObject => execute_delete_object(ctx, operation).await,
            OperationKind::DeleteFolder => execute_delete_folder(ctx, operation).await,
            OperationKind::DownloadToTemp | OperationKind::DownloadFile => {
                execute_download(ctx, operation, cancel).await
            }
            OperationKind::UploadFile => execute_upload(ctx, operation, cancel).await,
            OperationKind::CreateFolder => execute_create_folder(ctx, operation).await,
            OperationKind::CopyObject => execute_copy(ctx, operation).await,
        }
    }
    .await;

    match result {
        Ok(output) => (Some(output), String::new()),
        Err(err) => (None, err.to_string()),
    }
}

fn required_key(operation: &Operation) -> OpResult<&str> {
    operation
        .key
        .as_deref()
        .ok_or_else(|| OpError::LocalIo("Operation is missing an object key".to_string()))
}

fn required_local_path(operation: &Operation) -> OpResult<&Path> {
    operation
        .local_path
        .as_deref()
        .ok_or_else(|| OpError::LocalIo("Operation is missing a local path".to_string()))
}

fn folder_prefix(raw: &str) -> String {
    if raw.is_empty() || raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    }
}

async fn execute_list(ctx: &WorkerContext, operation: &Operation) -> OpResult<OperationOutput> {
    let prefix = folder_prefix(operation.key.as_deref().unwrap_or_default());

    let mut folders: Vec<String> = Vec::new();
    let mut files: Vec<RemoteObject> = Vec::new();
    let mut continuation: Option<String> = None;

    loop {
        let page = ctx
            .store
            .list_page(&operation.bucket, &prefix, Some("/"), continuation.as_deref())
            .await?;

        folders.extend(page.folders);
        // The folder placeholder itself is not a listable child.
        files.extend(page.objects.into_iter().filter(|object| object.key != prefix));

        match page.next_token {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }

    Ok(OperationOutput::List(ListResult {
        requested_prefix: prefix,
        folders,
        files,
    }))
}

async fn execute_delete_object(
    ctx: &WorkerContext,
    operation: &Operation,
) -> OpResult<OperationOutput> {
    let key = required_key(operation)?;
    ctx.store.delete_object(&operation.bucket, key).await?;
    Ok(OperationOutput::ObjectDeleted {
        key: key.to_string(),
    })
}

async fn execute_delete_folder(
    ctx: &WorkerContext,
    operation: &Operation,
) -> OpResult<OperationOutput> {
    let key = required_key(operation)?;
    let prefix = folder_prefix(key);

    let mut keys: Vec<String> = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = ctx
            .store
            .list_page(&operation.bucket, &prefix, None, continuation.as_deref())
            .await?;
        keys.extend(page.objects.into_iter().map(|object| object.key));
        match page.next_token {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }

    let mut deleted_count = 0usize;
    let mut errors: Vec<String> = Vec::new();
    for chunk in keys.chunks(1000) {
        let outcome = ctx
            .store
            .delete_objects(&operation.bucket, chunk)
            .await?;
        deleted_count += outcome.deleted;
        errors.extend(outcome.errors);
    }

    // The placeholder may exist even when the listing missed it; a missing
    // marker is not a failure.
    match ctx.store.delete_object(&operation.bucket, &prefix).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => errors.push(err.to_string()),
    }

    if !errors.is_empty() {
        return Err(OpError::remote(
            "PartialDelete",
            format!(
                "Deleted {deleted_count} objects under {prefix}; {} failed: {}",
                errors.len(),
                errors.join("; ")
            ),
        ));
    }

    Ok(OperationOutput::FolderDeleted {
        key: prefix,
        deleted_count,
    })
}

async fn execute_download(
    ctx: &WorkerContext,
    operation: &Operation,
    cancel: &AtomicBool,
) -> OpResult<OperationOutput> {
    let key = required_key(operation)?.to_string();
    let local_path = required_local_path(operation)?.to_path_buf();

    if let Some(parent) = local_path.parent() {
        tokio_fs::create_dir_all(parent).await?;
    }

    let body = ctx.store.get_object(&operation.bucket, &key).await?;
    let total = body.content_length.unwrap_or(0);

    let write_result: OpResult<i64> = async {
        let mut file = tokio_fs::File::create(&local_path).await?;
        let mut stream = body.stream;
        let mut transferred: i64 = 0;

        while let Some(chunk) = stream.next().await {
            if cancel.load(Ordering::SeqCst) {
                return Err(OpError::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            transferred += chunk.len() as i64;
            let _ = ctx.events.send(EngineEvent::TransferProgress(TransferProgressPayload {
                operation_id: operation.id,
                bucket: operation.bucket.clone(),
                key: key.clone(),
                transferred,
                total,
            }));
        }

        file.flush().await?;
        Ok(transferred)
    }
    .await;

    match write_result {
        Ok(bytes) => Ok(OperationOutput::Download(TransferResult {
            bucket: operation.bucket.clone(),
            key,
            local_path,
            bytes,
        })),
        Err(err) => {
            let _ = tokio_fs::remove_file(&local_path).await;
            Err(err)
        }
    }
}

async fn execute_upload(
    ctx: &WorkerContext,
    operation: &Operation,
    cancel: &AtomicBool,
) -> OpResult<OperationOutput> {
    let key = required_key(operation)?.to_string();
    let local_path = required_local_path(operation)?.to_path_buf();

    if !local_path.is_file() {
        return Err(OpError::FileNotFound(local_path.display().to_string()));
    }

    let events = ctx.events.clone();
    let operation_id = operation.id;
    let bucket = operation.bucket.clone();
    let progress_key = key.clone();
    let mut on_progress = move |transferred: i64, total: i64| {
        let _ = events.send(EngineEvent::TransferProgress(TransferProgressPayload {
            operation_id,
            bucket: bucket.clone(),
            key: progress_key.clone(),
            transferred,
            total,
        }));
    };

    let bytes = ctx
        .store
        .put_file(&operation.bucket, &key, &local_path, cancel, &mut on_progress)
        .await?;

    Ok(OperationOutput::Upload(TransferResult {
        bucket: operation.bucket.clone(),
        key,
        local_path,
        bytes,
    }))
}

async fn execute_create_folder(
    ctx: &WorkerContext,
    operation: &Operation,
) -> OpResult<OperationOutput> {
    let key = folder_prefix(required_key(operation)?);
    if key.is_empty() {
        return Err(OpError::LocalIo("Folder key must not be empty".to_string()));
    }
    ctx.store.put_empty_object(&operation.bucket, &key).await?;
    Ok(OperationOutput::FolderCreated { key })
}

async fn execute_copy(ctx: &WorkerContext, operation: &Operation) -> OpResult<OperationOutput> {
    let source_key = required_key(operation)?.to_string();
    let dest_key = operation
        .new_key
        .clone()
        .ok_or_else(|| OpError::LocalIo("Copy is missing a destination key".to_string()))?;
    let source_bucket = operation
        .context
        .source_bucket_override
        .clone()
        .unwrap_or_else(|| operation.bucket.clone());

    ctx.store
        .copy_object(&source_bucket, &source_key, &operation.bucket, &dest_key)
        .await?;

    let mut original_deleted = false;
    let mut original_delete_error = None;
    if operation.is_part_of_move {
        if let Some(original_key) = operation.original_source_key_for_move.as_deref() {
            // A failed source delete leaves a stray original but the copy
            // itself succeeded, so it is reported rather than failing the op.
            match ctx.store.delete_object(&source_bucket, original_key).await {
                Ok(()) => original_deleted = true,
                Err(err) => original_delete_error = Some(err.to_string()),
            }
        }
    }

    Ok(OperationOutput::Copy(CopyResult {
        source_bucket,
        source_key,
        dest_bucket: operation.bucket.clone(),
        dest_key,
        original_deleted,
        original_delete_error,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;
    use std::fs;

    fn test_context(store: Arc<MockStore>) -> (WorkerContext, mpsc::UnboundedReceiver<EngineEvent>) {
        let (_queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (completions_tx, _completions_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            store,
            queue: Arc::new(TokioMutex::new(queue_rx)),
            stop: Arc::new(AtomicBool::new(false)),
            completions: completions_tx,
            events: events_tx,
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
            poll_timeout: Duration::from_millis(50),
        };
        (ctx, events_rx)
    }

    fn unset_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[tokio::test]
    async fn list_excludes_the_folder_placeholder() {
        let store = Arc::new(MockStore::new());
        store.insert_object("bucket", "docs/", b"");
        store.insert_object("bucket", "docs/a.txt", b"aaa");
        store.insert_object("bucket", "docs/sub/b.txt", b"bbb");
        let (ctx, _events) = test_context(store);

        let op = Operation::list("bucket", "docs");
        let (output, error) = execute(&ctx, &op, &unset_cancel()).await;
        assert_eq!(error, "");

        let Some(OperationOutput::List(list)) = output else {
            panic!("expected list output");
        };
        assert_eq!(list.requested_prefix, "docs/");
        assert_eq!(list.folders, vec!["docs/sub/".to_string()]);
        let keys: Vec<&str> = list.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["docs/a.txt"]);
    }

    #[tokio::test]
    async fn delete_folder_chunks_bulk_deletes_at_1000() {
        let store = Arc::new(MockStore::new());
        store.insert_many("bucket", "big/", 2500);
        let (ctx, _events) = test_context(store.clone());

        let op = Operation::delete_folder("bucket", "big/");
        let (output, error) = execute(&ctx, &op, &unset_cancel()).await;
        assert_eq!(error, "");
        assert!(matches!(
            output,
            Some(OperationOutput::FolderDeleted { deleted_count: 2500, .. })
        ));
        assert_eq!(
            store.bulk_delete_sizes.lock().unwrap().as_slice(),
            &[1000, 1000, 500]
        );
        assert!(store.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_folder_tolerates_missing_placeholder() {
        let store = Arc::new(MockStore::new());
        store.insert_object("bucket", "docs/a.txt", b"a");
        let (ctx, _events) = test_context(store);

        let op = Operation::delete_folder("bucket", "docs/");
        let (_output, error) = execute(&ctx, &op, &unset_cancel()).await;
        assert_eq!(error, "");
    }

    #[tokio::test]
    async fn upload_of_missing_file_fails_without_touching_the_store() {
        let store = Arc::new(MockStore::new());
        let (ctx, _events) = test_context(store.clone());

        let op = Operation::upload_file("bucket", "a.txt", "/definitely/not/here.txt");
        let (output, error) = execute(&ctx, &op, &unset_cancel()).await;
        assert!(output.is_none());
        assert!(error.contains("not found"), "unexpected error: {error}");
        assert!(store.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn download_creates_parent_directories_and_reports_progress() {
        let store = Arc::new(MockStore::new());
        store.insert_object("bucket", "docs/a.txt", b"hello");
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("deep").join("a.txt");
        let (ctx, mut events) = test_context(store);

        let op = Operation::download_file("bucket", "docs/a.txt", &target);
        let (output, error) = execute(&ctx, &op, &unset_cancel()).await;
        assert_eq!(error, "");
        assert!(matches!(output, Some(OperationOutput::Download(ref t)) if t.bytes == 5));
        assert_eq!(fs::read(&target).expect("read"), b"hello");

        let Some(EngineEvent::TransferProgress(progress)) = events.recv().await else {
            panic!("expected progress event");
        };
        assert_eq!(progress.transferred, 5);
    }

    #[tokio::test]
    async fn move_with_failed_source_delete_still_succeeds() {
        let store = Arc::new(MockStore::new());
        store.insert_object("bucket", "src/a.txt", b"a");
        store.fail_deletes_of("src/a.txt");
        let (ctx, _events) = test_context(store.clone());

        let op = Operation::move_object("bucket", "src/a.txt", "dst/a.txt");
        let (output, error) = execute(&ctx, &op, &unset_cancel()).await;
        assert_eq!(error, "");

        let Some(OperationOutput::Copy(copy)) = output else {
            panic!("expected copy output");
        };
        assert!(!copy.original_deleted);
        assert!(copy.original_delete_error.is_some());
        assert!(store.contains("bucket", "dst/a.txt"));
        assert!(store.contains("bucket", "src/a.txt"));
    }

    #[tokio::test]
    async fn copy_honors_source_bucket_override() {
        let store = Arc::new(MockStore::new());
        store.insert_object("other", "src/a.txt", b"a");
        let (ctx, _events) = test_context(store.clone());

        let mut op = Operation::copy_object("bucket", "src/a.txt", "dst/a.txt");
        op.context.source_bucket_override = Some("other".to_string());
        let (output, error) = execute(&ctx, &op, &unset_cancel()).await;
        assert_eq!(error, "");
        assert!(matches!(output, Some(OperationOutput::Copy(_))));
        assert!(store.contains("bucket", "dst/a.txt"));
    }

    #[tokio::test]
    async fn queued_operation_ahead_of_shutdown_still_completes() {
        let store = Arc::new(MockStore::new());
        store.insert_object("bucket", "docs/a.txt", b"a");

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (completions_tx, mut completions_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            store,
            queue: Arc::new(TokioMutex::new(queue_rx)),
            stop: Arc::new(AtomicBool::new(false)),
            completions: completions_tx,
            events: events_tx,
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
            poll_timeout: Duration::from_millis(50),
        };

        let op = Operation::delete_object("bucket", "docs/a.txt");
        queue_tx
            .send(QueueItem::Work(Box::new(op.clone())))
            .expect("queue");
        queue_tx.send(QueueItem::Shutdown).expect("queue");

        run_worker(0, ctx).await;

        let completion = completions_rx.recv().await.expect("completion");
        assert_eq!(completion.operation.id, op.id);
        assert_eq!(completion.error, "");
        assert!(completions_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_upload_reports_cancellation() {
        let store = Arc::new(MockStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.txt");
        fs::write(&path, b"body").expect("write");
        let (ctx, _events) = test_context(store);

        let op = Operation::upload_file("bucket", "a.txt", &path);
        let cancel = AtomicBool::new(true);
        let (output, error) = execute(&ctx, &op, &cancel).await;
        assert!(output.is_none());
        assert!(error.contains("cancelled"), "unexpected error: {error}");
    }
}
