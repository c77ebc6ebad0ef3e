//! Events the engine emits to its embedder. The stream is a plain unbounded
//! channel so any front end (or test) can consume it without a UI toolkit in
//! the loop.

use serde::Serialize;
use uuid::Uuid;

use crate::operation::Operation;
use crate::temp_files::TempFileStatus;
use crate::worker::OperationOutput;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCompletion {
    pub operation: Operation,
    pub output: Option<OperationOutput>,
    /// Empty string on success, display text on failure.
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgressPayload {
    pub operation_id: Uuid,
    pub bucket: String,
    pub key: String,
    pub transferred: i64,
    pub total: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgressPayload {
    pub batch_id: String,
    /// Human-readable batch description, e.g. "Uploading files".
    pub display_name: String,
    pub completed: usize,
    pub total: usize,
    pub failed: usize,
    /// "{display_name}: {item} ({completed}/{total})" status line text.
    pub label: String,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEntry {
    pub key: String,
    pub is_folder: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CutBatchExtra {
    pub source_bucket: String,
    /// Top-level items the user cut; folder entries among these drive the
    /// cascading cleanup batch.
    pub original_top_level_sources: Vec<SourceEntry>,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchExtra {
    pub target_bucket: Option<String>,
    pub target_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cut: Option<CutBatchExtra>,
    /// Bucket whose listing should be refreshed when the batch ends.
    pub refresh_source_bucket: Option<String>,
    pub clears_clipboard: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDonePayload {
    pub batch_id: String,
    pub display_name: String,
    pub total: usize,
    pub failed: usize,
    pub finished_at: String,
    pub extra: BatchExtra,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TempFileStatusPayload {
    pub remote_key: String,
    pub bucket: String,
    pub status: TempFileStatus,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveProgressPayload {
    pub archive_id: Uuid,
    pub current_key: String,
    pub completed_objects: usize,
    pub total_objects: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveCompletedPayload {
    pub archive_id: Uuid,
    pub destination: String,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "payload")]
pub enum EngineEvent {
    ListCompleted(OperationCompletion),
    DownloadToTempCompleted(OperationCompletion),
    DownloadFileCompleted(OperationCompletion),
    UploadCompleted(OperationCompletion),
    DeleteCompleted(OperationCompletion),
    CreateFolderCompleted(OperationCompletion),
    CopyObjectCompleted(OperationCompletion),
    TransferProgress(TransferProgressPayload),
    BatchProgress(BatchProgressPayload),
    BatchDone(BatchDonePayload),
    #[serde(rename_all = "camelCase")]
    ClipboardCleared { batch_id: String },
    TempFileStatusChanged(TempFileStatusPayload),
    ArchiveProgress(ArchiveProgressPayload),
    ArchiveCompleted(ArchiveCompletedPayload),
}

impl EngineEvent {
    /// Routes a completion to the per-kind event the embedder listens for.
    pub(crate) fn for_completion(completion: OperationCompletion) -> Self {
        use crate::operation::OperationKind::*;
        match completion.operation.kind {
            List => Self::ListCompleted(completion),
            DownloadToTemp => Self::DownloadToTempCompleted(completion),
            DownloadFile => Self::DownloadFileCompleted(completion),
            UploadFile => Self::UploadCompleted(completion),
            DeleteObject | DeleteFolder => Self::DeleteCompleted(completion),
            CreateFolder => Self::CreateFolderCompleted(completion),
            CopyObject => Self::CopyObjectCompleted(completion),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    #[test]
    fn completion_routes_by_kind() {
        let completion = OperationCompletion {
            operation: Operation::list("bucket", ""),
            output: None,
            error: String::new(),
        };
        assert!(matches!(
            EngineEvent::for_completion(completion),
            EngineEvent::ListCompleted(_)
        ));

        let completion = OperationCompletion {
            operation: Operation::delete_folder("bucket", "a/"),
            output: None,
            error: String::new(),
        };
        assert!(matches!(
            EngineEvent::for_completion(completion),
            EngineEvent::DeleteCompleted(_)
        ));
    }

    #[test]
    fn events_serialize_with_tagged_payload() {
        let event = EngineEvent::ClipboardCleared {
            batch_id: "batch-1".to_string(),
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["event"], "clipboardCleared");
        assert_eq!(json["payload"]["batchId"], "batch-1");
    }
}
