//! Operation value objects: one atomic remote-storage request plus its
//! move/context metadata. Operations are immutable after submission and are
//! consumed exactly once by one worker.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::{OpError, OpResult};
use crate::mirror_paths::normalize_slashes;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    List,
    DeleteObject,
    DeleteFolder,
    DownloadToTemp,
    DownloadFile,
    UploadFile,
    CreateFolder,
    CopyObject,
}

/// Typed completion context carried through to the completion notification.
/// The fixed vocabulary replaces the free-form callback maps of earlier
/// revisions; workers never interpret any of it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpContext {
    /// Batch this operation belongs to, if any.
    pub batch_id: Option<String>,
    /// Opaque caller tag (e.g. originating view) echoed back on completion.
    pub source_tag: Option<String>,
    /// Source bucket for COPY_OBJECT when it differs from the destination.
    pub source_bucket_override: Option<String>,
    /// Member of a cascading cleanup batch; failures here do not count
    /// against the batch's failed counter.
    #[serde(default)]
    pub cleanup_delete: bool,
    /// A successful upload with this flag advances the temp-file baseline.
    #[serde(default)]
    pub temp_file_update: bool,
    /// Enqueued by the live-edit sync trigger.
    #[serde(default)]
    pub live_edit: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub bucket: String,
    /// Source key, or the prefix for LIST.
    pub key: Option<String>,
    /// Destination key for COPY_OBJECT.
    pub new_key: Option<String>,
    pub local_path: Option<PathBuf>,
    pub is_part_of_move: bool,
    /// Key to delete once a move's copy succeeds. Always present when
    /// `is_part_of_move` is set; the constructors enforce this.
    pub original_source_key_for_move: Option<String>,
    pub context: OpContext,
}

impl Operation {
    fn base(kind: OperationKind, bucket: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            bucket: bucket.to_string(),
            key: None,
            new_key: None,
            local_path: None,
            is_part_of_move: false,
            original_source_key_for_move: None,
            context: OpContext::default(),
        }
    }

    /// LIST the bucket under `prefix` ("" for the bucket root).
    pub fn list(bucket: &str, prefix: &str) -> Self {
        let mut op = Self::base(OperationKind::List, bucket);
        op.key = Some(prefix.to_string());
        op
    }

    pub fn delete_object(bucket: &str, key: &str) -> Self {
        let mut op = Self::base(OperationKind::DeleteObject, bucket);
        op.key = Some(key.to_string());
        op
    }

    pub fn delete_folder(bucket: &str, key: &str) -> Self {
        let mut op = Self::base(OperationKind::DeleteFolder, bucket);
        op.key = Some(key.to_string());
        op
    }

    pub fn download_to_temp(bucket: &str, key: &str, local_path: impl Into<PathBuf>) -> Self {
        let mut op = Self::base(OperationKind::DownloadToTemp, bucket);
        op.key = Some(key.to_string());
        op.local_path = Some(local_path.into());
        op
    }

    pub fn download_file(bucket: &str, key: &str, local_path: impl Into<PathBuf>) -> Self {
        let mut op = Self::base(OperationKind::DownloadFile, bucket);
        op.key = Some(key.to_string());
        op.local_path = Some(local_path.into());
        op
    }

    pub fn upload_file(bucket: &str, key: &str, local_path: impl Into<PathBuf>) -> Self {
        let mut op = Self::base(OperationKind::UploadFile, bucket);
        op.key = Some(key.to_string());
        op.local_path = Some(local_path.into());
        op
    }

    pub fn create_folder(bucket: &str, key: &str) -> Self {
        let mut op = Self::base(OperationKind::CreateFolder, bucket);
        op.key = Some(key.to_string());
        op
    }

    pub fn copy_object(bucket: &str, source_key: &str, dest_key: &str) -> Self {
        let mut op = Self::base(OperationKind::CopyObject, bucket);
        op.key = Some(source_key.to_string());
        op.new_key = Some(dest_key.to_string());
        op
    }

    /// Copy that is half of a move; the original source key is deleted after
    /// a successful copy and the outcome of that delete is reported
    /// distinctly.
    pub fn move_object(bucket: &str, source_key: &str, dest_key: &str) -> Self {
        let mut op = Self::copy_object(bucket, source_key, dest_key);
        op.is_part_of_move = true;
        op.original_source_key_for_move = Some(source_key.to_string());
        op
    }

    pub fn with_context(mut self, context: OpContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_batch_id(mut self, batch_id: &str) -> Self {
        self.context.batch_id = Some(batch_id.to_string());
        self
    }

    /// Human-readable item name for progress labels and status lines.
    pub fn display_name(&self) -> String {
        let raw = self
            .key
            .as_deref()
            .or(self.new_key.as_deref())
            .unwrap_or("item");
        let trimmed = raw.trim_end_matches('/');
        trimmed
            .rsplit('/')
            .next()
            .filter(|part| !part.is_empty())
            .unwrap_or("item")
            .to_string()
    }
}

/// Expands a local directory into one UPLOAD_FILE operation per regular file,
/// keyed under `dest_prefix` with forward-slash separators. Callers submit the
/// result as a batch.
pub fn plan_folder_upload(
    local_dir: &Path,
    bucket: &str,
    dest_prefix: &str,
) -> OpResult<Vec<Operation>> {
    if !local_dir.is_dir() {
        return Err(OpError::FileNotFound(local_dir.display().to_string()));
    }

    let prefix = if dest_prefix.is_empty() || dest_prefix.ends_with('/') {
        dest_prefix.to_string()
    } else {
        format!("{dest_prefix}/")
    };

    let mut operations = Vec::new();
    for entry in WalkDir::new(local_dir) {
        let entry = entry.map_err(|err| OpError::LocalIo(err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(local_dir)
            .map_err(|err| OpError::LocalIo(err.to_string()))?;
        let key = format!("{prefix}{}", normalize_slashes(relative));
        operations.push(Operation::upload_file(bucket, &key, entry.path()));
    }

    Ok(operations)
}
