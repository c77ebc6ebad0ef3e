//! Remote-storage seam. The engine talks to a `RemoteStore` collaborator;
//! `S3Store` is the aws-sdk-s3 implementation used in production, and tests
//! substitute the in-memory mock at the bottom of this module.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
    Client as S3Client,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{fs as tokio_fs, io::AsyncReadExt};

use crate::errors::{OpError, OpResult};

const COPY_SOURCE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'/');
const MULTIPART_THRESHOLD_BYTES: i64 = 5 * 1024 * 1024;
const MULTIPART_PART_SIZE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub key: String,
    pub size: i64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub folders: Vec<String>,
    pub objects: Vec<RemoteObject>,
    pub next_token: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ObjectMeta {
    pub content_length: Option<i64>,
    pub last_modified: Option<DateTime<Utc>>,
}

pub struct ObjectBody {
    pub content_length: Option<i64>,
    pub stream: BoxStream<'static, OpResult<Vec<u8>>>,
}

#[derive(Clone, Debug, Default)]
pub struct BulkDeleteOutcome {
    pub deleted: usize,
    pub errors: Vec<String>,
}

/// The subset of an S3-compatible API the engine needs. All operation kinds
/// map 1:1 onto these primitives.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One page of a prefix listing. `delimiter` of `/` groups common
    /// prefixes into `folders`.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
    ) -> OpResult<ListPage>;

    async fn head_object(&self, bucket: &str, key: &str) -> OpResult<ObjectMeta>;

    async fn get_object(&self, bucket: &str, key: &str) -> OpResult<ObjectBody>;

    /// Streams a local file to the remote, reporting incremental progress.
    /// Implementations may switch to multipart uploads above an internal
    /// threshold.
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        cancel: &AtomicBool,
        on_progress: &mut (dyn FnMut(i64, i64) + Send),
    ) -> OpResult<i64>;

    async fn put_empty_object(&self, bucket: &str, key: &str) -> OpResult<()>;

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> OpResult<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> OpResult<()>;

    /// Bulk delete of at most 1000 keys; per-key failures are captured in the
    /// outcome rather than failing the call.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> OpResult<BulkDeleteOutcome>;

    async fn presign_get(&self, bucket: &str, key: &str, expires_in: Duration)
        -> OpResult<String>;
}

/// Connection settings for one profile. Credentials arrive already decrypted
/// from whatever vault layer sits above the engine.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3ConnectionSettings {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// "aws", "minio" or "custom"; the latter two force path-style addressing.
    pub provider: String,
}

pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    pub fn connect(settings: &S3ConnectionSettings) -> OpResult<Self> {
        if settings.access_key_id.trim().is_empty() || settings.secret_access_key.trim().is_empty()
        {
            return Err(OpError::LocalIo("Profile credentials are missing".to_string()));
        }

        let region = settings
            .region
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("us-east-1");

        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            settings.session_token.clone(),
            None,
            "s3mirror",
        );

        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version_latest()
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials);

        if let Some(endpoint) = settings
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            config_builder = config_builder.endpoint_url(endpoint.to_string());
        }

        if matches!(settings.provider.as_str(), "minio" | "custom") {
            config_builder = config_builder.force_path_style(true);
        }

        Ok(Self {
            client: S3Client::from_conf(config_builder.build()),
        })
    }

    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

fn map_sdk_err<E>(err: SdkError<E>) -> OpError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) => OpError::Timeout(err.to_string()),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            OpError::Timeout(err.to_string())
        }
        _ => {
            let code = err.code().unwrap_or("Unknown").to_string();
            let message = err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            OpError::Remote { code, message }
        }
    }
}

fn aws_datetime_to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    dt.to_millis()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

fn format_copy_source(source_bucket: &str, source_key: &str) -> String {
    let encoded = utf8_percent_encode(source_key, COPY_SOURCE_ENCODE_SET);
    format!("{source_bucket}/{encoded}")
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
    ) -> OpResult<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(bucket.to_string())
            .max_keys(1000)
            .prefix(prefix.to_string());

        if let Some(delimiter) = delimiter {
            request = request.delimiter(delimiter.to_string());
        }
        if let Some(token) = continuation {
            request = request.continuation_token(token.to_string());
        }

        let output = request.send().await.map_err(map_sdk_err)?;

        let folders = output
            .common_prefixes()
            .iter()
            .filter_map(|common| common.prefix().map(str::to_string))
            .collect();

        let objects = output
            .contents()
            .iter()
            .map(|item| RemoteObject {
                key: item.key().unwrap_or_default().to_string(),
                size: item.size().unwrap_or(0).max(0),
                etag: item
                    .e_tag()
                    .unwrap_or_default()
                    .trim_matches('"')
                    .to_string(),
                last_modified: item.last_modified().and_then(aws_datetime_to_chrono),
            })
            .collect();

        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            folders,
            objects,
            next_token,
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> OpResult<ObjectMeta> {
        match self
            .client
            .head_object()
            .bucket(bucket.to_string())
            .key(key.to_string())
            .send()
            .await
        {
            Ok(head) => Ok(ObjectMeta {
                content_length: head.content_length(),
                last_modified: head.last_modified().and_then(aws_datetime_to_chrono),
            }),
            Err(err) => {
                if matches!(&err, SdkError::ServiceError(ctx) if ctx.err().is_not_found()) {
                    return Err(OpError::remote("NotFound", format!("Object not found: {key}")));
                }
                Err(map_sdk_err(err))
            }
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> OpResult<ObjectBody> {
        let output = self
            .client
            .get_object()
            .bucket(bucket.to_string())
            .key(key.to_string())
            .send()
            .await
            .map_err(map_sdk_err)?;

        let content_length = output.content_length();
        let stream = futures_util::stream::try_unfold(output.body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(bytes)) => Ok(Some((bytes.to_vec(), body))),
                Ok(None) => Ok(None),
                Err(err) => Err(OpError::remote(
                    "DownloadStream",
                    format!("Download stream failed: {err}"),
                )),
            }
        })
        .boxed();

        Ok(ObjectBody {
            content_length,
            stream,
        })
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        cancel: &AtomicBool,
        on_progress: &mut (dyn FnMut(i64, i64) + Send),
    ) -> OpResult<i64> {
        if cancel.load(Ordering::SeqCst) {
            return Err(OpError::Cancelled);
        }

        let total = fs::metadata(local_path)
            .map(|meta| meta.len() as i64)
            .unwrap_or(0)
            .max(0);

        if total <= MULTIPART_THRESHOLD_BYTES {
            let body = ByteStream::from_path(local_path.to_path_buf())
                .await
                .map_err(|err| {
                    OpError::LocalIo(format!("Failed to stream {}: {err}", local_path.display()))
                })?;

            self.client
                .put_object()
                .bucket(bucket.to_string())
                .key(key.to_string())
                .body(body)
                .send()
                .await
                .map_err(map_sdk_err)?;

            on_progress(total, total);
            return Ok(total);
        }

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(bucket.to_string())
            .key(key.to_string())
            .send()
            .await
            .map_err(map_sdk_err)?;
        let upload_id = multipart
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| OpError::remote("Multipart", "Missing multipart upload id"))?;

        let mut file = tokio_fs::File::open(local_path).await.map_err(|err| {
            OpError::LocalIo(format!("Failed to open {}: {err}", local_path.display()))
        })?;
        let mut transferred: i64 = 0;
        let mut part_number: i32 = 1;
        let mut parts: Vec<CompletedPart> = Vec::new();

        let upload_result: OpResult<()> = async {
            loop {
                if cancel.load(Ordering::SeqCst) {
                    return Err(OpError::Cancelled);
                }

                let mut buffer = vec![0u8; MULTIPART_PART_SIZE_BYTES];
                let mut read_total: usize = 0;
                while read_total < buffer.len() {
                    let read = file.read(&mut buffer[read_total..]).await.map_err(|err| {
                        OpError::LocalIo(format!(
                            "Failed reading {}: {err}",
                            local_path.display()
                        ))
                    })?;
                    if read == 0 {
                        break;
                    }
                    read_total += read;
                }

                if read_total == 0 {
                    break;
                }
                buffer.truncate(read_total);

                let output = self
                    .client
                    .upload_part()
                    .bucket(bucket.to_string())
                    .key(key.to_string())
                    .upload_id(upload_id.clone())
                    .part_number(part_number)
                    .body(ByteStream::from(buffer))
                    .send()
                    .await
                    .map_err(map_sdk_err)?;

                let completed_part = CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build();
                parts.push(completed_part);

                transferred += read_total as i64;
                on_progress(transferred, total);
                part_number += 1;
            }

            if parts.is_empty() {
                return Err(OpError::remote("Multipart", "Multipart upload produced no parts"));
            }

            let completed_upload = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();

            self.client
                .complete_multipart_upload()
                .bucket(bucket.to_string())
                .key(key.to_string())
                .upload_id(upload_id.clone())
                .multipart_upload(completed_upload)
                .send()
                .await
                .map_err(map_sdk_err)?;

            Ok(())
        }
        .await;

        if let Err(err) = upload_result {
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(bucket.to_string())
                .key(key.to_string())
                .upload_id(upload_id)
                .send()
                .await;
            return Err(err);
        }

        on_progress(total, total);
        Ok(total)
    }

    async fn put_empty_object(&self, bucket: &str, key: &str) -> OpResult<()> {
        self.client
            .put_object()
            .bucket(bucket.to_string())
            .key(key.to_string())
            .body(ByteStream::from(Vec::<u8>::new()))
            .send()
            .await
            .map_err(map_sdk_err)?;
        Ok(())
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> OpResult<()> {
        self.client
            .copy_object()
            .bucket(dest_bucket.to_string())
            .key(dest_key.to_string())
            .copy_source(format_copy_source(source_bucket, source_key))
            .send()
            .await
            .map_err(map_sdk_err)?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> OpResult<()> {
        self.client
            .delete_object()
            .bucket(bucket.to_string())
            .key(key.to_string())
            .send()
            .await
            .map_err(map_sdk_err)?;
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> OpResult<BulkDeleteOutcome> {
        if keys.is_empty() {
            return Ok(BulkDeleteOutcome::default());
        }

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let object = ObjectIdentifier::builder()
                .key(key.clone())
                .build()
                .map_err(|err| OpError::remote("InvalidKey", format!("Invalid object identifier: {err}")))?;
            objects.push(object);
        }

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .map_err(|err| OpError::remote("InvalidDelete", format!("Invalid delete payload: {err}")))?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket.to_string())
            .delete(delete)
            .send()
            .await
            .map_err(map_sdk_err)?;

        let errors = output
            .errors()
            .iter()
            .map(|err| {
                format!(
                    "{}: {} ({})",
                    err.key().unwrap_or("<unknown key>"),
                    err.message().unwrap_or("delete failed"),
                    err.code().unwrap_or("Unknown")
                )
            })
            .collect();

        Ok(BulkDeleteOutcome {
            deleted: output.deleted().len(),
            errors,
        })
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> OpResult<String> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|err| OpError::LocalIo(format!("Invalid presign ttl: {err}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket.to_string())
            .key(key.to_string())
            .presigned(config)
            .await
            .map_err(map_sdk_err)?;

        Ok(presigned.uri().to_string())
    }
}
