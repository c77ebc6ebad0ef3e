//! Streams a set of remote objects into a single local `.tar.gz` without
//! buffering whole objects in memory.

use flate2::{write::GzEncoder, Compression};
use futures_util::StreamExt;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::errors::{OpError, OpResult};
use crate::mirror_paths::sanitize_relative_path;
use crate::store::RemoteStore;

const TAR_BLOCK: usize = 512;

/// Archive entry path for a key, relative to the common prefix. Keys that
/// would escape the extraction directory are rejected.
fn entry_name(key: &str, common_prefix: &str) -> OpResult<std::path::PathBuf> {
    let stripped = key.strip_prefix(common_prefix).unwrap_or(key);
    let name = if stripped.is_empty() {
        key.rsplit('/').next().unwrap_or(key)
    } else {
        stripped
    };
    sanitize_relative_path(name)
        .ok_or_else(|| OpError::LocalIo(format!("Unsafe archive entry name: {name}")))
}

/// Downloads `keys` from `bucket` into a gzip-compressed tar at
/// `destination`. Entry paths are relative to `common_prefix`. The partial
/// archive is removed on any failure, including cancellation.
pub async fn download_archive_tar_gz(
    store: &dyn RemoteStore,
    bucket: &str,
    keys: &[String],
    common_prefix: &str,
    destination: &Path,
    cancel: &AtomicBool,
    on_progress: &mut (dyn FnMut(&str, usize, usize) + Send),
) -> OpResult<()> {
    if keys.is_empty() {
        return Err(OpError::LocalIo("Archive requires at least one object".to_string()));
    }

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = write_archive(store, bucket, keys, common_prefix, destination, cancel, on_progress)
        .await;

    if result.is_err() {
        let _ = std::fs::remove_file(destination);
    }
    result
}

async fn write_archive(
    store: &dyn RemoteStore,
    bucket: &str,
    keys: &[String],
    common_prefix: &str,
    destination: &Path,
    cancel: &AtomicBool,
    on_progress: &mut (dyn FnMut(&str, usize, usize) + Send),
) -> OpResult<()> {
    let file = File::create(destination)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

    for (index, key) in keys.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            return Err(OpError::Cancelled);
        }
        on_progress(key, index, keys.len());

        let body = store.get_object(bucket, key).await?;
        let size = body
            .content_length
            .ok_or_else(|| OpError::remote("Archive", format!("Unknown size for {key}")))?;
        if size < 0 {
            return Err(OpError::remote("Archive", format!("Negative size for {key}")));
        }

        let mut header = tar::Header::new_gnu();
        header
            .set_path(entry_name(key, common_prefix)?)
            .map_err(|err| OpError::LocalIo(format!("Invalid archive path for {key}: {err}")))?;
        header.set_size(size as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        encoder.write_all(header.as_bytes())?;

        let mut written: u64 = 0;
        let mut stream = body.stream;
        while let Some(chunk) = stream.next().await {
            if cancel.load(Ordering::SeqCst) {
                return Err(OpError::Cancelled);
            }
            let chunk = chunk?;
            encoder.write_all(&chunk)?;
            written += chunk.len() as u64;
        }

        if written != size as u64 {
            return Err(OpError::remote(
                "Archive",
                format!("Size mismatch for {key}: expected {size}, got {written}"),
            ));
        }

        let remainder = (written as usize) % TAR_BLOCK;
        if remainder != 0 {
            encoder.write_all(&vec![0u8; TAR_BLOCK - remainder])?;
        }
    }

    // Two zero blocks terminate a tar stream.
    encoder.write_all(&[0u8; TAR_BLOCK * 2])?;
    let mut writer = encoder
        .finish()
        .map_err(|err| OpError::LocalIo(format!("Failed to finish archive: {err}")))?;
    writer.flush()?;

    on_progress("", keys.len(), keys.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[tokio::test]
    async fn archive_contains_prefix_relative_entries() {
        let store = MockStore::new();
        store.insert_object("bucket", "docs/a.txt", b"alpha");
        store.insert_object("bucket", "docs/sub/b.txt", b"bravo-bravo");

        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("out.tar.gz");
        let keys = vec!["docs/a.txt".to_string(), "docs/sub/b.txt".to_string()];
        let cancel = AtomicBool::new(false);
        let mut seen: Vec<(String, usize)> = Vec::new();

        download_archive_tar_gz(
            &store,
            "bucket",
            &keys,
            "docs/",
            &destination,
            &cancel,
            &mut |key, done, _total| seen.push((key.to_string(), done)),
        )
        .await
        .expect("archive");

        assert_eq!(seen.first(), Some(&("docs/a.txt".to_string(), 0)));
        assert_eq!(seen.last(), Some(&(String::new(), 2)));

        let file = File::open(&destination).expect("open");
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        for entry in archive.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            let path = entry.path().expect("path").to_string_lossy().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).expect("read");
            entries.push((path, body));
        }

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "a.txt");
        assert_eq!(entries[0].1, b"alpha");
        assert_eq!(entries[1].0, "sub/b.txt");
        assert_eq!(entries[1].1, b"bravo-bravo");
    }

    #[tokio::test]
    async fn cancelled_archive_removes_partial_output() {
        let store = MockStore::new();
        store.insert_object("bucket", "a.txt", b"alpha");

        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("out.tar.gz");
        let keys = vec!["a.txt".to_string()];
        let cancel = AtomicBool::new(true);

        let err = download_archive_tar_gz(
            &store,
            "bucket",
            &keys,
            "",
            &destination,
            &cancel,
            &mut |_, _, _| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, OpError::Cancelled));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected_and_partial_output_removed() {
        let store = MockStore::new();
        store.insert_object("bucket", "docs/a.txt", b"alpha");
        store.insert_object("bucket", "docs/../../evil.txt", b"payload");

        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("out.tar.gz");
        let keys = vec![
            "docs/a.txt".to_string(),
            "docs/../../evil.txt".to_string(),
        ];
        let cancel = AtomicBool::new(false);

        let err = download_archive_tar_gz(
            &store,
            "bucket",
            &keys,
            "docs/",
            &destination,
            &cancel,
            &mut |_, _, _| {},
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("Unsafe archive entry name"));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn empty_key_set_is_rejected() {
        let store = MockStore::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("out.tar.gz");
        let cancel = AtomicBool::new(false);

        assert!(download_archive_tar_gz(
            &store,
            "bucket",
            &[],
            "",
            &destination,
            &cancel,
            &mut |_, _, _| {},
        )
        .await
        .is_err());
    }
}
