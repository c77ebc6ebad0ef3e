use std::path::{Component, Path, PathBuf};

use crate::errors::{OpError, OpResult};

pub fn mirror_root_dir() -> OpResult<PathBuf> {
    let home = if cfg!(target_os = "windows") {
        std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .map_err(|_| OpError::LocalIo("Unable to resolve USERPROFILE/HOME".to_string()))?
    } else {
        std::env::var("HOME")
            .map_err(|_| OpError::LocalIo("Unable to resolve HOME".to_string()))?
    };

    let mut path = PathBuf::from(home);
    if cfg!(target_os = "macos") {
        path.push("Library");
        path.push("Application Support");
        path.push("s3mirror");
    } else {
        path.push(".config");
        path.push("s3mirror");
    }
    path.push("mirror");
    Ok(path)
}

/// Local mirror path for a remote object, laid out as
/// `<mirror root>/<bucket>/<key path>`. Rejects keys that would escape the
/// mirror root.
pub fn mirror_path_for(bucket: &str, key: &str) -> OpResult<PathBuf> {
    mirror_path_in(&mirror_root_dir()?, bucket, key)
}

/// Same layout under an explicit root, for embedders that relocate the
/// mirror.
pub fn mirror_path_in(root: &Path, bucket: &str, key: &str) -> OpResult<PathBuf> {
    let relative = sanitize_relative_path(key)
        .ok_or_else(|| OpError::LocalIo(format!("Unsafe object key for mirror path: {key}")))?;
    Ok(root.join(bucket).join(relative))
}

pub fn sanitize_relative_path(relative_path: &str) -> Option<PathBuf> {
    let candidate = Path::new(relative_path);
    if candidate.is_absolute() {
        return None;
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    Some(candidate.to_path_buf())
}

pub fn normalize_slashes(path: &Path) -> String {
    path.components()
        .filter_map(|part| match part {
            Component::Normal(value) => Some(value.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
