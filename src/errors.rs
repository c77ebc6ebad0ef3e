//! Error types for the operation engine.

use thiserror::Error;

/// Main error type for engine operations.
///
/// Worker-level errors are never propagated across task boundaries; they are
/// captured into the completion tuple as a display string, so every variant
/// renders to something a status line can show verbatim.
#[derive(Error, Debug)]
pub enum OpError {
    #[error("S3 error ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("Local I/O error: {0}")]
    LocalIo(String),

    #[error("Local file not found: {0}")]
    FileNotFound(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remote client not configured")]
    ClientNotConfigured,

    #[error("Unknown operation kind: {0}")]
    UnknownKind(String),
}

impl OpError {
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Folder-marker deletes and head lookups tolerate missing objects, so
    /// not-found must stay distinguishable from other remote failures.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Remote { code, .. } => {
                matches!(code.as_str(), "NotFound" | "NoSuchKey" | "404")
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for OpError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::FileNotFound(err.to_string())
        } else {
            Self::LocalIo(err.to_string())
        }
    }
}

impl serde::Serialize for OpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias for engine operations.
pub type OpResult<T> = Result<T, OpError>;
