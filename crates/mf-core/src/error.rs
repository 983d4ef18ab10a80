//! Unified error type for mediafork.
//!
//! Every layer below `MediaFile` funnels its
//! failures into [`Error`]. The editor only ever sees the small status
//! vocabulary in [`FileStatus`], derived through [`Error::status`].

use std::fmt;
use std::path::{Path, PathBuf};

/// Status vocabulary exposed to the editor layer.
///
/// The numeric codes are stable; they travel across the worker protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    Ok,
    /// No backend claims the format, or the path does not exist.
    NotFound,
    /// Signature sniffing matched no backend.
    UnrecognizedCodec,
    /// The path is a project file and belongs to the project loader.
    IsXml,
    /// Table-of-contents construction was cancelled by the user.
    UserCanceled,
    /// Any other failure.
    Failed,
}

impl FileStatus {
    /// Wire code for this status.
    pub fn code(self) -> i64 {
        match self {
            FileStatus::Ok => 0,
            FileStatus::NotFound => 1,
            FileStatus::UnrecognizedCodec => 2,
            FileStatus::IsXml => 3,
            FileStatus::UserCanceled => 4,
            FileStatus::Failed => 5,
        }
    }

    /// Inverse of [`FileStatus::code`]. Unknown codes collapse to `Failed`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => FileStatus::Ok,
            1 => FileStatus::NotFound,
            2 => FileStatus::UnrecognizedCodec,
            3 => FileStatus::IsXml,
            4 => FileStatus::UserCanceled,
            _ => FileStatus::Failed,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileStatus::Ok => "FILE_OK",
            FileStatus::NotFound => "FILE_NOT_FOUND",
            FileStatus::UnrecognizedCodec => "FILE_UNRECOGNIZED_CODEC",
            FileStatus::IsXml => "FILE_IS_XML",
            FileStatus::UserCanceled => "FILE_USER_CANCELED",
            FileStatus::Failed => "FILE_FAILED",
        };
        f.write_str(name)
    }
}

/// Unified error type covering all failure modes in mediafork.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The path does not exist or no backend serves the requested format.
    #[error("not found: {0}")]
    NotFound(String),

    /// Sniffing the file header matched no registered backend.
    #[error("unrecognized codec: {}", .path.display())]
    UnrecognizedCodec {
        /// The file that was sniffed.
        path: PathBuf,
    },

    /// The path holds an editor project file rather than media.
    #[error("{} is a project file, not media", .path.display())]
    IsXml {
        /// The project file path.
        path: PathBuf,
    },

    /// The user cancelled a long-running table-of-contents scan.
    #[error("cancelled by user")]
    UserCanceled,

    /// The isolated worker process died or stopped answering.
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    /// The worker protocol was violated by one of the peers.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A decoder rejected its input or produced nothing usable.
    #[error("decode error: {0}")]
    Decode(String),

    /// An encoder or writer failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// The backend does not implement the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A persisted table of contents is malformed.
    #[error("table of contents error: {0}")]
    Toc(String),

    /// The handle is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    State(String),

    /// Configuration failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An error relayed from a worker, already reduced to its status.
    #[error("{status}: {message}")]
    Remote {
        /// Status the worker reported.
        status: FileStatus,
        /// The worker's rendering of the original error.
        message: String,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Map this error onto the editor-facing status vocabulary.
    pub fn status(&self) -> FileStatus {
        match self {
            Error::NotFound(_) => FileStatus::NotFound,
            Error::UnrecognizedCodec { .. } => FileStatus::UnrecognizedCodec,
            Error::IsXml { .. } => FileStatus::IsXml,
            Error::UserCanceled => FileStatus::UserCanceled,
            Error::Remote { status, .. } => *status,
            Error::Io { source } if source.kind() == std::io::ErrorKind::NotFound => {
                FileStatus::NotFound
            }
            Error::WorkerFailed(_)
            | Error::Protocol(_)
            | Error::Decode(_)
            | Error::Encode(_)
            | Error::Unsupported(_)
            | Error::Toc(_)
            | Error::State(_)
            | Error::Validation(_)
            | Error::Io { .. } => FileStatus::Failed,
        }
    }

    /// Whether the error came from a dead or unresponsive worker.
    pub fn is_worker_failure(&self) -> bool {
        matches!(self, Error::WorkerFailed(_))
    }

    /// Rebuild an error from a status and message relayed by a worker.
    ///
    /// Statuses that carry their own meaning are restored to the matching
    /// variant so callers can keep matching on them.
    pub fn from_status(status: FileStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            FileStatus::UserCanceled => Error::UserCanceled,
            FileStatus::NotFound => Error::NotFound(message),
            _ => Error::Remote { status, message },
        }
    }

    /// Convenience constructor for [`Error::NotFound`] naming a path.
    pub fn not_found(path: &Path) -> Self {
        Error::NotFound(path.display().to_string())
    }

    /// Convenience constructor for [`Error::Decode`].
    pub fn decode(message: impl fmt::Display) -> Self {
        Error::Decode(message.to_string())
    }

    /// Convenience constructor for [`Error::Encode`].
    pub fn encode(message: impl fmt::Display) -> Self {
        Error::Encode(message.to_string())
    }

    /// Convenience constructor for [`Error::Unsupported`].
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(message.into())
    }

    /// Convenience constructor for [`Error::State`].
    pub fn state(message: impl Into<String>) -> Self {
        Error::State(message.into())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
