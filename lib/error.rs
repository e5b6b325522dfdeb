//! Errors returned by mount operations, and their errno mapping.

use thiserror::Error;

use crate::backend::BackendError;
use crate::dispatch::DispatchError;
use crate::handle::FileHandle;
use crate::path::{ObjectPath, PathError};

/// Failure of a kernel-facing operation on a [`MountContext`](crate::mount::MountContext).
///
/// Nothing here crosses the FUSE boundary as-is; the adapter converts it with
/// [`FsError::errno`].
#[derive(Debug, Error)]
pub enum FsError {
    /// The path does not name an object.
    #[error("no such object: {0}")]
    NotFound(ObjectPath),

    /// The handle is not (or no longer) open.
    #[error("no such open file: {0}")]
    UnknownHandle(FileHandle),

    /// The path could not be normalized.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    /// A directory operation was attempted on a file.
    #[error("not a directory: {0}")]
    NotADirectory(ObjectPath),

    /// A file operation was attempted on a directory.
    #[error("is a directory: {0}")]
    IsADirectory(ObjectPath),

    /// The mount is quiescing; no new work is admitted.
    #[error("mount is closing")]
    MountClosing,

    /// The dispatcher queue is saturated and the fail-fast policy is active.
    #[error("too busy")]
    Busy,

    /// The caller gave up waiting for the backend.
    #[error("backend call timed out")]
    TimedOut,

    /// The worker running the call died before completing it.
    #[error("backend worker lost")]
    WorkerLost,

    /// The handle space is exhausted.
    #[error("out of file handles")]
    ResourceExhausted,

    /// The backend call failed.
    #[error(transparent)]
    Backend(BackendError),
}

impl FsError {
    /// The errno to reply to the kernel with.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) | Self::UnknownHandle(_) | Self::InvalidPath(PathError::Empty) => {
                libc::ENOENT
            }
            Self::InvalidPath(_) => libc::EINVAL,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::MountClosing | Self::TimedOut | Self::WorkerLost => libc::EIO,
            Self::Busy => libc::EBUSY,
            Self::ResourceExhausted => libc::ENFILE,
            Self::Backend(e) => e.errno(),
        }
    }
}

impl From<BackendError> for FsError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(path) => Self::NotFound(path),
            BackendError::NotADirectory(path) => Self::NotADirectory(path),
            other @ (BackendError::Connect(_) | BackendError::Io(_)) => Self::Backend(other),
        }
    }
}

impl From<DispatchError> for FsError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::ShuttingDown => Self::MountClosing,
            DispatchError::Busy => Self::Busy,
            DispatchError::TimedOut => Self::TimedOut,
            DispatchError::WorkerLost => Self::WorkerLost,
            DispatchError::Backend(inner) => inner.into(),
        }
    }
}
