//! The storage backend collaborator.
//!
//! Every call here is blocking and may take as long as the network wants it to. The mount never
//! calls a backend from a kernel callback thread directly; calls are routed through the
//! [`WorkDispatcher`](crate::dispatch::WorkDispatcher).

/// A backend that serves an exported object tree from a local directory.
pub mod dir;

use std::time::SystemTime;

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

use crate::path::ObjectPath;

bitflags! {
    /// Permission bits of an object, laid out like the low bits of `st_mode`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Read permission for everyone.
        const ALL_READ = Self::OWNER_READ.bits()
            | Self::GROUP_READ.bits()
            | Self::OTHER_READ.bits();
        /// Execute permission for everyone.
        const ALL_EXECUTE = Self::OWNER_EXECUTE.bits()
            | Self::GROUP_EXECUTE.bits()
            | Self::OTHER_EXECUTE.bits();
    }
}

/// The kind of an object in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// A regular file with byte content.
    File,
    /// A container of other objects.
    Directory,
}

/// Attributes of a stored object, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttrs {
    /// File or directory.
    pub kind: ObjectKind,
    /// Content length in bytes. Zero for directories.
    pub size: u64,
    /// Permission bits.
    pub perm: Permissions,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Creation (upload) time.
    pub ctime: SystemTime,
}

impl ObjectAttrs {
    /// Attributes of a plain read-only file, with both timestamps set to `at`.
    #[must_use]
    pub fn file(size: u64, at: SystemTime) -> Self {
        Self {
            kind: ObjectKind::File,
            size,
            perm: Permissions::ALL_READ | Permissions::OWNER_WRITE,
            mtime: at,
            ctime: at,
        }
    }

    /// Attributes of a directory, with both timestamps set to `at`.
    #[must_use]
    pub fn directory(at: SystemTime) -> Self {
        Self {
            kind: ObjectKind::Directory,
            size: 0,
            perm: Permissions::ALL_READ | Permissions::ALL_EXECUTE | Permissions::OWNER_WRITE,
            mtime: at,
            ctime: at,
        }
    }

    /// Whether this object is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Directory
    }
}

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildEntry {
    /// Name of the child within its parent.
    pub name: String,
    /// Kind of the child.
    pub kind: ObjectKind,
}

/// Failures reported by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The object does not exist.
    #[error("object not found: {0}")]
    NotFound(ObjectPath),

    /// A listing was requested on something that is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(ObjectPath),

    /// The connection to the store could not be established.
    #[error("cannot connect to store: {0}")]
    Connect(String),

    /// Transport or storage failure.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// The errno this failure should surface as at the FUSE boundary.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::Connect(_) => libc::EIO,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// A blocking client for the document store.
///
/// Implementations must be safe to call from several dispatcher workers at once. None of the
/// calls are retried by the mount; transient failures surface to the kernel as `EIO`.
pub trait StorageBackend: Send + Sync + Sized + 'static {
    /// Connection parameters.
    type Endpoint;

    /// Establish a connection to the store.
    fn connect(endpoint: &Self::Endpoint) -> Result<Self, BackendError>;

    /// Read up to `len` bytes of the object at `path`, starting at `offset`.
    ///
    /// Returns fewer bytes (possibly none) at end of object.
    fn fetch(&self, path: &ObjectPath, offset: u64, len: u32) -> Result<Bytes, BackendError>;

    /// Look up the attributes of the object at `path`.
    fn stat(&self, path: &ObjectPath) -> Result<ObjectAttrs, BackendError>;

    /// List the children of the directory at `path`, sorted by name.
    fn list(&self, path: &ObjectPath) -> Result<Vec<ChildEntry>, BackendError>;
}
