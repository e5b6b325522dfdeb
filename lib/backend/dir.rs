use std::fs::{File, Metadata};
use std::io::{ErrorKind, Read as _, Seek as _, SeekFrom};
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{trace, warn};

use super::{BackendError, ChildEntry, ObjectAttrs, ObjectKind, Permissions, StorageBackend};
use crate::path::ObjectPath;

/// Serves objects from a directory tree on the local machine.
///
/// This is the backend to use when the store has been exported (or network-mounted) somewhere
/// reachable as plain files. Only regular files and directories are exposed; symlinks and special
/// files are reported as missing.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// The directory this store serves from.
    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn resolve(&self, path: &ObjectPath) -> PathBuf {
        // ObjectPath never carries `..`, so the join stays under the root.
        path.components()
            .fold(self.root.clone(), |acc, component| acc.join(component))
    }

    fn metadata(&self, path: &ObjectPath) -> Result<Metadata, BackendError> {
        match std::fs::symlink_metadata(self.resolve(path)) {
            Ok(meta) if meta.is_file() || meta.is_dir() => Ok(meta),
            Ok(_) => Err(BackendError::NotFound(path.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BackendError::NotFound(path.clone())),
            Err(e) => Err(BackendError::Io(e)),
        }
    }
}

fn attrs_from_metadata(meta: &Metadata) -> ObjectAttrs {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "mode is masked to the permission bits"
    )]
    let perm = Permissions::from_bits_truncate((meta.permissions().mode() & 0o777) as u16);
    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let ctime = meta.created().unwrap_or(mtime);
    let (kind, size) = if meta.is_dir() {
        (ObjectKind::Directory, 0)
    } else {
        (ObjectKind::File, meta.len())
    };
    ObjectAttrs {
        kind,
        size,
        perm,
        mtime,
        ctime,
    }
}

impl StorageBackend for DirStore {
    type Endpoint = PathBuf;

    fn connect(endpoint: &PathBuf) -> Result<Self, BackendError> {
        let meta = std::fs::metadata(endpoint).map_err(|e| {
            BackendError::Connect(format!("'{}': {e}", endpoint.display()))
        })?;
        if !meta.is_dir() {
            return Err(BackendError::Connect(format!(
                "'{}' is not a directory",
                endpoint.display()
            )));
        }
        Ok(Self {
            root: endpoint.clone(),
        })
    }

    fn fetch(&self, path: &ObjectPath, offset: u64, len: u32) -> Result<Bytes, BackendError> {
        let meta = self.metadata(path)?;
        if meta.is_dir() {
            return Err(BackendError::Io(std::io::Error::from_raw_os_error(
                libc::EISDIR,
            )));
        }

        let mut file = File::open(self.resolve(path))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = Vec::with_capacity(len as usize);
        file.take(u64::from(len)).read_to_end(&mut buffer)?;
        trace!(%path, offset, requested = len, read = buffer.len(), "fetched");
        Ok(Bytes::from(buffer))
    }

    fn stat(&self, path: &ObjectPath) -> Result<ObjectAttrs, BackendError> {
        self.metadata(path).map(|meta| attrs_from_metadata(&meta))
    }

    fn list(&self, path: &ObjectPath) -> Result<Vec<ChildEntry>, BackendError> {
        let meta = self.metadata(path)?;
        if !meta.is_dir() {
            return Err(BackendError::NotADirectory(path.clone()));
        }

        let mut children = Vec::new();
        for dir_entry in std::fs::read_dir(self.resolve(path))? {
            let dir_entry = dir_entry?;
            let file_type = dir_entry.file_type()?;
            let kind = if file_type.is_dir() {
                ObjectKind::Directory
            } else if file_type.is_file() {
                ObjectKind::File
            } else {
                continue;
            };
            match dir_entry.file_name().into_string() {
                Ok(name) => children.push(ChildEntry { name, kind }),
                Err(raw) => warn!(parent = %path, name = ?raw, "skipping non UTF-8 entry"),
            }
        }
        children.sort_unstable();
        Ok(children)
    }
}
