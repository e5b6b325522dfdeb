//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`MountContext`] operations.
//!
//! The fuser session calls back on a single thread. Each callback resolves its inode to a path
//! inline, then moves the actual work onto the tokio blocking pool and replies from there, so a
//! slow backend call never holds up the next callback.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::inodes::{InodeAddr, InodeTable, ROOT_INO};
use crate::backend::{ObjectAttrs, ObjectKind, StorageBackend};
use crate::error::FsError;
use crate::mount::{Access, AccessMode, BLOCK_SIZE, MountContext};
use crate::path::ObjectPath;

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyStatfs,
);

/// Extension trait on `Result<T, FsError>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

fn kind_to_fuser(kind: ObjectKind) -> fuser::FileType {
    match kind {
        ObjectKind::File => fuser::FileType::RegularFile,
        ObjectKind::Directory => fuser::FileType::Directory,
    }
}

/// Convert backend attributes to the fuser-specific `FileAttr`.
fn attrs_to_fuser(ino: InodeAddr, attrs: &ObjectAttrs, owner: (u32, u32)) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(512),
        atime: attrs.mtime,
        mtime: attrs.mtime,
        ctime: attrs.mtime,
        crtime: attrs.ctime,
        kind: kind_to_fuser(attrs.kind),
        perm: attrs.perm.bits(),
        nlink: if attrs.is_dir() { 2 } else { 1 },
        uid: owner.0,
        gid: owner.1,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Bridges a [`MountContext`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter<B: StorageBackend> {
    ctx: Arc<MountContext<B>>,
    inodes: Arc<InodeTable>,
    runtime: tokio::runtime::Handle,
    owner: (u32, u32),
}

impl<B: StorageBackend> FuserAdapter<B> {
    const TTL: Duration = Duration::from_secs(1);

    /// Create an adapter serving `ctx`. Every file is reported as owned by `owner` (uid, gid).
    pub fn new(
        ctx: Arc<MountContext<B>>,
        runtime: tokio::runtime::Handle,
        owner: (u32, u32),
    ) -> Self {
        Self {
            ctx,
            inodes: Arc::new(InodeTable::new()),
            runtime,
            owner,
        }
    }

    /// The inode table this adapter maintains.
    #[must_use]
    pub fn inodes(&self) -> &Arc<InodeTable> {
        &self.inodes
    }

    fn path_of(&self, ino: InodeAddr) -> Result<ObjectPath, FsError> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| FsError::NotFound(ObjectPath::root()))
    }

    /// Run `work` on the blocking pool with this adapter's context and inode table.
    fn offload<F>(&self, work: F)
    where
        F: FnOnce(&MountContext<B>, &InodeTable) + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        let inodes = Arc::clone(&self.inodes);
        drop(self.runtime.spawn_blocking(move || work(&ctx, &inodes)));
    }
}

impl<B: StorageBackend> fuser::Filesystem for FuserAdapter<B> {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!(state = ?self.ctx.state(), "kernel session initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        match self.ctx.shutdown() {
            Ok(report) => debug!(?report, "mount torn down by kernel session"),
            Err(e) => debug!(error = %e, "teardown already done"),
        }
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let path = self.path_of(parent).and_then(|parent| {
            let name = name.to_str().ok_or_else(|| FsError::NotFound(parent.clone()))?;
            Ok(parent.join(name)?)
        });
        let path = match path {
            Ok(path) => path,
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
                return;
            }
        };

        let owner = self.owner;
        self.offload(move |ctx, inodes| {
            ctx.stat(&path).fuse_reply(reply, |attrs, reply| {
                let ino = inodes.lookup(&path);
                let f_attr = attrs_to_fuser(ino, &attrs, owner);
                debug!(?f_attr, "replying...");
                reply.entry(&Self::TTL, &f_attr, 0);
            });
        });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };
        let owner = self.owner;
        self.offload(move |ctx, _| {
            ctx.stat(&path).fuse_reply(reply, |attrs, reply| {
                let attr = attrs_to_fuser(ino, &attrs, owner);
                debug!(?attr, "replying...");
                reply.attr(&Self::TTL, &attr);
            });
        });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            debug!("write access requested on a read-only mount");
            reply.error(libc::EROFS);
            return;
        }
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };
        self.offload(move |ctx, _| {
            ctx.open(&path).fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.offload(move |ctx, _| {
            ctx.read(fh, offset, size).fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
        });
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        // Releasing only touches the handle table; no reason to leave the session thread.
        self.ctx.release(fh).fuse_reply(reply, |(), reply| {
            debug!("replying ok");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, _flags, reply))]
    fn opendir(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };
        self.offload(move |ctx, _| {
            let checked = ctx.stat(&path).and_then(|attrs| {
                if attrs.is_dir() {
                    Ok(())
                } else {
                    Err(FsError::NotADirectory(path.clone()))
                }
            });
            // Directory handles carry no state; readdir lists by inode.
            checked.fuse_reply(reply, |(), reply| reply.opened(0, 0));
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };
        let Ok(skip) = usize::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        self.offload(move |ctx, inodes| {
            let children = match ctx.list(&path) {
                Ok(children) => children,
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.errno());
                    return;
                }
            };

            let parent_ino = path.parent().map_or(ROOT_INO, |parent| inodes.ino_for(&parent));
            let mut entries = Vec::with_capacity(children.len() + 2);
            entries.push((ino, fuser::FileType::Directory, ".".to_owned()));
            entries.push((parent_ino, fuser::FileType::Directory, "..".to_owned()));
            for child in children {
                match path.join(&child.name) {
                    Ok(child_path) => entries.push((
                        inodes.ino_for(&child_path),
                        kind_to_fuser(child.kind),
                        child.name,
                    )),
                    Err(e) => warn!(parent = %path, error = %e, "skipping unrepresentable entry"),
                }
            }

            for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
                let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                    error!("Directory entry index {} too large for fuser", i + 1);
                    reply.error(libc::EIO);
                    return;
                };
                if reply.add(*entry_ino, next, *kind, name) {
                    debug!("buffer full for now, stopping readdir");
                    break;
                }
            }

            debug!("finalizing reply...");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::access", skip(self, _req, reply))]
    fn access(&mut self, _req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };
        let mode = AccessMode::from_bits_truncate(mask);
        self.offload(move |ctx, _| {
            ctx.access(&path, mode)
                .fuse_reply(reply, |access, reply| match access {
                    Access::Allowed => reply.ok(),
                    Access::Denied => reply.error(libc::EACCES),
                });
        });
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        self.ctx.statfs().fuse_reply(reply, |stats, reply| {
            debug!(?stats, "replying...");
            reply.statfs(
                stats.total_blocks,
                stats.free_blocks,
                stats.available_blocks,
                stats.open_files,
                0,
                stats.block_size,
                stats.max_filename_length,
                0,
            );
        });
    }
}
