//! Inode number ↔ path mapping for the kernel side of the mount.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::path::ObjectPath;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// The inode number FUSE uses for the mount root.
pub const ROOT_INO: InodeAddr = 1;

#[derive(Debug)]
struct Slot {
    path: ObjectPath,
    lookups: u64,
}

#[derive(Debug)]
struct Inner {
    by_ino: FxHashMap<InodeAddr, Slot>,
    by_path: FxHashMap<ObjectPath, InodeAddr>,
    next_ino: InodeAddr,
}

/// Assigns inode numbers to paths and tracks the kernel's lookup count for each.
///
/// The kernel holds on to an inode number for as long as its lookup count is positive. When
/// `forget` brings the count to zero the mapping is dropped; if the path is looked up again it
/// gets a new number. Numbers are never reused. The root is pinned.
#[derive(Debug)]
pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl InodeTable {
    /// A table holding only the root.
    #[must_use]
    pub fn new() -> Self {
        let root = ObjectPath::root();
        let mut by_ino = FxHashMap::default();
        let mut by_path = FxHashMap::default();
        by_path.insert(root.clone(), ROOT_INO);
        by_ino.insert(
            ROOT_INO,
            Slot {
                path: root,
                lookups: 1,
            },
        );
        Self {
            inner: RwLock::new(Inner {
                by_ino,
                by_path,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    /// The path behind `ino`, if the kernel may still use it.
    #[must_use]
    pub fn path_of(&self, ino: InodeAddr) -> Option<ObjectPath> {
        self.inner.read().by_ino.get(&ino).map(|slot| slot.path.clone())
    }

    /// The inode for `path`, counting one kernel lookup against it.
    pub fn lookup(&self, path: &ObjectPath) -> InodeAddr {
        self.get_or_assign(path, 1)
    }

    /// The inode number to report for `path` in a directory listing.
    ///
    /// Returns the mapped number if the kernel already holds one. Otherwise a fresh number is
    /// handed out without being mapped: the kernel never forgets entries it only saw listed, so a
    /// mapping here would never be reclaimed. A later `lookup` assigns the number the kernel will
    /// actually use.
    pub fn ino_for(&self, path: &ObjectPath) -> InodeAddr {
        if let Some(&ino) = self.inner.read().by_path.get(path) {
            return ino;
        }
        let mut inner = self.inner.write();
        if let Some(&ino) = inner.by_path.get(path) {
            return ino;
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        ino
    }

    fn get_or_assign(&self, path: &ObjectPath, lookups: u64) -> InodeAddr {
        let mut inner = self.inner.write();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(slot) = inner.by_ino.get_mut(&ino) {
                slot.lookups = slot.lookups.saturating_add(lookups);
            }
            return ino;
        }

        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.by_path.insert(path.clone(), ino);
        inner.by_ino.insert(
            ino,
            Slot {
                path: path.clone(),
                lookups,
            },
        );
        trace!(ino, %path, "assigned inode");
        ino
    }

    /// Drop `nlookup` kernel references to `ino`. Returns `true` if the mapping went away.
    pub fn forget(&self, ino: InodeAddr, nlookup: u64) -> bool {
        if ino == ROOT_INO {
            return false;
        }
        let mut inner = self.inner.write();
        let Some(slot) = inner.by_ino.get_mut(&ino) else {
            return false;
        };
        slot.lookups = slot.lookups.saturating_sub(nlookup);
        if slot.lookups > 0 {
            return false;
        }

        if let Some(slot) = inner.by_ino.remove(&ino) {
            inner.by_path.remove(&slot.path);
            trace!(ino, path = %slot.path, "forgot inode");
        }
        true
    }

    /// Kernel lookups outstanding against `ino`.
    #[must_use]
    pub fn lookup_count(&self, ino: InodeAddr) -> Option<u64> {
        self.inner.read().by_ino.get(&ino).map(|slot| slot.lookups)
    }

    /// Number of mapped inodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_ino.len()
    }

    /// Always `false`: the root is always mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
