use std::collections::BTreeSet;
use std::collections::hash_map::Entry;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use super::{FileHandle, HandleAllocator};
use crate::backend::ObjectAttrs;
use crate::error::FsError;
use crate::path::ObjectPath;

/// The record behind one open file.
///
/// Entries are only ever reached through an [`EntryRef`]. The table holds one reference for as
/// long as the handle is open; every in-flight operation on the handle holds another. Whatever the
/// entry owns is released when the last reference goes away, which may be well after `release`
/// has unlinked the handle from the table.
#[derive(Debug)]
pub struct HandleEntry {
    /// The handle the kernel knows this entry by.
    pub handle: FileHandle,
    /// The path the handle was opened against.
    pub path: ObjectPath,
    /// Attributes observed when the handle was opened.
    pub attrs: ObjectAttrs,
    /// When the handle was opened.
    pub opened_at: Instant,
}

impl Drop for HandleEntry {
    fn drop(&mut self) {
        trace!(
            handle = self.handle,
            path = %self.path,
            open_for = ?self.opened_at.elapsed(),
            "freeing handle entry"
        );
    }
}

/// A counted reference to a [`HandleEntry`].
///
/// Cloning takes another reference. [`release`](Self::release) (or dropping) gives one back.
#[derive(Debug, Clone)]
pub struct EntryRef(Arc<HandleEntry>);

impl EntryRef {
    fn new(entry: HandleEntry) -> Self {
        Self(Arc::new(entry))
    }

    /// Number of live references, including this one.
    #[must_use]
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Give this reference back.
    ///
    /// Returns `true` when this was the last reference, i.e. this call freed the entry.
    pub fn release(self) -> bool {
        Arc::into_inner(self.0).is_some()
    }

    /// An observer that can tell whether the entry has been freed, without keeping it alive.
    #[must_use]
    pub fn watch(&self) -> EntryWatch {
        EntryWatch(Arc::downgrade(&self.0))
    }
}

impl Deref for EntryRef {
    type Target = HandleEntry;

    fn deref(&self) -> &HandleEntry {
        &self.0
    }
}

/// Non-owning observer of a [`HandleEntry`].
#[derive(Debug, Clone)]
pub struct EntryWatch(Weak<HandleEntry>);

impl EntryWatch {
    /// Whether the entry is still alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[derive(Debug, Default)]
struct Indices {
    by_handle: FxHashMap<FileHandle, EntryRef>,
    /// Never holds an empty set: the slot goes away with the last handle for its path.
    by_path: FxHashMap<ObjectPath, BTreeSet<FileHandle>>,
}

/// Registry of open handles, indexed by handle and by path.
///
/// All methods take `&self`; internal synchronization via `parking_lot::RwLock`. Lookups share
/// the lock; inserts and removals take it exclusively.
#[derive(Debug, Default)]
pub struct HandleTable {
    indices: RwLock<Indices>,
}

impl HandleTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh handle for `path` and register it in both indices.
    ///
    /// The handle is taken from `allocator` while the writer lock is held, so handle order
    /// matches insertion order.
    pub fn allocate_and_insert(
        &self,
        allocator: &HandleAllocator,
        path: ObjectPath,
        attrs: ObjectAttrs,
    ) -> Result<FileHandle, FsError> {
        let mut indices = self.indices.write();
        let handle = allocator.allocate().ok_or(FsError::ResourceExhausted)?;

        indices
            .by_path
            .entry(path.clone())
            .or_default()
            .insert(handle);
        let entry = EntryRef::new(HandleEntry {
            handle,
            path,
            attrs,
            opened_at: Instant::now(),
        });
        let previous = indices.by_handle.insert(handle, entry);
        debug_assert!(previous.is_none(), "handle {handle} issued twice");

        Ok(handle)
    }

    /// Borrow the entry for `handle`. The caller must release the returned reference.
    #[must_use]
    pub fn lookup_by_handle(&self, handle: FileHandle) -> Option<EntryRef> {
        self.indices.read().by_handle.get(&handle).cloned()
    }

    /// All handles currently open against `path`, in allocation order.
    ///
    /// `None` when nothing is open for the path.
    #[must_use]
    pub fn handles_for_path(&self, path: &ObjectPath) -> Option<Vec<FileHandle>> {
        self.indices
            .read()
            .by_path
            .get(path)
            .map(|handles| handles.iter().copied().collect())
    }

    /// Unlink `handle` from both indices and hand back the table's reference.
    ///
    /// Outstanding borrows stay valid; only new lookups stop finding the entry.
    #[must_use]
    pub fn remove(&self, handle: FileHandle) -> Option<EntryRef> {
        let mut indices = self.indices.write();
        let entry = indices.by_handle.remove(&handle)?;

        match indices.by_path.entry(entry.path.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().remove(&handle);
                if slot.get().is_empty() {
                    slot.remove();
                }
            }
            Entry::Vacant(_) => {
                debug_assert!(false, "handle {handle} missing from the path index");
                warn!(handle, path = %entry.path, "path index out of sync with handle index");
            }
        }

        Some(entry)
    }

    /// Unlink every handle and give back the table's references. Returns how many were open.
    ///
    /// Entries still borrowed elsewhere are freed when their last borrower releases them.
    pub fn drain(&self) -> usize {
        let drained: Vec<EntryRef> = {
            let mut indices = self.indices.write();
            indices.by_path.clear();
            indices.by_handle.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.release();
        }
        count
    }

    /// Number of open handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.read().by_handle.len()
    }

    /// Whether no handle is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct paths with at least one open handle.
    #[must_use]
    pub fn path_count(&self) -> usize {
        self.indices.read().by_path.len()
    }
}
