//! Open-file handles.

/// The dual-indexed registry of open handles.
pub mod table;

pub use table::{EntryRef, EntryWatch, HandleEntry, HandleTable};

use std::sync::atomic::{AtomicU64, Ordering};

/// Type representing a file handle returned to the kernel by `open`.
pub type FileHandle = u64;

/// Monotonically increasing file handle allocator.
///
/// Handles are never reused within the lifetime of a mount, so a stale handle held by a confused
/// caller can never alias a newer open.
#[derive(Debug)]
#[must_use]
pub struct HandleAllocator {
    next_fh: AtomicU64,
}

impl HandleAllocator {
    /// The first handle a fresh mount hands out. Lower values stay clear of the standard streams.
    pub const FIRST_HANDLE: FileHandle = 4;

    /// An allocator starting at [`Self::FIRST_HANDLE`].
    pub fn new() -> Self {
        Self::starting_at(Self::FIRST_HANDLE)
    }

    /// An allocator whose first handle is `first`.
    pub fn starting_at(first: FileHandle) -> Self {
        Self {
            next_fh: AtomicU64::new(first),
        }
    }

    /// Take the next handle, or `None` once the handle space is used up.
    #[must_use]
    pub fn allocate(&self) -> Option<FileHandle> {
        self.next_fh
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |fh| fh.checked_add(1))
            .ok()
    }

    /// The handle the next successful [`allocate`](Self::allocate) will return.
    #[must_use]
    pub fn peek(&self) -> FileHandle {
        self.next_fh.load(Ordering::Relaxed)
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
