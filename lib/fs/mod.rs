//! The kernel-facing side of the mount.
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`MountContext`](crate::mount::MountContext).
pub mod fuser;
/// Inode number ↔ path mapping.
pub mod inodes;

pub use inodes::{InodeAddr, InodeTable, ROOT_INO};
