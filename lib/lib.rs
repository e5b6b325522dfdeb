//! docfs shared library.
//!
//! Exposes a remote document store as a read-only filesystem. [`mount::MountContext`] is the
//! heart of it; [`fs::fuser::FuserAdapter`] plugs it into the kernel.

/// Admission control for kernel-facing operations.
pub mod admission;
/// The storage backend collaborator.
pub mod backend;
/// Off-thread execution of backend calls.
pub mod dispatch;
/// Errors returned by mount operations.
pub mod error;
/// Kernel-facing adapter and inode mapping.
pub mod fs;
/// Open-file handles.
pub mod handle;
/// The per-mount context.
pub mod mount;
/// Normalized object paths.
pub mod path;
/// Per-operation stats records.
pub mod telemetry;
/// Teardown deadline guard.
pub mod watchdog;
