//! Low-level Linux syscall wrappers for the compartd monitor.
//!
//! This crate provides thin wrappers around the Linux interfaces a seccomp
//! user-notification supervisor needs that are not available in rustix or
//! libc. For standard syscalls, use rustix.
//!
//! ## Modules
//!
//! - **seccomp** - BPF filter construction (notify filter, ioctl allow-list) and installation
//! - **`seccomp_notify`** - Notification ioctls and the runtime record layout
//! - **pidfd** - Process handles: liveness probe, `pidfd_getfd`, `setns`
//! - **`process_vm`** - Cross-process memory copies (`process_vm_readv`/`writev`)
//! - **fs** - `openat2` with `RESOLVE_*` scoping
//! - **check** - Runtime kernel capability detection
//!
//! ## Record Layout
//!
//! The kernel reports the sizes of `struct seccomp_notif`,
//! `struct seccomp_notif_resp` and `struct seccomp_data` through
//! `SECCOMP_GET_NOTIF_SIZES`. Newer kernels may grow these records, so the
//! sizes are queried once per listener and every encode/decode goes through
//! the resulting [`seccomp_notify::NotifLayout`].
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod check;
pub mod fs;
pub mod pidfd;
pub mod process_vm;
pub mod seccomp;
pub mod seccomp_notify;

pub use check::{CheckError, SystemInfo, check};

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
