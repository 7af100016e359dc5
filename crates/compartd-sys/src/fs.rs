//! `openat2` with path-resolution scoping.
//!
//! `RESOLVE_IN_ROOT` treats the directory fd as the root for the whole
//! lookup: absolute symlinks and `..` are clamped to it, so a path supplied
//! by a sandboxed process cannot resolve outside its root.

use std::ffi::CStr;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use rustix::io::Errno;

use crate::last_errno;

pub const RESOLVE_NO_XDEV: u64 = 0x01;
pub const RESOLVE_NO_MAGICLINKS: u64 = 0x02;
pub const RESOLVE_NO_SYMLINKS: u64 = 0x04;
pub const RESOLVE_BENEATH: u64 = 0x08;
pub const RESOLVE_IN_ROOT: u64 = 0x10;

/// Mirrors kernel `struct open_how`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenHow {
    pub flags: u64,
    pub mode: u64,
    pub resolve: u64,
}

/// Open `path` relative to `dirfd` with `how`.
///
/// # Errors
///
/// Returns `Errno::XDEV` when a scoped lookup would escape, or the usual
/// `open` errors.
pub fn openat2(dirfd: BorrowedFd<'_>, path: &CStr, how: &OpenHow) -> Result<OwnedFd, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            dirfd.as_raw_fd(),
            path.as_ptr(),
            how as *const OpenHow,
            size_of::<OpenHow>(),
        )
    };
    if ret < 0 {
        Err(last_errno())
    } else {
        // SAFETY: On success, ret is a new descriptor owned by us.
        Ok(unsafe { OwnedFd::from_raw_fd(ret as i32) })
    }
}

/// Open a directory inside `root` as an `O_PATH` handle, never leaving `root`.
pub fn open_dir_in_root(root: BorrowedFd<'_>, path: &CStr) -> Result<OwnedFd, Errno> {
    let how = OpenHow {
        flags: (libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC) as u64,
        mode: 0,
        resolve: RESOLVE_IN_ROOT | RESOLVE_NO_MAGICLINKS,
    };
    openat2(root, path, &how)
}
