//! Process file descriptors.
//!
//! A pidfd refers to one specific process instance. Unlike a numeric pid it
//! is never recycled, so every operation on a notifying process goes through
//! the pidfd obtained when the notification arrived.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use rustix::io::Errno;

use crate::last_errno;

/// Returns true while the process behind `pidfd` has not exited.
///
/// Sends signal 0; `EPERM` still means the process exists.
pub fn pidfd_is_alive(pidfd: BorrowedFd<'_>) -> bool {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            0,
            std::ptr::null::<libc::siginfo_t>(),
            0u32,
        )
    };
    ret == 0 || last_errno() == Errno::PERM
}

/// `PIDFD_THREAD`: the pidfd refers to one thread rather than its group.
pub const PIDFD_THREAD: u32 = libc::O_EXCL as u32;

/// Open a pidfd for the single thread `tid` (kernel 6.9+).
///
/// Unlike a plain `pidfd_open`, `tid` need not be a thread-group leader, and
/// the pidfd reports exit as soon as that thread exits.
///
/// # Errors
///
/// Returns `Errno::INVAL` on kernels without `PIDFD_THREAD`, `Errno::SRCH`
/// if no such thread exists.
pub fn pidfd_open_thread(tid: i32) -> Result<OwnedFd, Errno> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, tid, PIDFD_THREAD) };
    if ret < 0 {
        Err(last_errno())
    } else {
        // SAFETY: On success, ret is a new descriptor owned by us.
        Ok(unsafe { OwnedFd::from_raw_fd(ret as i32) })
    }
}

/// Duplicate file descriptor `targetfd` of the process behind `pidfd`.
///
/// Requires `PTRACE_MODE_ATTACH_REALCREDS` over the target (kernel 5.6+).
///
/// # Errors
///
/// Returns `Errno::BADF` if the target has no such descriptor,
/// `Errno::SRCH` if it exited.
pub fn pidfd_getfd(pidfd: BorrowedFd<'_>, targetfd: i32) -> Result<OwnedFd, Errno> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), targetfd, 0u32) };
    if ret < 0 {
        Err(last_errno())
    } else {
        // SAFETY: On success, ret is a new descriptor owned by us.
        Ok(unsafe { OwnedFd::from_raw_fd(ret as i32) })
    }
}

/// Move the calling thread into namespaces of the process behind `pidfd`.
///
/// `nstype` is a mask of `CLONE_NEW*` flags (pidfd form, kernel 5.8+).
///
/// # Errors
///
/// Returns `Errno` if the namespaces cannot be joined.
pub fn setns(pidfd: BorrowedFd<'_>, nstype: i32) -> Result<(), Errno> {
    let ret = unsafe { libc::setns(pidfd.as_raw_fd(), nstype) };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}
