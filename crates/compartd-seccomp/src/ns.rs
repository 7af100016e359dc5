//! Short-lived helpers that act inside a compartment's namespaces.
//!
//! `setns(CLONE_NEWNS)` is refused for multi-threaded callers and would move
//! the whole monitor anyway, so the work runs in a forked child. A pid
//! namespace only applies to children of the joining task, so when one is
//! joined the helper forks once more and the operation runs in the
//! grandchild:
//!
//! ```text
//! monitor                  helper                      worker
//!   │ pipe2(O_CLOEXEC)
//!   │ fork ──────────────────▶ setns(pidfd, nstype)
//!   │                          fork ─────────────────────▶ op()
//!   │ read(errno) ◀────────────────────────────────────── write(errno)
//!   │ waitpid                  waitpid, _exit(0)           _exit(0)
//! ```
//!
//! Without `CLONE_NEWPID` the helper runs `op` itself. Whichever process
//! runs `op` reports a raw errno (0 on success) over the pipe, so callers
//! see a `Result` rather than an exit code. Any data the operation needs
//! (paths, option strings, file descriptors) must be prepared before the
//! call; the helper only issues syscalls.
//!
//! The user namespace is never joined: device nodes need `CAP_MKNOD` in the
//! initial user namespace, which the helper keeps only by staying in it.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use compartd_sys::last_errno;
use compartd_sys::pidfd::setns;
use rustix::io::Errno;

/// The caller's mount namespace alone.
pub const MOUNT_NS: i32 = libc::CLONE_NEWNS;

/// Every namespace a new filesystem instance can be bound to.
///
/// `proc` takes the pid namespace, `sysfs` the network namespace, `mqueue`
/// the IPC namespace and `cgroup2` the cgroup namespace of the mounting task.
pub const FILESYSTEM_NS: i32 = libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWCGROUP;

fn pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(last_errno());
    }
    // SAFETY: pipe2 returned two new descriptors owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Write the outcome to the monitor and leave. Only called in a forked child.
fn report(write_end: &OwnedFd, result: Result<(), Errno>) -> ! {
    let code = match result {
        Ok(()) => 0i32,
        Err(e) => e.raw_os_error(),
    };
    let bytes = code.to_ne_bytes();
    unsafe {
        libc::write(write_end.as_raw_fd(), bytes.as_ptr().cast(), bytes.len());
        libc::_exit(0)
    }
}

fn reap(child: libc::pid_t) -> i32 {
    let mut status = 0;
    while unsafe { libc::waitpid(child, &mut status, 0) } < 0 {
        if last_errno() != Errno::INTR {
            break;
        }
    }
    status
}

/// Run `op` in a child that has joined the `nstype` namespaces of `pidfd`.
///
/// `nstype` is a mask of `CLONE_NEW*` flags, normally [`MOUNT_NS`] or
/// [`FILESYSTEM_NS`]. Blocks until the helpers have exited.
///
/// # Errors
///
/// The errno `setns`, the inner fork or `op` failed with, or the error from
/// spawning and reaping the helper.
pub fn run_in_namespaces<F>(pidfd: BorrowedFd<'_>, nstype: i32, op: F) -> Result<(), Errno>
where
    F: FnOnce() -> Result<(), Errno>,
{
    let (read_end, write_end) = pipe()?;

    let child = unsafe { libc::fork() };
    if child < 0 {
        return Err(last_errno());
    }

    if child == 0 {
        drop(read_end);
        if let Err(e) = setns(pidfd, nstype) {
            report(&write_end, Err(e));
        }
        if nstype & libc::CLONE_NEWPID == 0 {
            report(&write_end, op());
        }

        let worker = unsafe { libc::fork() };
        if worker < 0 {
            report(&write_end, Err(last_errno()));
        }
        if worker == 0 {
            report(&write_end, op());
        }
        drop(write_end);
        reap(worker);
        unsafe { libc::_exit(0) }
    }

    drop(write_end);

    let mut bytes = [0u8; 4];
    let read = loop {
        let n = unsafe { libc::read(read_end.as_raw_fd(), bytes.as_mut_ptr().cast(), bytes.len()) };
        if n < 0 && last_errno() == Errno::INTR {
            continue;
        }
        break n;
    };

    let status = reap(child);

    if read != bytes.len() as isize {
        tracing::warn!(helper = child, status, "namespace helper died without reporting");
        return Err(Errno::CHILD);
    }

    match i32::from_ne_bytes(bytes) {
        0 => Ok(()),
        code => Err(Errno::from_raw_os_error(code)),
    }
}
