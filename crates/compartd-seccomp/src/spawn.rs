//! Launch a command with a notify filter installed.
//!
//! ## Handshake
//!
//! ```text
//! child                               parent
//! -----                               ------
//! install filter (NEW_LISTENER)
//! write listener fd number  -------->  pidfd_getfd(child, n)
//!                           <--------  ack
//! close listener, execvp
//! ```
//!
//! The listener is taken straight out of the child with `pidfd_getfd`, so
//! no socket is needed to pass it. A negative number on the report pipe is
//! the errno of a failed installation.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use compartd_sys::last_errno;
use compartd_sys::pidfd::pidfd_getfd;
use compartd_sys::seccomp::{SockFilter, SockFprog, seccomp_set_mode_filter_listener};
use rustix::io::Errno;
use rustix::process::{Pid, PidfdFlags, pidfd_open};
use thiserror::Error;

const SETUP_TIMEOUT_MS: i32 = 30_000;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("empty command")]
    EmptyCommand,

    #[error("argument contains NUL: {0:?}")]
    InvalidArgument(String),

    #[error("pipe: {0}")]
    Pipe(Errno),

    #[error("fork: {0}")]
    Fork(Errno),

    #[error("pidfd: {0}")]
    Pidfd(Errno),

    #[error("child setup: {0}")]
    ChildSetup(String),

    #[error("installing notify filter: {0}")]
    Filter(Errno),
}

/// A running child whose syscalls are routed to `listener`.
#[derive(Debug)]
pub struct Armed {
    pub pid: u32,
    pub pidfd: OwnedFd,
    pub listener: OwnedFd,
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    #[inline]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd), SpawnError> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(SpawnError::Pipe(last_errno()));
    }
    // SAFETY: pipe2 returned two new descriptors owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Fork `cmd[0]` (looked up in `PATH`) with `filter` installed.
pub fn spawn_armed(cmd: &[String], filter: &[SockFilter]) -> Result<Armed, SpawnError> {
    if cmd.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }

    // Everything the child touches is prepared before fork
    let argv: Vec<CString> = cmd
        .iter()
        .map(|a| CString::new(a.as_bytes()).map_err(|_| SpawnError::InvalidArgument(a.clone())))
        .collect::<Result<_, _>>()?;
    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let fprog = SockFprog::new(filter);

    let (report_read, report_write) = pipe_cloexec()?;
    let (ack_read, ack_write) = pipe_cloexec()?;

    let child_pid = unsafe { libc::fork() };
    if child_pid < 0 {
        return Err(SpawnError::Fork(last_errno()));
    }

    if child_pid == 0 {
        drop(report_read);
        drop(ack_write);
        child_process(&fprog, report_write.as_fd(), ack_read.as_fd(), &argv_ptrs);
    }

    drop(report_write);
    drop(ack_read);

    let pid = unsafe { Pid::from_raw_unchecked(child_pid) };
    let pidfd = match pidfd_open(pid, PidfdFlags::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            kill_and_reap(child_pid);
            return Err(SpawnError::Pidfd(e));
        }
    };

    let listener = match receive_listener(child_pid, report_read.as_fd(), pidfd.as_fd()) {
        Ok(fd) => fd,
        Err(e) => {
            kill_and_reap(child_pid);
            return Err(e);
        }
    };

    let ack = [1u8];
    if unsafe { libc::write(ack_write.as_raw_fd(), ack.as_ptr().cast(), 1) } != 1 {
        kill_and_reap(child_pid);
        return Err(SpawnError::ChildSetup("ack write failed".into()));
    }

    tracing::debug!(pid = child_pid, listener = listener.as_raw_fd(), "child armed");
    Ok(Armed {
        pid: child_pid as u32,
        pidfd,
        listener,
    })
}

fn receive_listener(
    child_pid: libc::pid_t,
    report: BorrowedFd<'_>,
    pidfd: BorrowedFd<'_>,
) -> Result<OwnedFd, SpawnError> {
    let mut pfd = libc::pollfd {
        fd: report.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    if unsafe { libc::poll(&mut pfd, 1, SETUP_TIMEOUT_MS) } <= 0 {
        return Err(SpawnError::ChildSetup("timeout waiting for listener".into()));
    }

    let mut raw = [0u8; 4];
    let n = unsafe { libc::read(report.as_raw_fd(), raw.as_mut_ptr().cast(), raw.len()) };
    if n != raw.len() as isize {
        return Err(SpawnError::ChildSetup(format!(
            "child {child_pid} exited before reporting its listener"
        )));
    }

    let reported = i32::from_ne_bytes(raw);
    if reported < 0 {
        return Err(SpawnError::Filter(Errno::from_raw_os_error(-reported)));
    }
    pidfd_getfd(pidfd, reported).map_err(SpawnError::Pidfd)
}

fn kill_and_reap(child_pid: libc::pid_t) {
    unsafe {
        libc::kill(child_pid, libc::SIGKILL);
        libc::waitpid(child_pid, std::ptr::null_mut(), 0);
    }
}

/// Runs after fork in the child. Never returns.
fn child_process(
    fprog: &SockFprog,
    report: BorrowedFd<'_>,
    ack: BorrowedFd<'_>,
    argv: &[*const libc::c_char],
) -> ! {
    let listener = unsafe { seccomp_set_mode_filter_listener(fprog) };
    let reported = match &listener {
        Ok(fd) => fd.as_raw_fd(),
        Err(e) => -e.raw_os_error(),
    };

    let bytes = reported.to_ne_bytes();
    let written = unsafe { libc::write(report.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
    if written != bytes.len() as isize || listener.is_err() {
        unsafe { libc::_exit(126) }
    }

    let mut byte = 0u8;
    if unsafe { libc::read(ack.as_raw_fd(), (&mut byte as *mut u8).cast(), 1) } != 1 {
        unsafe { libc::_exit(126) }
    }

    // The parent holds its own copy now
    drop(listener);

    unsafe {
        libc::execvp(argv[0], argv.as_ptr());
        libc::_exit(127)
    }
}

/// Reap the process behind `pidfd`, blocking until it exits.
pub fn wait_for_exit(pidfd: BorrowedFd<'_>) -> io::Result<ExitStatus> {
    let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::waitid(
            libc::P_PIDFD,
            pidfd.as_raw_fd() as libc::id_t,
            &mut siginfo,
            libc::WEXITED,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let code = siginfo.si_code;
    let status = unsafe { siginfo.si_status() };

    Ok(match code {
        libc::CLD_EXITED => ExitStatus {
            code: Some(status),
            signal: None,
        },
        libc::CLD_KILLED | libc::CLD_DUMPED => ExitStatus {
            code: None,
            signal: Some(status),
        },
        _ => ExitStatus {
            code: None,
            signal: None,
        },
    })
}
