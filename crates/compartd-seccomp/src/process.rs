//! Remote memory access for a notifying process.
//!
//! A [`ProcessHandle`] is opened from the request's pid (the calling
//! thread's tid) the moment the notification is received and is used for
//! everything else in that request. The pidfd pins the process instance; the
//! tid alone is only used as the address for `process_vm_readv` and
//! `/proc/<tid>`, and every copy is bracketed by a liveness check so a
//! recycled tid can never be read from.
//!
//! Transfers are bounded to one page. Buffers are fresh per call and never
//! outlive the emulation that requested them.

use std::ffi::CString;
use std::fs;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

use compartd_sys::pidfd::{pidfd_is_alive, pidfd_open_thread};
use compartd_sys::process_vm::{process_vm_read, process_vm_write};
use rustix::io::Errno;
use rustix::process::{Pid, PidfdFlags, pidfd_open};

use crate::error::EmulationError;

/// Largest single remote transfer.
pub const MAX_REMOTE_SIZE: usize = 4096;

const PAGE_SIZE: u64 = 4096;

/// Memory access to one process instance.
pub trait RemoteProcess {
    fn pid(&self) -> u32;

    /// Copy `size` bytes at `addr` into a fresh buffer.
    fn fetch(&self, addr: u64, size: usize) -> Result<Vec<u8>, EmulationError>;

    /// Copy `bytes` to `addr`.
    fn send(&self, addr: u64, bytes: &[u8]) -> Result<(), EmulationError>;

    /// Read a NUL-terminated string of at most `max` bytes (terminator included).
    ///
    /// Reads page-sized chunks that never cross a page boundary, so a short
    /// string at the end of a mapping is still readable.
    fn fetch_cstring(&self, addr: u64, max: usize) -> Result<CString, EmulationError> {
        if addr == 0 {
            return Err(EmulationError::InvalidArgument("null string pointer"));
        }
        if max == 0 || max > MAX_REMOTE_SIZE {
            return Err(EmulationError::InvalidArgument("string bound out of range"));
        }

        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < max {
            let to_page_end = (PAGE_SIZE - cursor % PAGE_SIZE) as usize;
            let chunk = to_page_end.min(max - out.len());
            let bytes = self.fetch(cursor, chunk)?;
            if let Some(nul) = bytes.iter().position(|&b| b == 0) {
                out.extend_from_slice(&bytes[..nul]);
                return CString::new(out)
                    .map_err(|_| EmulationError::InvalidArgument("embedded NUL"));
            }
            out.extend_from_slice(&bytes);
            cursor = cursor
                .checked_add(chunk as u64)
                .ok_or(EmulationError::InvalidArgument("string wraps address space"))?;
        }

        Err(EmulationError::InvalidArgument("unterminated string"))
    }

    /// Like [`fetch_cstring`](Self::fetch_cstring) but a null pointer is `None`.
    fn fetch_optional_cstring(
        &self,
        addr: u64,
        max: usize,
    ) -> Result<Option<CString>, EmulationError> {
        if addr == 0 {
            Ok(None)
        } else {
            self.fetch_cstring(addr, max).map(Some)
        }
    }
}

fn check_range(addr: u64, size: usize) -> Result<(), EmulationError> {
    if size > MAX_REMOTE_SIZE {
        return Err(EmulationError::InvalidArgument("remote buffer larger than a page"));
    }
    if addr == 0 {
        return Err(EmulationError::InvalidArgument("null remote address"));
    }
    if addr.checked_add(size as u64).is_none() {
        return Err(EmulationError::InvalidArgument("remote range wraps"));
    }
    Ok(())
}

/// Thread group of `tid`, from the `Tgid:` line of `/proc/<tid>/status`.
pub fn parse_tgid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|id| id.trim().parse().ok())
}

fn read_tgid(tid: u32) -> Result<u32, EmulationError> {
    let status = fs::read_to_string(format!("/proc/{tid}/status")).map_err(|e| {
        match e.raw_os_error() {
            Some(libc::ENOENT | libc::ESRCH) => EmulationError::TargetGone,
            Some(code) => EmulationError::Os(Errno::from_raw_os_error(code)),
            None => EmulationError::Os(Errno::IO),
        }
    })?;
    parse_tgid(&status).ok_or(EmulationError::Os(Errno::IO))
}

/// A live thread pinned by a pidfd.
///
/// Notifications name the calling thread, which need not lead its thread
/// group. The thread itself is pinned with `PIDFD_THREAD` where the kernel
/// has it; otherwise the pidfd pins the thread group and the thread's
/// membership is re-checked through `/proc/<tgid>/task/<tid>`.
#[derive(Debug)]
pub struct ProcessHandle {
    tid: u32,
    tgid: u32,
    pidfd: OwnedFd,
    thread_scoped: bool,
}

impl ProcessHandle {
    /// Pin the thread currently holding `tid`.
    ///
    /// # Errors
    ///
    /// `TargetGone` if no such thread exists.
    pub fn open(tid: u32) -> Result<Self, EmulationError> {
        let raw = i32::try_from(tid).map_err(|_| EmulationError::TargetGone)?;
        if raw <= 0 {
            return Err(EmulationError::TargetGone);
        }

        match pidfd_open_thread(raw) {
            Ok(pidfd) => {
                let handle = Self {
                    tid,
                    tgid: read_tgid(tid)?,
                    pidfd,
                    thread_scoped: true,
                };
                handle.ensure_alive()?;
                return Ok(handle);
            }
            // No PIDFD_THREAD before 6.9
            Err(Errno::INVAL) => {}
            Err(Errno::SRCH) => return Err(EmulationError::TargetGone),
            Err(e) => return Err(EmulationError::Os(e)),
        }

        let tgid = read_tgid(tid)?;
        let leader = Pid::from_raw(tgid as i32).ok_or(EmulationError::Os(Errno::IO))?;
        let pidfd = pidfd_open(leader, PidfdFlags::empty()).map_err(|e| match e {
            Errno::SRCH => EmulationError::TargetGone,
            e => EmulationError::Os(e),
        })?;

        // The tid may have been recycled into another group before the open
        if read_tgid(tid)? != tgid {
            return Err(EmulationError::TargetGone);
        }
        let handle = Self {
            tid,
            tgid,
            pidfd,
            thread_scoped: false,
        };
        handle.ensure_alive()?;
        Ok(handle)
    }

    pub fn tgid(&self) -> u32 {
        self.tgid
    }

    pub fn pidfd(&self) -> BorrowedFd<'_> {
        self.pidfd.as_fd()
    }

    pub fn is_alive(&self) -> bool {
        if !pidfd_is_alive(self.pidfd.as_fd()) {
            return false;
        }
        self.thread_scoped
            || self.tid == self.tgid
            || Path::new(&format!("/proc/{}/task/{}", self.tgid, self.tid)).exists()
    }

    /// `TargetGone` unless the pinned thread is still running.
    pub fn ensure_alive(&self) -> Result<(), EmulationError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(EmulationError::TargetGone)
        }
    }

    fn raw_pid(&self) -> i32 {
        self.tid as i32
    }
}

impl RemoteProcess for ProcessHandle {
    fn pid(&self) -> u32 {
        self.tid
    }

    fn fetch(&self, addr: u64, size: usize) -> Result<Vec<u8>, EmulationError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        check_range(addr, size)?;
        self.ensure_alive()?;

        let mut buf = vec![0u8; size];
        let n = process_vm_read(self.raw_pid(), addr, &mut buf)?;

        // The pid may have been reused between the first check and the copy
        self.ensure_alive()?;
        if n != size {
            return Err(EmulationError::Os(Errno::FAULT));
        }
        Ok(buf)
    }

    fn send(&self, addr: u64, bytes: &[u8]) -> Result<(), EmulationError> {
        if bytes.is_empty() {
            return Ok(());
        }
        check_range(addr, bytes.len())?;
        self.ensure_alive()?;

        let n = process_vm_write(self.raw_pid(), addr, bytes)?;

        self.ensure_alive()?;
        if n != bytes.len() {
            return Err(EmulationError::Os(Errno::FAULT));
        }
        Ok(())
    }
}
