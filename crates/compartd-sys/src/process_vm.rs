//! Cross-process memory copies.
//!
//! `process_vm_readv`/`process_vm_writev` move bytes between address spaces
//! without going through `/proc/<pid>/mem`. They address the target by pid,
//! so callers must confirm the target's pidfd is still alive around the copy.

use rustix::io::Errno;

use crate::last_errno;

/// Copy `local.len()` bytes from `remote` in process `pid`.
///
/// Returns the number of bytes copied, which may be short if the remote
/// range crosses into an unmapped page.
///
/// # Errors
///
/// Returns `Errno::FAULT` for an unmapped address, `Errno::SRCH` if the
/// process does not exist.
pub fn process_vm_read(pid: i32, remote: u64, local: &mut [u8]) -> Result<usize, Errno> {
    let local_iov = libc::iovec {
        iov_base: local.as_mut_ptr().cast(),
        iov_len: local.len(),
    };
    let remote_iov = libc::iovec {
        iov_base: remote as *mut libc::c_void,
        iov_len: local.len(),
    };
    let ret = unsafe { libc::process_vm_readv(pid, &local_iov, 1, &remote_iov, 1, 0) };
    if ret < 0 {
        Err(last_errno())
    } else {
        Ok(ret as usize)
    }
}

/// Copy `local` into `remote` in process `pid`.
///
/// # Errors
///
/// Returns `Errno::FAULT` for an unmapped or read-only address,
/// `Errno::SRCH` if the process does not exist.
pub fn process_vm_write(pid: i32, remote: u64, local: &[u8]) -> Result<usize, Errno> {
    let local_iov = libc::iovec {
        iov_base: local.as_ptr() as *mut libc::c_void,
        iov_len: local.len(),
    };
    let remote_iov = libc::iovec {
        iov_base: remote as *mut libc::c_void,
        iov_len: local.len(),
    };
    let ret = unsafe { libc::process_vm_writev(pid, &local_iov, 1, &remote_iov, 1, 0) };
    if ret < 0 {
        Err(last_errno())
    } else {
        Ok(ret as usize)
    }
}
