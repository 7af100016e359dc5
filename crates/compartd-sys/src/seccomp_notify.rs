//! Seccomp user notification (`SECCOMP_RET_USER_NOTIF`) support.
//!
//! Seccomp user notification allows a supervisor process to intercept
//! syscalls from a sandboxed process and answer them on its behalf.
//!
//! ## Protocol
//!
//! 1. The sandbox installs a filter with `SECCOMP_FILTER_FLAG_NEW_LISTENER`
//! 2. The listener fd is handed to the monitor
//! 3. The monitor polls the listener fd; when readable, calls `SECCOMP_IOCTL_NOTIF_RECV`
//! 4. The monitor answers with `SECCOMP_IOCTL_NOTIF_SEND`, either:
//!    - `SECCOMP_USER_NOTIF_FLAG_CONTINUE` to let the syscall proceed
//!    - an error code to deny it
//!    - a return value for an emulated call
//!
//! ## Runtime Layout
//!
//! Record sizes come from `SECCOMP_GET_NOTIF_SIZES` and are captured in a
//! [`NotifLayout`]. Receive buffers are sized from the layout and zeroed,
//! responses are encoded into buffers of the reported response size. Field
//! offsets are fixed by the ABI (the kernel only appends fields).
//!
//! ## TOCTOU Protection
//!
//! Between receiving a notification and responding, the target may exit and
//! its pid may be recycled. Call `SECCOMP_IOCTL_NOTIF_ID_VALID` after reading
//! target memory and before acting on it or responding.

use rustix::io::Errno;
use thiserror::Error;

use crate::last_errno;
use crate::seccomp::seccomp_get_notif_sizes;

/// Let the syscall proceed as-is (supervisor approves).
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

// ioctl numbers for seccomp notify (from kernel headers)
// SECCOMP_IOCTL_NOTIF_RECV = SECCOMP_IOWR(0, struct seccomp_notif)
// SECCOMP_IOCTL_NOTIF_SEND = SECCOMP_IOWR(1, struct seccomp_notif_resp)
// SECCOMP_IOCTL_NOTIF_ID_VALID = SECCOMP_IOW(2, __u64)

/// ioctl to receive a notification from the seccomp listener fd.
pub const SECCOMP_IOCTL_NOTIF_RECV: u64 = 0xc0502100;
/// ioctl to send a response to a seccomp notification.
pub const SECCOMP_IOCTL_NOTIF_SEND: u64 = 0xc0182101;
/// ioctl to check if a notification ID is still valid (TOCTOU protection).
pub const SECCOMP_IOCTL_NOTIF_ID_VALID: u64 = 0x40082102;

// struct seccomp_notif
const NOTIF_ID: usize = 0;
const NOTIF_PID: usize = 8;
const NOTIF_FLAGS: usize = 12;
const NOTIF_DATA: usize = 16;

// struct seccomp_data, relative to NOTIF_DATA
const DATA_NR: usize = 0;
const DATA_ARCH: usize = 4;
const DATA_IP: usize = 8;
const DATA_ARGS: usize = 16;

// struct seccomp_notif_resp
const RESP_ID: usize = 0;
const RESP_VAL: usize = 8;
const RESP_ERROR: usize = 16;
const RESP_FLAGS: usize = 20;

/// Smallest record sizes this crate can decode (first kernel ABI).
pub const MIN_NOTIF_SIZE: u16 = 80;
pub const MIN_NOTIF_RESP_SIZE: u16 = 24;
pub const MIN_DATA_SIZE: u16 = 64;

/// Record sizes reported by the kernel (mirrors `struct seccomp_notif_sizes`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifSizes {
    pub seccomp_notif: u16,
    pub seccomp_notif_resp: u16,
    pub seccomp_data: u16,
}

/// Decoded `struct seccomp_data`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompData {
    /// Syscall number.
    pub nr: i32,
    /// Architecture (`AUDIT_ARCH_*`).
    pub arch: u32,
    /// Instruction pointer at time of syscall.
    pub instruction_pointer: u64,
    /// Syscall arguments.
    pub args: [u64; 6],
}

/// Decoded `struct seccomp_notif`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotif {
    /// Unique notification ID.
    pub id: u64,
    /// PID of the notifying process (in the supervisor's PID namespace).
    pub pid: u32,
    /// Flags (currently unused, must be 0).
    pub flags: u32,
    /// The syscall data.
    pub data: SeccompData,
}

/// Response to a seccomp notification (`struct seccomp_notif_resp`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotifResp {
    /// Must match the notification ID.
    pub id: u64,
    /// Return value for the syscall.
    pub val: i64,
    /// Negative errno, or 0.
    pub error: i32,
    /// Flags (e.g., `SECCOMP_USER_NOTIF_FLAG_CONTINUE`).
    pub flags: u32,
}

/// Errors decoding or negotiating the record layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("kernel reports {record} of {found} bytes, need at least {required}")]
    TooSmall {
        record: &'static str,
        found: u16,
        required: u16,
    },

    #[error("record is {found} bytes, layout expects {expected}")]
    Truncated { expected: usize, found: usize },

    #[error("SECCOMP_GET_NOTIF_SIZES: {0}")]
    Query(Errno),
}

/// Record layout captured once per listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifLayout {
    sizes: NotifSizes,
}

impl NotifLayout {
    /// Query the running kernel for its record sizes.
    pub fn query() -> Result<Self, LayoutError> {
        let sizes = seccomp_get_notif_sizes().map_err(LayoutError::Query)?;
        Self::from_sizes(sizes)
    }

    /// Build a layout from explicit sizes, rejecting records too small to
    /// hold the fields the monitor reads.
    pub fn from_sizes(sizes: NotifSizes) -> Result<Self, LayoutError> {
        check_size("seccomp_notif", sizes.seccomp_notif, MIN_NOTIF_SIZE)?;
        check_size(
            "seccomp_notif_resp",
            sizes.seccomp_notif_resp,
            MIN_NOTIF_RESP_SIZE,
        )?;
        check_size("seccomp_data", sizes.seccomp_data, MIN_DATA_SIZE)?;
        Ok(Self { sizes })
    }

    pub fn sizes(&self) -> NotifSizes {
        self.sizes
    }

    /// Size of a receive buffer.
    pub fn notif_size(&self) -> usize {
        usize::from(self.sizes.seccomp_notif)
    }

    /// Size of an encoded response.
    pub fn resp_size(&self) -> usize {
        usize::from(self.sizes.seccomp_notif_resp)
    }

    /// Decode a received notification record.
    pub fn decode_notif(&self, buf: &[u8]) -> Result<SeccompNotif, LayoutError> {
        if buf.len() != self.notif_size() {
            return Err(LayoutError::Truncated {
                expected: self.notif_size(),
                found: buf.len(),
            });
        }

        let mut args = [0u64; 6];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = read_u64(buf, NOTIF_DATA + DATA_ARGS + i * 8);
        }

        Ok(SeccompNotif {
            id: read_u64(buf, NOTIF_ID),
            pid: read_u32(buf, NOTIF_PID),
            flags: read_u32(buf, NOTIF_FLAGS),
            data: SeccompData {
                nr: read_u32(buf, NOTIF_DATA + DATA_NR) as i32,
                arch: read_u32(buf, NOTIF_DATA + DATA_ARCH),
                instruction_pointer: read_u64(buf, NOTIF_DATA + DATA_IP),
                args,
            },
        })
    }

    /// Encode a notification record (used by tests and record replay).
    pub fn encode_notif(&self, notif: &SeccompNotif) -> Vec<u8> {
        let mut buf = vec![0u8; self.notif_size()];
        write_bytes(&mut buf, NOTIF_ID, &notif.id.to_ne_bytes());
        write_bytes(&mut buf, NOTIF_PID, &notif.pid.to_ne_bytes());
        write_bytes(&mut buf, NOTIF_FLAGS, &notif.flags.to_ne_bytes());
        write_bytes(&mut buf, NOTIF_DATA + DATA_NR, &notif.data.nr.to_ne_bytes());
        write_bytes(
            &mut buf,
            NOTIF_DATA + DATA_ARCH,
            &notif.data.arch.to_ne_bytes(),
        );
        write_bytes(
            &mut buf,
            NOTIF_DATA + DATA_IP,
            &notif.data.instruction_pointer.to_ne_bytes(),
        );
        for (i, arg) in notif.data.args.iter().enumerate() {
            write_bytes(&mut buf, NOTIF_DATA + DATA_ARGS + i * 8, &arg.to_ne_bytes());
        }
        buf
    }

    /// Encode a response into a buffer of the kernel's response size.
    pub fn encode_resp(&self, resp: &SeccompNotifResp) -> Vec<u8> {
        let mut buf = vec![0u8; self.resp_size()];
        write_bytes(&mut buf, RESP_ID, &resp.id.to_ne_bytes());
        write_bytes(&mut buf, RESP_VAL, &resp.val.to_ne_bytes());
        write_bytes(&mut buf, RESP_ERROR, &resp.error.to_ne_bytes());
        write_bytes(&mut buf, RESP_FLAGS, &resp.flags.to_ne_bytes());
        buf
    }
}

fn check_size(record: &'static str, found: u16, required: u16) -> Result<(), LayoutError> {
    if found < required {
        Err(LayoutError::TooSmall {
            record,
            found,
            required,
        })
    } else {
        Ok(())
    }
}

#[inline]
fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

#[inline]
fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Receive a raw notification record into `buf`.
///
/// `buf` must be [`NotifLayout::notif_size`] bytes; it is zeroed first as
/// the kernel requires.
///
/// # Errors
///
/// Returns `Errno` on failure (`ENOENT` if the target died before delivery).
pub fn notif_recv(listener_fd: i32, buf: &mut [u8]) -> Result<(), Errno> {
    buf.fill(0);
    let ret = unsafe {
        libc::ioctl(
            listener_fd,
            SECCOMP_IOCTL_NOTIF_RECV,
            buf.as_mut_ptr(),
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

/// Send an encoded response record.
///
/// # Errors
///
/// Returns `Errno` on failure (`ENOENT` if the notification is stale).
pub fn notif_send(listener_fd: i32, buf: &[u8]) -> Result<(), Errno> {
    let ret = unsafe { libc::ioctl(listener_fd, SECCOMP_IOCTL_NOTIF_SEND, buf.as_ptr()) };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

/// Check if a notification ID is still valid.
///
/// # Errors
///
/// Returns `Errno::NOENT` if the notification is no longer valid.
pub fn notif_id_valid(listener_fd: i32, id: u64) -> Result<(), Errno> {
    let ret = unsafe { libc::ioctl(listener_fd, SECCOMP_IOCTL_NOTIF_ID_VALID, &id as *const u64) };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}
