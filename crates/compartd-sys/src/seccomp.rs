//! Seccomp-BPF filters for syscall emulation.
//!
//! The monitor only needs two kinds of programs:
//!
//! 1. A **notify filter** that routes the emulated syscalls to
//!    `SECCOMP_RET_USER_NOTIF` and lets everything else through. It is stacked
//!    on top of the compartment's regular filter; the kernel picks the
//!    strictest verdict across stacked filters.
//! 2. An **ioctl filter** describing the ioctl allow-list: allow-listed
//!    request codes are routed to the monitor, every other `ioctl` gets
//!    `EPERM`. It is exposed for audit and diagnostics.
//!
//! ## Notify Filter Layout
//!
//! ```text
//! [0-2]   Architecture check (foreign arch -> ALLOW, kernel decides)
//! [3]     Load syscall number
//! [4..N]  Emulated syscall checks -> NOTIFY
//! [N+1]   RET ALLOW
//! [N+2]   RET USER_NOTIF
//! ```
//!
//! ## Security Notes
//!
//! - Filters are permanent once installed
//! - Requires `PR_SET_NO_NEW_PRIVS` first (or `CAP_SYS_ADMIN`)
//! - `SECCOMP_FILTER_FLAG_NEW_LISTENER` returns the listener fd the monitor polls

use std::os::fd::{FromRawFd, OwnedFd};

use rustix::io::Errno;

use crate::last_errno;
use crate::seccomp_notify::NotifSizes;

// Seccomp operations
const SECCOMP_SET_MODE_FILTER: u32 = 1;
const SECCOMP_GET_NOTIF_SIZES: u32 = 3;
pub const SECCOMP_FILTER_FLAG_NEW_LISTENER: u32 = 1 << 3;

// Seccomp return actions
pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc00000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff0000;
const SECCOMP_RET_ERRNO: u32 = 0x00050000;

// BPF instruction classes
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// BPF ld/ldx fields
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;

// BPF alu/jmp fields
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

pub const AUDIT_ARCH_X86_64: u32 = 0xc000003e;
pub const AUDIT_ARCH_AARCH64: u32 = 0xc00000b7;

/// Audit architecture tag of the monitor's own build target.
#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH_NATIVE: u32 = AUDIT_ARCH_X86_64;
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH_NATIVE: u32 = AUDIT_ARCH_AARCH64;

// seccomp_data offsets (little endian)
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS_1: u32 = 24; // args[1], lower 32 bits

/// Maximum number of compared values (BPF jump offsets are u8)
const MAX_LIST_SIZE: usize = 200;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    /// Returns the action if this instruction is a `RET K`.
    pub const fn ret_action(&self) -> Option<u32> {
        if self.code == BPF_RET | BPF_K {
            Some(self.k)
        } else {
            None
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

impl SockFprog {
    /// Borrow a program for installation. The slice must outlive the call.
    pub fn new(filter: &[SockFilter]) -> Self {
        Self {
            len: filter.len() as u16,
            filter: filter.as_ptr(),
        }
    }
}

/// `SECCOMP_RET_ERRNO` action carrying `errno`.
#[inline]
pub const fn ret_errno(errno: i32) -> u32 {
    SECCOMP_RET_ERRNO | (errno as u32 & 0xffff)
}

/// Builds a BPF filter that returns `SECCOMP_RET_USER_NOTIF` for the listed
/// syscalls and `SECCOMP_RET_ALLOW` for everything else.
///
/// # Panics
///
/// Panics if `syscalls.len()` > 200 (BPF jump offsets are u8).
pub fn build_notify_filter(syscalls: &[i64]) -> Vec<SockFilter> {
    assert!(
        syscalls.len() <= MAX_LIST_SIZE,
        "notify syscall list too large: {} > {}",
        syscalls.len(),
        MAX_LIST_SIZE
    );

    let n = syscalls.len();
    let mut filter = Vec::with_capacity(n + 6);

    push_arch_check(&mut filter);

    filter.push(SockFilter::stmt(
        BPF_LD | BPF_W | BPF_ABS,
        OFFSET_SYSCALL_NR,
    ));

    for (i, &nr) in syscalls.iter().enumerate() {
        let notify_offset = (n - i) as u8;
        filter.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            nr as u32,
            notify_offset,
            0,
        ));
    }

    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_USER_NOTIF));

    filter
}

/// Builds the ioctl allow-list program.
///
/// ## Layout
///
/// ```text
/// [0-2]   Architecture check
/// [3]     Load syscall number
/// [4]     ioctl? -> [6]
/// [5]     RET ALLOW (not an ioctl)
/// [6]     Load request code (args[1], lower 32 bits)
/// [7..N]  Allow-listed codes -> NOTIFY
/// [N+1]   RET ERRNO(EPERM)
/// [N+2]   RET USER_NOTIF
/// ```
///
/// # Panics
///
/// Panics if `codes.len()` > 200 (BPF jump offsets are u8).
pub fn build_ioctl_filter(codes: &[u32]) -> Vec<SockFilter> {
    assert!(
        codes.len() <= MAX_LIST_SIZE,
        "ioctl allow-list too large: {} > {}",
        codes.len(),
        MAX_LIST_SIZE
    );

    let n = codes.len();
    let mut filter = Vec::with_capacity(n + 9);

    push_arch_check(&mut filter);

    filter.push(SockFilter::stmt(
        BPF_LD | BPF_W | BPF_ABS,
        OFFSET_SYSCALL_NR,
    ));
    filter.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        libc::SYS_ioctl as u32,
        1,
        0,
    ));
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_1));
    for (i, &code) in codes.iter().enumerate() {
        let notify_offset = (n - i) as u8;
        filter.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            code,
            notify_offset,
            0,
        ));
    }

    filter.push(SockFilter::stmt(
        BPF_RET | BPF_K,
        ret_errno(libc::EPERM),
    ));
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_USER_NOTIF));

    filter
}

fn push_arch_check(filter: &mut Vec<SockFilter>) {
    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    filter.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        AUDIT_ARCH_NATIVE,
        1,
        0,
    ));
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
}

/// Install a seccomp filter with `SECCOMP_FILTER_FLAG_NEW_LISTENER`.
///
/// Returns the listener fd which can be used to receive notifications.
/// Sets `PR_SET_NO_NEW_PRIVS` first.
///
/// # Safety
///
/// The filter must be a valid BPF program. This permanently restricts
/// syscalls for this thread.
///
/// # Errors
///
/// Returns `Errno` if the filter cannot be installed.
pub unsafe fn seccomp_set_mode_filter_listener(fprog: &SockFprog) -> Result<OwnedFd, Errno> {
    unsafe {
        let ret = libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
        if ret != 0 {
            return Err(last_errno());
        }

        let ret = libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_NEW_LISTENER,
            fprog as *const _,
        );
        if ret < 0 {
            Err(last_errno())
        } else {
            // SAFETY: On success, ret is a valid listener file descriptor.
            Ok(OwnedFd::from_raw_fd(ret as i32))
        }
    }
}

/// Query the notification record sizes of the running kernel.
///
/// # Errors
///
/// Returns `Errno` if the kernel does not support user notification.
pub fn seccomp_get_notif_sizes() -> Result<NotifSizes, Errno> {
    let mut sizes = NotifSizes::default();
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_GET_NOTIF_SIZES,
            0u32,
            &mut sizes as *mut NotifSizes,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(sizes) }
}

/// Returns true if seccomp is available.
pub fn seccomp_available() -> bool {
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}
