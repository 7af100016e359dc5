//! Syscall emulators.
//!
//! Each emulator validates one intercepted syscall and produces a [`Reply`]:
//! a value or errno for the caller, or "continue" to hand the call back to
//! the kernel. Emulators never send anything themselves; the monitor owns
//! the response.
//!
//! | Syscall | Feature | Emulator |
//! |---------|---------|----------|
//! | `mount` | `MOUNT` | [`mount::mount`] |
//! | `finit_module` | `MODULE` | [`module::finit_module`] |
//! | `mknodat`, `mknod` | `MKNOD` | [`mknod::mknodat`], [`mknod::mknod`] |
//! | `ioctl` | `IOCTL` | [`ioctl::ioctl`] |
//! | `clock_adjtime` | `TIME` | [`time::adjtime`] |
//! | `adjtimex` | `TIME` | [`time::adjtimex`] |
//! | `clock_settime`, `settimeofday` | `TIME` | [`time::settime`] |
//! | `sysinfo` | `SYSINFO` | [`sysinfo::sysinfo`] |

pub mod ioctl;
pub mod mknod;
pub mod module;
pub mod mount;
pub mod sysinfo;
pub mod time;

use crate::channel::{Reply, Request};
use crate::compartment::Compartment;
use crate::error::EmulationError;
use crate::host::Host;
use crate::policy::{Features, Policy};

/// Longest path accepted from a compartment (`PATH_MAX`).
pub(crate) const PATH_MAX: usize = 4096;

/// Everything an emulator may look at for one request.
pub struct Context<'a, H: Host> {
    pub host: &'a H,
    pub process: &'a H::Process,
    pub compartment: &'a Compartment,
    pub policy: &'a Policy,
    pub request: &'a Request,
}

impl<H: Host> Context<'_, H> {
    pub(crate) fn arg(&self, index: usize) -> u64 {
        self.request.args[index]
    }

    /// Argument as the `int` the kernel sees.
    pub(crate) fn int_arg(&self, index: usize) -> i32 {
        self.request.args[index] as u32 as i32
    }
}

/// Result type of every emulator.
pub type EmulationResult = Result<Reply, EmulationError>;

/// Syscalls the monitor can emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syscall {
    Mount,
    FinitModule,
    Mknodat,
    #[cfg(target_arch = "x86_64")]
    Mknod,
    Ioctl,
    ClockAdjtime,
    Adjtimex,
    ClockSettime,
    Settimeofday,
    Sysinfo,
}

impl Syscall {
    pub const ALL: &'static [Syscall] = &[
        Syscall::Mount,
        Syscall::FinitModule,
        Syscall::Mknodat,
        #[cfg(target_arch = "x86_64")]
        Syscall::Mknod,
        Syscall::Ioctl,
        Syscall::ClockAdjtime,
        Syscall::Adjtimex,
        Syscall::ClockSettime,
        Syscall::Settimeofday,
        Syscall::Sysinfo,
    ];

    pub fn nr(self) -> i64 {
        match self {
            Syscall::Mount => libc::SYS_mount,
            Syscall::FinitModule => libc::SYS_finit_module,
            Syscall::Mknodat => libc::SYS_mknodat,
            #[cfg(target_arch = "x86_64")]
            Syscall::Mknod => libc::SYS_mknod,
            Syscall::Ioctl => libc::SYS_ioctl,
            Syscall::ClockAdjtime => libc::SYS_clock_adjtime,
            Syscall::Adjtimex => libc::SYS_adjtimex,
            Syscall::ClockSettime => libc::SYS_clock_settime,
            Syscall::Settimeofday => libc::SYS_settimeofday,
            Syscall::Sysinfo => libc::SYS_sysinfo,
        }
    }

    pub fn from_nr(nr: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.nr() == nr)
    }

    pub fn feature(self) -> Features {
        match self {
            Syscall::Mount => Features::MOUNT,
            Syscall::FinitModule => Features::MODULE,
            Syscall::Mknodat => Features::MKNOD,
            #[cfg(target_arch = "x86_64")]
            Syscall::Mknod => Features::MKNOD,
            Syscall::Ioctl => Features::IOCTL,
            Syscall::ClockAdjtime
            | Syscall::Adjtimex
            | Syscall::ClockSettime
            | Syscall::Settimeofday => Features::TIME,
            Syscall::Sysinfo => Features::SYSINFO,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Syscall::Mount => "mount",
            Syscall::FinitModule => "finit_module",
            Syscall::Mknodat => "mknodat",
            #[cfg(target_arch = "x86_64")]
            Syscall::Mknod => "mknod",
            Syscall::Ioctl => "ioctl",
            Syscall::ClockAdjtime => "clock_adjtime",
            Syscall::Adjtimex => "adjtimex",
            Syscall::ClockSettime => "clock_settime",
            Syscall::Settimeofday => "settimeofday",
            Syscall::Sysinfo => "sysinfo",
        }
    }
}
