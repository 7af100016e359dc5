//! Emulation policy: which syscalls a compartment may have emulated, and the
//! allow-lists each emulator consults.
//!
//! ## Example
//!
//! ```ignore
//! use compartd_seccomp::{Features, Policy};
//!
//! let features = Features::MOUNT | Features::SYSINFO;
//! let policy = Policy::default()
//!     .allow_fstype("overlay")
//!     .allow_ioctl(libc::TIOCGPGRP as u32, 4)
//!     .allow_modules(["overlay", "br_netfilter"]);
//! ```
//!
//! ## Defaults
//!
//! | Allow-list | Default |
//! |------------|---------|
//! | filesystem types | `tmpfs`, `proc`, `sysfs`, `devpts`, `mqueue`, `cgroup2` |
//! | mount flags | `MS_RDONLY`, `MS_NOSUID`, `MS_NODEV`, `MS_NOEXEC`, `MS_NOATIME`, `MS_NODIRATIME`, `MS_RELATIME`, `MS_STRICTATIME`, `MS_SILENT` |
//! | char devices | null 1:3, zero 1:5, full 1:7, random 1:8, urandom 1:9, tty 5:0 |
//! | ioctls | `TIOCGWINSZ` (8 bytes), `TCGETS` (36 bytes), `FIONREAD` (4 bytes) |
//! | modules | any module known to the host |

use bitflags::bitflags;
use thiserror::Error;

use crate::emulate::Syscall;

bitflags! {
    /// Syscalls a compartment is permitted to have emulated.
    ///
    /// Negotiated when the compartment is created. A syscall whose bit is
    /// clear is answered with "continue unmodified".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        const MOUNT = 1 << 0;
        const MODULE = 1 << 1;
        const MKNOD = 1 << 2;
        const IOCTL = 1 << 3;
        const TIME = 1 << 4;
        const SYSINFO = 1 << 5;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl Features {
    /// Syscall numbers routed to the monitor when these features are on.
    pub fn syscalls(self) -> Vec<i64> {
        Syscall::ALL
            .iter()
            .filter(|s| self.contains(s.feature()))
            .map(|s| s.nr())
            .collect()
    }

    /// Parse a comma-separated list such as `mount,sysinfo` (or `all`).
    pub fn parse_list(list: &str) -> Result<Self, UnknownFeature> {
        let mut features = Features::empty();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            features |= match name.to_ascii_lowercase().as_str() {
                "all" => Features::all(),
                "mount" => Features::MOUNT,
                "module" | "finit_module" => Features::MODULE,
                "mknod" | "mknodat" => Features::MKNOD,
                "ioctl" => Features::IOCTL,
                "time" => Features::TIME,
                "sysinfo" => Features::SYSINFO,
                _ => return Err(UnknownFeature(name.to_string())),
            };
        }
        Ok(features)
    }
}

/// Legacy magic some callers still put in the upper mount-flag bits.
const MS_MGC_VAL: u64 = 0xc0ed_0000;
const MS_MGC_MSK: u64 = 0xffff_0000;

const DEFAULT_FSTYPES: &[&str] = &["tmpfs", "proc", "sysfs", "devpts", "mqueue", "cgroup2"];

const DEFAULT_MOUNT_FLAGS: u64 = (libc::MS_RDONLY
    | libc::MS_NOSUID
    | libc::MS_NODEV
    | libc::MS_NOEXEC
    | libc::MS_NOATIME
    | libc::MS_NODIRATIME
    | libc::MS_RELATIME
    | libc::MS_STRICTATIME
    | libc::MS_SILENT) as u64;

/// A character device a compartment may create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRule {
    pub name: &'static str,
    pub major: u32,
    pub minor: u32,
}

impl DeviceRule {
    pub const fn new(name: &'static str, major: u32, minor: u32) -> Self {
        Self { name, major, minor }
    }
}

const DEFAULT_DEVICES: &[DeviceRule] = &[
    DeviceRule::new("null", 1, 3),
    DeviceRule::new("zero", 1, 5),
    DeviceRule::new("full", 1, 7),
    DeviceRule::new("random", 1, 8),
    DeviceRule::new("urandom", 1, 9),
    DeviceRule::new("tty", 5, 0),
];

/// An ioctl request forwarded to the real file, with the size of the result
/// the kernel writes through `argp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoctlRule {
    pub request: u32,
    pub size: usize,
}

// Kernel `struct termios` (asm-generic), not the larger libc one.
const KERNEL_TERMIOS_SIZE: usize = 36;

fn default_ioctls() -> Vec<IoctlRule> {
    vec![
        IoctlRule {
            request: libc::TIOCGWINSZ as u32,
            size: size_of::<libc::winsize>(),
        },
        IoctlRule {
            request: libc::TCGETS as u32,
            size: KERNEL_TERMIOS_SIZE,
        },
        IoctlRule {
            request: libc::FIONREAD as u32,
            size: size_of::<libc::c_int>(),
        },
    ]
}

/// Allow-lists consulted by the emulators.
#[derive(Debug, Clone)]
pub struct Policy {
    fstypes: Vec<String>,
    mount_flags: u64,
    devices: Vec<DeviceRule>,
    ioctls: Vec<IoctlRule>,
    modules: Option<Vec<String>>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            fstypes: DEFAULT_FSTYPES.iter().map(|s| s.to_string()).collect(),
            mount_flags: DEFAULT_MOUNT_FLAGS,
            devices: DEFAULT_DEVICES.to_vec(),
            ioctls: default_ioctls(),
            modules: None,
        }
    }
}

impl Policy {
    /// A policy that permits nothing.
    pub fn deny_all() -> Self {
        Self {
            fstypes: Vec::new(),
            mount_flags: 0,
            devices: Vec::new(),
            ioctls: Vec::new(),
            modules: Some(Vec::new()),
        }
    }

    pub fn allow_fstype(mut self, fstype: impl Into<String>) -> Self {
        let fstype = fstype.into();
        if !self.fstypes.contains(&fstype) {
            self.fstypes.push(fstype);
        }
        self
    }

    /// Replace the allowed mount-flag mask.
    pub fn mount_flags(mut self, mask: u64) -> Self {
        self.mount_flags = mask;
        self
    }

    pub fn allow_device(mut self, rule: DeviceRule) -> Self {
        if !self.device_allowed(rule.major, rule.minor) {
            self.devices.push(rule);
        }
        self
    }

    pub fn allow_ioctl(mut self, request: u32, size: usize) -> Self {
        self.ioctls.retain(|r| r.request != request);
        self.ioctls.push(IoctlRule { request, size });
        self
    }

    /// Restrict `finit_module` to the named modules.
    pub fn allow_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = self.modules.get_or_insert_with(Vec::new);
        list.extend(
            names
                .into_iter()
                .map(|n| crate::modules::normalize_name(n.as_ref())),
        );
        self
    }

    pub fn fstype_allowed(&self, fstype: &str) -> bool {
        self.fstypes.iter().any(|f| f == fstype)
    }

    /// Check mount flags against the mask, ignoring the legacy magic.
    pub fn mount_flags_allowed(&self, flags: u64) -> bool {
        let flags = strip_mount_magic(flags);
        flags & !self.mount_flags == 0
    }

    pub fn device_allowed(&self, major: u32, minor: u32) -> bool {
        self.devices
            .iter()
            .any(|d| d.major == major && d.minor == minor)
    }

    pub fn ioctl_rule(&self, request: u32) -> Option<&IoctlRule> {
        self.ioctls.iter().find(|r| r.request == request)
    }

    pub fn ioctl_codes(&self) -> Vec<u32> {
        self.ioctls.iter().map(|r| r.request).collect()
    }

    /// `true` if the module may be loaded. No list means any module.
    pub fn module_allowed(&self, name: &str) -> bool {
        match &self.modules {
            None => true,
            Some(list) => {
                let name = crate::modules::normalize_name(name);
                list.iter().any(|m| *m == name)
            }
        }
    }
}

pub(crate) fn strip_mount_magic(flags: u64) -> u64 {
    if flags & MS_MGC_MSK == MS_MGC_VAL {
        flags & !MS_MGC_MSK
    } else {
        flags
    }
}
