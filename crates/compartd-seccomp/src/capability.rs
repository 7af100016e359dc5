//! Capability queries against a process's effective set.
//!
//! `/proc/<pid>/status` reports `CapEff` relative to the process's own user
//! namespace. Root inside a compartment's user namespace therefore shows a
//! full mask, while a capability held only in an ancestor namespace does not
//! appear at all.
//!
//! Every query fails closed: if the status file cannot be read or parsed the
//! capability is treated as absent.

use std::fmt;
use std::fs;
use std::str::FromStr;

use thiserror::Error;

/// Capabilities the emulators distinguish on (numbers from `linux/capability.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Capability {
    Chown = 0,
    DacOverride = 1,
    Kill = 5,
    NetAdmin = 12,
    SysModule = 16,
    SysChroot = 18,
    SysPtrace = 19,
    SysAdmin = 21,
    SysBoot = 22,
    SysResource = 24,
    SysTime = 25,
    Mknod = 27,
}

impl Capability {
    const ALL: &'static [(Capability, &'static str)] = &[
        (Capability::Chown, "CAP_CHOWN"),
        (Capability::DacOverride, "CAP_DAC_OVERRIDE"),
        (Capability::Kill, "CAP_KILL"),
        (Capability::NetAdmin, "CAP_NET_ADMIN"),
        (Capability::SysModule, "CAP_SYS_MODULE"),
        (Capability::SysChroot, "CAP_SYS_CHROOT"),
        (Capability::SysPtrace, "CAP_SYS_PTRACE"),
        (Capability::SysAdmin, "CAP_SYS_ADMIN"),
        (Capability::SysBoot, "CAP_SYS_BOOT"),
        (Capability::SysResource, "CAP_SYS_RESOURCE"),
        (Capability::SysTime, "CAP_SYS_TIME"),
        (Capability::Mknod, "CAP_MKNOD"),
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(c, _)| *c == self)
            .map_or("CAP_UNKNOWN", |(_, n)| n)
    }

    /// `true` if this capability's bit is set in `mask`.
    pub fn in_mask(self, mask: u64) -> bool {
        mask & (1u64 << self.number()) != 0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown capability: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    /// Accepts `CAP_SYS_ADMIN`, `cap_sys_admin` or `sys_admin`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let full = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        };
        Self::ALL
            .iter()
            .find(|(_, n)| *n == full)
            .map(|(c, _)| *c)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// Extract the `CapEff` mask from the text of `/proc/<pid>/status`.
pub fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

/// Does `pid` hold `cap` in its effective set? Any failure answers `false`.
///
/// Prefer a handle-based check (`Host::has_capability`) while serving a
/// request, since a bare pid may be recycled.
pub fn has_capability(pid: u32, cap: Capability) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/status")) {
        Ok(status) => parse_cap_eff(&status).is_some_and(|mask| cap.in_mask(mask)),
        Err(e) => {
            tracing::debug!(pid, capability = %cap, error = %e, "capability query failed");
            false
        }
    }
}
