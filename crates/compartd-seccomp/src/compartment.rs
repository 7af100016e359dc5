//! Read-only descriptor of the compartment a monitor serves.
//!
//! The compartment's lifecycle (namespaces, cgroup, rootfs) is owned by the
//! caller. The monitor only reads the root path, the resource envelope and,
//! for `sysinfo`, the live cgroup counters.
//!
//! ## Example
//!
//! ```ignore
//! use compartd_seccomp::{Compartment, CompartmentId};
//!
//! let compartment = Compartment::new(CompartmentId(7), "build", "/var/lib/compartd/build")
//!     .memory_max(512 * 1024 * 1024)
//!     .pids_max(128)
//!     .cgroup("/sys/fs/cgroup/compartd/build");
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompartmentId(pub usize);

impl fmt::Display for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Compartment({})", self.0)
    }
}

/// Resource envelope; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory limit in bytes (`memory.max`).
    pub memory_max: Option<u64>,
    /// Swap limit in bytes (`memory.swap.max`).
    pub swap_max: Option<u64>,
    /// Maximum number of processes (`pids.max`).
    pub pids_max: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Compartment {
    id: CompartmentId,
    name: String,
    root: PathBuf,
    limits: ResourceLimits,
    cgroup: Option<PathBuf>,
    started: Option<Instant>,
}

impl Compartment {
    pub fn new(id: CompartmentId, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            root: root.into(),
            limits: ResourceLimits::default(),
            cgroup: None,
            started: None,
        }
    }

    pub fn memory_max(mut self, bytes: u64) -> Self {
        self.limits.memory_max = Some(bytes);
        self
    }

    pub fn swap_max(mut self, bytes: u64) -> Self {
        self.limits.swap_max = Some(bytes);
        self
    }

    pub fn pids_max(mut self, count: u64) -> Self {
        self.limits.pids_max = Some(count);
        self
    }

    /// Directory of the compartment's cgroup, read for live usage.
    pub fn cgroup(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgroup = Some(path.into());
        self
    }

    pub fn started_at(mut self, at: Instant) -> Self {
        self.started = Some(at);
        self
    }

    pub fn id(&self) -> CompartmentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn cgroup_path(&self) -> Option<&Path> {
        self.cgroup.as_deref()
    }

    /// Time since the compartment was started, if known.
    pub fn uptime(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }
}
