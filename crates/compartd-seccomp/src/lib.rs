//! compartd-seccomp: syscall emulation for compartments
//!
//! A compartment's sandbox is armed with a seccomp filter that routes a small
//! set of privileged syscalls to `SECCOMP_RET_USER_NOTIF`. One
//! [`CompartmentMonitor`] per compartment receives those notifications,
//! decides whether each call may proceed, and performs the permitted ones on
//! the compartment's behalf:
//!
//! - **mount** - allow-listed filesystem types and flags, target kept inside the compartment root
//! - **`finit_module`** - dependency-ordered loading with a per-compartment cache
//! - **mknodat** - allow-listed character devices only
//! - **ioctl** - allow-listed read-only requests forwarded to the real file
//! - **time** - read-only clock queries pass, clock changes are refused
//! - **sysinfo** - memory and process figures scoped to the compartment's limits
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use compartd_seccomp::{
//!     Compartment, CompartmentId, CompartmentMonitor, Features, KernelChannel, LinuxHost,
//!     Supervisor, spawn_armed,
//! };
//!
//! let compartment = Arc::new(Compartment::new(CompartmentId(0), "web", "/"));
//! let features = Features::SYSINFO | Features::TIME;
//! let armed = spawn_armed(&["free".into()], &compartd_sys::seccomp::build_notify_filter(
//!     &features.syscalls(),
//! ))?;
//!
//! let channel = KernelChannel::new(armed.listener)?;
//! let monitor = CompartmentMonitor::new(channel, LinuxHost::new(), compartment, features);
//!
//! let mut supervisor = Supervisor::new()?;
//! supervisor.register(Box::new(monitor))?;
//! ```
//!
//! ## Requirements
//!
//! - Linux kernel 5.10+ (user notification with `CONTINUE`, `pidfd_getfd`)
//! - Seccomp enabled in kernel

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod capability;
pub mod cgroup;
pub mod channel;
pub mod compartment;
pub mod emulate;
pub mod error;
pub mod host;
pub mod modules;
pub mod monitor;
pub mod ns;
pub mod policy;
pub mod process;
pub mod spawn;
pub mod supervisor;
pub mod validate;

pub use capability::{Capability, has_capability};
pub use channel::{KernelChannel, NotifyChannel, Reply, Request, Response};
pub use compartment::{Compartment, CompartmentId, ResourceLimits};
pub use emulate::Syscall;
pub use error::{EmulationError, MonitorError};
pub use host::{Host, LinuxHost};
pub use modules::{GraphError, ModuleGraph};
pub use monitor::{CompartmentMonitor, Dispatch, Outcome};
pub use policy::{DeviceRule, Features, Policy};
pub use process::{ProcessHandle, RemoteProcess};
pub use spawn::{Armed, ExitStatus, SpawnError, spawn_armed, wait_for_exit};
pub use supervisor::{Event, Supervisor, SupervisorError};
