//! Per-compartment notification dispatcher.
//!
//! A [`CompartmentMonitor`] owns one notification channel and answers every
//! request on it exactly once. Each request moves through:
//!
//! ```text
//! Received -> Validated -> (Emulated | Denied | Continued) -> Responded
//!                                                          \-> Dropped
//! ```
//!
//! `Dropped` is silent and happens only when the target is gone or the
//! cookie went stale while the emulator ran.
//!
//! ## Draining
//!
//! The reactor is edge-triggered, so one readiness event may stand for many
//! queued notifications. [`CompartmentMonitor::handle_ready`] keeps fetching
//! while the channel still polls readable and handles them one at a time.

use std::os::fd::RawFd;
use std::sync::Arc;

use compartd_sys::seccomp::{
    AUDIT_ARCH_NATIVE, SockFilter, build_ioctl_filter, build_notify_filter,
};

use crate::capability::Capability;
use crate::channel::{NotifyChannel, Reply, Request, Response};
use crate::compartment::{Compartment, CompartmentId};
use crate::emulate::{self, Context, EmulationResult, Syscall};
use crate::error::{EmulationError, MonitorError};
use crate::host::Host;
use crate::modules::{GraphError, ModuleGraph};
use crate::policy::{Features, Policy};

/// What happened to one fetched notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing usable was received.
    Skipped,
    Responded(Reply),
    /// No response was sent.
    Dropped,
}

pub struct CompartmentMonitor<C: NotifyChannel, H: Host> {
    channel: C,
    host: H,
    features: Features,
    compartment: Arc<Compartment>,
    policy: Arc<Policy>,
    graph: Arc<ModuleGraph>,
    loaded: Vec<String>,
}

impl<C: NotifyChannel, H: Host> CompartmentMonitor<C, H> {
    pub fn new(channel: C, host: H, compartment: Arc<Compartment>, features: Features) -> Self {
        tracing::debug!(
            compartment = %compartment.name(),
            features = ?features,
            notif_size = channel.layout().notif_size(),
            "monitor created"
        );
        Self {
            channel,
            host,
            features,
            compartment,
            policy: Arc::new(Policy::default()),
            graph: Arc::new(ModuleGraph::new()),
            loaded: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<Policy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_modules(mut self, graph: Arc<ModuleGraph>) -> Self {
        self.graph = graph;
        self
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn compartment(&self) -> &Compartment {
        &self.compartment
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Modules loaded on behalf of this compartment, in load order.
    pub fn loaded_modules(&self) -> &[String] {
        &self.loaded
    }

    /// Does `pid` hold `cap` in its own user namespace? Fails closed.
    pub fn is_capable(&self, pid: u32, cap: Capability) -> bool {
        self.host
            .open_process(pid)
            .is_ok_and(|process| self.host.has_capability(&process, cap))
    }

    /// Load order for `name`, prerequisites first.
    pub fn module_dependencies(&self, name: &str) -> Result<Vec<String>, GraphError> {
        self.graph.dependencies_of(name)
    }

    /// Program routing this monitor's enabled syscalls to the channel.
    pub fn notify_filter(&self) -> Vec<SockFilter> {
        build_notify_filter(&self.features.syscalls())
    }

    /// Program describing the ioctl allow-list.
    pub fn ioctl_filter(&self) -> Vec<SockFilter> {
        build_ioctl_filter(&self.policy.ioctl_codes())
    }

    /// Fetch and answer one notification.
    pub fn handle_one(&mut self) -> Result<Outcome, MonitorError> {
        let Some(request) = self.channel.recv()? else {
            return Ok(Outcome::Skipped);
        };

        let Some(reply) = self.decide(&request) else {
            tracing::trace!(
                compartment = %self.compartment.name(),
                pid = request.pid,
                nr = request.nr,
                "target gone, request dropped"
            );
            return Ok(Outcome::Dropped);
        };

        // The target may have died or been interrupted while we worked
        if !self.channel.id_valid(request.cookie) {
            tracing::debug!(
                compartment = %self.compartment.name(),
                pid = request.pid,
                nr = request.nr,
                "cookie went stale, response dropped"
            );
            return Ok(Outcome::Dropped);
        }

        match self.channel.send(&Response::new(request.cookie, reply)) {
            Ok(()) => Ok(Outcome::Responded(reply)),
            Err(MonitorError::Io(e)) => {
                tracing::warn!(
                    compartment = %self.compartment.name(),
                    pid = request.pid,
                    error = %e,
                    "failed to send response"
                );
                Ok(Outcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    /// Handle every notification currently queued. Returns how many were
    /// fetched.
    pub fn handle_ready(&mut self) -> Result<usize, MonitorError> {
        let mut count = 0;
        while self.channel.has_pending() {
            self.handle_one()?;
            count += 1;
        }
        Ok(count)
    }

    /// Reply for `request`, or `None` to drop it.
    fn decide(&mut self, request: &Request) -> Option<Reply> {
        if request.arch != AUDIT_ARCH_NATIVE {
            tracing::warn!(
                compartment = %self.compartment.name(),
                pid = request.pid,
                arch = format_args!("{:#x}", request.arch),
                "foreign architecture denied"
            );
            return Some(Reply::Error(libc::EPERM));
        }

        let Some(syscall) = Syscall::from_nr(i64::from(request.nr)) else {
            return Some(Reply::Continue);
        };
        if !self.features.contains(syscall.feature()) {
            return Some(Reply::Continue);
        }

        let process = match self.host.open_process(request.pid) {
            Ok(process) => process,
            Err(e) => return Self::error_reply(e),
        };

        let ctx = Context {
            host: &self.host,
            process: &process,
            compartment: &self.compartment,
            policy: &self.policy,
            request,
        };
        let result = emulate_syscall(syscall, &ctx, &self.graph, &mut self.loaded);

        match result {
            Ok(reply) => {
                tracing::debug!(
                    compartment = %self.compartment.name(),
                    pid = request.pid,
                    syscall = syscall.name(),
                    reply = ?reply,
                    "request answered"
                );
                Some(reply)
            }
            Err(e) => {
                tracing::debug!(
                    compartment = %self.compartment.name(),
                    pid = request.pid,
                    syscall = syscall.name(),
                    error = %e,
                    "emulation failed"
                );
                Self::error_reply(e)
            }
        }
    }

    fn error_reply(error: EmulationError) -> Option<Reply> {
        error.errno().map(Reply::Error)
    }
}

fn emulate_syscall<H: Host>(
    syscall: Syscall,
    ctx: &Context<'_, H>,
    graph: &ModuleGraph,
    loaded: &mut Vec<String>,
) -> EmulationResult {
    match syscall {
        Syscall::Mount => emulate::mount::mount(ctx),
        Syscall::FinitModule => emulate::module::finit_module(ctx, graph, loaded),
        Syscall::Mknodat => emulate::mknod::mknodat(ctx),
        #[cfg(target_arch = "x86_64")]
        Syscall::Mknod => emulate::mknod::mknod(ctx),
        Syscall::Ioctl => emulate::ioctl::ioctl(ctx),
        Syscall::ClockAdjtime => emulate::time::adjtime(ctx),
        Syscall::Adjtimex => emulate::time::adjtimex(ctx),
        Syscall::ClockSettime | Syscall::Settimeofday => emulate::time::settime(ctx),
        Syscall::Sysinfo => emulate::sysinfo::sysinfo(ctx),
    }
}

impl<C: NotifyChannel, H: Host> Drop for CompartmentMonitor<C, H> {
    fn drop(&mut self) {
        tracing::debug!(
            compartment = %self.compartment.name(),
            loaded_modules = self.loaded.len(),
            "monitor closed"
        );
    }
}

/// A monitor as seen by the reactor.
pub trait Dispatch {
    fn compartment_id(&self) -> CompartmentId;

    /// Descriptor to watch for readiness.
    fn as_raw_fd(&self) -> RawFd;

    /// Handle everything queued; returns the number of notifications fetched.
    fn dispatch(&mut self) -> Result<usize, MonitorError>;
}

impl<C: NotifyChannel, H: Host> Dispatch for CompartmentMonitor<C, H> {
    fn compartment_id(&self) -> CompartmentId {
        self.compartment.id()
    }

    fn as_raw_fd(&self) -> RawFd {
        self.channel.as_raw_fd()
    }

    fn dispatch(&mut self) -> Result<usize, MonitorError> {
        self.handle_ready()
    }
}
