//! `ioctl(fd, request, argp)` for allow-listed read-only requests.
//!
//! With the ioctl feature on, the notify filter routes every `ioctl` here,
//! so request codes missing from the allow-list are refused with `EPERM`.
//! Allowed requests are reissued on a duplicate of the caller's descriptor
//! and the result bytes are copied back to `argp`.

use rustix::io::Errno;

use super::{Context, EmulationResult};
use crate::channel::Reply;
use crate::error::EmulationError;
use crate::host::Host;
use crate::process::RemoteProcess;

pub fn ioctl<H: Host>(ctx: &Context<'_, H>) -> EmulationResult {
    let fd = ctx.int_arg(0);
    // The kernel takes `unsigned int cmd`; upper bits are ignored.
    let request = ctx.arg(1) as u32;
    let argp = ctx.arg(2);

    let Some(rule) = ctx.policy.ioctl_rule(request) else {
        tracing::debug!(
            compartment = %ctx.compartment.name(),
            pid = ctx.process.pid(),
            request = format_args!("{request:#x}"),
            "ioctl not on allow-list"
        );
        return Err(EmulationError::PermissionDenied("ioctl request not allowed"));
    };
    if argp == 0 {
        return Err(EmulationError::Os(Errno::FAULT));
    }

    let (ret, bytes) = ctx.host.ioctl(ctx.process, fd, request, rule.size)?;
    ctx.process.send(argp, &bytes)?;

    tracing::trace!(
        compartment = %ctx.compartment.name(),
        pid = ctx.process.pid(),
        fd,
        request = format_args!("{request:#x}"),
        "ioctl emulated"
    );
    Ok(Reply::Value(ret))
}
