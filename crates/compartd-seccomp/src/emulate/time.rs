//! Clock syscalls. Reading the clock is harmless and goes back to the kernel;
//! changing it affects every compartment on the host and is refused.

use super::{Context, EmulationResult, Syscall};
use crate::channel::Reply;
use crate::error::EmulationError;
use crate::host::Host;
use crate::process::RemoteProcess;

/// `ADJ_OFFSET_SS_READ`: query the remaining offset, changes nothing.
const ADJ_OFFSET_SS_READ: u32 = 0xa001;

/// `struct timex` starts with `unsigned int modes`.
fn read_only_modes(modes: u32) -> bool {
    modes == 0 || modes == ADJ_OFFSET_SS_READ
}

fn check_timex<H: Host>(ctx: &Context<'_, H>, addr: u64) -> EmulationResult {
    // Null is the kernel's EFAULT to report.
    if addr == 0 {
        return Ok(Reply::Continue);
    }

    let bytes = ctx.process.fetch(addr, size_of::<u32>())?;
    let modes = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    // The kernel re-reads modes after Continue; its own CAP_SYS_TIME check covers a racing writer
    if read_only_modes(modes) {
        Ok(Reply::Continue)
    } else {
        tracing::info!(
            compartment = %ctx.compartment.name(),
            pid = ctx.process.pid(),
            modes = format_args!("{modes:#x}"),
            "clock adjustment refused"
        );
        Err(EmulationError::PermissionDenied("clock adjustment"))
    }
}

/// `clock_adjtime(clockid, buf)`.
pub fn adjtime<H: Host>(ctx: &Context<'_, H>) -> EmulationResult {
    check_timex(ctx, ctx.arg(1))
}

/// `adjtimex(buf)`.
pub fn adjtimex<H: Host>(ctx: &Context<'_, H>) -> EmulationResult {
    check_timex(ctx, ctx.arg(0))
}

/// `clock_settime(clockid, tp)` and `settimeofday(tv, tz)`.
pub fn settime<H: Host>(ctx: &Context<'_, H>) -> EmulationResult {
    let nr = i64::from(ctx.request.nr);
    // settimeofday(NULL, NULL) sets nothing
    if Syscall::from_nr(nr) == Some(Syscall::Settimeofday) && ctx.arg(0) == 0 && ctx.arg(1) == 0 {
        return Ok(Reply::Continue);
    }

    tracing::info!(
        compartment = %ctx.compartment.name(),
        pid = ctx.process.pid(),
        "clock change refused"
    );
    Err(EmulationError::PermissionDenied("setting the clock"))
}
