//! `mount(source, target, fstype, flags, data)`.
//!
//! Checks, in order:
//!
//! 1. the strings are readable and bounded
//! 2. the caller holds `CAP_SYS_ADMIN` in its own namespace
//! 3. the target stays inside the compartment root
//! 4. the filesystem type and flags are on the allow-list
//!
//! Every policy failure is `EPERM`. A permitted mount is performed in the
//! caller's mount namespace and its errno is returned as-is.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::{Context, EmulationResult, PATH_MAX};
use crate::capability::Capability;
use crate::channel::Reply;
use crate::error::EmulationError;
use crate::host::{Host, MountSpec};
use crate::policy::strip_mount_magic;
use crate::process::{MAX_REMOTE_SIZE, RemoteProcess};
use crate::validate::{host_to_root, resolve_in_root};

const FSTYPE_MAX: usize = 256;

pub fn mount<H: Host>(ctx: &Context<'_, H>) -> EmulationResult {
    let process = ctx.process;
    let source = process.fetch_optional_cstring(ctx.arg(0), PATH_MAX)?;
    let target = process.fetch_cstring(ctx.arg(1), PATH_MAX)?;
    let fstype = process.fetch_optional_cstring(ctx.arg(2), FSTYPE_MAX)?;
    let flags = ctx.arg(3);
    let data = process.fetch_optional_cstring(ctx.arg(4), MAX_REMOTE_SIZE)?;

    if !ctx.host.has_capability(process, Capability::SysAdmin) {
        return Err(EmulationError::PermissionDenied("mount requires CAP_SYS_ADMIN"));
    }

    let target = resolve_target(ctx, Path::new(OsStr::from_bytes(target.as_bytes())))?;

    let Some(fstype) = fstype else {
        return Err(EmulationError::PermissionDenied("mount without filesystem type"));
    };
    let fstype_allowed = fstype
        .to_str()
        .is_ok_and(|name| ctx.policy.fstype_allowed(name));
    if !fstype_allowed {
        return Err(EmulationError::PermissionDenied("filesystem type not allowed"));
    }
    if !ctx.policy.mount_flags_allowed(flags) {
        return Err(EmulationError::PermissionDenied("mount flags not allowed"));
    }

    let spec = MountSpec {
        source,
        target,
        fstype,
        flags: strip_mount_magic(flags),
        data,
    };
    ctx.host.mount(process, ctx.compartment, &spec)?;

    tracing::info!(
        compartment = %ctx.compartment.name(),
        pid = process.pid(),
        target = %spec.target.display(),
        fstype = ?spec.fstype,
        "mount emulated"
    );
    Ok(Reply::Value(0))
}

/// Resolve the mount target inside the compartment; escapes are `EPERM`.
fn resolve_target<H: Host>(ctx: &Context<'_, H>, target: &Path) -> Result<PathBuf, EmulationError> {
    let base = if target.is_absolute() {
        PathBuf::from("/")
    } else {
        let cwd = ctx.host.cwd(ctx.process)?;
        host_to_root(ctx.compartment.root(), &cwd)
            .map_err(|_| EmulationError::PermissionDenied("caller is outside its root"))?
    };

    resolve_in_root(&base, target).map_err(|e| {
        tracing::warn!(
            compartment = %ctx.compartment.name(),
            pid = ctx.process.pid(),
            target = %target.display(),
            error = %e,
            "rejected mount target"
        );
        EmulationError::PermissionDenied("mount target escapes compartment root")
    })
}
