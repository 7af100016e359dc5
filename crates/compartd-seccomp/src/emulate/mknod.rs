//! `mknodat(dirfd, path, mode, dev)` and `mknod(path, mode, dev)`.
//!
//! FIFOs, regular files and sockets need no privilege and are handed back to
//! the kernel. Character devices are created only for allow-listed
//! major:minor pairs and only for callers holding `CAP_MKNOD`. Block devices
//! and unknown node types are refused.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::{Context, EmulationResult, PATH_MAX};
use crate::capability::Capability;
use crate::channel::Reply;
use crate::error::EmulationError;
use crate::host::{Host, MknodSpec};
use crate::process::RemoteProcess;
use crate::validate::{host_to_root, resolve_in_root};

/// Major number of a kernel (`new_encode_dev`) device number.
pub fn dev_major(dev: u32) -> u32 {
    (dev & 0xfff00) >> 8
}

/// Minor number of a kernel (`new_encode_dev`) device number.
pub fn dev_minor(dev: u32) -> u32 {
    (dev & 0xff) | ((dev >> 12) & 0xfff00)
}

pub fn mknodat<H: Host>(ctx: &Context<'_, H>) -> EmulationResult {
    create(ctx, ctx.int_arg(0), ctx.arg(1), ctx.arg(2) as u32, ctx.arg(3) as u32)
}

#[cfg(target_arch = "x86_64")]
pub fn mknod<H: Host>(ctx: &Context<'_, H>) -> EmulationResult {
    create(ctx, libc::AT_FDCWD, ctx.arg(0), ctx.arg(1) as u32, ctx.arg(2) as u32)
}

fn create<H: Host>(
    ctx: &Context<'_, H>,
    dirfd: i32,
    path_addr: u64,
    mode: u32,
    dev: u32,
) -> EmulationResult {
    match mode & libc::S_IFMT {
        libc::S_IFCHR => {}
        0 | libc::S_IFREG | libc::S_IFIFO | libc::S_IFSOCK => return Ok(Reply::Continue),
        _ => return Err(EmulationError::PermissionDenied("only character devices are emulated")),
    }

    let (major, minor) = (dev_major(dev), dev_minor(dev));
    if !ctx.policy.device_allowed(major, minor) {
        tracing::debug!(
            compartment = %ctx.compartment.name(),
            pid = ctx.process.pid(),
            major,
            minor,
            "device not on allow-list"
        );
        return Err(EmulationError::PermissionDenied("device not allowed"));
    }
    if !ctx.host.has_capability(ctx.process, Capability::Mknod) {
        return Err(EmulationError::PermissionDenied("mknod requires CAP_MKNOD"));
    }

    let raw = ctx.process.fetch_cstring(path_addr, PATH_MAX)?;
    let path = resolve_path(ctx, dirfd, Path::new(OsStr::from_bytes(raw.as_bytes())))?;

    let spec = MknodSpec {
        path,
        mode,
        dev: u64::from(dev),
    };
    ctx.host.mknod(ctx.process, ctx.compartment, &spec)?;

    tracing::info!(
        compartment = %ctx.compartment.name(),
        pid = ctx.process.pid(),
        path = %spec.path.display(),
        major,
        minor,
        "device node created"
    );
    Ok(Reply::Value(0))
}

fn resolve_path<H: Host>(
    ctx: &Context<'_, H>,
    dirfd: i32,
    path: &Path,
) -> Result<PathBuf, EmulationError> {
    let base = if path.is_absolute() {
        PathBuf::from("/")
    } else {
        let host_base = if dirfd == libc::AT_FDCWD {
            ctx.host.cwd(ctx.process)?
        } else {
            ctx.host.fd_path(ctx.process, dirfd)?
        };
        host_to_root(ctx.compartment.root(), &host_base)
            .map_err(|_| EmulationError::PermissionDenied("directory is outside the root"))?
    };

    resolve_in_root(&base, path)
        .map_err(|_| EmulationError::PermissionDenied("path escapes compartment root"))
}
