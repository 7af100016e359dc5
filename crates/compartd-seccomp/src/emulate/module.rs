//! `finit_module(fd, params, flags)`.
//!
//! The module is named by the object the caller passed (basename of
//! `/proc/<pid>/fd/<fd>`). The caller's object itself is never handed to the
//! kernel: the name only selects a module from the host's own tree.
//! Prerequisites from the dependency graph are loaded first with empty
//! parameters, then the requested module with the caller's parameters.
//!
//! Every module loaded on behalf of the compartment is recorded in the
//! monitor's cache; a cached module short-circuits to success. A failure
//! stops the sequence and is reported as-is. Modules already loaded stay
//! loaded and stay recorded, since unloading is not generally possible.

use std::path::Path;

use rustix::io::Errno;

use super::{Context, EmulationResult};
use crate::capability::Capability;
use crate::channel::Reply;
use crate::error::EmulationError;
use crate::host::Host;
use crate::modules::{ModuleGraph, module_name_from_path};
use crate::process::{MAX_REMOTE_SIZE, RemoteProcess};

pub fn finit_module<H: Host>(
    ctx: &Context<'_, H>,
    graph: &ModuleGraph,
    loaded: &mut Vec<String>,
) -> EmulationResult {
    let process = ctx.process;
    let fd = ctx.int_arg(0);
    let flags = ctx.arg(2);

    if flags != 0 {
        return Err(EmulationError::InvalidArgument("finit_module flags are not supported"));
    }
    if !ctx.host.has_capability(process, Capability::SysModule) {
        return Err(EmulationError::PermissionDenied("finit_module requires CAP_SYS_MODULE"));
    }

    let params = process
        .fetch_optional_cstring(ctx.arg(1), MAX_REMOTE_SIZE)?
        .unwrap_or_default();
    let object = ctx.host.fd_path(process, fd)?;
    let name = module_name_from_path(&object)
        .ok_or(EmulationError::InvalidArgument("fd is not a module object"))?;

    if !ctx.policy.module_allowed(&name) {
        return Err(EmulationError::PermissionDenied("module not allowed"));
    }

    if loaded.contains(&name) {
        tracing::debug!(compartment = %ctx.compartment.name(), module = %name, "module already loaded");
        return Ok(Reply::Value(0));
    }

    let order = graph.dependencies_of(&name)?;
    for dep in order.iter().filter(|m| **m != name) {
        if loaded.contains(dep) {
            continue;
        }
        loaded_ok(ctx.host.load_module_file(host_object(graph, dep)?, c""))?;
        tracing::info!(compartment = %ctx.compartment.name(), module = %dep, "loaded prerequisite module");
        loaded.push(dep.clone());
    }

    loaded_ok(ctx.host.load_module_file(host_object(graph, &name)?, &params))?;
    tracing::info!(compartment = %ctx.compartment.name(), module = %name, "loaded module");
    loaded.push(name);

    Ok(Reply::Value(0))
}

fn host_object<'g>(graph: &'g ModuleGraph, name: &str) -> Result<&'g Path, EmulationError> {
    graph
        .path_of(name)
        .ok_or_else(|| EmulationError::NotFound(name.to_string()))
}

/// A module that is already resident counts as loaded.
fn loaded_ok(result: Result<(), EmulationError>) -> Result<(), EmulationError> {
    match result {
        Err(EmulationError::Os(Errno::EXIST)) => Ok(()),
        other => other,
    }
}
