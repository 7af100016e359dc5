//! Path validation against a compartment root.
//!
//! Paths supplied by a compartment are resolved lexically inside the
//! compartment's view before anything touches the filesystem:
//!
//! - **Absolute paths** start at the compartment root
//! - **Relative paths** start at the caller's working directory (or dirfd)
//! - **`..` above the root** is an escape and is rejected
//!
//! Symlinks are not followed here. The namespace helper opens the resolved
//! path with `RESOLVE_IN_ROOT`, which clamps any symlink to the root.
//!
//! ## Example
//!
//! ```ignore
//! use compartd_seccomp::validate::resolve_in_root;
//!
//! assert_eq!(resolve_in_root("/work".as_ref(), "tmp".as_ref()), Ok("/work/tmp".into()));
//! assert!(resolve_in_root("/".as_ref(), "../../etc".as_ref()).is_err());
//! ```

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path escapes compartment root")]
    Escape,

    #[error("path is empty")]
    Empty,

    #[error("path is outside the compartment view")]
    OutsideView,
}

/// Resolve `path` against `base` (both inside the compartment).
///
/// Returns an absolute, normalized path relative to the compartment root.
pub fn resolve_in_root(base: &Path, path: &Path) -> Result<PathBuf, PathError> {
    if path.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    let start = if path.is_absolute() {
        Path::new("/")
    } else {
        base
    };

    for component in start.components().chain(path.components()) {
        match component {
            Component::RootDir => parts.clear(),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathError::Escape);
                }
            }
            Component::Normal(name) => parts.push(name),
            Component::Prefix(_) => return Err(PathError::Escape),
        }
    }

    let mut resolved = PathBuf::from("/");
    resolved.extend(parts);
    Ok(resolved)
}

/// Translate a host-view path (e.g. from `/proc/<pid>/cwd`) into the
/// compartment's view under `root`.
pub fn host_to_root(root: &Path, host_path: &Path) -> Result<PathBuf, PathError> {
    let rest = host_path
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideView)?;
    Ok(Path::new("/").join(rest))
}

/// Relative form of an in-root path, suitable for `openat2` on the root fd.
pub fn relative_to_root(path: &Path) -> &Path {
    match path.strip_prefix("/") {
        Ok(rest) if !rest.as_os_str().is_empty() => rest,
        _ => Path::new("."),
    }
}
