//! Error types shared by the emulators and the dispatcher.
//!
//! | Error | Outcome |
//! |-------|---------|
//! | `InvalidArgument` | `EINVAL` |
//! | `PermissionDenied` | `EPERM` |
//! | `TargetGone` | request dropped, nothing sent |
//! | `NotFound` | `ENOENT` |
//! | `DependencyCycle` | `ELOOP` |
//! | `Os(errno)` | that errno |

use std::io;

use compartd_sys::seccomp_notify::LayoutError;
use rustix::io::Errno;
use thiserror::Error;

use crate::modules::GraphError;

/// Failure of a single emulation. Never fatal to the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmulationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("target process is gone")]
    TargetGone,

    #[error("module not found: {0}")]
    NotFound(String),

    #[error("module dependency cycle at {0}")]
    DependencyCycle(String),

    #[error("{0}")]
    Os(Errno),
}

impl EmulationError {
    /// Positive errno to report, or `None` when the request must be dropped.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::InvalidArgument(_) => Some(libc::EINVAL),
            Self::PermissionDenied(_) => Some(libc::EPERM),
            Self::TargetGone => None,
            Self::NotFound(_) => Some(libc::ENOENT),
            Self::DependencyCycle(_) => Some(libc::ELOOP),
            Self::Os(e) => Some(e.raw_os_error()),
        }
    }
}

impl From<Errno> for EmulationError {
    fn from(e: Errno) -> Self {
        // ESRCH from a pid-addressed call means the target exited underneath us
        if e == Errno::SRCH {
            Self::TargetGone
        } else {
            Self::Os(e)
        }
    }
}

impl From<GraphError> for EmulationError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::NotFound(name) => Self::NotFound(name),
            GraphError::DependencyCycle(name) => Self::DependencyCycle(name),
            GraphError::Io(e) => Self::Os(Errno::from_io_error(&e).unwrap_or(Errno::IO)),
        }
    }
}

/// Failure of a monitor as a whole.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The notification channel was torn down; the monitor is finished.
    #[error("notification channel closed: {0}")]
    ChannelClosed(Errno),

    #[error("notification layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
