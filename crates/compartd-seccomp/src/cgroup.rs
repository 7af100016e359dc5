//! Live cgroup v2 counters for a compartment.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("failed to read {file}: {source}")]
    Read {
        file: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {file}: {value:?}")]
    Parse { file: &'static str, value: String },
}

/// Current resource usage; `None` for counters the cgroup does not expose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupUsage {
    pub memory: Option<u64>,
    pub swap: Option<u64>,
    pub pids: Option<u64>,
}

impl CgroupUsage {
    /// Read `memory.current`, `memory.swap.current` and `pids.current`.
    ///
    /// Missing or unreadable counters are left as `None`.
    pub fn read(dir: &Path) -> Self {
        let read = |file| match read_counter(dir, file) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::trace!(cgroup = %dir.display(), error = %e, "cgroup counter unavailable");
                None
            }
        };
        Self {
            memory: read("memory.current"),
            swap: read("memory.swap.current"),
            pids: read("pids.current"),
        }
    }
}

/// Read a single-value cgroup file.
pub fn read_counter(dir: &Path, file: &'static str) -> Result<u64, CgroupError> {
    let content =
        fs::read_to_string(dir.join(file)).map_err(|source| CgroupError::Read { file, source })?;

    content.trim().parse().map_err(|_| CgroupError::Parse {
        file,
        value: content.trim().to_string(),
    })
}
