//! Kernel support probe for the monitor.
//!
//! Run once at startup; the answer is cached in a `OnceLock`.
//!
//! | Requirement | Minimum | Probe |
//! |-------------|---------|-------|
//! | Kernel | 5.10 | `uname` release |
//! | Seccomp | enabled | `prctl(PR_GET_SECCOMP)` |
//! | User notification | sizes reported | `seccomp(SECCOMP_GET_NOTIF_SIZES)` |
//! | Process handles | `pidfd_open` works | open a pidfd on ourselves |
//!
//! ```ignore
//! let info = compartd_sys::check().map_err(|e| eprintln!("unsupported: {e}"))?;
//! println!("notif record: {} bytes", info.notif_sizes.seccomp_notif);
//! ```

use std::sync::OnceLock;

use rustix::process::{PidfdFlags, getpid, pidfd_open};
use rustix::system::uname;
use thiserror::Error;

use crate::seccomp;
use crate::seccomp_notify::{LayoutError, NotifLayout, NotifSizes};

/// What the running kernel offers.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub kernel_version: (u32, u32, u32),
    pub seccomp_enabled: bool,
    pub notif_sizes: NotifSizes,
}

#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("kernel {}.{}.{} is older than {}.{}.{}", .found.0, .found.1, .found.2, .required.0, .required.1, .required.2)]
    KernelTooOld {
        required: (u32, u32, u32),
        found: (u32, u32, u32),
    },

    #[error("unparseable kernel release {0:?}")]
    BadRelease(String),

    #[error("seccomp is not available")]
    SeccompNotAvailable,

    #[error("seccomp user notification unsupported: {0}")]
    NotifUnsupported(#[from] LayoutError),

    #[error("pidfd_open failed: {0}")]
    PidfdUnavailable(rustix::io::Errno),
}

// pidfd_getfd and openat2 (5.6), setns on a pidfd (5.8)
const MIN_KERNEL: (u32, u32, u32) = (5, 10, 0);

static PROBE: OnceLock<Result<SystemInfo, CheckError>> = OnceLock::new();

/// Probe the kernel, or return the cached answer.
pub fn check() -> Result<&'static SystemInfo, &'static CheckError> {
    PROBE.get_or_init(probe).as_ref()
}

fn probe() -> Result<SystemInfo, CheckError> {
    let release = uname().release().to_string_lossy().into_owned();
    let kernel_version = parse_release(&release)?;
    if kernel_version < MIN_KERNEL {
        return Err(CheckError::KernelTooOld {
            required: MIN_KERNEL,
            found: kernel_version,
        });
    }

    if !seccomp::seccomp_available() {
        return Err(CheckError::SeccompNotAvailable);
    }
    let notif_sizes = NotifLayout::query()?.sizes();

    pidfd_open(getpid(), PidfdFlags::empty()).map_err(CheckError::PidfdUnavailable)?;

    Ok(SystemInfo {
        kernel_version,
        seccomp_enabled: true,
        notif_sizes,
    })
}

/// `major.minor[.patch][-suffix]`; a missing patch level reads as 0.
fn parse_release(release: &str) -> Result<(u32, u32, u32), CheckError> {
    let bad = || CheckError::BadRelease(release.to_string());
    let numeric = release.split(['-', '+']).next().unwrap_or_default();
    let mut fields = numeric.split('.').map(str::parse::<u32>);

    let major = fields.next().and_then(Result::ok).ok_or_else(bad)?;
    let minor = fields.next().and_then(Result::ok).ok_or_else(bad)?;
    let patch = fields.next().and_then(Result::ok).unwrap_or(0);
    Ok((major, minor, patch))
}
