//! The OS-facing collaborator the emulators act through.
//!
//! [`Host`] gathers every privileged side effect and every query about a
//! process that is not plain memory access. [`LinuxHost`] is the real
//! implementation; tests substitute a recording double.
//!
//! ## Namespace Attribution
//!
//! Mounts and device nodes are created by a helper that has joined the
//! caller's namespaces through its pidfd: the mount namespace for device
//! nodes, and also the pid, network, IPC and cgroup namespaces for mounts,
//! so `proc`, `sysfs`, `mqueue` and `cgroup2` show the compartment's
//! instance rather than the host's. The caller's root is opened
//! (`/proc/<pid>/root`) before the helper starts, and the target is resolved
//! from it with `RESOLVE_IN_ROOT`, so neither `..` nor a symlink planted by
//! the compartment can redirect the operation outside its root.

use std::ffi::{CStr, CString};
use std::fs::{self, File};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use compartd_sys::fs::{OpenHow, RESOLVE_IN_ROOT, RESOLVE_NO_MAGICLINKS, openat2};
use compartd_sys::last_errno;
use compartd_sys::pidfd::pidfd_getfd;
use rustix::io::Errno;

use crate::capability::{self, Capability};
use crate::cgroup::CgroupUsage;
use crate::compartment::Compartment;
use crate::emulate::sysinfo::SysInfo;
use crate::error::EmulationError;
use crate::ns::{FILESYSTEM_NS, MOUNT_NS, run_in_namespaces};
use crate::process::{ProcessHandle, RemoteProcess};
use crate::validate::relative_to_root;

/// A validated mount, target already resolved inside the compartment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: Option<CString>,
    /// Absolute path inside the compartment root.
    pub target: PathBuf,
    pub fstype: CString,
    pub flags: u64,
    pub data: Option<CString>,
}

/// A validated device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MknodSpec {
    /// Absolute path inside the compartment root.
    pub path: PathBuf,
    pub mode: u32,
    pub dev: u64,
}

pub trait Host {
    type Process: RemoteProcess;

    /// Pin the process behind `pid`. Called once per request.
    fn open_process(&self, pid: u32) -> Result<Self::Process, EmulationError>;

    /// Effective capability check. Fails closed.
    fn has_capability(&self, process: &Self::Process, cap: Capability) -> bool;

    /// Caller's working directory, host view.
    fn cwd(&self, process: &Self::Process) -> Result<PathBuf, EmulationError>;

    /// Path behind one of the caller's descriptors, host view.
    fn fd_path(&self, process: &Self::Process, fd: i32) -> Result<PathBuf, EmulationError>;

    fn mount(
        &self,
        process: &Self::Process,
        compartment: &Compartment,
        spec: &MountSpec,
    ) -> Result<(), EmulationError>;

    fn mknod(
        &self,
        process: &Self::Process,
        compartment: &Compartment,
        spec: &MknodSpec,
    ) -> Result<(), EmulationError>;

    /// Load a trusted module object from the host's module tree.
    fn load_module_file(&self, path: &Path, params: &CStr) -> Result<(), EmulationError>;

    /// Issue `request` on the caller's `fd`, returning the kernel's return
    /// value and the `size` result bytes.
    fn ioctl(
        &self,
        process: &Self::Process,
        fd: i32,
        request: u32,
        size: usize,
    ) -> Result<(i64, Vec<u8>), EmulationError>;

    fn sysinfo(&self) -> Result<SysInfo, EmulationError>;

    fn usage(&self, compartment: &Compartment) -> CgroupUsage;
}

/// The real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxHost;

impl LinuxHost {
    pub fn new() -> Self {
        Self
    }

    /// Open `/proc/<pid>/<entry>` as an `O_PATH` directory handle and make
    /// sure the pid still belongs to the pinned process afterwards.
    fn open_proc_dir(process: &ProcessHandle, entry: &str) -> Result<OwnedFd, EmulationError> {
        let path = CString::new(format!("/proc/{}/{entry}", process.pid()))
            .map_err(|_| EmulationError::InvalidArgument("proc path"))?;
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(match last_errno() {
                Errno::NOENT | Errno::SRCH => EmulationError::TargetGone,
                e => EmulationError::Os(e),
            });
        }
        // SAFETY: open returned a new descriptor owned by us.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        process.ensure_alive()?;
        Ok(fd)
    }

    fn read_proc_link(process: &ProcessHandle, entry: &str) -> Result<PathBuf, EmulationError> {
        let link = fs::read_link(format!("/proc/{}/{entry}", process.pid())).map_err(|e| {
            match e.raw_os_error() {
                Some(libc::ENOENT) => EmulationError::Os(Errno::BADF),
                Some(libc::ESRCH) => EmulationError::TargetGone,
                Some(code) => EmulationError::Os(Errno::from_raw_os_error(code)),
                None => EmulationError::Os(Errno::IO),
            }
        })?;
        process.ensure_alive()?;
        Ok(link)
    }

    fn dup_fd(process: &ProcessHandle, fd: i32) -> Result<OwnedFd, EmulationError> {
        pidfd_getfd(process.pidfd(), fd).map_err(|e| match e {
            Errno::SRCH => EmulationError::TargetGone,
            e => EmulationError::Os(e),
        })
    }
}

fn finit_module(fd: BorrowedFd<'_>, params: &CStr) -> Result<(), Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_finit_module,
            fd.as_raw_fd(),
            params.as_ptr(),
            0u32,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

fn path_cstring(path: &Path) -> Result<CString, EmulationError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| EmulationError::InvalidArgument("NUL in path"))
}

fn open_in_root(root: BorrowedFd<'_>, path: &CStr, flags: i32) -> Result<OwnedFd, Errno> {
    let how = OpenHow {
        flags: (flags | libc::O_CLOEXEC) as u64,
        mode: 0,
        resolve: RESOLVE_IN_ROOT | RESOLVE_NO_MAGICLINKS,
    };
    openat2(root, path, &how)
}

impl Host for LinuxHost {
    type Process = ProcessHandle;

    fn open_process(&self, pid: u32) -> Result<ProcessHandle, EmulationError> {
        ProcessHandle::open(pid)
    }

    fn has_capability(&self, process: &ProcessHandle, cap: Capability) -> bool {
        let held = capability::has_capability(process.pid(), cap);
        // The answer only counts if the pid still names the pinned process
        held && process.is_alive()
    }

    fn cwd(&self, process: &ProcessHandle) -> Result<PathBuf, EmulationError> {
        Self::read_proc_link(process, "cwd")
    }

    fn fd_path(&self, process: &ProcessHandle, fd: i32) -> Result<PathBuf, EmulationError> {
        if fd < 0 {
            return Err(EmulationError::Os(Errno::BADF));
        }
        Self::read_proc_link(process, &format!("fd/{fd}"))
    }

    fn mount(
        &self,
        process: &ProcessHandle,
        compartment: &Compartment,
        spec: &MountSpec,
    ) -> Result<(), EmulationError> {
        let root = Self::open_proc_dir(process, "root")?;
        let target = path_cstring(relative_to_root(&spec.target))?;
        let source_ptr = spec.source.as_ref().map_or(std::ptr::null(), |s| s.as_ptr());
        let data_ptr = spec
            .data
            .as_ref()
            .map_or(std::ptr::null(), |d| d.as_ptr().cast::<libc::c_void>());

        tracing::debug!(
            compartment = %compartment.name(),
            pid = process.pid(),
            target = %spec.target.display(),
            fstype = ?spec.fstype,
            flags = spec.flags,
            "mounting in compartment namespaces"
        );

        run_in_namespaces(process.pidfd(), FILESYSTEM_NS, || {
            let target_fd = open_in_root(root.as_fd(), &target, libc::O_PATH)?;
            if unsafe { libc::fchdir(target_fd.as_raw_fd()) } < 0 {
                return Err(last_errno());
            }
            let ret = unsafe {
                libc::mount(
                    source_ptr,
                    c".".as_ptr(),
                    spec.fstype.as_ptr(),
                    spec.flags as libc::c_ulong,
                    data_ptr,
                )
            };
            if ret < 0 { Err(last_errno()) } else { Ok(()) }
        })
        .map_err(EmulationError::Os)
    }

    fn mknod(
        &self,
        process: &ProcessHandle,
        compartment: &Compartment,
        spec: &MknodSpec,
    ) -> Result<(), EmulationError> {
        let root = Self::open_proc_dir(process, "root")?;
        let parent = spec.path.parent().unwrap_or(Path::new("/"));
        let name = spec
            .path
            .file_name()
            .ok_or(EmulationError::InvalidArgument("mknod path has no file name"))?;
        let parent = path_cstring(relative_to_root(parent))?;
        let name = CString::new(name.as_bytes())
            .map_err(|_| EmulationError::InvalidArgument("NUL in path"))?;

        tracing::debug!(
            compartment = %compartment.name(),
            pid = process.pid(),
            path = %spec.path.display(),
            dev = spec.dev,
            "creating device node in compartment namespace"
        );

        run_in_namespaces(process.pidfd(), MOUNT_NS, || {
            let dir = open_in_root(root.as_fd(), &parent, libc::O_PATH | libc::O_DIRECTORY)?;
            let ret = unsafe {
                libc::mknodat(
                    dir.as_raw_fd(),
                    name.as_ptr(),
                    spec.mode as libc::mode_t,
                    spec.dev as libc::dev_t,
                )
            };
            if ret < 0 { Err(last_errno()) } else { Ok(()) }
        })
        .map_err(EmulationError::Os)
    }

    fn load_module_file(&self, path: &Path, params: &CStr) -> Result<(), EmulationError> {
        let file = File::open(path).map_err(|e| {
            EmulationError::Os(Errno::from_io_error(&e).unwrap_or(Errno::NOENT))
        })?;
        tracing::debug!(path = %path.display(), ?params, "loading module");
        finit_module(file.as_fd(), params).map_err(EmulationError::Os)
    }

    fn ioctl(
        &self,
        process: &ProcessHandle,
        fd: i32,
        request: u32,
        size: usize,
    ) -> Result<(i64, Vec<u8>), EmulationError> {
        let local = Self::dup_fd(process, fd)?;
        let mut buf = vec![0u8; size];
        let ret = unsafe { libc::ioctl(local.as_raw_fd(), request as _, buf.as_mut_ptr()) };
        if ret < 0 {
            return Err(EmulationError::Os(last_errno()));
        }
        Ok((i64::from(ret), buf))
    }

    fn sysinfo(&self) -> Result<SysInfo, EmulationError> {
        SysInfo::host().map_err(EmulationError::Os)
    }

    fn usage(&self, compartment: &Compartment) -> CgroupUsage {
        compartment
            .cgroup_path()
            .map(CgroupUsage::read)
            .unwrap_or_default()
    }
}
