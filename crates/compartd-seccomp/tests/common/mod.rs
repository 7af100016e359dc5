//! Test doubles shared by the emulation tests.
//!
//! - [`RecordingChannel`] queues encoded notification records and records
//!   every response written to it.
//! - [`FakeHost`] / [`FakeProcess`] stand in for the OS: paged fake memory,
//!   a liveness switch, capability sets, and a log of privileged effects.
//!
//! Both are cheap handles over shared state so a test can keep a clone and
//! inspect it after handing the original to a monitor.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use compartd_seccomp::cgroup::CgroupUsage;
use compartd_seccomp::emulate::sysinfo::SysInfo;
use compartd_seccomp::host::{MknodSpec, MountSpec};
use compartd_seccomp::process::MAX_REMOTE_SIZE;
use compartd_seccomp::{
    Capability, Compartment, CompartmentId, CompartmentMonitor, EmulationError, Features, Host,
    MonitorError, NotifyChannel, RemoteProcess, Request, Response,
};
use compartd_sys::seccomp::AUDIT_ARCH_NATIVE;
use compartd_sys::seccomp_notify::{
    MIN_DATA_SIZE, MIN_NOTIF_RESP_SIZE, MIN_NOTIF_SIZE, NotifLayout, NotifSizes, SeccompData,
    SeccompNotif,
};
use rustix::io::Errno;

pub const PID: u32 = 4242;
pub const ROOT: &str = "/srv/compartments/web";

/// Base of the scratch area tests write arguments into.
pub const SCRATCH: u64 = 0x7000_0000;
const PAGE: u64 = 4096;

pub fn layout() -> NotifLayout {
    NotifLayout::from_sizes(NotifSizes {
        seccomp_notif: MIN_NOTIF_SIZE,
        seccomp_notif_resp: MIN_NOTIF_RESP_SIZE,
        seccomp_data: MIN_DATA_SIZE,
    })
    .unwrap()
}

pub fn compartment() -> Arc<Compartment> {
    Arc::new(Compartment::new(CompartmentId(1), "web", ROOT))
}

/// A native-arch request from [`PID`].
pub fn request(cookie: u64, nr: i64, args: [u64; 6]) -> Request {
    Request {
        cookie,
        pid: PID,
        nr: nr as i32,
        arch: AUDIT_ARCH_NATIVE,
        args,
    }
}

// ============================================================================
// Fake memory
// ============================================================================

/// Sparse memory of 4 KiB pages; unmapped pages fault.
#[derive(Clone, Default)]
pub struct FakeMemory {
    pages: Rc<RefCell<HashMap<u64, Box<[u8; 4096]>>>>,
}

impl FakeMemory {
    /// Map zeroed pages covering `[addr, addr + len)`.
    pub fn map(&self, addr: u64, len: usize) {
        let mut pages = self.pages.borrow_mut();
        let first = addr / PAGE;
        let last = (addr + len.max(1) as u64 - 1) / PAGE;
        for page in first..=last {
            pages.entry(page).or_insert_with(|| Box::new([0u8; 4096]));
        }
    }

    /// Map and fill.
    pub fn write(&self, addr: u64, bytes: &[u8]) {
        self.map(addr, bytes.len());
        self.store(addr, bytes);
    }

    /// Write `s` plus its terminator.
    pub fn write_cstr(&self, addr: u64, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.write(addr, &bytes);
    }

    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let pages = self.pages.borrow();
        let mut out = Vec::with_capacity(len);
        for i in 0..len as u64 {
            let at = addr + i;
            let page = pages.get(&(at / PAGE))?;
            out.push(page[(at % PAGE) as usize]);
        }
        Some(out)
    }

    /// Write into already mapped pages only.
    fn store(&self, addr: u64, bytes: &[u8]) -> bool {
        let mut pages = self.pages.borrow_mut();
        for i in 0..bytes.len() as u64 {
            if !pages.contains_key(&((addr + i) / PAGE)) {
                return false;
            }
        }
        for (i, b) in bytes.iter().enumerate() {
            let at = addr + i as u64;
            if let Some(page) = pages.get_mut(&(at / PAGE)) {
                page[(at % PAGE) as usize] = *b;
            }
        }
        true
    }
}

// ============================================================================
// Fake process and host
// ============================================================================

pub struct FakeProcess {
    pid: u32,
    memory: FakeMemory,
    alive: Rc<Cell<bool>>,
}

impl RemoteProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn fetch(&self, addr: u64, size: usize) -> Result<Vec<u8>, EmulationError> {
        if !self.alive.get() {
            return Err(EmulationError::TargetGone);
        }
        if addr == 0 || size > MAX_REMOTE_SIZE {
            return Err(EmulationError::InvalidArgument("range"));
        }
        self.memory
            .read(addr, size)
            .ok_or(EmulationError::Os(Errno::FAULT))
    }

    fn send(&self, addr: u64, bytes: &[u8]) -> Result<(), EmulationError> {
        if !self.alive.get() {
            return Err(EmulationError::TargetGone);
        }
        if addr == 0 || bytes.len() > MAX_REMOTE_SIZE {
            return Err(EmulationError::InvalidArgument("range"));
        }
        if self.memory.store(addr, bytes) {
            Ok(())
        } else {
            Err(EmulationError::Os(Errno::FAULT))
        }
    }
}

#[derive(Default)]
pub struct HostState {
    pub memory: FakeMemory,
    pub alive: Rc<Cell<bool>>,
    pub caps: RefCell<HashSet<Capability>>,
    pub cwd: RefCell<PathBuf>,
    pub fds: RefCell<HashMap<i32, PathBuf>>,
    pub mounts: RefCell<Vec<MountSpec>>,
    pub mknods: RefCell<Vec<MknodSpec>>,
    /// Module objects handed to the kernel, as paths.
    pub loads: RefCell<Vec<PathBuf>>,
    /// Parameters passed with each entry of `loads`.
    pub load_params: RefCell<Vec<String>>,
    /// Errno returned when loading the object with this file name.
    pub load_errors: RefCell<HashMap<String, Errno>>,
    pub ioctls: RefCell<HashMap<u32, (i64, Vec<u8>)>>,
    pub sysinfo: Cell<SysInfo>,
    pub usage: Cell<CgroupUsage>,
    /// Runs at every privileged effect, e.g. to kill the target mid-request.
    pub on_effect: RefCell<Option<Box<dyn Fn()>>>,
}

#[derive(Clone)]
pub struct FakeHost(pub Rc<HostState>);

impl FakeHost {
    pub fn new() -> Self {
        let state = HostState::default();
        state.alive.set(true);
        *state.cwd.borrow_mut() = PathBuf::from(ROOT);
        Self(Rc::new(state))
    }

    pub fn grant(self, cap: Capability) -> Self {
        self.0.caps.borrow_mut().insert(cap);
        self
    }

    pub fn cwd(self, path: impl Into<PathBuf>) -> Self {
        *self.0.cwd.borrow_mut() = path.into();
        self
    }

    pub fn fd(self, fd: i32, path: impl Into<PathBuf>) -> Self {
        self.0.fds.borrow_mut().insert(fd, path.into());
        self
    }

    pub fn memory(&self) -> &FakeMemory {
        &self.0.memory
    }

    pub fn kill(&self) {
        self.0.alive.set(false);
    }

    pub fn mounts(&self) -> Vec<MountSpec> {
        self.0.mounts.borrow().clone()
    }

    pub fn mknods(&self) -> Vec<MknodSpec> {
        self.0.mknods.borrow().clone()
    }

    pub fn loads(&self) -> Vec<PathBuf> {
        self.0.loads.borrow().clone()
    }

    pub fn load_params(&self) -> Vec<String> {
        self.0.load_params.borrow().clone()
    }

    fn effect(&self) {
        if let Some(hook) = self.0.on_effect.borrow().as_ref() {
            hook();
        }
    }

    fn load(&self, path: PathBuf, params: &CStr) -> Result<(), EmulationError> {
        self.effect();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(errno) = self.0.load_errors.borrow().get(&name) {
            return Err(EmulationError::Os(*errno));
        }
        self.0.loads.borrow_mut().push(path);
        self.0
            .load_params
            .borrow_mut()
            .push(params.to_string_lossy().into_owned());
        Ok(())
    }
}

impl Host for FakeHost {
    type Process = FakeProcess;

    fn open_process(&self, pid: u32) -> Result<FakeProcess, EmulationError> {
        if !self.0.alive.get() {
            return Err(EmulationError::TargetGone);
        }
        Ok(FakeProcess {
            pid,
            memory: self.0.memory.clone(),
            alive: Rc::clone(&self.0.alive),
        })
    }

    fn has_capability(&self, _process: &FakeProcess, cap: Capability) -> bool {
        self.0.caps.borrow().contains(&cap)
    }

    fn cwd(&self, _process: &FakeProcess) -> Result<PathBuf, EmulationError> {
        Ok(self.0.cwd.borrow().clone())
    }

    fn fd_path(&self, _process: &FakeProcess, fd: i32) -> Result<PathBuf, EmulationError> {
        self.0
            .fds
            .borrow()
            .get(&fd)
            .cloned()
            .ok_or(EmulationError::Os(Errno::BADF))
    }

    fn mount(
        &self,
        _process: &FakeProcess,
        _compartment: &Compartment,
        spec: &MountSpec,
    ) -> Result<(), EmulationError> {
        self.effect();
        self.0.mounts.borrow_mut().push(spec.clone());
        Ok(())
    }

    fn mknod(
        &self,
        _process: &FakeProcess,
        _compartment: &Compartment,
        spec: &MknodSpec,
    ) -> Result<(), EmulationError> {
        self.effect();
        self.0.mknods.borrow_mut().push(spec.clone());
        Ok(())
    }

    fn load_module_file(&self, path: &Path, params: &CStr) -> Result<(), EmulationError> {
        self.load(path.to_path_buf(), params)
    }

    fn ioctl(
        &self,
        _process: &FakeProcess,
        _fd: i32,
        request: u32,
        size: usize,
    ) -> Result<(i64, Vec<u8>), EmulationError> {
        let (ret, mut bytes) = self
            .0
            .ioctls
            .borrow()
            .get(&request)
            .cloned()
            .ok_or(EmulationError::Os(Errno::NOTTY))?;
        bytes.resize(size, 0);
        Ok((ret, bytes))
    }

    fn sysinfo(&self) -> Result<SysInfo, EmulationError> {
        Ok(self.0.sysinfo.get())
    }

    fn usage(&self, _compartment: &Compartment) -> CgroupUsage {
        self.0.usage.get()
    }
}

// ============================================================================
// Recording channel
// ============================================================================

#[derive(Default)]
pub struct ChannelState {
    /// Encoded `seccomp_notif` records waiting to be received.
    pub queue: RefCell<VecDeque<Vec<u8>>>,
    pub sent: RefCell<Vec<Response>>,
    pub stale: RefCell<HashSet<u64>>,
    /// Cookies that go stale as soon as they are received.
    pub expire_on_recv: RefCell<HashSet<u64>>,
    /// Error returned by the next `recv`.
    pub recv_error: Cell<Option<Errno>>,
}

#[derive(Clone)]
pub struct RecordingChannel {
    pub state: Rc<ChannelState>,
    layout: NotifLayout,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self {
            state: Rc::new(ChannelState::default()),
            layout: layout(),
        }
    }

    pub fn push(&self, request: Request) {
        let notif = SeccompNotif {
            id: request.cookie,
            pid: request.pid,
            flags: 0,
            data: SeccompData {
                nr: request.nr,
                arch: request.arch,
                instruction_pointer: 0x40_1000,
                args: request.args,
            },
        };
        self.state
            .queue
            .borrow_mut()
            .push_back(self.layout.encode_notif(&notif));
    }

    pub fn sent(&self) -> Vec<Response> {
        self.state.sent.borrow().clone()
    }

    pub fn expire_on_recv(&self, cookie: u64) {
        self.state.expire_on_recv.borrow_mut().insert(cookie);
    }

    pub fn fail_next_recv(&self, errno: Errno) {
        self.state.recv_error.set(Some(errno));
    }
}

impl NotifyChannel for RecordingChannel {
    fn recv(&mut self) -> Result<Option<Request>, MonitorError> {
        if let Some(errno) = self.state.recv_error.take() {
            return match errno {
                Errno::NOENT => Ok(None),
                e => Err(MonitorError::ChannelClosed(e)),
            };
        }
        let Some(record) = self.state.queue.borrow_mut().pop_front() else {
            return Ok(None);
        };
        let request = Request::from(self.layout.decode_notif(&record)?);
        if self.state.expire_on_recv.borrow().contains(&request.cookie) {
            self.state.stale.borrow_mut().insert(request.cookie);
        }
        Ok(Some(request))
    }

    fn id_valid(&self, cookie: u64) -> bool {
        !self.state.stale.borrow().contains(&cookie)
    }

    fn send(&mut self, response: &Response) -> Result<(), MonitorError> {
        // Stale cookies are silently ignored, as the kernel's ENOENT is
        if !self.state.stale.borrow().contains(&response.cookie) {
            self.state.sent.borrow_mut().push(*response);
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        !self.state.queue.borrow().is_empty() || self.state.recv_error.get().is_some()
    }

    fn layout(&self) -> &NotifLayout {
        &self.layout
    }

    fn as_raw_fd(&self) -> RawFd {
        -1
    }
}

pub type TestMonitor = CompartmentMonitor<RecordingChannel, FakeHost>;

/// A monitor with every feature on, plus handles to its doubles.
pub fn monitor(host: &FakeHost) -> (TestMonitor, RecordingChannel) {
    monitor_with(host, Features::all())
}

pub fn monitor_with(host: &FakeHost, features: Features) -> (TestMonitor, RecordingChannel) {
    let channel = RecordingChannel::new();
    let monitor = CompartmentMonitor::new(channel.clone(), host.clone(), compartment(), features);
    (monitor, channel)
}
