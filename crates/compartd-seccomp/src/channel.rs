//! Notification channel: the request/response half of the protocol.
//!
//! [`KernelChannel`] wraps a seccomp listener fd. The record layout is
//! queried once when the channel is created and every receive and send goes
//! through it, so a kernel with larger records is handled without a rebuild.
//!
//! ## Error Semantics
//!
//! | Call | Errno | Result |
//! |------|-------|--------|
//! | `recv` | `ENOENT` | `Ok(None)`, target died before delivery |
//! | `recv` | `EINTR` | `Ok(None)` |
//! | `recv` | other | `ChannelClosed` |
//! | `send` | `ENOENT` | `Ok(())`, cookie went stale |
//! | `send` | `EBADF` | `ChannelClosed` |

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use compartd_sys::seccomp_notify::{
    NotifLayout, SECCOMP_USER_NOTIF_FLAG_CONTINUE, SeccompNotif, SeccompNotifResp, notif_id_valid,
    notif_recv, notif_send,
};
use rustix::io::Errno;

use crate::error::MonitorError;

/// One intercepted syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Echoed back unmodified in the response.
    pub cookie: u64,
    pub pid: u32,
    pub nr: i32,
    pub arch: u32,
    pub args: [u64; 6],
}

impl From<SeccompNotif> for Request {
    fn from(n: SeccompNotif) -> Self {
        Self {
            cookie: n.id,
            pid: n.pid,
            nr: n.data.nr,
            arch: n.data.arch,
            args: n.data.args,
        }
    }
}

/// How the kernel should complete the syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Return this value to the caller.
    Value(i64),
    /// Fail with this (positive) errno.
    Error(i32),
    /// Let the kernel run the syscall as if it had not been intercepted.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub cookie: u64,
    pub reply: Reply,
}

impl Response {
    pub fn new(cookie: u64, reply: Reply) -> Self {
        Self { cookie, reply }
    }

    pub fn to_raw(&self) -> SeccompNotifResp {
        let (val, error, flags) = match self.reply {
            Reply::Value(v) => (v, 0, 0),
            Reply::Error(e) => (0, -e, 0),
            Reply::Continue => (0, 0, SECCOMP_USER_NOTIF_FLAG_CONTINUE),
        };
        SeccompNotifResp {
            id: self.cookie,
            val,
            error,
            flags,
        }
    }
}

/// Duplex channel delivering requests and accepting responses.
pub trait NotifyChannel {
    /// Fetch one pending request. `Ok(None)` means nothing usable arrived.
    fn recv(&mut self) -> Result<Option<Request>, MonitorError>;

    /// Is `cookie` still a live request?
    fn id_valid(&self, cookie: u64) -> bool;

    /// Deliver a response. A stale cookie is not an error.
    fn send(&mut self, response: &Response) -> Result<(), MonitorError>;

    /// Is another request ready without blocking?
    fn has_pending(&self) -> bool;

    fn layout(&self) -> &NotifLayout;

    fn as_raw_fd(&self) -> RawFd;
}

/// Channel over a seccomp listener fd.
#[derive(Debug)]
pub struct KernelChannel {
    fd: OwnedFd,
    layout: NotifLayout,
    buf: Vec<u8>,
}

impl KernelChannel {
    /// Take ownership of `fd`, querying the kernel's record layout.
    pub fn new(fd: OwnedFd) -> Result<Self, MonitorError> {
        let layout = NotifLayout::query()?;
        Ok(Self::with_layout(fd, layout))
    }

    pub fn with_layout(fd: OwnedFd, layout: NotifLayout) -> Self {
        let buf = vec![0u8; layout.notif_size()];
        Self { fd, layout, buf }
    }
}

impl NotifyChannel for KernelChannel {
    fn recv(&mut self) -> Result<Option<Request>, MonitorError> {
        match notif_recv(self.fd.as_raw_fd(), &mut self.buf) {
            Ok(()) => Ok(Some(self.layout.decode_notif(&self.buf)?.into())),
            Err(Errno::NOENT) | Err(Errno::INTR) => Ok(None),
            Err(e) => Err(MonitorError::ChannelClosed(e)),
        }
    }

    fn id_valid(&self, cookie: u64) -> bool {
        notif_id_valid(self.fd.as_raw_fd(), cookie).is_ok()
    }

    fn send(&mut self, response: &Response) -> Result<(), MonitorError> {
        let raw = self.layout.encode_resp(&response.to_raw());
        match notif_send(self.fd.as_raw_fd(), &raw) {
            Ok(()) | Err(Errno::NOENT) => Ok(()),
            Err(Errno::BADF) => Err(MonitorError::ChannelClosed(Errno::BADF)),
            Err(e) => Err(MonitorError::Io(io::Error::from_raw_os_error(
                e.raw_os_error(),
            ))),
        }
    }

    fn has_pending(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        ret > 0 && pfd.revents & libc::POLLIN != 0
    }

    fn layout(&self) -> &NotifLayout {
        &self.layout
    }

    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
