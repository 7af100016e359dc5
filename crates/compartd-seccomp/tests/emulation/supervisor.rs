//! Supervisor tests with pipe-backed monitors.

use std::cell::Cell;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use compartd_seccomp::{
    CompartmentId, Dispatch, Event, MonitorError, Supervisor, SupervisorError, wait_for_exit,
};
use rustix::io::Errno;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn nonblocking_pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    assert_eq!(ret, 0, "pipe2 failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn poke(fd: &OwnedFd, bytes: &[u8]) {
    let n = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
    assert_eq!(n, bytes.len() as isize);
}

/// Each byte on the pipe stands for one notification.
struct PipeMonitor {
    id: CompartmentId,
    read: OwnedFd,
    dispatched: Rc<Cell<usize>>,
    /// Fail every dispatch as if the listener had gone away.
    broken: bool,
}

impl PipeMonitor {
    fn new(id: usize) -> (Self, OwnedFd, Rc<Cell<usize>>) {
        let (read, write) = nonblocking_pipe();
        let dispatched = Rc::new(Cell::new(0));
        let monitor = Self {
            id: CompartmentId(id),
            read,
            dispatched: Rc::clone(&dispatched),
            broken: false,
        };
        (monitor, write, dispatched)
    }
}

impl Dispatch for PipeMonitor {
    fn compartment_id(&self) -> CompartmentId {
        self.id
    }

    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    fn dispatch(&mut self) -> Result<usize, MonitorError> {
        if self.broken {
            return Err(MonitorError::ChannelClosed(Errno::BADF));
        }
        let mut total = 0;
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            total += n as usize;
        }
        self.dispatched.set(self.dispatched.get() + total);
        Ok(total)
    }
}

fn poll_until(supervisor: &mut Supervisor, mut done: impl FnMut(&Event) -> bool) -> Vec<Event> {
    let mut seen = Vec::new();
    let mut events = Vec::new();
    for _ in 0..50 {
        supervisor.poll(&mut events, TIMEOUT).unwrap();
        let hit = events.iter().any(&mut done);
        seen.append(&mut events);
        if hit {
            return seen;
        }
    }
    panic!("event never arrived; saw {seen:?}");
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn test_register_and_deregister() {
    let mut supervisor = Supervisor::new().unwrap();
    let (monitor, _write, _count) = PipeMonitor::new(1);

    assert_eq!(supervisor.register(Box::new(monitor)).unwrap(), CompartmentId(1));
    assert_eq!(supervisor.len(), 1);
    assert!(supervisor.contains(CompartmentId(1)));

    let back = supervisor.deregister(CompartmentId(1)).unwrap();
    assert_eq!(back.compartment_id(), CompartmentId(1));
    assert!(supervisor.is_empty());
    assert!(supervisor.deregister(CompartmentId(1)).is_none());
}

#[test]
fn test_duplicate_registration_rejected() {
    let mut supervisor = Supervisor::new().unwrap();
    let (first, _w1, _c1) = PipeMonitor::new(3);
    let (second, _w2, _c2) = PipeMonitor::new(3);

    supervisor.register(Box::new(first)).unwrap();
    assert!(matches!(
        supervisor.register(Box::new(second)),
        Err(SupervisorError::Duplicate(CompartmentId(3)))
    ));
    assert_eq!(supervisor.len(), 1);
}

#[test]
fn test_watch_exit_requires_registration() {
    let mut supervisor = Supervisor::new().unwrap();
    let (read, _write) = nonblocking_pipe();

    assert!(matches!(
        supervisor.watch_exit(CompartmentId(9), read),
        Err(SupervisorError::Unknown(CompartmentId(9)))
    ));
}

#[test]
fn test_poll_with_nothing_registered_returns() {
    let mut supervisor = Supervisor::new().unwrap();
    let mut events = vec![Event::Closed { id: CompartmentId(0) }];

    supervisor.poll(&mut events, None).unwrap();
    assert!(events.is_empty());
}

// ============================================================================
// Dispatch
// ============================================================================

#[test]
fn test_ready_monitor_dispatched() {
    let mut supervisor = Supervisor::new().unwrap();
    let (monitor, write, count) = PipeMonitor::new(1);
    supervisor.register(Box::new(monitor)).unwrap();

    poke(&write, b"abc");
    let seen = poll_until(&mut supervisor, |e| matches!(e, Event::Handled { .. }));

    assert!(seen.iter().any(|e| matches!(
        e,
        Event::Handled { id: CompartmentId(1), count: 3 }
    )));
    assert_eq!(count.get(), 3);
}

#[test]
fn test_closed_monitor_removed_siblings_continue() {
    let mut supervisor = Supervisor::new().unwrap();
    let (mut broken, broken_write, _) = PipeMonitor::new(1);
    broken.broken = true;
    let (healthy, healthy_write, healthy_count) = PipeMonitor::new(2);
    supervisor.register(Box::new(broken)).unwrap();
    supervisor.register(Box::new(healthy)).unwrap();

    poke(&broken_write, b"x");
    let seen = poll_until(&mut supervisor, |e| matches!(e, Event::Closed { .. }));
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::Closed { id: CompartmentId(1) })));
    assert!(!supervisor.contains(CompartmentId(1)));

    poke(&healthy_write, b"yy");
    poll_until(&mut supervisor, |e| matches!(e, Event::Handled { .. }));
    assert_eq!(healthy_count.get(), 2);
    assert!(supervisor.contains(CompartmentId(2)));
}

#[test]
fn test_hangup_closes_monitor() {
    let mut supervisor = Supervisor::new().unwrap();
    let (monitor, write, _) = PipeMonitor::new(4);
    supervisor.register(Box::new(monitor)).unwrap();

    drop(write);
    poll_until(&mut supervisor, |e| {
        matches!(e, Event::Closed { id: CompartmentId(4) })
    });
    assert!(supervisor.is_empty());
}

// ============================================================================
// Exit watching
// ============================================================================

#[test]
fn test_exit_reported_with_pidfd() {
    let mut supervisor = Supervisor::new().unwrap();
    let (monitor, _write, _) = PipeMonitor::new(5);
    supervisor.register(Box::new(monitor)).unwrap();

    let child = std::process::Command::new("true").spawn().unwrap();
    let raw = unsafe { libc::syscall(libc::SYS_pidfd_open, child.id() as libc::pid_t, 0) };
    if raw < 0 {
        eprintln!("Skipping test: pidfd_open unavailable");
        return;
    }
    let pidfd = unsafe { OwnedFd::from_raw_fd(raw as RawFd) };
    supervisor.watch_exit(CompartmentId(5), pidfd).unwrap();

    let seen = poll_until(&mut supervisor, |e| matches!(e, Event::Exited { .. }));
    let pidfd = seen
        .into_iter()
        .find_map(|e| match e {
            Event::Exited { id, pidfd } => {
                assert_eq!(id, CompartmentId(5));
                Some(pidfd)
            }
            _ => None,
        })
        .unwrap();

    let status = wait_for_exit(pidfd.as_fd()).unwrap();
    assert!(status.success());
    // The monitor outlives its process until its channel closes
    assert!(supervisor.contains(CompartmentId(5)));
}
