//! ioctl emulation tests.

use compartd_seccomp::Reply;

use crate::common::{FakeHost, SCRATCH, monitor, request};

const TIOCGWINSZ: u32 = libc::TIOCGWINSZ as u32;
const FIONREAD: u32 = libc::FIONREAD as u32;

fn winsize(rows: u16, cols: u16) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8);
    for v in [rows, cols, 0, 0] {
        bytes.extend_from_slice(&v.to_ne_bytes());
    }
    bytes
}

fn run_ioctl(host: &FakeHost, fd: u64, request_code: u64, argp: u64) -> Reply {
    let (mut monitor, channel) = monitor(host);
    channel.push(request(1, libc::SYS_ioctl, [fd, request_code, argp, 0, 0, 0]));
    monitor.handle_one().unwrap();
    channel.sent()[0].reply
}

#[test]
fn test_window_size_forwarded() {
    let host = FakeHost::new();
    host.0
        .ioctls
        .borrow_mut()
        .insert(TIOCGWINSZ, (0, winsize(24, 80)));
    host.memory().map(SCRATCH, 8);

    assert_eq!(
        run_ioctl(&host, 1, u64::from(TIOCGWINSZ), SCRATCH),
        Reply::Value(0)
    );
    assert_eq!(host.memory().read(SCRATCH, 8).unwrap(), winsize(24, 80));
}

#[test]
fn test_fionread_forwarded() {
    let host = FakeHost::new();
    host.0
        .ioctls
        .borrow_mut()
        .insert(FIONREAD, (0, 512i32.to_ne_bytes().to_vec()));
    host.memory().map(SCRATCH, 4);

    assert_eq!(run_ioctl(&host, 0, u64::from(FIONREAD), SCRATCH), Reply::Value(0));
    assert_eq!(host.memory().read(SCRATCH, 4).unwrap(), 512i32.to_ne_bytes());
}

#[test]
fn test_upper_request_bits_ignored() {
    let host = FakeHost::new();
    host.0
        .ioctls
        .borrow_mut()
        .insert(TIOCGWINSZ, (0, winsize(50, 132)));
    host.memory().map(SCRATCH, 8);

    let code = (0xffff_ffffu64 << 32) | u64::from(TIOCGWINSZ);
    assert_eq!(run_ioctl(&host, 1, code, SCRATCH), Reply::Value(0));
}

#[test]
fn test_unlisted_request_denied() {
    let host = FakeHost::new();
    host.memory().map(SCRATCH, 8);

    assert_eq!(run_ioctl(&host, 1, 0xdead, SCRATCH), Reply::Error(libc::EPERM));
    // TIOCSWINSZ changes state and is not on the list
    assert_eq!(
        run_ioctl(&host, 1, libc::TIOCSWINSZ as u64, SCRATCH),
        Reply::Error(libc::EPERM)
    );
}

#[test]
fn test_null_argp_faults() {
    let host = FakeHost::new();

    assert_eq!(
        run_ioctl(&host, 1, u64::from(TIOCGWINSZ), 0),
        Reply::Error(libc::EFAULT)
    );
}

#[test]
fn test_unmapped_argp_faults() {
    let host = FakeHost::new();
    host.0
        .ioctls
        .borrow_mut()
        .insert(TIOCGWINSZ, (0, winsize(24, 80)));

    assert_eq!(
        run_ioctl(&host, 1, u64::from(TIOCGWINSZ), 0x5555_0000),
        Reply::Error(libc::EFAULT)
    );
}

#[test]
fn test_real_ioctl_error_reported() {
    // The descriptor is not a terminal
    let host = FakeHost::new();
    host.memory().map(SCRATCH, 8);

    assert_eq!(
        run_ioctl(&host, 3, u64::from(TIOCGWINSZ), SCRATCH),
        Reply::Error(libc::ENOTTY)
    );
}
