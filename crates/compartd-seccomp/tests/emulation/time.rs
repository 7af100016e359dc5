//! Clock syscall tests.

use compartd_seccomp::{Capability, Reply};

use crate::common::{FakeHost, SCRATCH, monitor, request};

const ADJ_OFFSET: u32 = 0x0001;
const ADJ_OFFSET_SS_READ: u32 = 0xa001;

fn run(host: &FakeHost, nr: i64, args: [u64; 6]) -> Reply {
    let (mut monitor, channel) = monitor(host);
    channel.push(request(1, nr, args));
    monitor.handle_one().unwrap();
    channel.sent()[0].reply
}

/// A `struct timex` whose `modes` is `modes`.
fn timex(host: &FakeHost, modes: u32) -> u64 {
    let mut bytes = vec![0u8; 208];
    bytes[..4].copy_from_slice(&modes.to_ne_bytes());
    host.memory().write(SCRATCH, &bytes);
    SCRATCH
}

#[test]
fn test_adjtimex_query_continues() {
    for modes in [0, ADJ_OFFSET_SS_READ] {
        let host = FakeHost::new();
        let buf = timex(&host, modes);
        assert_eq!(
            run(&host, libc::SYS_adjtimex, [buf, 0, 0, 0, 0, 0]),
            Reply::Continue,
            "modes {modes:#x}"
        );
    }
}

#[test]
fn test_adjtimex_change_denied() {
    // Even a caller holding CAP_SYS_TIME
    let host = FakeHost::new().grant(Capability::SysTime);
    let buf = timex(&host, ADJ_OFFSET);

    assert_eq!(
        run(&host, libc::SYS_adjtimex, [buf, 0, 0, 0, 0, 0]),
        Reply::Error(libc::EPERM)
    );
}

#[test]
fn test_adjtimex_null_left_to_kernel() {
    let host = FakeHost::new();

    assert_eq!(run(&host, libc::SYS_adjtimex, [0; 6]), Reply::Continue);
}

#[test]
fn test_adjtimex_unmapped_faults() {
    let host = FakeHost::new();

    assert_eq!(
        run(&host, libc::SYS_adjtimex, [0x6000_0000, 0, 0, 0, 0, 0]),
        Reply::Error(libc::EFAULT)
    );
}

#[test]
fn test_clock_adjtime_reads_second_argument() {
    let host = FakeHost::new();
    let buf = timex(&host, 0);
    let args = [libc::CLOCK_REALTIME as u64, buf, 0, 0, 0, 0];
    assert_eq!(run(&host, libc::SYS_clock_adjtime, args), Reply::Continue);

    let host = FakeHost::new();
    let buf = timex(&host, ADJ_OFFSET);
    let args = [libc::CLOCK_REALTIME as u64, buf, 0, 0, 0, 0];
    assert_eq!(
        run(&host, libc::SYS_clock_adjtime, args),
        Reply::Error(libc::EPERM)
    );
}

#[test]
fn test_clock_settime_denied() {
    let host = FakeHost::new().grant(Capability::SysTime);
    host.memory().write(SCRATCH, &[0u8; 16]);

    assert_eq!(
        run(
            &host,
            libc::SYS_clock_settime,
            [libc::CLOCK_REALTIME as u64, SCRATCH, 0, 0, 0, 0]
        ),
        Reply::Error(libc::EPERM)
    );
}

#[test]
fn test_settimeofday() {
    let host = FakeHost::new();
    host.memory().write(SCRATCH, &[0u8; 16]);

    // Neither tv nor tz: nothing to set
    assert_eq!(run(&host, libc::SYS_settimeofday, [0; 6]), Reply::Continue);
    assert_eq!(
        run(&host, libc::SYS_settimeofday, [SCRATCH, 0, 0, 0, 0, 0]),
        Reply::Error(libc::EPERM)
    );
    assert_eq!(
        run(&host, libc::SYS_settimeofday, [0, SCRATCH, 0, 0, 0, 0]),
        Reply::Error(libc::EPERM)
    );
}
