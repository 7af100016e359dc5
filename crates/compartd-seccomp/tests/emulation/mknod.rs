//! mknodat / mknod emulation tests.

use std::path::PathBuf;

use compartd_seccomp::{Capability, Reply};

use crate::common::{FakeHost, ROOT, SCRATCH, monitor, request};

const AT_FDCWD: u64 = libc::AT_FDCWD as i64 as u64;

/// `makedev` for the kernel's encoding.
fn makedev(major: u32, minor: u32) -> u64 {
    u64::from((minor & 0xff) | (major << 8) | ((minor & !0xff) << 12))
}

fn mknodat(host: &FakeHost, dirfd: u64, path: &str, mode: u32, dev: u64) -> Reply {
    host.memory().write_cstr(SCRATCH, path);
    let (mut monitor, channel) = monitor(host);
    channel.push(request(
        1,
        libc::SYS_mknodat,
        [dirfd, SCRATCH, u64::from(mode), dev, 0, 0],
    ));
    monitor.handle_one().unwrap();
    channel.sent()[0].reply
}

fn device_maker() -> FakeHost {
    FakeHost::new().grant(Capability::Mknod)
}

// ============================================================================
// Character devices
// ============================================================================

#[test]
fn test_null_device_created() {
    let host = device_maker();
    let mode = libc::S_IFCHR | 0o666;

    assert_eq!(
        mknodat(&host, AT_FDCWD, "/dev/null", mode, makedev(1, 3)),
        Reply::Value(0)
    );

    let nodes = host.mknods();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].path, PathBuf::from("/dev/null"));
    assert_eq!(nodes[0].mode, mode);
    assert_eq!(nodes[0].dev, 0x103);
}

#[test]
fn test_relative_to_directory_fd() {
    let host = device_maker().fd(7, format!("{ROOT}/dev"));

    assert_eq!(
        mknodat(&host, 7, "urandom", libc::S_IFCHR | 0o644, makedev(1, 9)),
        Reply::Value(0)
    );
    assert_eq!(host.mknods()[0].path, PathBuf::from("/dev/urandom"));
}

#[test]
fn test_relative_to_cwd() {
    let host = device_maker().cwd(format!("{ROOT}/dev"));

    assert_eq!(
        mknodat(&host, AT_FDCWD, "tty", libc::S_IFCHR | 0o620, makedev(5, 0)),
        Reply::Value(0)
    );
    assert_eq!(host.mknods()[0].path, PathBuf::from("/dev/tty"));
}

#[test]
fn test_unlisted_device_denied() {
    let host = device_maker();

    // /dev/mem
    assert_eq!(
        mknodat(&host, AT_FDCWD, "/dev/mem", libc::S_IFCHR | 0o600, makedev(1, 1)),
        Reply::Error(libc::EPERM)
    );
    assert!(host.mknods().is_empty());
}

#[test]
fn test_requires_cap_mknod() {
    let host = FakeHost::new();

    assert_eq!(
        mknodat(&host, AT_FDCWD, "/dev/null", libc::S_IFCHR | 0o666, makedev(1, 3)),
        Reply::Error(libc::EPERM)
    );
    assert!(host.mknods().is_empty());
}

#[test]
fn test_escaping_directory_fd_denied() {
    let host = device_maker().fd(7, "/dev");

    assert_eq!(
        mknodat(&host, 7, "null", libc::S_IFCHR | 0o666, makedev(1, 3)),
        Reply::Error(libc::EPERM)
    );
}

#[test]
fn test_escaping_path_denied() {
    let host = device_maker().cwd(format!("{ROOT}/dev"));

    assert_eq!(
        mknodat(&host, AT_FDCWD, "../../null", libc::S_IFCHR | 0o666, makedev(1, 3)),
        Reply::Error(libc::EPERM)
    );
    assert!(host.mknods().is_empty());
}

// ============================================================================
// Other node types
// ============================================================================

#[test]
fn test_unprivileged_node_types_continue() {
    for kind in [0, libc::S_IFREG, libc::S_IFIFO, libc::S_IFSOCK] {
        let host = FakeHost::new();
        assert_eq!(
            mknodat(&host, AT_FDCWD, "/tmp/node", kind | 0o600, 0),
            Reply::Continue,
            "mode {kind:#o}"
        );
        assert!(host.mknods().is_empty());
    }
}

#[test]
fn test_block_device_denied() {
    let host = device_maker();

    // /dev/sda
    assert_eq!(
        mknodat(&host, AT_FDCWD, "/dev/sda", libc::S_IFBLK | 0o660, makedev(8, 0)),
        Reply::Error(libc::EPERM)
    );
    assert!(host.mknods().is_empty());
}

#[test]
fn test_directory_type_denied() {
    let host = device_maker();

    assert_eq!(
        mknodat(&host, AT_FDCWD, "/dev/x", libc::S_IFDIR | 0o755, 0),
        Reply::Error(libc::EPERM)
    );
}

#[test]
fn test_unreadable_path_faults() {
    let host = device_maker();
    let (mut monitor, channel) = monitor(&host);

    channel.push(request(
        1,
        libc::SYS_mknodat,
        [AT_FDCWD, 0x1234_0000, u64::from(libc::S_IFCHR | 0o666), 0x103, 0, 0],
    ));
    monitor.handle_one().unwrap();

    assert_eq!(channel.sent()[0].reply, Reply::Error(libc::EFAULT));
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_legacy_mknod() {
    let host = device_maker();
    host.memory().write_cstr(SCRATCH, "/dev/zero");
    let (mut monitor, channel) = monitor(&host);

    channel.push(request(
        1,
        libc::SYS_mknod,
        [SCRATCH, u64::from(libc::S_IFCHR | 0o666), makedev(1, 5), 0, 0, 0],
    ));
    monitor.handle_one().unwrap();

    assert_eq!(channel.sent()[0].reply, Reply::Value(0));
    assert_eq!(host.mknods()[0].path, PathBuf::from("/dev/zero"));
}
