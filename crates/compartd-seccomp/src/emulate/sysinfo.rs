//! `sysinfo` scoped to the compartment's resource envelope.
//!
//! ## Record Layout (64-bit)
//!
//! ```text
//! 0    uptime      (long)
//! 8    loads[3]    (unsigned long)
//! 32   totalram    40  freeram     48  sharedram   56  bufferram
//! 64   totalswap   72  freeswap
//! 80   procs       (unsigned short, 6 bytes padding)
//! 88   totalhigh   96  freehigh
//! 104  mem_unit    (unsigned int, 4 bytes padding)
//! ```
//!
//! With a memory limit, RAM figures are reported in bytes (`mem_unit = 1`):
//! `totalram` is the limit and `freeram` the limit minus live usage. The
//! same applies to swap. Without any limit, host figures pass through.

use compartd_sys::last_errno;
use rustix::io::Errno;

use super::{Context, EmulationResult};
use crate::cgroup::CgroupUsage;
use crate::channel::Reply;
use crate::compartment::Compartment;
use crate::error::EmulationError;
use crate::host::Host;
use crate::process::RemoteProcess;

/// Size of `struct sysinfo` on 64-bit targets.
pub const SYSINFO_SIZE: usize = 112;

const UPTIME: usize = 0;
const LOADS: usize = 8;
const TOTALRAM: usize = 32;
const FREERAM: usize = 40;
const SHAREDRAM: usize = 48;
const BUFFERRAM: usize = 56;
const TOTALSWAP: usize = 64;
const FREESWAP: usize = 72;
const PROCS: usize = 80;
const TOTALHIGH: usize = 88;
const FREEHIGH: usize = 96;
const MEM_UNIT: usize = 104;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SysInfo {
    pub uptime: i64,
    pub loads: [u64; 3],
    pub totalram: u64,
    pub freeram: u64,
    pub sharedram: u64,
    pub bufferram: u64,
    pub totalswap: u64,
    pub freeswap: u64,
    pub procs: u16,
    pub totalhigh: u64,
    pub freehigh: u64,
    pub mem_unit: u32,
}

impl SysInfo {
    /// The host's own view.
    pub fn host() -> Result<Self, Errno> {
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } < 0 {
            return Err(last_errno());
        }
        Ok(Self {
            uptime: info.uptime as i64,
            loads: info.loads.map(|l| l as u64),
            totalram: info.totalram as u64,
            freeram: info.freeram as u64,
            sharedram: info.sharedram as u64,
            bufferram: info.bufferram as u64,
            totalswap: info.totalswap as u64,
            freeswap: info.freeswap as u64,
            procs: info.procs,
            totalhigh: info.totalhigh as u64,
            freehigh: info.freehigh as u64,
            mem_unit: info.mem_unit,
        })
    }

    /// Re-express every memory figure in bytes.
    fn in_bytes(mut self) -> Self {
        let unit = u64::from(self.mem_unit.max(1));
        for field in [
            &mut self.totalram,
            &mut self.freeram,
            &mut self.sharedram,
            &mut self.bufferram,
            &mut self.totalswap,
            &mut self.freeswap,
            &mut self.totalhigh,
            &mut self.freehigh,
        ] {
            *field = field.saturating_mul(unit);
        }
        self.mem_unit = 1;
        self
    }

    /// Apply the compartment's limits and live usage.
    pub fn scoped(self, compartment: &Compartment, usage: &CgroupUsage) -> Self {
        let limits = compartment.limits();
        let mut info = if limits.memory_max.is_some() || limits.swap_max.is_some() {
            self.in_bytes()
        } else {
            self
        };

        if let Some(limit) = limits.memory_max {
            let used = usage.memory.unwrap_or(0).min(limit);
            info.totalram = limit;
            info.freeram = limit - used;
            info.sharedram = info.sharedram.min(limit);
            info.bufferram = info.bufferram.min(info.freeram);
            info.totalhigh = 0;
            info.freehigh = 0;
        }

        if let Some(limit) = limits.swap_max {
            let used = usage.swap.unwrap_or(0).min(limit);
            info.totalswap = limit;
            info.freeswap = limit - used;
        }

        if let Some(pids) = usage.pids {
            info.procs = u16::try_from(pids).unwrap_or(u16::MAX);
        }

        if let Some(uptime) = compartment.uptime() {
            info.uptime = i64::try_from(uptime.as_secs()).unwrap_or(i64::MAX);
        }

        info
    }

    pub fn to_bytes(&self) -> [u8; SYSINFO_SIZE] {
        let mut buf = [0u8; SYSINFO_SIZE];
        put(&mut buf, UPTIME, &self.uptime.to_ne_bytes());
        for (i, load) in self.loads.iter().enumerate() {
            put(&mut buf, LOADS + i * 8, &load.to_ne_bytes());
        }
        put(&mut buf, TOTALRAM, &self.totalram.to_ne_bytes());
        put(&mut buf, FREERAM, &self.freeram.to_ne_bytes());
        put(&mut buf, SHAREDRAM, &self.sharedram.to_ne_bytes());
        put(&mut buf, BUFFERRAM, &self.bufferram.to_ne_bytes());
        put(&mut buf, TOTALSWAP, &self.totalswap.to_ne_bytes());
        put(&mut buf, FREESWAP, &self.freeswap.to_ne_bytes());
        put(&mut buf, PROCS, &self.procs.to_ne_bytes());
        put(&mut buf, TOTALHIGH, &self.totalhigh.to_ne_bytes());
        put(&mut buf, FREEHIGH, &self.freehigh.to_ne_bytes());
        put(&mut buf, MEM_UNIT, &self.mem_unit.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < SYSINFO_SIZE {
            return None;
        }
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_ne_bytes(b)
        };
        Some(Self {
            uptime: u64_at(UPTIME) as i64,
            loads: [u64_at(LOADS), u64_at(LOADS + 8), u64_at(LOADS + 16)],
            totalram: u64_at(TOTALRAM),
            freeram: u64_at(FREERAM),
            sharedram: u64_at(SHAREDRAM),
            bufferram: u64_at(BUFFERRAM),
            totalswap: u64_at(TOTALSWAP),
            freeswap: u64_at(FREESWAP),
            procs: u16::from_ne_bytes([buf[PROCS], buf[PROCS + 1]]),
            totalhigh: u64_at(TOTALHIGH),
            freehigh: u64_at(FREEHIGH),
            mem_unit: u32::from_ne_bytes([
                buf[MEM_UNIT],
                buf[MEM_UNIT + 1],
                buf[MEM_UNIT + 2],
                buf[MEM_UNIT + 3],
            ]),
        })
    }
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// `sysinfo(info)`: write the compartment's view to `info`.
pub fn sysinfo<H: Host>(ctx: &Context<'_, H>) -> EmulationResult {
    let addr = ctx.arg(0);
    if addr == 0 {
        return Err(EmulationError::Os(Errno::FAULT));
    }

    let usage = ctx.host.usage(ctx.compartment);
    let info = ctx.host.sysinfo()?.scoped(ctx.compartment, &usage);
    ctx.process.send(addr, &info.to_bytes())?;

    tracing::trace!(
        compartment = %ctx.compartment.name(),
        pid = ctx.process.pid(),
        totalram = info.totalram,
        freeram = info.freeram,
        "sysinfo emulated"
    );
    Ok(Reply::Value(0))
}
