//! compartd CLI - diagnostics and a supervised run harness for the monitor

use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use compartd_seccomp::{
    Capability, Compartment, CompartmentId, CompartmentMonitor, Event, ExitStatus, Features,
    KernelChannel, LinuxHost, ModuleGraph, Policy, Supervisor, has_capability, spawn_armed,
    wait_for_exit,
};
use compartd_sys::seccomp::{SockFilter, build_ioctl_filter, build_notify_filter};

const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "compartd")]
#[command(author, version, about = "Seccomp syscall-emulation monitor for compartments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the kernel supports user notification
    Check,

    /// List a module's load order, prerequisites first
    Deps {
        /// Module name
        module: String,

        /// modules.dep to read instead of the running kernel's
        #[arg(long)]
        modules_dep: Option<PathBuf>,
    },

    /// Query whether a process holds a capability
    Capable {
        pid: u32,

        /// Capability name, e.g. CAP_SYS_ADMIN or sys_admin
        capability: String,
    },

    /// Print the BPF program a compartment would be armed with
    Filter {
        /// Comma-separated features (mount, module, mknod, ioctl, time, sysinfo, all)
        #[arg(short, long, default_value = "all")]
        features: String,

        /// Print the ioctl allow-list program instead
        #[arg(long)]
        ioctl: bool,
    },

    /// Run a command with its syscalls emulated by a monitor
    Run {
        /// Compartment root as seen from the host
        #[arg(short, long, default_value = "/")]
        root: PathBuf,

        /// Compartment name
        #[arg(short, long, default_value = "run")]
        name: String,

        /// Memory limit in MB reported by sysinfo
        #[arg(long)]
        memory_max: Option<u64>,

        /// Swap limit in MB reported by sysinfo
        #[arg(long)]
        swap_max: Option<u64>,

        /// Process limit
        #[arg(long)]
        pids_max: Option<u64>,

        /// cgroup v2 directory to read live usage from
        #[arg(long)]
        cgroup: Option<PathBuf>,

        /// Comma-separated features to emulate
        #[arg(short, long, default_value = "mount,module,mknod,time,sysinfo")]
        features: String,

        /// Command and arguments
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("compartd=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => check(),

        Commands::Deps {
            module,
            modules_dep,
        } => {
            let graph = match modules_dep {
                Some(path) => ModuleGraph::from_file(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => ModuleGraph::for_running_kernel().context("reading modules.dep")?,
            };
            for name in graph.dependencies_of(&module)? {
                match graph.path_of(&name) {
                    Some(path) => println!("{name}\t{}", path.display()),
                    None => println!("{name}"),
                }
            }
            Ok(())
        }

        Commands::Capable { pid, capability } => {
            let cap: Capability = capability.parse()?;
            let held = has_capability(pid, cap);
            println!("{pid} {} {cap}", if held { "has" } else { "lacks" });
            if !held {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Filter { features, ioctl } => {
            let program = if ioctl {
                build_ioctl_filter(&Policy::default().ioctl_codes())
            } else {
                build_notify_filter(&Features::parse_list(&features)?.syscalls())
            };
            print_program(&program);
            Ok(())
        }

        Commands::Run {
            root,
            name,
            memory_max,
            swap_max,
            pids_max,
            cgroup,
            features,
            cmd,
        } => {
            let mut compartment =
                Compartment::new(CompartmentId(0), name, root).started_at(Instant::now());
            if let Some(mb) = memory_max {
                compartment = compartment.memory_max(mb * MIB);
            }
            if let Some(mb) = swap_max {
                compartment = compartment.swap_max(mb * MIB);
            }
            if let Some(count) = pids_max {
                compartment = compartment.pids_max(count);
            }
            if let Some(dir) = cgroup {
                compartment = compartment.cgroup(dir);
            }

            let status = run(compartment, Features::parse_list(&features)?, &cmd)?;
            match (status.code, status.signal) {
                (Some(code), _) => std::process::exit(code),
                (None, Some(signal)) => std::process::exit(128 + signal),
                (None, None) => bail!("child ended without a status"),
            }
        }
    }
}

fn check() -> Result<()> {
    let info = compartd_sys::check::check().map_err(|e| anyhow!("system not supported: {e}"))?;
    let (major, minor, patch) = info.kernel_version;
    println!("kernel:           {major}.{minor}.{patch}");
    println!("seccomp:          {}", info.seccomp_enabled);
    println!(
        "notif sizes:      notif={} resp={} data={}",
        info.notif_sizes.seccomp_notif,
        info.notif_sizes.seccomp_notif_resp,
        info.notif_sizes.seccomp_data
    );
    Ok(())
}

fn print_program(program: &[SockFilter]) {
    for (i, ins) in program.iter().enumerate() {
        println!(
            "{i:3}: code={:#06x} jt={:3} jf={:3} k={:#010x}",
            ins.code, ins.jt, ins.jf, ins.k
        );
    }
}

fn run(compartment: Compartment, features: Features, cmd: &[String]) -> Result<ExitStatus> {
    let graph = if features.contains(Features::MODULE) {
        ModuleGraph::for_running_kernel().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "no module graph, finit_module will fail");
            ModuleGraph::new()
        })
    } else {
        ModuleGraph::new()
    };

    let compartment = Arc::new(compartment);
    let filter = build_notify_filter(&features.syscalls());
    let armed = spawn_armed(cmd, &filter).with_context(|| format!("spawning {}", cmd.join(" ")))?;
    tracing::info!(
        compartment = %compartment.name(),
        pid = armed.pid,
        features = ?features,
        "command armed"
    );

    let channel = KernelChannel::new(armed.listener).context("opening notification channel")?;
    let monitor = CompartmentMonitor::new(channel, LinuxHost::new(), compartment, features)
        .with_modules(Arc::new(graph));

    let mut supervisor = Supervisor::new().context("creating reactor")?;
    let id = supervisor.register(Box::new(monitor))?;
    let watched = armed.pidfd.try_clone().context("duplicating pidfd")?;
    supervisor.watch_exit(id, watched)?;

    // Serve until every process sharing the filter has gone
    let mut status = None;
    let mut events = Vec::new();
    while !supervisor.is_empty() {
        supervisor.poll(&mut events, None).context("polling")?;
        for event in events.drain(..) {
            match event {
                Event::Handled { id, count } => {
                    tracing::trace!(compartment = %id, count, "notifications handled");
                }
                Event::Exited { pidfd, .. } => {
                    status = Some(wait_for_exit(pidfd.as_fd()).context("reaping command")?);
                }
                Event::Closed { id } => {
                    tracing::debug!(compartment = %id, "channel closed");
                }
            }
        }
    }

    let status = match status {
        Some(status) => status,
        None => wait_for_exit(armed.pidfd.as_fd()).context("reaping command")?,
    };
    tracing::info!(code = ?status.code, signal = ?status.signal, "command finished");
    Ok(status)
}
