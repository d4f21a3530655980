use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

/// True if a process with this pid currently exists. Sending signal 0 is the
/// POSIX idiom for an existence probe without actually signalling anything.
pub fn is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn send(pid: u32, sig: Signal) {
    let _ = signal::kill(Pid::from_raw(pid as i32), sig);
}

/// Terminates a process tree rooted at `pid`: children first (depth-first),
/// then the root, each with SIGTERM followed by SIGKILL for anything still
/// alive after `timeout`. Grounded in the same graceful-then-forceful
/// pattern used for a single child in [`crate::process::command::kill_process`],
/// extended to an entire subtree since crash recovery must not leave
/// grandchildren of a crashed transcoder behind.
pub async fn kill_process_tree(pid: u32, timeout: Duration) {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    for (p, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children_of
                .entry(parent.as_u32())
                .or_default()
                .push(p.as_u32());
        }
    }

    let mut subtree = Vec::new();
    collect_subtree(pid, &children_of, &mut subtree);
    subtree.push(pid);

    for &p in &subtree {
        send(p, Signal::SIGTERM);
    }

    tokio::time::sleep(timeout).await;

    for &p in &subtree {
        if is_alive(p) {
            tracing::warn!(pid = p, "process survived SIGTERM, sending SIGKILL");
            send(p, Signal::SIGKILL);
        }
    }
}

fn collect_subtree(pid: u32, children_of: &HashMap<u32, Vec<u32>>, out: &mut Vec<u32>) {
    if let Some(children) = children_of.get(&pid) {
        for &child in children {
            out.push(child);
            collect_subtree(child, children_of, out);
        }
    }
}

/// Enumerates live processes named `exe_name` whose command line references
/// `needle` (the configured HLS root), used by the supervisor's startup
/// self-cleanup to find orphan transcoders from a previous, ungracefully
/// terminated instance.
pub fn find_orphans(exe_name: &str, needle: &Path) -> Vec<u32> {
    let needle = needle.to_string_lossy().to_string();
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    sys.processes()
        .iter()
        .filter_map(|(pid, process)| {
            let name_matches = process
                .name()
                .to_string_lossy()
                .eq_ignore_ascii_case(exe_name);
            if !name_matches {
                return None;
            }
            let cmdline_matches = process
                .cmd()
                .iter()
                .any(|arg| arg.to_string_lossy().contains(&needle));
            cmdline_matches.then_some(pid_to_u32(*pid))
        })
        .collect()
}

fn pid_to_u32(pid: SysPid) -> u32 {
    pid.as_u32()
}

/// CPU and memory pressure, refreshed on demand. Used only by
/// `ErrorJournal::health`; kept as a thin wrapper since `sysinfo` needs two
/// refresh passes with a delay in between to report meaningful CPU usage.
pub struct SystemPressure;

impl SystemPressure {
    pub async fn sample() -> (f32, f32) {
        let mut sys = System::new_all();
        sys.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        let cpu = sys.global_cpu_usage();

        sys.refresh_memory();
        let mem_percent = if sys.total_memory() > 0 {
            (sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0) as f32
        } else {
            0.0
        };
        (cpu, mem_percent)
    }
}
