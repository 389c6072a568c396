//! Process table access: enumeration, descendant search and liveness.
//!
//! Linux reads `/proc/<pid>/{status,cmdline}`; macOS uses the libproc
//! `proc_listpids`/`proc_pidinfo` APIs. [`ProcessTable`] is the seam the
//! locator depends on so tests can script the table.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use nix::sys::signal;
use nix::unistd::Pid;
use tracing::debug;

use vigil_types::VigilError;

/// One entry of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    /// Kernel command name (truncated to 15 bytes on Linux).
    pub name: String,
    /// Argument vector; empty when unavailable.
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    /// Whether this process runs the program called `target`.
    ///
    /// Matches the command name, the basename of `argv[0]`, or the basename
    /// of `argv[1]` for scripts run through an interpreter such as `node`.
    pub fn runs(&self, target: &str) -> bool {
        if self.name == target {
            return true;
        }
        // Command names are truncated; compare the prefix the kernel kept.
        if self.name.len() == 15 && target.len() > 15 && target.starts_with(&self.name) {
            return true;
        }
        self.cmdline
            .iter()
            .take(2)
            .any(|arg| basename(arg) == target)
    }
}

fn basename(arg: &str) -> &str {
    Path::new(arg)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(arg)
}

/// Read access to the system's processes.
pub trait ProcessTable: Send + Sync {
    fn processes(&self) -> Result<Vec<ProcessInfo>, VigilError>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// The real process table of this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn processes(&self) -> Result<Vec<ProcessInfo>, VigilError> {
        enumerate_processes()
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_alive(pid)
    }
}

/// Whether `pid` exists and is not a zombie.
///
/// `EPERM` means the process exists but belongs to someone else; that still
/// counts as alive.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let exists = match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    };
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
        .map(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("State:"))
                .is_some_and(|state| state.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// All descendants of `root`, nearest generation first.
pub fn descendants(root: u32, processes: &[ProcessInfo]) -> Vec<&ProcessInfo> {
    let mut children: HashMap<u32, Vec<&ProcessInfo>> = HashMap::new();
    for info in processes {
        if info.pid != info.ppid {
            children.entry(info.ppid).or_default().push(info);
        }
    }
    for list in children.values_mut() {
        list.sort_by_key(|p| p.pid);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &child in kids {
                if child.pid == root {
                    continue;
                }
                found.push(child);
                queue.push_back(child.pid);
            }
        }
    }
    found
}

/// The first descendant of `root` running `target`.
pub fn find_target<'a>(
    root: u32,
    target: &str,
    processes: &'a [ProcessInfo],
) -> Option<&'a ProcessInfo> {
    descendants(root, processes)
        .into_iter()
        .find(|p| p.runs(target))
}

#[cfg(target_os = "linux")]
fn enumerate_processes() -> Result<Vec<ProcessInfo>, VigilError> {
    use std::fs;

    let entries = fs::read_dir("/proc")
        .map_err(|e| VigilError::LocatorError(format!("cannot read /proc: {e}")))?;

    let mut processes = Vec::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };

        // The process may exit between readdir and these reads.
        let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) else {
            continue;
        };

        let mut name = String::new();
        let mut ppid = 0;
        for line in status.lines() {
            if let Some(val) = line.strip_prefix("Name:") {
                name = val.trim().to_string();
            } else if let Some(val) = line.strip_prefix("PPid:") {
                ppid = val.trim().parse().unwrap_or(0);
            }
        }

        let cmdline = fs::read(format!("/proc/{pid}/cmdline"))
            .map(|raw| {
                raw.split(|&b| b == 0)
                    .filter(|arg| !arg.is_empty())
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect()
            })
            .unwrap_or_default();

        processes.push(ProcessInfo {
            pid,
            ppid,
            name,
            cmdline,
        });
    }

    debug!(process_count = processes.len(), "enumerated processes");
    Ok(processes)
}

#[cfg(target_os = "macos")]
fn enumerate_processes() -> Result<Vec<ProcessInfo>, VigilError> {
    use std::ffi::CStr;
    use std::mem;

    // PROC_ALL_PIDS from <sys/proc_info.h>.
    const PROC_ALL_PIDS: u32 = 1;

    let num_bytes = unsafe { libc::proc_listpids(PROC_ALL_PIDS, 0, std::ptr::null_mut(), 0) };
    if num_bytes <= 0 {
        return Err(VigilError::LocatorError(format!(
            "proc_listpids size query failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    // Headroom for processes spawned between the two calls.
    let pid_count = (num_bytes as usize / mem::size_of::<libc::pid_t>()) + 64;
    let mut pids: Vec<libc::pid_t> = vec![0; pid_count];
    let buf_size = (pid_count * mem::size_of::<libc::pid_t>()) as libc::c_int;

    let actual_bytes =
        unsafe { libc::proc_listpids(PROC_ALL_PIDS, 0, pids.as_mut_ptr().cast(), buf_size) };
    if actual_bytes <= 0 {
        return Err(VigilError::LocatorError(format!(
            "proc_listpids data query failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    pids.truncate(actual_bytes as usize / mem::size_of::<libc::pid_t>());

    let info_size = mem::size_of::<libc::proc_bsdinfo>() as libc::c_int;
    let mut processes = Vec::with_capacity(pids.len());
    for &pid in pids.iter().filter(|&&pid| pid > 0) {
        let mut info: libc::proc_bsdinfo = unsafe { mem::zeroed() };
        let ret = unsafe {
            libc::proc_pidinfo(
                pid,
                libc::PROC_PIDTBSDINFO,
                0,
                (&raw mut info).cast(),
                info_size,
            )
        };
        if ret <= 0 {
            continue;
        }

        let name = unsafe { CStr::from_ptr(info.pbi_comm.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        processes.push(ProcessInfo {
            pid: pid as u32,
            ppid: info.pbi_ppid,
            name,
            cmdline: Vec::new(),
        });
    }

    debug!(process_count = processes.len(), "enumerated processes");
    Ok(processes)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn enumerate_processes() -> Result<Vec<ProcessInfo>, VigilError> {
    Err(VigilError::LocatorError(
        "process enumeration is not supported on this platform".into(),
    ))
}
