//! Process-table inspection via the /proc filesystem.
//!
//! Provides the minimal facts the liveness probe needs about an arbitrary
//! pid: its run state (including zombie detection), its parent pid, its
//! descendants, and whether a debugger is attached to it.
//!
//! On Linux this parses `/proc/{pid}/stat` and `/proc/{pid}/status`
//! directly; no external process-listing tool is involved. On other
//! platforms every lookup reports [`PlatformError::Unsupported`].

use crate::error::{PlatformError, Result};

/// Run state of a process, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Running or runnable.
    Running,
    /// Interruptible sleep.
    Sleeping,
    /// Uninterruptible disk wait.
    DiskWait,
    /// Exited but not yet reaped by its parent.
    Zombie,
    /// Stopped (job control or tracing).
    Stopped,
    /// Dead (should never be observed).
    Dead,
    /// Unrecognized state character.
    Unknown,
}

impl ProcessStatus {
    /// Returns true if the process has exited but has not been reaped.
    #[must_use]
    pub const fn is_zombie(&self) -> bool {
        matches!(self, Self::Zombie)
    }
}

/// Parsed subset of `/proc/{pid}/stat`.
#[derive(Debug, Clone, Copy)]
pub struct ProcStat {
    /// Process id the entry was read for.
    pub pid: u32,
    /// Parent process id.
    pub ppid: u32,
    /// Run state.
    pub status: ProcessStatus,
}

/// Reads the run state and parent pid of a process.
///
/// # Errors
/// Returns [`PlatformError::NotFound`] if the process does not exist,
/// [`PlatformError::Parse`] if its stat entry is malformed.
#[cfg(target_os = "linux")]
pub fn stat(pid: u32) -> Result<ProcStat> {
    let path = format!("/proc/{pid}/stat");
    let content = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PlatformError::NotFound(pid)
        } else {
            PlatformError::Io(e)
        }
    })?;
    parse_stat_content(pid, &content)
}

/// Parses the content of `/proc/{pid}/stat`.
///
/// Format: `pid (comm) state ppid pgrp session ...` — the comm field may
/// itself contain spaces and parentheses, so fields are taken after the
/// last `)`.
#[cfg(target_os = "linux")]
fn parse_stat_content(pid: u32, content: &str) -> Result<ProcStat> {
    let comm_end = content
        .rfind(')')
        .ok_or_else(|| PlatformError::parse("stat entry has no closing paren"))?;
    let after_comm = content[comm_end + 1..].trim_start();
    let mut fields = after_comm.split_whitespace();

    let state = fields
        .next()
        .and_then(|f| f.chars().next())
        .ok_or_else(|| PlatformError::parse("stat entry has no state field"))?;
    let status = match state {
        'R' => ProcessStatus::Running,
        'S' => ProcessStatus::Sleeping,
        'D' => ProcessStatus::DiskWait,
        'Z' => ProcessStatus::Zombie,
        'T' | 't' => ProcessStatus::Stopped,
        'X' | 'x' => ProcessStatus::Dead,
        _ => ProcessStatus::Unknown,
    };

    let ppid = fields
        .next()
        .and_then(|f| f.parse::<u32>().ok())
        .ok_or_else(|| PlatformError::parse("stat entry has no ppid field"))?;

    Ok(ProcStat { pid, ppid, status })
}

/// Returns true if the process exists (including zombies).
///
/// Uses the null signal: `kill(pid, 0)` probes existence without
/// delivering anything. EPERM still means the process exists.
#[cfg(unix)]
#[must_use]
pub fn exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)] // pids fit in i32 range
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Snapshot of the whole process table as (stat) entries.
///
/// Entries that vanish mid-scan are skipped rather than failing the scan.
#[cfg(target_os = "linux")]
fn process_table() -> Result<Vec<ProcStat>> {
    let mut table = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if let Ok(st) = stat(pid) {
            table.push(st);
        }
    }
    Ok(table)
}

/// Returns the direct children of a process.
///
/// # Errors
/// Returns [`PlatformError::NotFound`] if the process itself does not
/// exist, or an I/O error if the process table cannot be scanned.
#[cfg(target_os = "linux")]
pub fn children(pid: u32) -> Result<Vec<u32>> {
    if !exists(pid) {
        return Err(PlatformError::NotFound(pid));
    }
    let table = process_table()?;
    Ok(table
        .iter()
        .filter(|st| st.ppid == pid)
        .map(|st| st.pid)
        .collect())
}

/// Returns all descendants of a process, breadth-first.
///
/// The table is snapshotted once; processes forked during the walk may be
/// missed, which is acceptable for liveness probing.
///
/// # Errors
/// Returns [`PlatformError::NotFound`] if the root process does not exist.
#[cfg(target_os = "linux")]
pub fn descendants(pid: u32) -> Result<Vec<u32>> {
    if !exists(pid) {
        return Err(PlatformError::NotFound(pid));
    }
    let table = process_table()?;

    let mut out = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        for st in table.iter().filter(|st| st.ppid == parent) {
            // A stale ppid cycle would loop forever; the table is a tree
            // so membership of `out` is a sufficient guard.
            if st.pid != pid && !out.contains(&st.pid) {
                out.push(st.pid);
                frontier.push(st.pid);
            }
        }
    }
    Ok(out)
}

/// Returns the pid of the tracer attached to a process, or 0 if none.
///
/// Parsed from the `TracerPid` line of `/proc/{pid}/status`.
///
/// # Errors
/// Returns [`PlatformError::NotFound`] if the process does not exist,
/// [`PlatformError::Parse`] if the status file has no TracerPid line.
#[cfg(target_os = "linux")]
pub fn tracer_pid(pid: u32) -> Result<u32> {
    let path = format!("/proc/{pid}/status");
    let content = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PlatformError::NotFound(pid)
        } else {
            PlatformError::Io(e)
        }
    })?;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("TracerPid:") {
            return value
                .trim()
                .parse::<u32>()
                .map_err(|_| PlatformError::parse("unparseable TracerPid value"));
        }
    }
    Err(PlatformError::parse("status entry has no TracerPid line"))
}

// Non-Linux fallbacks: the probe treats these as indeterminate.

#[cfg(not(target_os = "linux"))]
pub fn stat(pid: u32) -> Result<ProcStat> {
    let _ = pid;
    Err(PlatformError::unsupported("proc stat lookup"))
}

#[cfg(not(unix))]
#[must_use]
pub fn exists(_pid: u32) -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
pub fn children(pid: u32) -> Result<Vec<u32>> {
    let _ = pid;
    Err(PlatformError::unsupported("process table scan"))
}

#[cfg(not(target_os = "linux"))]
pub fn descendants(pid: u32) -> Result<Vec<u32>> {
    let _ = pid;
    Err(PlatformError::unsupported("process table scan"))
}

#[cfg(not(target_os = "linux"))]
pub fn tracer_pid(pid: u32) -> Result<u32> {
    let _ = pid;
    Err(PlatformError::unsupported("tracer lookup"))
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;

    #[test]
    fn test_stat_self() {
        let pid = std::process::id();
        let st = stat(pid).unwrap();
        assert_eq!(st.pid, pid);
        assert!(st.ppid > 0);
        assert!(!st.status.is_zombie());
    }

    #[test]
    fn test_stat_init() {
        let st = stat(1).unwrap();
        assert_eq!(st.ppid, 0);
    }

    #[test]
    fn test_stat_nonexistent() {
        // Very high pid, beyond any realistic pid_max
        let err = stat(4_000_000_000).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_exists() {
        assert!(exists(std::process::id()));
        assert!(!exists(4_000_000_000));
    }

    #[test]
    fn test_parse_simple() {
        let content = "1234 (watcher) S 77 1234 1234 0 -1 4194304 100 0 0 0 50 25 0 0 20 0 5 0 1000";
        let st = parse_stat_content(1234, content).unwrap();
        assert_eq!(st.pid, 1234);
        assert_eq!(st.ppid, 77);
        assert_eq!(st.status, ProcessStatus::Sleeping);
    }

    #[test]
    fn test_parse_comm_with_parens_and_spaces() {
        let content = "99 (a (weird) name) Z 42 0 0 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 0";
        let st = parse_stat_content(99, content).unwrap();
        assert_eq!(st.ppid, 42);
        assert!(st.status.is_zombie());
    }

    #[test]
    fn test_parse_all_states() {
        for (ch, expected) in [
            ('R', ProcessStatus::Running),
            ('S', ProcessStatus::Sleeping),
            ('D', ProcessStatus::DiskWait),
            ('Z', ProcessStatus::Zombie),
            ('T', ProcessStatus::Stopped),
            ('t', ProcessStatus::Stopped),
            ('X', ProcessStatus::Dead),
            ('W', ProcessStatus::Unknown),
        ] {
            let content = format!("1 (t) {ch} 0 0 0 0 0 0 0");
            let st = parse_stat_content(1, &content).unwrap();
            assert_eq!(st.status, expected, "state char {ch}");
        }
    }

    #[test]
    fn test_parse_malformed_no_paren() {
        assert!(parse_stat_content(1, "1234 watcher S 1").is_err());
    }

    #[test]
    fn test_parse_malformed_truncated() {
        assert!(parse_stat_content(1, "1234 (watcher)").is_err());
        assert!(parse_stat_content(1, "1234 (watcher) S").is_err());
    }

    #[test]
    fn test_children_of_self_contains_spawned_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let kids = children(std::process::id()).unwrap();
        assert!(kids.contains(&child.id()));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_descendants_of_missing_root() {
        let err = descendants(4_000_000_000).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_tracer_pid_self() {
        // Unless the test run itself is traced, no tracer is attached.
        let tracer = tracer_pid(std::process::id()).unwrap();
        assert!(tracer == 0 || exists(tracer));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // The comm field is attacker-ish input: any bytes including
            // spaces and parens must not confuse field extraction.
            #[test]
            fn parse_survives_arbitrary_comm(comm in ".{0,32}", ppid in 0u32..100_000) {
                let content = format!("55 ({comm}) R {ppid} 0 0 0 0 0 0");
                // The rightmost ')' is always the template's own closing
                // paren, so any parens inside comm must not shift fields.
                let st = parse_stat_content(55, &content).unwrap();
                prop_assert_eq!(st.pid, 55);
                prop_assert_eq!(st.ppid, ppid);
                prop_assert_eq!(st.status, ProcessStatus::Running);
            }
        }
    }
}
