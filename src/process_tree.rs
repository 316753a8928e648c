/// Best-effort teardown of a process and all of its live descendants.
///
/// Each process gets SIGTERM, a short grace period, then SIGKILL. Nothing in
/// here returns an error: problems are logged and collected in the
/// `TeardownReport` so cleanup never fails the surrounding test.
use crate::config::TeardownConfig;
use crate::reporter::Reporter;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on descendants collected for a single teardown.
const MAX_DESCENDANTS: usize = 4096;

/// Process inspection primitive: lookup, child enumeration, signalling.
pub trait ProcessControl: Send + Sync {
    /// Whether `pid` currently names a process.
    fn exists(&self, pid: u32) -> bool;

    /// All live descendants of `pid`, parents before their own children.
    fn descendants(&self, pid: u32) -> std::io::Result<Vec<u32>>;

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno>;
}

/// `ProcessControl` backed by procfs and `kill(2)`. Lookup and child
/// enumeration read `proc_root`; signals always go to the live kernel.
#[derive(Debug, Clone)]
pub struct ProcfsControl {
    proc_root: PathBuf,
}

impl ProcfsControl {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }
}

impl Default for ProcfsControl {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessControl for ProcfsControl {
    fn exists(&self, pid: u32) -> bool {
        // Same view of the process table as `descendants`.
        pid > 0 && self.proc_root.join(pid.to_string()).is_dir()
    }

    fn descendants(&self, pid: u32) -> std::io::Result<Vec<u32>> {
        discover_descendants(pid, &self.proc_root)
    }

    fn signal(&self, pid: u32, sig: Signal) -> Result<(), Errno> {
        let raw = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
        signal::kill(Pid::from_raw(raw), sig)
    }
}

/// Walk `<proc_root>/*/status` and return every descendant of `parent`
/// in breadth-first order.
pub fn discover_descendants(parent: u32, proc_root: &Path) -> std::io::Result<Vec<u32>> {
    let mut parent_map: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let pid: u32 = match name.to_string_lossy().parse() {
            Ok(p) if p > 0 => p,
            _ => continue,
        };
        // Processes can vanish mid-scan; skip unreadable entries.
        let Ok(status) = std::fs::read_to_string(entry.path().join("status")) else {
            continue;
        };
        if let Some(ppid) = parse_ppid(&status) {
            parent_map.entry(ppid).or_default().push(pid);
        }
    }

    let mut descendants = Vec::new();
    let mut queue = VecDeque::from([parent]);
    while let Some(current) = queue.pop_front() {
        let Some(children) = parent_map.get(&current) else {
            continue;
        };
        for &child in children {
            if child == parent || descendants.contains(&child) {
                continue;
            }
            if descendants.len() >= MAX_DESCENDANTS {
                tracing::warn!(parent, max = MAX_DESCENDANTS, "descendant scan truncated");
                return Ok(descendants);
            }
            descendants.push(child);
            queue.push_back(child);
        }
    }
    Ok(descendants)
}

fn parse_ppid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// What a teardown did, plus every non-fatal problem it ran into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub pid: u32,
    /// The process was already gone when teardown started.
    pub not_found: bool,
    /// Pids that accepted SIGTERM, in signalling order.
    pub terminated: Vec<u32>,
    pub issues: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Terminates process trees with escalating force.
#[derive(Clone)]
pub struct ProcessTreeTerminator {
    control: Arc<dyn ProcessControl>,
    reporter: Arc<dyn Reporter>,
    grace_period: Duration,
}

impl ProcessTreeTerminator {
    pub fn new(control: Arc<dyn ProcessControl>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            control,
            reporter,
            grace_period: Duration::from_millis(100),
        }
    }

    pub fn from_config(config: &TeardownConfig, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            control: Arc::new(ProcfsControl::new(&config.proc_root)),
            reporter,
            grace_period: config.grace_period(),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Kill `pid` and all of its children. Never fails.
    pub async fn terminate(&self, pid: u32) -> TeardownReport {
        let mut report = TeardownReport {
            pid,
            ..Default::default()
        };

        if !self.control.exists(pid) {
            self.reporter
                .log(&format!("unable to find pid {pid}, assuming dead"));
            report.not_found = true;
            return report;
        }

        let mut family = match self.control.descendants(pid) {
            Ok(children) => children,
            Err(e) => {
                tracing::debug!(pid, error = %e, "child enumeration failed");
                Vec::new()
            }
        };
        // Leaves first, the requested process last.
        family.reverse();
        family.push(pid);
        tracing::debug!(pid, family = ?family, "terminating process tree");

        for p in family {
            if let Err(e) = self.control.signal(p, Signal::SIGTERM) {
                let issue = format!("unable to terminate pid {p}: {e}");
                self.reporter.log(&issue);
                report.issues.push(issue);
                continue;
            }
            report.terminated.push(p);

            // Allow process a chance to cleanup before instant death.
            tokio::time::sleep(self.grace_period).await;

            match self.control.signal(p, Signal::SIGKILL) {
                Ok(()) => {}
                Err(Errno::ESRCH) => {
                    tracing::debug!(pid = p, "exited during grace period");
                }
                Err(e) => {
                    let issue = format!("unable to kill pid {p}: {e}");
                    self.reporter.log(&issue);
                    report.issues.push(issue);
                }
            }
        }

        tracing::info!(
            pid,
            terminated = report.terminated.len(),
            issues = report.issues.len(),
            "process tree teardown finished"
        );
        report
    }
}
