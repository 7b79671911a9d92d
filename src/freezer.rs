//! The frozen-item registry and the freeze/unfreeze operations that are
//! its only writers.
//!
//! Grounded on the source's `frozen_items` list of `("cgroup", path, pids)`
//! / `("sigstop", pids)` tuples, `freeze_something`, `unfreeze_something`
//! and `should_use_cgroup_freeze`, re-expressed as a tagged enum plus an
//! explicit registry type instead of untyped tuples in a global list.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Result, ThrashProtectError};
use crate::eventlog::EventLog;
use crate::procfs::{self, ProcStat};
use crate::state::PidChain;

/// One unit of suspension: either a SIGSTOP'd pid-chain or an entire
/// cgroup frozen via the v2 freezer. `path` is the unique key for the
/// `Cgroup` variant.
#[derive(Clone, Debug, PartialEq)]
pub enum FrozenItem {
    Sigstop(PidChain),
    Cgroup { path: PathBuf, pids: PidChain },
}

impl FrozenItem {
    pub fn pids(&self) -> &PidChain {
        match self {
            FrozenItem::Sigstop(chain) => chain,
            FrozenItem::Cgroup { pids, .. } => pids,
        }
    }
}

/// Ordered collection of frozen items, oldest at the front, plus the
/// derived set of frozen cgroup paths used for duplicate detection and
/// "already frozen" classification.
#[derive(Default)]
pub struct FrozenRegistry {
    items: VecDeque<FrozenItem>,
    frozen_cgroup_paths: HashSet<PathBuf>,
    num_unfreezes: u64,
}

impl FrozenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_cgroup_frozen(&self, path: &Path) -> bool {
        self.frozen_cgroup_paths.contains(path)
    }

    /// All currently frozen pids, grouped by chain - the shape both the
    /// event log's "frozen list" decoration and the persisted pid-list
    /// file need.
    pub fn all_frozen_pids(&self) -> Vec<&PidChain> {
        self.items.iter().map(FrozenItem::pids).collect()
    }

    pub fn contains_pid(&self, pid: i32) -> bool {
        self.items.iter().any(|item| item.pids().contains(pid))
    }

    /// A pid is "already frozen" if its process is in T-state, or its
    /// cgroup is currently frozen.
    pub fn is_frozen(&self, stat: &ProcStat, cgroup_path: Option<&Path>) -> bool {
        stat.state == 'T' || cgroup_path.map(|p| self.is_cgroup_frozen(p)).unwrap_or(false)
    }

    fn push_sigstop(&mut self, chain: PidChain) {
        let duplicate = self
            .items
            .iter()
            .any(|item| matches!(item, FrozenItem::Sigstop(existing) if existing == &chain));
        if !duplicate {
            self.items.push_back(FrozenItem::Sigstop(chain));
        }
    }

    fn push_cgroup(&mut self, path: PathBuf, chain: PidChain) {
        if self.frozen_cgroup_paths.contains(&path) {
            return;
        }
        self.frozen_cgroup_paths.insert(path.clone());
        self.items.push_back(FrozenItem::Cgroup {
            path,
            pids: chain,
        });
    }

    /// Mixed queue/stack discipline: every `unfreeze_pop_ratio`-th call
    /// pops the oldest entry (FIFO, preventing starvation); the rest pop
    /// the newest (LIFO, preventing whiplash on the process that was just
    /// frozen).
    fn pop_for_unfreeze(&mut self, unfreeze_pop_ratio: u32) -> Option<FrozenItem> {
        if self.items.is_empty() {
            return None;
        }
        let item = if unfreeze_pop_ratio != 0 && self.num_unfreezes % unfreeze_pop_ratio as u64 == 0 {
            self.items.pop_front()
        } else {
            self.items.pop_back()
        };
        self.num_unfreezes += 1;
        if let Some(FrozenItem::Cgroup { path, .. }) = &item {
            self.frozen_cgroup_paths.remove(path);
        }
        item
    }

    #[cfg(test)]
    pub fn insert_for_test(&mut self, chain: PidChain) {
        self.push_sigstop(chain);
    }

    /// Drains every entry, in back-to-front order (youngest first), for
    /// exit-time cleanup. Does not log.
    pub fn drain_all(&mut self) -> Vec<FrozenItem> {
        self.frozen_cgroup_paths.clear();
        self.items.drain(..).rev().collect()
    }
}

/// Returns the cgroup path to freeze if `pid`'s cgroup satisfies every
/// precondition: cgroup v2 with a `cgroup.freeze` file, a path ending in
/// `.scope` (a per-activity scope, not a shared slice), and a path living
/// under `user@<uid>.service/` rather than directly in `user-<uid>.slice/`
/// - the latter would typically catch `session-N.scope`, which wraps an
/// entire graphical session rather than one isolated spawn.
pub fn should_use_cgroup_freeze(proc_root: &Path, cgroup_root: &Path, pid: i32) -> Option<PathBuf> {
    let path = procfs::read_cgroup_path(proc_root, cgroup_root, pid)?;
    if !path.join("cgroup.freeze").exists() {
        return None;
    }
    let path_str = path.to_string_lossy();
    if !path_str.ends_with(".scope") {
        return None;
    }
    if !path_str.contains("/user@") {
        return None;
    }
    Some(path)
}

fn write_cgroup_freeze(path: &Path, value: &str) -> std::io::Result<()> {
    match std::fs::write(path.join("cgroup.freeze"), value) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
            // Transitional "freezing" state: treat as already in the
            // requested state for this tick.
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Owns the registry exclusively; selectors and the logger only read it.
pub struct Freezer {
    pub registry: FrozenRegistry,
    own_pid: i32,
    own_ppid: i32,
}

impl Freezer {
    pub fn new(own_pid: i32, own_ppid: i32) -> Self {
        Freezer {
            registry: FrozenRegistry::new(),
            own_pid,
            own_ppid,
        }
    }

    /// Freezes `chain` (cgroup-preferred, SIGSTOP fallback), appends the
    /// corresponding registry entry, and logs each pid. Refuses and
    /// returns `SelfTarget` if the daemon's own pid or parent pid is in
    /// the chain.
    pub fn freeze(
        &mut self,
        chain: PidChain,
        proc_root: &Path,
        cgroup_root: &Path,
        event_log: &EventLog,
        config: &Config,
    ) -> Result<()> {
        if chain.contains(self.own_pid) || chain.contains(self.own_ppid) {
            return Err(ThrashProtectError::SelfTarget {
                pid: self.own_pid,
            });
        }

        let cgroup_path = chain
            .pids()
            .iter()
            .find_map(|&pid| should_use_cgroup_freeze(proc_root, cgroup_root, pid));

        if let Some(path) = cgroup_path {
            if write_cgroup_freeze(&path, "1").is_ok() {
                self.registry.push_cgroup(path, chain.clone());
                for &pid in chain.pids() {
                    event_log.ignore_and_report(|| event_log.log_frozen(pid, &self.registry, config));
                }
                return Ok(());
            }
            // Cgroup freeze failed (FreezeFailure policy): fall through to SIGSTOP.
        }

        let pids = chain.pids();
        for (i, &pid) in pids.iter().enumerate() {
            unsafe {
                libc::kill(pid, libc::SIGSTOP);
            }
            if pids.len() > 1 && i + 1 < pids.len() {
                sleep(Duration::from_secs_f64(config.max_acceptable_time_delta() / 3.0));
            }
        }
        self.registry.push_sigstop(chain.clone());
        for &pid in chain.pids() {
            crate::eventlog::debug_check_state(proc_root, pid, true, config);
            event_log.ignore_and_report(|| event_log.log_frozen(pid, &self.registry, config));
        }
        Ok(())
    }

    /// Unfreezes the next item per the mixed queue/stack discipline and
    /// logs each pid. Returns the pid-chain that was unfrozen, if any.
    pub fn unfreeze(&mut self, proc_root: &Path, event_log: &EventLog, config: &Config) -> Option<PidChain> {
        let item = self.registry.pop_for_unfreeze(config.unfreeze_pop_ratio)?;
        let is_sigstop = matches!(item, FrozenItem::Sigstop(_));
        let chain = match &item {
            FrozenItem::Cgroup { path, pids } => {
                let _ = write_cgroup_freeze(path, "0");
                pids.clone()
            }
            FrozenItem::Sigstop(pids) => {
                let reversed: Vec<i32> = pids.pids().iter().rev().copied().collect();
                for (i, &pid) in reversed.iter().enumerate() {
                    unsafe {
                        libc::kill(pid, libc::SIGCONT);
                    }
                    if reversed.len() > 1 && i + 1 < reversed.len() {
                        sleep(Duration::from_secs_f64(config.max_acceptable_time_delta()));
                    }
                }
                pids.clone()
            }
        };
        for &pid in chain.pids() {
            if is_sigstop {
                crate::eventlog::debug_check_state(proc_root, pid, false, config);
            }
            event_log.ignore_and_report(|| event_log.log_unfrozen(pid, &self.registry, config));
        }
        Some(chain)
    }

    /// Unconditional exit-time cleanup: unfreezes everything still held,
    /// youngest first, ignoring individual failures.
    pub fn cleanup(&mut self) {
        for item in self.registry.drain_all() {
            match item {
                FrozenItem::Cgroup { path, .. } => {
                    let _ = write_cgroup_freeze(&path, "0");
                }
                FrozenItem::Sigstop(pids) => {
                    for &pid in pids.pids().iter().rev() {
                        unsafe {
                            libc::kill(pid, libc::SIGCONT);
                        }
                    }
                }
            }
        }
    }
}
