//! The process/cgroup selector cascade: a stateful round-robin over four
//! strategies for picking what to suspend next.
//!
//! Grounded on `ProcessSelector` and its four subclasses
//! (`LastFrozenProcessSelector`, `CgroupPressureProcessSelector`,
//! `OOMScoreProcessSelector`, `PageFaultingProcessSelector`) plus
//! `GlobalProcessSelector`.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::freezer::FrozenRegistry;
use crate::procfs::{self, ProcStat};
use crate::state::{PidChain, SystemState};

/// Shared read-only context every selector's `scan` needs.
pub struct ScanContext<'a> {
    pub proc_root: &'a Path,
    pub cgroup_root: &'a Path,
    pub config: &'a Config,
    pub registry: &'a FrozenRegistry,
    pub own_pid: i32,
    pub own_ppid: i32,
}

pub trait ProcessSelector {
    fn scan(&mut self, ctx: &ScanContext) -> Option<PidChain>;
    fn update(&mut self, _prev: &SystemState, _cur: &SystemState) {}
}

/// True for `pid == 2` (kthreadd) or any process parented directly by it.
/// Kernel threads have no `/proc/<pid>/cgroup` worth suspending and
/// SIGSTOP has no effect on most of them anyway.
pub fn is_kernel_thread(pid: i32, stat: &ProcStat) -> bool {
    pid == 2 || stat.ppid == 2
}

/// A pid is already handled if its process is observed stopped, or its
/// cgroup is in the frozen set.
pub fn is_frozen(ctx: &ScanContext, pid: i32, stat: &ProcStat) -> bool {
    if stat.state == 'T' {
        return true;
    }
    let cgroup_path = procfs::read_cgroup_path(ctx.proc_root, ctx.cgroup_root, pid);
    cgroup_path
        .map(|p| ctx.registry.is_cgroup_frozen(&p))
        .unwrap_or(false)
}

pub fn apply_score_adjustments(score: f64, cmd: &str, config: &Config) -> f64 {
    let mut score = score;
    if config.cmd_whitelist.iter().any(|c| c == cmd) {
        score /= config.whitelist_score_divider;
    }
    if config.cmd_blacklist.iter().any(|c| c == cmd) {
        score *= config.blacklist_score_multiplier;
    }
    score
}

/// Walks up the job-control shell chain: if `pid`'s parent's command
/// (leading `-` of a login shell stripped) is in `cmd_jobctrllist`, the
/// parent is prepended and the walk continues; otherwise the chain is
/// just `[pid]`. The recursion naturally produces parent-before-child
/// order.
fn check_parents(proc_root: &Path, pid: i32, ppid: Option<i32>, jobctrllist: &[String]) -> Vec<i32> {
    let ppid = match ppid {
        Some(p) => p,
        None => match procfs::read_proc_stat(proc_root, pid) {
            Some(stat) => stat.ppid,
            None => return Vec::new(),
        },
    };
    if ppid <= 1 {
        return vec![pid];
    }
    match procfs::read_proc_stat(proc_root, ppid) {
        Some(stat) if jobctrllist.iter().any(|j| j == stat.cmd.trim_start_matches('-')) => {
            let mut chain = check_parents(proc_root, ppid, Some(stat.ppid), jobctrllist);
            chain.push(pid);
            chain
        }
        _ => vec![pid],
    }
}

fn chain_for(proc_root: &Path, pid: i32, ppid: i32, jobctrllist: &[String]) -> Option<PidChain> {
    let pids = check_parents(proc_root, pid, Some(ppid), jobctrllist);
    if pids.is_empty() {
        None
    } else {
        Some(PidChain(pids))
    }
}

/// Refreezes the pid-chain that was most recently unfrozen, on the
/// theory that if it caused thrashing once it is the cheapest and most
/// likely candidate to cause it again.
#[derive(Default)]
pub struct LastFrozenProcessSelector {
    last_unfrozen: Option<PidChain>,
}

impl LastFrozenProcessSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessSelector for LastFrozenProcessSelector {
    fn update(&mut self, _prev: &SystemState, cur: &SystemState) {
        if let Some(chain) = &cur.unfrozen_pid {
            self.last_unfrozen = Some(chain.clone());
        }
    }

    fn scan(&mut self, ctx: &ScanContext) -> Option<PidChain> {
        let chain = self.last_unfrozen.as_ref()?;
        if chain.pids().iter().any(|&pid| ctx.registry.contains_pid(pid)) {
            return None;
        }
        if !chain.pids().iter().any(|&pid| procfs::read_proc_stat(ctx.proc_root, pid).is_some()) {
            self.last_unfrozen = None;
            return None;
        }
        self.last_unfrozen.clone()
    }
}

/// Selects a process from whichever cgroup is under the highest memory
/// pressure, weighted by that process's individual `oom_score` so a
/// solitary high-cost process in a small scope outranks a crowded
/// session full of low-priority renderers.
pub struct CgroupPressureProcessSelector {
    pressure_cache: HashMap<std::path::PathBuf, (Instant, f64)>,
    cache_ttl: Duration,
}

impl Default for CgroupPressureProcessSelector {
    fn default() -> Self {
        CgroupPressureProcessSelector {
            pressure_cache: HashMap::new(),
            cache_ttl: Duration::from_secs(1),
        }
    }
}

impl CgroupPressureProcessSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn cgroup_pressure(&mut self, cgroup_path: &Path) -> Option<f64> {
        let now = Instant::now();
        if let Some((cached_at, pressure)) = self.pressure_cache.get(cgroup_path) {
            if now.duration_since(*cached_at) < self.cache_ttl {
                return Some(*pressure);
            }
        }
        let record = procfs::read_pressure(&cgroup_path.join("memory.pressure"))?;
        let pressure = record.some.avg10;
        self.pressure_cache.insert(cgroup_path.to_path_buf(), (now, pressure));
        Some(pressure)
    }
}

impl ProcessSelector for CgroupPressureProcessSelector {
    fn scan(&mut self, ctx: &ScanContext) -> Option<PidChain> {
        if !ctx.config.use_psi {
            return None;
        }
        let mut best: Option<(i32, i32, f64)> = None;
        for pid in procfs::list_pids(ctx.proc_root) {
            if pid == ctx.own_pid || pid == ctx.own_ppid {
                continue;
            }
            let Some(stat) = procfs::read_proc_stat(ctx.proc_root, pid) else {
                continue;
            };
            if is_kernel_thread(pid, &stat) || is_frozen(ctx, pid, &stat) {
                continue;
            }
            let Some(cgroup_path) = procfs::read_cgroup_path(ctx.proc_root, ctx.cgroup_root, pid) else {
                continue;
            };
            let Some(pressure) = self.cgroup_pressure(&cgroup_path) else {
                continue;
            };
            let oom_score = procfs::read_oom_score(ctx.proc_root, pid).unwrap_or(0).max(1) as f64;
            let score = apply_score_adjustments(pressure * oom_score, &stat.cmd, ctx.config);
            if best.map(|(_, _, s)| score > s).unwrap_or(score > 0.0) {
                best = Some((pid, stat.ppid, score));
            }
        }
        let (pid, ppid, _) = best?;
        chain_for(ctx.proc_root, pid, ppid, &ctx.config.cmd_jobctrllist)
    }
}

/// Selects the non-frozen process with the highest adjusted `oom_score`.
#[derive(Default)]
pub struct OOMScoreProcessSelector;

impl OOMScoreProcessSelector {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSelector for OOMScoreProcessSelector {
    fn scan(&mut self, ctx: &ScanContext) -> Option<PidChain> {
        let mut best: Option<(i32, i32, f64)> = None;
        for pid in procfs::list_pids(ctx.proc_root) {
            if pid == ctx.own_pid || pid == ctx.own_ppid {
                continue;
            }
            let Some(oom_score) = procfs::read_oom_score(ctx.proc_root, pid) else {
                continue;
            };
            if oom_score <= 0 {
                continue;
            }
            let Some(stat) = procfs::read_proc_stat(ctx.proc_root, pid) else {
                continue;
            };
            if is_kernel_thread(pid, &stat) || is_frozen(ctx, pid, &stat) {
                continue;
            }
            let score = apply_score_adjustments(oom_score as f64, &stat.cmd, ctx.config);
            if best.map(|(_, _, s)| score > s).unwrap_or(true) {
                best = Some((pid, stat.ppid, score));
            }
        }
        let (pid, ppid, _) = best?;
        chain_for(ctx.proc_root, pid, ppid, &ctx.config.cmd_jobctrllist)
    }
}

/// Selects the process whose major-fault count grew the most since the
/// last scan, gated by a hurdle that relaxes as the cooldown counter
/// climbs.
#[derive(Default)]
pub struct PageFaultingProcessSelector {
    pagefault_by_pid: HashMap<i32, u64>,
    cooldown_counter: u32,
}

impl PageFaultingProcessSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessSelector for PageFaultingProcessSelector {
    // The source proactively reruns `scan` from inside `update` once major
    // faults jump past `pgmajfault_scan_threshold`, ahead of this
    // selector's next turn in the cascade. The control loop here always
    // runs the full cascade once per tick regardless of which selector
    // turns up a candidate, so that proactive rescan has no effect beyond
    // what the next ordinary turn already does; only `cooldown_counter`
    // needs to be carried forward.
    fn update(&mut self, _prev: &SystemState, cur: &SystemState) {
        self.cooldown_counter = cur.cooldown_counter;
    }

    fn scan(&mut self, ctx: &ScanContext) -> Option<PidChain> {
        let mut best: Option<(i32, i32, f64)> = None;
        for pid in procfs::list_pids(ctx.proc_root) {
            let Some(stat) = procfs::read_proc_stat(ctx.proc_root, pid) else {
                continue;
            };
            if stat.majflt == 0 || is_kernel_thread(pid, &stat) || is_frozen(ctx, pid, &stat) {
                continue;
            }
            let previous = self.pagefault_by_pid.get(&pid).copied().unwrap_or(0);
            self.pagefault_by_pid.insert(pid, stat.majflt);
            let mut diff = stat.majflt.saturating_sub(previous) as f64;
            if ctx.config.test_mode > 0 {
                diff += (crate::detector::test_mode_jitter() & 0x7) as f64;
            }
            if diff == 0.0 {
                continue;
            }
            let diff = apply_score_adjustments(diff, &stat.cmd, ctx.config);
            if pid == ctx.own_pid || pid == ctx.own_ppid {
                continue;
            }
            if best.map(|(_, _, s)| diff > s).unwrap_or(true) {
                best = Some((pid, stat.ppid, diff));
            }
        }
        let (pid, ppid, max) = best?;
        if max > 4.0 / (self.cooldown_counter as f64 + 1.0) {
            chain_for(ctx.proc_root, pid, ppid, &ctx.config.cmd_jobctrllist)
        } else {
            None
        }
    }
}

/// The fixed-order cascade: `LastFrozen`, `CgroupPressure`, `OOMScore`,
/// `PageFault`. A rotating index makes each tick start from the
/// selector after whichever one last succeeded, so no single strategy
/// monopolises every decision; the index resets to zero whenever the
/// previous tick unfroze something.
pub struct GlobalProcessSelector {
    collection: Vec<Box<dyn ProcessSelector + Send>>,
    scan_method_count: usize,
}

impl GlobalProcessSelector {
    pub fn new() -> Self {
        GlobalProcessSelector {
            collection: vec![
                Box::new(LastFrozenProcessSelector::new()),
                Box::new(CgroupPressureProcessSelector::new()),
                Box::new(OOMScoreProcessSelector::new()),
                Box::new(PageFaultingProcessSelector::new()),
            ],
            scan_method_count: 0,
        }
    }
}

impl Default for GlobalProcessSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSelector for GlobalProcessSelector {
    fn update(&mut self, prev: &SystemState, cur: &SystemState) {
        if cur.unfrozen_pid.is_some() {
            self.scan_method_count = 0;
        }
        for selector in &mut self.collection {
            selector.update(prev, cur);
        }
    }

    fn scan(&mut self, ctx: &ScanContext) -> Option<PidChain> {
        let len = self.collection.len();
        for _ in 0..len {
            let idx = self.scan_method_count % len;
            self.scan_method_count += 1;
            if let Some(chain) = self.collection[idx].scan(ctx) {
                return Some(chain);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, StorageTypeSetting};
    use std::fs;
    use tempfile::TempDir;

    fn config() -> Config {
        Config::resolve(&CliArgs {
            storage_type: Some(StorageTypeSetting::Hdd),
            ..Default::default()
        })
    }

    fn write_proc(proc_root: &Path, pid: i32, ppid: i32, cmd: &str, state: char, majflt: u64, oom_score: i64) {
        let dir = proc_root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        let fields = format!(
            "{pid} ({cmd}) {state} {ppid} 0 0 0 0 0 0 0 {majflt} 0 0 0 0 0 0 0 0 0 0 0"
        );
        fs::write(dir.join("stat"), fields).unwrap();
        fs::write(dir.join("oom_score"), oom_score.to_string()).unwrap();
    }

    #[test]
    fn oom_score_selector_ignores_self_and_kernel_threads() {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        write_proc(&proc_root, 100, 1, "victim", 'S', 0, 500);
        write_proc(&proc_root, 2, 0, "kthreadd", 'S', 0, 999);
        write_proc(&proc_root, 3, 2, "kworker", 'S', 0, 999);
        let cfg = config();
        let registry = FrozenRegistry::new();
        let ctx = ScanContext {
            proc_root: &proc_root,
            cgroup_root: &dir.path().join("cgroup"),
            config: &cfg,
            registry: &registry,
            own_pid: 1,
            own_ppid: 0,
        };
        let mut selector = OOMScoreProcessSelector::new();
        let chain = selector.scan(&ctx).unwrap();
        assert_eq!(chain.pids(), &[100]);
    }

    #[test]
    fn pagefault_selector_skips_already_stopped_processes() {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        write_proc(&proc_root, 100, 1, "victim", 'S', 50, 0);
        write_proc(&proc_root, 200, 1, "stopped", 'T', 9000, 0);
        let cfg = config();
        let registry = FrozenRegistry::new();
        let ctx = ScanContext {
            proc_root: &proc_root,
            cgroup_root: &dir.path().join("cgroup"),
            config: &cfg,
            registry: &registry,
            own_pid: 1,
            own_ppid: 0,
        };
        let mut selector = PageFaultingProcessSelector::new();
        let chain = selector.scan(&ctx).unwrap();
        assert_eq!(chain.pids(), &[100]);
    }

    #[test]
    fn pagefault_selector_hurdle_blocks_small_deltas() {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        write_proc(&proc_root, 100, 1, "victim", 'S', 1, 0);
        let cfg = config();
        let registry = FrozenRegistry::new();
        let ctx = ScanContext {
            proc_root: &proc_root,
            cgroup_root: &dir.path().join("cgroup"),
            config: &cfg,
            registry: &registry,
            own_pid: 1,
            own_ppid: 0,
        };
        let mut selector = PageFaultingProcessSelector::new();
        // cooldown_counter is 0 so the hurdle is 4/(0+1) = 4; a first-seen
        // majflt of 1 (previous=0, diff=1) must not clear it.
        assert!(selector.scan(&ctx).is_none());
    }

    #[test]
    fn last_frozen_selector_returns_chain_set_by_update() {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        write_proc(&proc_root, 55, 1, "victim", 'T', 0, 0);
        let cfg = config();
        let registry = FrozenRegistry::new();
        let ctx = ScanContext {
            proc_root: &proc_root,
            cgroup_root: &dir.path().join("cgroup"),
            config: &cfg,
            registry: &registry,
            own_pid: 1,
            own_ppid: 0,
        };
        let mut selector = LastFrozenProcessSelector::new();
        let prev = SystemState {
            timestamp: std::time::Instant::now(),
            pagefaults: 0,
            swapcount: (0, 0),
            psi: None,
            cooldown_counter: 0,
            unfrozen_pid: None,
            timer_alert: false,
        };
        let mut cur = prev.clone();
        cur.unfrozen_pid = Some(PidChain(vec![55]));
        selector.update(&prev, &cur);
        let chain = selector.scan(&ctx).unwrap();
        assert_eq!(chain.pids(), &[55]);
    }

    #[test]
    fn cascade_resets_index_when_previous_tick_unfroze() {
        let mut cascade = GlobalProcessSelector::new();
        cascade.scan_method_count = 3;
        let prev = SystemState {
            timestamp: std::time::Instant::now(),
            pagefaults: 0,
            swapcount: (0, 0),
            psi: None,
            cooldown_counter: 0,
            unfrozen_pid: None,
            timer_alert: false,
        };
        let mut cur = prev.clone();
        cur.unfrozen_pid = Some(PidChain(vec![1]));
        cascade.update(&prev, &cur);
        assert_eq!(cascade.scan_method_count, 0);
    }
}
