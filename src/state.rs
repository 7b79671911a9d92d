//! The per-tick system snapshot.
//!
//! `SystemState` replaces what would otherwise be a handful of module-level
//! globals mutated in place every tick (the shape the daemon had before it
//! grew a proper sampler): the control loop keeps exactly two live
//! instances, `prev` and `current`, and discards the older one after each
//! tick.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::procfs::{self, PsiRecord};

/// A pid-chain in parent-to-child order, as produced by a selector and
/// consumed by the freezer. Never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PidChain(pub Vec<i32>);

impl PidChain {
    pub fn single(pid: i32) -> Self {
        PidChain(vec![pid])
    }

    pub fn pids(&self) -> &[i32] {
        &self.0
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.0.contains(&pid)
    }
}

/// A snapshot of the counters the detector and predictor need, taken at
/// one instant. One is sampled per tick; the previous tick's sample is
/// kept around just long enough to compute a delta against it.
#[derive(Clone, Debug)]
pub struct SystemState {
    pub timestamp: Instant,
    pub pagefaults: u64,
    pub swapcount: (u64, u64),
    pub psi: Option<PsiRecord>,
    pub cooldown_counter: u32,
    pub unfrozen_pid: Option<PidChain>,
    pub timer_alert: bool,
}

impl SystemState {
    /// Takes a fresh sample from `proc_root`, carrying `cooldown_counter`
    /// forward from `prev` (the detector mutates it afterwards).
    pub fn sample(proc_root: &Path, prev: Option<&SystemState>) -> Option<SystemState> {
        let vmstat = procfs::read_vmstat(proc_root)?;
        let swapcount = (
            vmstat.swap_counters.first().copied().unwrap_or(0),
            vmstat.swap_counters.get(1).copied().unwrap_or(0),
        );
        let psi = procfs::read_pressure(&psi_path(proc_root));
        Some(SystemState {
            timestamp: Instant::now(),
            pagefaults: vmstat.pgmajfault,
            swapcount,
            psi,
            cooldown_counter: prev.map(|p| p.cooldown_counter).unwrap_or(0),
            unfrozen_pid: None,
            timer_alert: false,
        })
    }

    /// Adaptive sleep interval: tightens as `cooldown_counter` climbs.
    pub fn sleep_interval(&self, base_interval: f64) -> f64 {
        base_interval / (self.cooldown_counter as f64 + 1.0)
    }
}

fn psi_path(proc_root: &Path) -> PathBuf {
    proc_root.join("pressure").join("memory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn sample_reads_counters_from_proc_root() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("vmstat"),
            "pgmajfault 7\npswpin 1\npswpout 2\n",
        )
        .unwrap();
        let state = SystemState::sample(dir.path(), None).unwrap();
        assert_eq!(state.pagefaults, 7);
        assert_eq!(state.swapcount, (1, 2));
        assert_eq!(state.cooldown_counter, 0);
    }

    #[test]
    fn sample_carries_cooldown_counter_forward() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("vmstat"), "pgmajfault 1\npswpin 0\npswpout 0\n").unwrap();
        let first = SystemState::sample(dir.path(), None).unwrap();
        let mut first = first;
        first.cooldown_counter = 3;
        let second = SystemState::sample(dir.path(), Some(&first)).unwrap();
        assert_eq!(second.cooldown_counter, 3);
    }

    #[test]
    fn sleep_interval_shrinks_with_cooldown() {
        let mut state = SystemState {
            timestamp: Instant::now(),
            pagefaults: 0,
            swapcount: (0, 0),
            psi: None,
            cooldown_counter: 0,
            unfrozen_pid: None,
            timer_alert: false,
        };
        assert_eq!(state.sleep_interval(0.5), 0.5);
        state.cooldown_counter = 4;
        assert_eq!(state.sleep_interval(0.5), 0.1);
    }
}
