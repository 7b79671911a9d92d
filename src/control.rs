//! The control loop: ties the sampler, detector, predictor, selector
//! cascade, and freezer together, and the startup/shutdown lifecycle
//! around it.
//!
//! Grounded on the source's top-level `while True:` loop in `main()`,
//! plus its startup `mlockall` call and its `finally`-wrapped cleanup.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use crate::config::Config;
use crate::detector::ThrashDetector;
use crate::eventlog::EventLog;
use crate::freezer::Freezer;
use crate::predictor::OomPredictor;
use crate::selectors::{GlobalProcessSelector, ProcessSelector, ScanContext};
use crate::state::SystemState;

const PROC_ROOT: &str = "/proc";
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Best-effort `mlockall`: tries the full `MCL_CURRENT|MCL_FUTURE` first,
/// falling back to `MCL_CURRENT` alone (works without `CAP_IPC_LOCK` on
/// some kernels), and never treats failure as fatal - an unprivileged
/// daemon still functions, just swappable itself.
pub fn lock_memory_best_effort() {
    let full = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if full == 0 {
        return;
    }
    let current_only = unsafe { libc::mlockall(libc::MCL_CURRENT) };
    if current_only != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        tracing::warn!(errno, "mlockall failed, continuing without it");
    }
}

/// Owns every long-lived piece of daemon state for the duration of one
/// process lifetime: the configuration, the selector cascade, the
/// freezer (and through it, the registry), the detector and predictor,
/// and the event log.
pub struct Daemon {
    pub config: Config,
    proc_root: PathBuf,
    cgroup_root: PathBuf,
    detector: ThrashDetector,
    predictor: OomPredictor,
    selector: GlobalProcessSelector,
    freezer: Freezer,
    event_log: EventLog,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let own_pid = std::process::id() as i32;
        let own_ppid = unsafe { libc::getppid() };
        Daemon {
            config,
            proc_root: PathBuf::from(PROC_ROOT),
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            detector: ThrashDetector,
            predictor: OomPredictor::new(),
            selector: GlobalProcessSelector::new(),
            freezer: Freezer::new(own_pid, own_ppid),
            event_log: EventLog::new(),
        }
    }

    /// Startup lifecycle: best-effort memory lock, a one-time PSI
    /// availability check (`ProbeUnavailable` is a startup-only log, not a
    /// per-tick one), then unconditionally resume anything left stopped by
    /// a crashed previous instance.
    pub fn startup(&self) {
        lock_memory_best_effort();
        if self.config.use_psi
            && crate::procfs::read_pressure(&self.proc_root.join("pressure").join("memory")).is_none()
        {
            tracing::warn!("/proc/pressure/memory unavailable, PSI amplification disabled for this run");
        }
        self.event_log.unfreeze_from_state_file();
    }

    /// Guaranteed-on-exit lifecycle: unfreeze everything still held and
    /// remove the persisted state file, regardless of how the loop ended.
    pub fn cleanup(&mut self) {
        self.freezer.cleanup();
        let _ = std::fs::remove_file(Path::new("/tmp/thrash-protect-frozen-pid-list"));
    }

    /// Runs one tick: sample, detect, predict, select, freeze or
    /// unfreeze, update selector state, and return the sleep interval the
    /// caller should wait before the next tick (or `None` if the timer
    /// alert fired and the tick should be retried immediately).
    fn tick(&mut self, prev: &SystemState) -> (SystemState, Option<f64>) {
        let Some(mut current) = SystemState::sample(&self.proc_root, Some(prev)) else {
            // No data this tick; treat like an idle tick at the base interval.
            return (prev.clone(), Some(self.config.interval));
        };

        let busy = self.detector.check(prev, &mut current, &self.config);

        let oom = self.config.oom_protection
            && !busy
            && self.predictor.should_freeze(&self.proc_root, &self.config);

        if busy || oom {
            let ctx = ScanContext {
                proc_root: &self.proc_root,
                cgroup_root: &self.cgroup_root,
                config: &self.config,
                registry: &self.freezer.registry,
                own_pid: std::process::id() as i32,
                own_ppid: unsafe { libc::getppid() },
            };
            if let Some(chain) = self.selector.scan(&ctx) {
                if let Err(e) = self
                    .freezer
                    .freeze(chain, &self.proc_root, &self.cgroup_root, &self.event_log, &self.config)
                {
                    tracing::error!(error = %e, "freeze attempt failed");
                }
            }
        } else if current.cooldown_counter == 0 {
            current.unfrozen_pid = self
                .freezer
                .unfreeze(&self.proc_root, &self.event_log, &self.config);
        }

        self.selector.update(prev, &current);

        let delay_ok_before = self.detector.check_delay(&mut current, &self.config, 0.0);
        let sleep_secs = if delay_ok_before && !busy {
            Some(current.sleep_interval(self.config.interval))
        } else {
            None
        };

        (current, sleep_secs)
    }

    /// Runs the control loop until `should_stop` returns true (checked
    /// between ticks and after each sleep). The caller is responsible for
    /// cleanup regardless of the return value. Returns `false` for the one
    /// fatal probe failure the loop itself detects - an unreadable
    /// `/proc` at startup - so `main` can report a non-zero exit code; a
    /// clean, signal-driven stop returns `true`.
    pub fn run(&mut self, should_stop: impl Fn() -> bool) -> bool {
        let Some(mut current) = SystemState::sample(&self.proc_root, None) else {
            tracing::error!("initial /proc sample failed, cannot start control loop");
            return false;
        };

        while !should_stop() {
            let prev = current;
            let (next, sleep_secs) = self.tick(&prev);
            current = next;

            if let Some(dt) = sleep_secs {
                if dt > 0.0 {
                    sleep(Duration::from_secs_f64(dt));
                }
                self.detector.check_delay(&mut current, &self.config, dt);
            }
        }
        true
    }
}
