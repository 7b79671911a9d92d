//! Proactive OOM predictor (spec-only: no analogue in the source this
//! crate is grounded on). Maintains a two-point linear projection of
//! storage-weighted available memory and forecasts how many seconds
//! remain before it runs out.

use std::path::Path;

use crate::config::Config;
use crate::procfs;

/// `prev_time`/`prev_available` persist across calls; everything else is
/// recomputed from the current `/proc/meminfo` snapshot.
#[derive(Default)]
pub struct OomPredictor {
    prev: Option<(std::time::Instant, f64)>,
}

impl OomPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `/proc/meminfo` under `proc_root`, updates the two-point
    /// state, and returns `true` if exhaustion is projected within
    /// `config.oom_horizon` seconds. The first observation always returns
    /// `false` ("unknown") since there is nothing yet to compare against.
    pub fn should_freeze(&mut self, proc_root: &Path, config: &Config) -> bool {
        let Some(meminfo) = procfs::read_meminfo(proc_root) else {
            return false;
        };
        let available = meminfo.mem_available_kb as f64
            + config.oom_swap_weight * meminfo.swap_free_kb as f64;
        let total = meminfo.mem_total_kb as f64 + config.oom_swap_weight * meminfo.swap_total_kb as f64;
        let now = std::time::Instant::now();

        let Some((prev_time, prev_available)) = self.prev else {
            self.prev = Some((now, available));
            return false;
        };
        self.prev = Some((now, available));

        if available >= prev_available {
            // Not declining.
            return false;
        }
        if total <= 0.0 {
            return false;
        }
        if available / total >= config.oom_low_pct / 100.0 {
            // Plenty of room even though it's declining.
            return false;
        }

        let dt = now.duration_since(prev_time).as_secs_f64();
        if dt <= 0.0 {
            return false;
        }
        let rate = (prev_available - available) / dt;
        if rate <= 0.0 {
            return false;
        }
        let eta = available / rate;
        eta < config.oom_horizon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, StorageTypeSetting};
    use std::fs;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_meminfo(dir: &Path, mem_available_kb: u64, swap_free_kb: u64) {
        fs::write(
            dir.join("meminfo"),
            format!(
                "MemTotal:       16000000 kB\nMemAvailable:   {mem_available_kb} kB\nSwapTotal:       8000000 kB\nSwapFree:        {swap_free_kb} kB\n"
            ),
        )
        .unwrap();
    }

    fn config(oom_horizon: f64, oom_low_pct: f64, oom_swap_weight: f64) -> Config {
        let cli = CliArgs {
            oom_horizon: Some(oom_horizon),
            oom_low_pct: Some(oom_low_pct),
            oom_swap_weight: Some(oom_swap_weight),
            storage_type: Some(StorageTypeSetting::Hdd),
            ..Default::default()
        };
        Config::resolve(&cli)
    }

    #[test]
    fn first_observation_never_fires() {
        let dir = TempDir::new().unwrap();
        write_meminfo(dir.path(), 2_000_000, 1_000_000);
        let mut predictor = OomPredictor::new();
        let config = config(10.0, 10.0, 2.0);
        assert!(!predictor.should_freeze(dir.path(), &config));
    }

    #[test]
    fn rising_availability_never_fires() {
        let dir = TempDir::new().unwrap();
        let config = config(3600.0, 10.0, 2.0);
        let mut predictor = OomPredictor::new();
        write_meminfo(dir.path(), 500_000, 500_000);
        predictor.should_freeze(dir.path(), &config);
        sleep(Duration::from_millis(5));
        write_meminfo(dir.path(), 2_000_000, 2_000_000);
        assert!(!predictor.should_freeze(dir.path(), &config));
    }

    #[test]
    fn plenty_of_room_suppresses_prediction_even_when_declining() {
        let dir = TempDir::new().unwrap();
        // total = 16M + 2*8M = 32M kB; 18% available is far above a 10% low_pct.
        let config = config(3600.0, 10.0, 2.0);
        let mut predictor = OomPredictor::new();
        write_meminfo(dir.path(), 8_000_000, 4_000_000);
        predictor.should_freeze(dir.path(), &config);
        sleep(Duration::from_millis(5));
        write_meminfo(dir.path(), 7_000_000, 3_500_000);
        assert!(!predictor.should_freeze(dir.path(), &config));
    }
}
