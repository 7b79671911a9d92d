//! Thrash detector: compares two consecutive [`SystemState`] samples and
//! decides whether the host is currently thrashing, maintaining a
//! cooldown counter and an auto-tuned timing threshold along the way.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Config;
use crate::state::SystemState;

/// Tiny xorshift64 PRNG used only by `test_mode`'s forced-trigger coin
/// flip. No external crate in this dependency stack provides randomness,
/// and this is not security-sensitive, so a hand-rolled generator seeded
/// from the previous draw is sufficient.
static RNG_STATE: AtomicU64 = AtomicU64::new(0x9E3779B97F4A7C15);

fn next_random_u64() -> u64 {
    let mut x = RNG_STATE.load(Ordering::Relaxed);
    if x == 0 {
        x = 0x9E3779B97F4A7C15;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    RNG_STATE.store(x, Ordering::Relaxed);
    x
}

/// Exposes a few bits of the same PRNG to `test_mode`'s other consumer,
/// the page-fault selector's deterministic jitter.
pub fn test_mode_jitter() -> u64 {
    next_random_u64()
}

/// Returns true roughly 1-in-2^n of the time, mirroring
/// `random.getrandbits(n) == 0`.
fn random_bits_are_zero(n: u32) -> bool {
    if n == 0 {
        return true;
    }
    let mask = if n >= 64 { u64::MAX } else { (1u64 << n) - 1 };
    next_random_u64() & mask == 0
}

/// Stateless: all mutable state lives on the two `SystemState` values it is
/// handed each tick, plus the shared, interior-mutable
/// `max_acceptable_time_delta` on `Config`.
#[derive(Default)]
pub struct ThrashDetector;

impl ThrashDetector {
    /// Computes the swap product and optional PSI amplification, mutates
    /// `current.cooldown_counter` per the evolution rules, and returns
    /// whether the tick counts as "busy" (thrashing).
    pub fn check(&self, prev: &SystemState, current: &mut SystemState, config: &Config) -> bool {
        current.cooldown_counter = prev.cooldown_counter;

        if config.test_mode > 0 && random_bits_are_zero(config.test_mode) {
            current.cooldown_counter = prev.cooldown_counter + 1;
            return true;
        }

        let threshold = config.swap_page_threshold as f64;
        let delta_in = current.swapcount.0 as f64 - prev.swapcount.0 as f64;
        let delta_out = current.swapcount.1 as f64 - prev.swapcount.1 as f64;
        let swap_product = ((delta_in + 0.1) / threshold) * ((delta_out + 0.1) / threshold);

        let psi_weight = if config.use_psi {
            current
                .psi
                .as_ref()
                .map(|psi| 1.0 + psi.some.avg10 / config.psi_threshold)
                .unwrap_or(1.0)
        } else {
            1.0
        };

        let triggered = swap_product * psi_weight > 1.0;

        if triggered {
            current.cooldown_counter = prev.cooldown_counter + 1;
            if !prev.timer_alert {
                config.set_max_acceptable_time_delta(config.max_acceptable_time_delta() / 1.1);
            }
        } else if prev.cooldown_counter > 0
            && prev.swapcount == current.swapcount
            && current
                .timestamp
                .duration_since(prev.timestamp)
                .as_secs_f64()
                >= current.sleep_interval(config.interval)
        {
            current.cooldown_counter = prev.cooldown_counter - 1;
            if prev.timer_alert {
                config.set_max_acceptable_time_delta(config.max_acceptable_time_delta() * 1.1);
            }
        }

        triggered
    }

    /// Raises `timer_alert` and accelerates the loop if the actual elapsed
    /// time since `current.timestamp` exceeds the acceptable bound. Called
    /// once before sleeping (`expected_delay = 0`) and once after
    /// (`expected_delay = dt`), matching the control-loop pseudocode.
    pub fn check_delay(&self, current: &mut SystemState, config: &Config, expected_delay: f64) -> bool {
        let elapsed = current.timestamp.elapsed().as_secs_f64();
        let delta = elapsed - expected_delay;
        if delta > config.max_acceptable_time_delta() {
            current.cooldown_counter += 2;
            current.timer_alert = true;
            false
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, StorageTypeSetting};
    use crate::procfs::{PsiMetrics, PsiRecord};
    use std::time::Instant;

    fn config_with(swap_page_threshold: u64, psi_threshold: f64) -> Config {
        let cli = CliArgs {
            swap_page_threshold: Some(swap_page_threshold),
            psi_threshold: Some(psi_threshold),
            storage_type: Some(StorageTypeSetting::Hdd),
            ..Default::default()
        };
        Config::resolve(&cli)
    }

    fn state(swapcount: (u64, u64), psi_some_avg10: Option<f64>, cooldown: u32) -> SystemState {
        SystemState {
            timestamp: Instant::now(),
            pagefaults: 0,
            swapcount,
            psi: psi_some_avg10.map(|avg10| PsiRecord {
                some: PsiMetrics {
                    avg10,
                    ..Default::default()
                },
                full: None,
            }),
            cooldown_counter: cooldown,
            unfrozen_pid: None,
            timer_alert: false,
        }
    }

    #[test]
    fn no_swap_delta_does_not_trigger() {
        let config = config_with(4, 5.0);
        let prev = state((0, 0), None, 0);
        let mut cur = state((0, 0), None, 0);
        let detector = ThrashDetector;
        assert!(!detector.check(&prev, &mut cur, &config));
        assert_eq!(cur.cooldown_counter, 0);
    }

    #[test]
    fn bidirectional_swap_storm_triggers() {
        let config = config_with(4, 5.0);
        let prev = state((0, 0), None, 0);
        let mut cur = state((10, 10), None, 0);
        let detector = ThrashDetector;
        assert!(detector.check(&prev, &mut cur, &config));
        assert_eq!(cur.cooldown_counter, 1);
    }

    #[test]
    fn zero_swap_high_psi_does_not_trigger() {
        let config = config_with(4, 5.0);
        let prev = state((5, 5), None, 0);
        let mut cur = state((5, 5), Some(50.0), 0);
        let detector = ThrashDetector;
        assert!(!detector.check(&prev, &mut cur, &config));
    }

    #[test]
    fn psi_amplifies_moderate_swap_signal() {
        // prev=(0,0), cur=(3,3), T=4, psi_some_avg10=15, psi_threshold=5
        // swap_product = (3.1/4)*(3.1/4) = 0.6006..., psi_weight = 1+15/5 = 4
        // product ~= 2.4 > 1 -> trigger.
        let config = config_with(4, 5.0);
        let prev = state((0, 0), None, 0);
        let mut cur = state((3, 3), Some(15.0), 0);
        let detector = ThrashDetector;
        assert!(detector.check(&prev, &mut cur, &config));
    }

    #[test]
    fn cooldown_counter_never_goes_negative() {
        let config = config_with(4, 5.0);
        let prev = state((0, 0), None, 0);
        let mut cur = state((0, 0), None, 0);
        let detector = ThrashDetector;
        detector.check(&prev, &mut cur, &config);
        assert_eq!(cur.cooldown_counter, 0);
    }
}
