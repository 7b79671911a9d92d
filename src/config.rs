//! Configuration resolution: defaults, overlaid by an optional TOML file,
//! overlaid by `THRASH_PROTECT_*` environment variables, overlaid by CLI
//! flags - the same four-layer priority the original daemon's
//! `load_config` implements, narrowed from its four supported file formats
//! (YAML/TOML/JSON/INI) to TOML alone, since that is the format already
//! present in this crate's dependency stack.
//!
//! The result is a single immutable [`Config`] value built once in `main`
//! and shared by reference into every component.

use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::storage::StorageType;

const DEFAULT_CONFIG_PATH: &str = "/etc/thrash-protect.toml";

const STATIC_WHITELIST: &[&str] = &[
    "sshd", "ssh", "xterm", "rxvt", "urxvt", "alacritty", "kitty", "foot", "screen", "SCREEN",
    "tmux", "xinit", "X", "Xorg", "Xorg.bin", "sway", "wayfire", "hyprland", "spectrwm", "i3",
    "dwm", "openbox", "awesome", "bspwm", "gnome-shell", "kwin_x11", "kwin_wayland", "plasmashell",
    "xfce4-session", "systemd-journal", "dbus-daemon",
];

fn shells_from_etc() -> Vec<String> {
    let shells = crate::procfs::read_shell_basenames(Path::new("/etc/shells"));
    if shells.is_empty() {
        vec!["bash".into(), "sh".into(), "zsh".into(), "fish".into()]
    } else {
        shells
    }
}

fn default_whitelist() -> Vec<String> {
    let mut set: Vec<String> = STATIC_WHITELIST.iter().map(|s| s.to_string()).collect();
    for shell in shells_from_etc() {
        if !set.contains(&shell) {
            set.push(shell);
        }
    }
    set
}

fn default_jobctrllist() -> Vec<String> {
    let mut shells = shells_from_etc();
    if !shells.iter().any(|s| s == "sudo") {
        shells.push("sudo".to_string());
    }
    shells
}

/// Command-line surface, layered on top of file/env/defaults.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Protect a Linux host from thrashing by temporarily suspending processes")]
pub struct CliArgs {
    /// Configuration file path (TOML). Defaults to /etc/thrash-protect.toml if present.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Enable debug logging to stderr.
    #[arg(long)]
    pub debug_logging: bool,

    /// Enable verbose per-tick diagnostic logging.
    #[arg(long)]
    pub diagnostic_logging: bool,

    /// Log warnings when a process's observed state mismatches expectations.
    #[arg(long)]
    pub debug_checkstate: bool,

    /// Sleep interval between checks, in seconds.
    #[arg(long)]
    pub interval: Option<f64>,

    /// Number of swap pages to trigger action.
    #[arg(long)]
    pub swap_page_threshold: Option<u64>,

    /// Major page faults before the page-fault selector runs its heavy scan.
    #[arg(long)]
    pub pgmajfault_scan_threshold: Option<u64>,

    /// Use PSI for thrash detection if available.
    #[arg(long)]
    pub use_psi: Option<bool>,

    /// PSI some-avg10 percentage to trigger action.
    #[arg(long)]
    pub psi_threshold: Option<f64>,

    /// Processes to protect from suspension.
    #[arg(long, num_args = 1..)]
    pub cmd_whitelist: Option<Vec<String>>,

    /// Processes to prioritize for suspension.
    #[arg(long, num_args = 1..)]
    pub cmd_blacklist: Option<Vec<String>>,

    /// Processes with job control - the parent is suspended too.
    #[arg(long, num_args = 1..)]
    pub cmd_jobctrllist: Option<Vec<String>>,

    /// Score multiplier for blacklisted processes.
    #[arg(long)]
    pub blacklist_score_multiplier: Option<f64>,

    /// Score divider for whitelisted processes.
    #[arg(long)]
    pub whitelist_score_divider: Option<f64>,

    /// Ratio of queue pops vs stack pops when unfreezing.
    #[arg(long)]
    pub unfreeze_pop_ratio: Option<u32>,

    /// Enable the proactive OOM predictor.
    #[arg(long)]
    pub oom_protection: Option<bool>,

    /// Seconds of projected runway below which the predictor fires.
    #[arg(long)]
    pub oom_horizon: Option<f64>,

    /// Weight given to free swap in the OOM predictor's availability metric.
    #[arg(long)]
    pub oom_swap_weight: Option<f64>,

    /// Percentage of total memory+swap below which the predictor is armed.
    #[arg(long)]
    pub oom_low_pct: Option<f64>,

    /// Swap storage type: auto, ssd or hdd.
    #[arg(long)]
    pub storage_type: Option<StorageTypeSetting>,

    /// Pretend thrashing every 2^N iterations, for deterministic testing.
    #[arg(long)]
    pub test_mode: Option<u32>,

    /// Log detailed process info when freezing.
    #[arg(long)]
    pub log_user_data_on_freeze: Option<bool>,

    /// Log detailed process info when unfreezing.
    #[arg(long)]
    pub log_user_data_on_unfreeze: Option<bool>,

    /// Use human-readable local timestamps in the event log instead of Unix seconds.
    #[arg(long)]
    pub date_human_readable: Option<bool>,
}

/// The user-facing `storage_type` setting before auto-detection resolves it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTypeSetting {
    #[default]
    Auto,
    Ssd,
    Hdd,
}

/// Mirrors [`CliArgs`]' optional fields for TOML deserialization, so a
/// config file may specify any subset of keys.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct FileConfig {
    interval: Option<f64>,
    swap_page_threshold: Option<u64>,
    pgmajfault_scan_threshold: Option<u64>,
    use_psi: Option<bool>,
    psi_threshold: Option<f64>,
    cmd_whitelist: Option<Vec<String>>,
    cmd_blacklist: Option<Vec<String>>,
    cmd_jobctrllist: Option<Vec<String>>,
    blacklist_score_multiplier: Option<f64>,
    whitelist_score_divider: Option<f64>,
    unfreeze_pop_ratio: Option<u32>,
    oom_protection: Option<bool>,
    oom_horizon: Option<f64>,
    oom_swap_weight: Option<f64>,
    oom_low_pct: Option<f64>,
    storage_type: Option<StorageTypeSetting>,
    test_mode: Option<u32>,
    debug_logging: Option<bool>,
    diagnostic_logging: Option<bool>,
    debug_checkstate: Option<bool>,
    log_user_data_on_freeze: Option<bool>,
    log_user_data_on_unfreeze: Option<bool>,
    date_human_readable: Option<bool>,
}

/// Fully resolved, immutable configuration record. Built once in `main`
/// via [`Config::resolve`] and shared by reference thereafter.
#[derive(Debug)]
pub struct Config {
    pub interval: f64,
    pub swap_page_threshold: u64,
    pub pgmajfault_scan_threshold: u64,
    pub use_psi: bool,
    pub psi_threshold: f64,
    pub cmd_whitelist: Vec<String>,
    pub cmd_blacklist: Vec<String>,
    pub cmd_jobctrllist: Vec<String>,
    pub blacklist_score_multiplier: f64,
    pub whitelist_score_divider: f64,
    pub unfreeze_pop_ratio: u32,
    pub oom_protection: bool,
    pub oom_horizon: f64,
    pub oom_swap_weight: f64,
    pub oom_low_pct: f64,
    pub storage_type: StorageType,
    pub test_mode: u32,
    pub debug_logging: bool,
    pub diagnostic_logging: bool,
    pub debug_checkstate: bool,
    pub log_user_data_on_freeze: bool,
    pub log_user_data_on_unfreeze: bool,
    pub date_human_readable: bool,
    /// Auto-tuned by the detector at runtime; seeded from `interval / 8.0`.
    pub max_acceptable_time_delta: std::sync::atomic::AtomicU64,
}

fn env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key)
        .ok()
        .map(|v| v.split_whitespace().map(str::to_string).collect())
}

fn load_file_config(path: Option<&Path>) -> FileConfig {
    let candidate = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let Ok(text) = std::fs::read_to_string(&candidate) else {
        return FileConfig::default();
    };
    toml::from_str(&text).unwrap_or_else(|e| {
        tracing::warn!(path = %candidate.display(), error = %e, "failed to parse config file, ignoring");
        FileConfig::default()
    })
}

impl Config {
    /// Resolves the four configuration layers (defaults, file, env, CLI)
    /// into one immutable record, then applies storage-aware defaults for
    /// `swap_page_threshold` and `oom_swap_weight` unless the operator set
    /// them explicitly.
    pub fn resolve(cli: &CliArgs) -> Config {
        let file = load_file_config(cli.config.as_deref());

        macro_rules! layer {
            ($field:ident, $default:expr, $env_key:literal) => {
                cli.$field
                    .clone()
                    .or(env_var($env_key))
                    .or(file.$field.clone())
                    .unwrap_or($default)
            };
        }

        let swap_page_threshold_explicit = cli.swap_page_threshold.is_some()
            || file.swap_page_threshold.is_some()
            || env_var::<u64>("THRASH_PROTECT_SWAP_PAGE_THRESHOLD").is_some();
        let oom_swap_weight_explicit = cli.oom_swap_weight.is_some()
            || file.oom_swap_weight.is_some()
            || env_var::<f64>("THRASH_PROTECT_OOM_SWAP_WEIGHT").is_some();

        let storage_setting = cli.storage_type.or(file.storage_type).unwrap_or_default();
        let storage_type = match storage_setting {
            StorageTypeSetting::Ssd => StorageType::Ssd,
            StorageTypeSetting::Hdd => StorageType::Hdd,
            StorageTypeSetting::Auto => crate::storage::detect_swap_storage(Path::new("/proc")),
        };

        let swap_page_threshold = if swap_page_threshold_explicit {
            layer!(swap_page_threshold, 4, "THRASH_PROTECT_SWAP_PAGE_THRESHOLD")
        } else {
            match storage_type {
                StorageType::Ssd => 64,
                _ => 4,
            }
        };

        let oom_swap_weight = if oom_swap_weight_explicit {
            layer!(oom_swap_weight, 2.0, "THRASH_PROTECT_OOM_SWAP_WEIGHT")
        } else {
            match storage_type {
                StorageType::Ssd => 2.0,
                _ => 4.0,
            }
        };

        let pgmajfault_scan_threshold = cli
            .pgmajfault_scan_threshold
            .or_else(|| env_var("THRASH_PROTECT_PGMAJFAULT_SCAN_THRESHOLD"))
            .or(file.pgmajfault_scan_threshold)
            .unwrap_or(swap_page_threshold * 4);

        let interval = layer!(interval, 0.5, "THRASH_PROTECT_INTERVAL");

        let cmd_whitelist = {
            let mut base = default_whitelist();
            if let Some(extra) = cli
                .cmd_whitelist
                .clone()
                .or_else(|| env_list("THRASH_PROTECT_CMD_WHITELIST"))
                .or(file.cmd_whitelist.clone())
            {
                for item in extra {
                    if !base.contains(&item) {
                        base.push(item);
                    }
                }
            }
            base
        };

        let cmd_jobctrllist = {
            let mut base = default_jobctrllist();
            if let Some(extra) = cli
                .cmd_jobctrllist
                .clone()
                .or_else(|| env_list("THRASH_PROTECT_CMD_JOBCTRLLIST"))
                .or(file.cmd_jobctrllist.clone())
            {
                for item in extra {
                    if !base.contains(&item) {
                        base.push(item);
                    }
                }
            }
            base
        };

        let cmd_blacklist = cli
            .cmd_blacklist
            .clone()
            .or_else(|| env_list("THRASH_PROTECT_CMD_BLACKLIST"))
            .or(file.cmd_blacklist.clone())
            .unwrap_or_default();

        Config {
            interval,
            swap_page_threshold,
            pgmajfault_scan_threshold,
            use_psi: layer!(use_psi, true, "THRASH_PROTECT_USE_PSI"),
            psi_threshold: layer!(psi_threshold, 5.0, "THRASH_PROTECT_PSI_THRESHOLD"),
            cmd_whitelist,
            cmd_blacklist,
            cmd_jobctrllist,
            blacklist_score_multiplier: layer!(
                blacklist_score_multiplier,
                16.0,
                "THRASH_PROTECT_BLACKLIST_SCORE_MULTIPLIER"
            ),
            whitelist_score_divider: layer!(
                whitelist_score_divider,
                64.0,
                "THRASH_PROTECT_WHITELIST_SCORE_DIVIDER"
            ),
            unfreeze_pop_ratio: layer!(unfreeze_pop_ratio, 5, "THRASH_PROTECT_UNFREEZE_POP_RATIO"),
            oom_protection: layer!(oom_protection, true, "THRASH_PROTECT_OOM_PROTECTION"),
            oom_horizon: layer!(oom_horizon, 3600.0, "THRASH_PROTECT_OOM_HORIZON"),
            oom_swap_weight,
            oom_low_pct: layer!(oom_low_pct, 10.0, "THRASH_PROTECT_OOM_LOW_PCT"),
            storage_type,
            test_mode: layer!(test_mode, 0, "THRASH_PROTECT_TEST_MODE"),
            debug_logging: cli.debug_logging || file.debug_logging.unwrap_or(false),
            diagnostic_logging: cli.diagnostic_logging || file.diagnostic_logging.unwrap_or(false),
            debug_checkstate: cli.debug_checkstate || file.debug_checkstate.unwrap_or(false),
            log_user_data_on_freeze: layer!(
                log_user_data_on_freeze,
                false,
                "THRASH_PROTECT_LOG_USER_DATA_ON_FREEZE"
            ),
            log_user_data_on_unfreeze: layer!(
                log_user_data_on_unfreeze,
                true,
                "THRASH_PROTECT_LOG_USER_DATA_ON_UNFREEZE"
            ),
            date_human_readable: layer!(
                date_human_readable,
                true,
                "THRASH_PROTECT_DATE_HUMAN_READABLE"
            ),
            max_acceptable_time_delta: std::sync::atomic::AtomicU64::new((interval / 8.0).to_bits()),
        }
    }

    pub fn max_acceptable_time_delta(&self) -> f64 {
        f64::from_bits(
            self.max_acceptable_time_delta
                .load(std::sync::atomic::Ordering::Relaxed),
        )
    }

    pub fn set_max_acceptable_time_delta(&self, value: f64) {
        self.max_acceptable_time_delta
            .store(value.to_bits(), std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_pgmajfault_threshold_from_swap_threshold() {
        let cli = CliArgs {
            swap_page_threshold: Some(10),
            storage_type: Some(StorageTypeSetting::Ssd),
            ..Default::default()
        };
        let cfg = Config::resolve(&cli);
        assert_eq!(cfg.swap_page_threshold, 10);
        assert_eq!(cfg.pgmajfault_scan_threshold, 40);
    }

    #[test]
    fn ssd_storage_setting_bumps_swap_page_threshold_default() {
        let cli = CliArgs {
            storage_type: Some(StorageTypeSetting::Ssd),
            ..Default::default()
        };
        let cfg = Config::resolve(&cli);
        assert_eq!(cfg.swap_page_threshold, 64);
        assert_eq!(cfg.oom_swap_weight, 2.0);
    }

    #[test]
    fn hdd_storage_setting_keeps_default_swap_page_threshold() {
        let cli = CliArgs {
            storage_type: Some(StorageTypeSetting::Hdd),
            ..Default::default()
        };
        let cfg = Config::resolve(&cli);
        assert_eq!(cfg.swap_page_threshold, 4);
        assert_eq!(cfg.oom_swap_weight, 4.0);
    }

    #[test]
    fn explicit_swap_page_threshold_overrides_storage_default() {
        let cli = CliArgs {
            storage_type: Some(StorageTypeSetting::Ssd),
            swap_page_threshold: Some(7),
            ..Default::default()
        };
        let cfg = Config::resolve(&cli);
        assert_eq!(cfg.swap_page_threshold, 7);
    }

    #[test]
    fn max_acceptable_time_delta_derives_from_interval() {
        let cli = CliArgs {
            interval: Some(1.6),
            storage_type: Some(StorageTypeSetting::Hdd),
            ..Default::default()
        };
        let cfg = Config::resolve(&cli);
        assert_eq!(cfg.max_acceptable_time_delta(), 0.2);
    }

    #[test]
    fn default_whitelist_includes_static_entries() {
        let cli = CliArgs {
            storage_type: Some(StorageTypeSetting::Hdd),
            ..Default::default()
        };
        let cfg = Config::resolve(&cli);
        assert!(cfg.cmd_whitelist.contains(&"sshd".to_string()));
        assert!(cfg.cmd_whitelist.contains(&"tmux".to_string()));
    }
}
