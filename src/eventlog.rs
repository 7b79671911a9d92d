//! The durable event log and the persisted frozen-pid-list state file.
//!
//! Grounded on `get_date_string`, `get_process_info`, `log_frozen`,
//! `log_unfrozen` and `ignore_failure`. The two side-effecting writes -
//! the append-only log and the single-line state file - are kept
//! together here since every call site needs both.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Local;

use crate::config::Config;
use crate::freezer::FrozenRegistry;
use crate::procfs;

const DEFAULT_LOG_PATH: &str = "/var/log/thrash-protect.log";
const DEFAULT_STATE_PATH: &str = "/tmp/thrash-protect-frozen-pid-list";

/// Owns the two paths the control loop writes to, so tests can point
/// both at a temporary directory.
pub struct EventLog {
    log_path: PathBuf,
    state_path: PathBuf,
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
        }
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths(log_path: PathBuf, state_path: PathBuf) -> Self {
        EventLog { log_path, state_path }
    }

    /// Runs `method`, funneling any failure into a `tracing::error!` so a
    /// logging hiccup never aborts the calling tick.
    pub fn ignore_and_report(&self, method: impl FnOnce() -> std::io::Result<()>) {
        if let Err(e) = method() {
            tracing::error!(error = %e, "event log write failed, ignoring");
        }
    }

    fn timestamp(&self, config: &Config) -> String {
        if config.date_human_readable {
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            format!("{}.{:03}", now.as_secs(), now.subsec_millis())
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(line.as_bytes())
    }

    fn write_state_file(&self, registry: &FrozenRegistry) -> std::io::Result<()> {
        let all_frozen = registry.all_frozen_pids();
        if all_frozen.is_empty() {
            match std::fs::remove_file(&self.state_path) {
                Ok(()) | Err(_) => Ok(()),
            }
        } else {
            let line = all_frozen
                .iter()
                .map(|chain| {
                    chain
                        .pids()
                        .iter()
                        .map(i32::to_string)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
                .join(" ");
            std::fs::write(&self.state_path, format!("{line}\n"))
        }
    }

    fn frozen_list_repr(registry: &FrozenRegistry) -> String {
        let groups: Vec<String> = registry
            .all_frozen_pids()
            .iter()
            .map(|chain| {
                format!(
                    "[{}]",
                    chain
                        .pids()
                        .iter()
                        .map(i32::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
            .collect();
        format!("[{}]", groups.join(", "))
    }

    pub fn log_frozen(&self, pid: i32, registry: &FrozenRegistry, config: &Config) -> std::io::Result<()> {
        let ts = self.timestamp(config);
        let line = if config.log_user_data_on_freeze {
            format!(
                "{ts} - frozen   pid {pid:>5} - {} - list: {}\n",
                describe_process(pid),
                Self::frozen_list_repr(registry)
            )
        } else {
            format!(
                "{ts} - frozen pid {pid} - frozen list: {}\n",
                Self::frozen_list_repr(registry)
            )
        };
        self.append_line(&line)?;
        // The state file always reflects every frozen chain, not just
        // this one event, so unfreeze-at-startup recovers everything.
        self.write_state_file(registry)
    }

    pub fn log_unfrozen(&self, pid: i32, registry: &FrozenRegistry, config: &Config) -> std::io::Result<()> {
        let ts = self.timestamp(config);
        let line = if config.log_user_data_on_unfreeze {
            format!(
                "{ts} - unfrozen   pid {pid:>5} - {} - list: {}\n",
                describe_process(pid),
                Self::frozen_list_repr(registry)
            )
        } else {
            format!("{ts} - unfrozen pid {pid}\n")
        };
        self.append_line(&line)?;
        self.write_state_file(registry)
    }

    /// Called once at startup: every pid on the persisted state line is
    /// unconditionally SIGCONTed (a crash may have left them stopped),
    /// then the file is removed.
    pub fn unfreeze_from_state_file(&self) {
        let Ok(contents) = std::fs::read_to_string(&self.state_path) else {
            return;
        };
        for pid in contents.split_whitespace().filter_map(|s| s.parse::<i32>().ok()) {
            unsafe {
                libc::kill(pid, libc::SIGCONT);
            }
        }
        let _ = std::fs::remove_file(&self.state_path);
    }
}

/// Compares a pid's observed `T`-state against what the freezer/unfreezer
/// just tried to put it in, and logs a warning on mismatch. Gated on
/// `config.debug_checkstate` since it costs an extra `/proc/<pid>/stat`
/// read per signalled pid; a process that exits between the signal and
/// this check is not a mismatch and is silently ignored.
pub fn debug_check_state(proc_root: &Path, pid: i32, expected_stopped: bool, config: &Config) {
    if !config.debug_checkstate {
        return;
    }
    let Some(stat) = procfs::read_proc_stat(proc_root, pid) else {
        return;
    };
    let actually_stopped = stat.state == 'T';
    if actually_stopped != expected_stopped {
        tracing::warn!(
            pid,
            expected_stopped,
            observed_state = %stat.state,
            "pid state mismatch after freeze/unfreeze signal"
        );
    }
}

/// Best-effort `ps -p <pid> uf` side channel; never invoked from the
/// critical freeze path itself, only used to decorate a log line that is
/// already wrapped in [`EventLog::ignore_and_report`].
fn describe_process(pid: i32) -> String {
    let output = Command::new("ps").arg("-p").arg(pid.to_string()).arg("uf").output();
    let Ok(output) = output else {
        return "problem fetching process information".to_string();
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let Some(data_line) = text.lines().nth(1) else {
        return "No information available, the process was probably killed or 'ps' returns unexpected output."
            .to_string();
    };
    let fields: Vec<&str> = data_line.split_whitespace().collect();
    if fields.len() >= 11 {
        format!(
            "u:{:>10}  CPU:{:>5}%  MEM:{:>5}%  CMD: {}",
            fields[0],
            fields[2],
            fields[3],
            fields[10..].join(" ")
        )
    } else {
        "No information available, the process was probably killed or 'ps' returns unexpected output.".to_string()
    }
}
