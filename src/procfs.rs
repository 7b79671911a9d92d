//! Stateless readers over `/proc`.
//!
//! Every function here takes an explicit root path rather than hard-coding
//! `/proc` so that tests can point them at a temporary directory tree built
//! with fake files, the same trick the `procfs` crate uses for its `Proc`
//! handles (`root: PathBuf`, joined with relative paths on every read).
//! Nothing here ever panics: a missing or malformed file becomes `None`,
//! which callers collapse into "process gone" or "probe unavailable" per
//! the error policy in [`crate::error`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One pressure-stall-information line: `avg10/avg60/avg300` percentages
/// plus a cumulative `total` in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PsiMetrics {
    pub avg10: f64,
    pub avg60: f64,
    pub avg300: f64,
    pub total: u64,
}

/// The full contents of a `.../pressure/memory`-shaped file: the `some`
/// line is always present when the file exists, `full` only on kernels new
/// enough to report it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PsiRecord {
    pub some: PsiMetrics,
    pub full: Option<PsiMetrics>,
}

fn extract_psi_value(line: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    line.split_whitespace()
        .find_map(|word| word.strip_prefix(prefix.as_str()).map(str::to_string))
}

fn parse_psi_metrics(line: &str) -> Option<PsiMetrics> {
    Some(PsiMetrics {
        avg10: extract_psi_value(line, "avg10")?.parse().ok()?,
        avg60: extract_psi_value(line, "avg60")?.parse().ok()?,
        avg300: extract_psi_value(line, "avg300")?.parse().ok()?,
        total: extract_psi_value(line, "total")?.parse().ok()?,
    })
}

/// Reads a PSI-formatted pressure file (`/proc/pressure/memory` or a
/// per-cgroup `memory.pressure`). Returns `None` if the file does not
/// exist or cannot be parsed at all.
pub fn read_pressure(path: &Path) -> Option<PsiRecord> {
    let contents = fs::read_to_string(path).ok()?;
    let mut some = None;
    let mut full = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("some ") {
            some = parse_psi_metrics(&format!("some {rest}"));
        } else if let Some(rest) = line.strip_prefix("full ") {
            full = parse_psi_metrics(&format!("full {rest}"));
        }
    }
    Some(PsiRecord {
        some: some?,
        full,
    })
}

/// Snapshot of the handful of `/proc/vmstat` counters the detector cares
/// about: the cumulative major-fault count, and the swap in/out counters
/// in the order they appear in the file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmStat {
    pub pgmajfault: u64,
    pub swap_counters: Vec<u64>,
}

/// Reads `<proc_root>/vmstat`, extracting `pgmajfault` and every `pswp*`
/// line in file order (normally `pswpin` then `pswpout`).
pub fn read_vmstat(proc_root: &Path) -> Option<VmStat> {
    let contents = fs::read_to_string(proc_root.join("vmstat")).ok()?;
    let mut pgmajfault = None;
    let mut swap_counters = Vec::new();
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("pgmajfault ") {
            pgmajfault = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("pswp") {
            if let Some((_, value)) = rest.split_once(' ') {
                if let Ok(v) = value.trim().parse() {
                    swap_counters.push(v);
                }
            }
        }
    }
    Some(VmStat {
        pgmajfault: pgmajfault?,
        swap_counters,
    })
}

/// The subset of `/proc/meminfo` the OOM predictor and storage detection
/// need, in kB.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MemInfo {
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

pub fn read_meminfo(proc_root: &Path) -> Option<MemInfo> {
    let contents = fs::read_to_string(proc_root.join("meminfo")).ok()?;
    let mut values: HashMap<&str, u64> = HashMap::new();
    for line in contents.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let n = rest
            .trim()
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok());
        if let Some(n) = n {
            values.insert(key, n);
        }
    }
    Some(MemInfo {
        mem_total_kb: *values.get("MemTotal")?,
        mem_available_kb: *values.get("MemAvailable")?,
        swap_total_kb: *values.get("SwapTotal")?,
        swap_free_kb: *values.get("SwapFree")?,
    })
}

/// The fields of `/proc/<pid>/stat` the selectors need. `cmd` is the
/// literal parenthesised program name, decoded lossily - the source bytes
/// may contain unbalanced parens or invalid UTF-8 (observed in the wild,
/// see the upstream tracker issue about CJK process names getting
/// truncated by naive parsers).
#[derive(Clone, Debug, PartialEq)]
pub struct ProcStat {
    pub cmd: String,
    pub state: char,
    pub ppid: i32,
    pub majflt: u64,
}

/// Parses raw `/proc/<pid>/stat` bytes per the split-on-first-`(`,
/// rsplit-on-last-`)` rule: everything between is the opaque `cmd`, the
/// remainder splits on spaces into numeric fields indexed from `state=0`.
pub fn parse_stat_bytes(bytes: &[u8]) -> Option<ProcStat> {
    let open = bytes.iter().position(|&b| b == b'(')?;
    let close = bytes.iter().rposition(|&b| b == b')')?;
    if close <= open {
        return None;
    }
    let cmd = String::from_utf8_lossy(&bytes[open + 1..close]).into_owned();
    let rest = std::str::from_utf8(&bytes[close + 1..]).ok()?;
    let fields: Vec<&str> = rest.split(' ').filter(|s| !s.is_empty()).collect();
    let state = fields.first()?.chars().next()?;
    let ppid: i32 = fields.get(1)?.parse().ok()?;
    let majflt: u64 = fields.get(9)?.parse().ok()?;
    Some(ProcStat {
        cmd,
        state,
        ppid,
        majflt,
    })
}

/// Reads and parses `<proc_root>/<pid>/stat`. `None` covers both "process
/// gone" and "unparseable" - both are treated identically by callers.
pub fn read_proc_stat(proc_root: &Path, pid: i32) -> Option<ProcStat> {
    let bytes = fs::read(proc_root.join(pid.to_string()).join("stat")).ok()?;
    parse_stat_bytes(&bytes)
}

/// Reads `<proc_root>/<pid>/oom_score` as a plain integer.
pub fn read_oom_score(proc_root: &Path, pid: i32) -> Option<i64> {
    fs::read_to_string(proc_root.join(pid.to_string()).join("oom_score"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Resolves the cgroup v2 path for a pid from `<proc_root>/<pid>/cgroup`,
/// joined onto `cgroup_root` (normally `/sys/fs/cgroup`). Lines are
/// `hier:controllers:path`; the v2 line has an empty hierarchy id.
pub fn read_cgroup_path(proc_root: &Path, cgroup_root: &Path, pid: i32) -> Option<PathBuf> {
    let contents = fs::read_to_string(proc_root.join(pid.to_string()).join("cgroup")).ok()?;
    for line in contents.lines() {
        let mut parts = line.splitn(3, ':');
        let hier = parts.next()?;
        let _controllers = parts.next()?;
        let path = parts.next()?;
        if hier == "0" {
            let rel = path.strip_prefix('/').unwrap_or(path);
            return Some(cgroup_root.join(rel));
        }
    }
    None
}

/// Lists every numeric entry directly under `proc_root` - i.e. every pid
/// currently visible, in arbitrary order. Stands in for `glob.glob("/proc/*/stat")`.
pub fn list_pids(proc_root: &Path) -> Vec<i32> {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .collect()
}

/// Parses `/proc/swaps`: first column is the device path, header line
/// skipped.
pub fn read_swap_devices(proc_root: &Path) -> Vec<PathBuf> {
    let Ok(contents) = fs::read_to_string(proc_root.join("swaps")) else {
        return Vec::new();
    };
    contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(PathBuf::from)
        .collect()
}

/// Parses `/etc/shells`-style files: one path per line, `#` comments,
/// returning basenames only.
pub fn read_shell_basenames(shells_path: &Path) -> Vec<String> {
    let Ok(contents) = fs::read_to_string(shells_path) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.rsplit('/').next())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, contents: &[u8]) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn parses_stat_with_balanced_cmd() {
        let line = b"10 (cat) R 9 11054 16079 34823 11054 4202496 122 0 321 0 0 0 0 0 20 0 1 0\n";
        let stat = parse_stat_bytes(line).unwrap();
        assert_eq!(stat.cmd, "cat");
        assert_eq!(stat.state, 'R');
        assert_eq!(stat.ppid, 9);
        assert_eq!(stat.majflt, 321);
    }

    #[test]
    fn parses_stat_with_invalid_utf8_and_embedded_parens() {
        // mirrors the upstream regression: a cmd containing raw non-UTF-8
        // bytes and no closing paren before the real one.
        let mut line = b"16077 (".to_vec();
        line.extend_from_slice(&[0xd0, 0x99, 0xd0, 0xa6, 0xd0]);
        line.extend_from_slice(b") S 3451 16077 16077 0 -1 4202496 1915 87 0 0 49 21 0\n");
        let stat = parse_stat_bytes(&line).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 3451);
        assert_eq!(stat.majflt, 87);
    }

    #[test]
    fn read_proc_stat_returns_none_for_missing_pid() {
        let dir = TempDir::new().unwrap();
        assert!(read_proc_stat(dir.path(), 99999).is_none());
    }

    #[test]
    fn reads_vmstat_counters_in_file_order() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "vmstat",
            b"nr_free_pages 12345\npgmajfault 42\npswpin 3\npswpout 7\n",
        );
        let vm = read_vmstat(dir.path()).unwrap();
        assert_eq!(vm.pgmajfault, 42);
        assert_eq!(vm.swap_counters, vec![3, 7]);
    }

    #[test]
    fn reads_meminfo() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "meminfo",
            b"MemTotal:       16000000 kB\nMemAvailable:    4000000 kB\nSwapTotal:       8000000 kB\nSwapFree:        1000000 kB\n",
        );
        let mi = read_meminfo(dir.path()).unwrap();
        assert_eq!(mi.mem_total_kb, 16_000_000);
        assert_eq!(mi.mem_available_kb, 4_000_000);
        assert_eq!(mi.swap_total_kb, 8_000_000);
        assert_eq!(mi.swap_free_kb, 1_000_000);
    }

    #[test]
    fn reads_psi_some_and_full() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "pressure/memory",
            b"some avg10=12.50 avg60=8.20 avg300=1.10 total=123456\nfull avg10=3.20 avg60=1.00 avg300=0.10 total=4567\n",
        );
        let psi = read_pressure(&dir.path().join("pressure/memory")).unwrap();
        assert_eq!(psi.some.avg10, 12.50);
        assert_eq!(psi.full.unwrap().avg10, 3.20);
    }

    #[test]
    fn reads_shell_basenames_skipping_comments() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "shells", b"# comment\n/bin/bash\n/usr/bin/zsh\n\n");
        let shells = read_shell_basenames(&dir.path().join("shells"));
        assert_eq!(shells, vec!["bash".to_string(), "zsh".to_string()]);
    }

    #[test]
    fn resolves_cgroup_v2_path() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "7/cgroup", b"0::/user.slice/user-1000.slice/session-1.scope\n");
        let path = read_cgroup_path(dir.path(), Path::new("/sys/fs/cgroup"), 7).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/sys/fs/cgroup/user.slice/user-1000.slice/session-1.scope")
        );
    }
}
