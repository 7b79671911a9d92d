//! Swap-storage auto-detection (spec-only: the source this crate is
//! grounded on has no notion of SSD vs HDD swap and always uses a fixed
//! `swap_page_threshold`; this module exists to serve the OOM predictor's
//! and detector's storage-aware defaults).
//!
//! Algorithm: resolve every device listed in `/proc/swaps`, stat it, walk
//! `/sys/dev/block/MAJOR:MINOR/` (following the symlink to the real device
//! directory, then stepping up one level for partitions) until a
//! `queue/rotational` file turns up. `0` means SSD, `1` means HDD. Several
//! swap devices with mixed types report HDD, the conservative choice.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageType {
    Ssd,
    Hdd,
    Unknown,
}

fn major_minor(rdev: u64) -> (u64, u64) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major, minor)
}

fn read_rotational(block_dir: &Path) -> Option<StorageType> {
    let direct = block_dir.join("queue/rotational");
    let contents = fs::read_to_string(&direct)
        .ok()
        .or_else(|| fs::read_to_string(block_dir.join("../queue/rotational")).ok())?;
    match contents.trim() {
        "0" => Some(StorageType::Ssd),
        "1" => Some(StorageType::Hdd),
        _ => None,
    }
}

fn detect_one_device(sys_root: &Path, device: &Path) -> Option<StorageType> {
    let real_path = fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
    let meta = fs::symlink_metadata(&real_path).ok()?;
    if !meta.file_type().is_block_device() {
        return None;
    }
    let (major, minor) = major_minor(meta.rdev());
    let block_dir = sys_root.join("dev/block").join(format!("{major}:{minor}"));
    read_rotational(&block_dir)
}

/// Inspects every device backing active swap and reports whether any of
/// them is rotational. Returns `Unknown` when `/proc/swaps` is empty or no
/// device yields a readable `queue/rotational`.
pub fn detect_swap_storage_with_roots(proc_root: &Path, sys_root: &Path) -> StorageType {
    let devices = crate::procfs::read_swap_devices(proc_root);
    if devices.is_empty() {
        return StorageType::Unknown;
    }
    let mut any_ssd = false;
    let mut any_hdd = false;
    for device in devices {
        match detect_one_device(sys_root, &device) {
            Some(StorageType::Hdd) => any_hdd = true,
            Some(StorageType::Ssd) => any_ssd = true,
            _ => {}
        }
    }
    if any_hdd {
        StorageType::Hdd
    } else if any_ssd {
        StorageType::Ssd
    } else {
        StorageType::Unknown
    }
}

/// Convenience wrapper over the real `/proc` and `/sys` roots.
pub fn detect_swap_storage(proc_root: &Path) -> StorageType {
    detect_swap_storage_with_roots(proc_root, Path::new("/sys"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn reports_unknown_when_no_swap_devices() {
        let proc = TempDir::new().unwrap();
        fs::write(proc.path().join("swaps"), "Filename Type Size Used Priority\n").unwrap();
        let sys = TempDir::new().unwrap();
        assert_eq!(
            detect_swap_storage_with_roots(proc.path(), sys.path()),
            StorageType::Unknown
        );
    }

    #[test]
    fn major_minor_decodes_glibc_encoding() {
        // major 8 (sd devices), minor 1 -> classic glibc dev_t encoding.
        let rdev: u64 = (8u64 << 8) | 1u64;
        assert_eq!(major_minor(rdev), (8, 1));
    }
}
