//! Mounted volume list, filtered to the disks a person cares about.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use sysinfo::Disks;

use crate::cache::CacheCell;
use crate::storage::VolumeSource;
use crate::types::DiskInfo;

const TTL: Duration = Duration::from_secs(1);
const GB: f64 = 1e9;

const PSEUDO_FS: &[&str] = &[
    "tmpfs", "devtmpfs", "overlay", "squashfs", "devfs", "autofs", "nullfs", "proc", "sysfs",
];

const NOISY_PREFIXES: &[&str] = &[
    "/Library/Developer/CoreSimulator/",
    "/Library/Developer/XCTestDevices/",
    "/private/var/folders/",
    "/System/Volumes/VM",
    "/System/Volumes/Preboot",
    "/System/Volumes/Recovery",
    "/System/Volumes/Update",
    "/snap/",
    "/boot/efi",
];

const NOISY_SUBSTRINGS: &[&str] = &[
    "CoreSimulator",
    "Cryptex",
    ".timemachine",
    "com.apple.TimeMachine",
    "TimeMachineBackup",
];

/// Simulator images, snapshots, OS housekeeping volumes and the like.
pub fn is_noisy_mount(mount: &str) -> bool {
    NOISY_PREFIXES.iter().any(|p| mount.starts_with(p))
        || NOISY_SUBSTRINGS.iter().any(|s| mount.contains(s))
}

pub struct DiskList {
    disks: Mutex<Disks>,
    cache: CacheCell<Vec<DiskInfo>>,
}

impl DiskList {
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            cache: CacheCell::new(TTL),
        }
    }

    pub fn list(&self) -> Vec<DiskInfo> {
        self.cache.get(|| self.scan())
    }

    fn scan(&self) -> Vec<DiskInfo> {
        let mut disks = self.disks.lock().unwrap_or_else(PoisonError::into_inner);
        disks.refresh(true);
        disks
            .iter()
            .filter_map(|d| {
                let fs = d.file_system().to_string_lossy().into_owned();
                let mount = d.mount_point().to_string_lossy().into_owned();
                let total = d.total_space();
                if total == 0 || PSEUDO_FS.contains(&fs.as_str()) || is_noisy_mount(&mount) {
                    return None;
                }
                let free = d.available_space().min(total);
                let used = total - free;
                Some(DiskInfo {
                    filesystem: d.name().to_string_lossy().into_owned(),
                    mount_point: mount,
                    total_gb: total as f64 / GB,
                    used_gb: used as f64 / GB,
                    free_gb: free as f64 / GB,
                    used_percent: used as f64 / total as f64 * 100.0,
                })
            })
            .collect()
    }
}

impl Default for DiskList {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeSource for DiskList {
    fn volumes(&self) -> Vec<DiskInfo> {
        self.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noisy_mounts() {
        assert!(is_noisy_mount("/System/Volumes/Preboot"));
        assert!(is_noisy_mount(
            "/Library/Developer/CoreSimulator/Volumes/iOS_21A328"
        ));
        assert!(is_noisy_mount("/Volumes/com.apple.TimeMachine.localsnapshots"));
        assert!(!is_noisy_mount("/"));
        assert!(!is_noisy_mount("/System/Volumes/Data"));
        assert!(!is_noisy_mount("/home"));
    }
}
