//! Mass-storage volume discovery.
//!
//! In BOOTSEL mode the RP2040 mask ROM exposes a FAT volume labelled
//! `RPI-RP2`. Desktop sessions usually automount it, CI runners often do
//! not. Lookup therefore has two paths:
//!
//! 1. **Fast path**: scan the live mount table for a mount point whose last
//!    component carries the label.
//! 2. **Slow path**: walk the `lsblk` block-device tree (any nesting depth,
//!    composite card readers and hubs expose several levels), and either use
//!    the reported mount point or ask `udisksctl` to mount the device.

use crate::command::{CommandRunner, Invocation};
use crate::error::{Error, Result};
use crate::poll::{Clock, poll_until};
use log::{debug, info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for one `lsblk` run.
const LSBLK_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for one `udisksctl mount` run.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device.
    pub device: String,
    /// Mount point, with octal escapes decoded.
    pub mount_point: PathBuf,
    /// Filesystem type.
    pub fs_type: String,
}

/// Parse the text of `/proc/mounts` (or `/etc/mtab`).
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next().unwrap_or_default();
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Decode the `\ooo` octal escapes the kernel uses for spaces and tabs.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether a mount point looks like the volume called `label`.
fn mount_point_matches(mount_point: &Path, label: &str) -> bool {
    mount_point
        .file_name()
        .is_some_and(|name| name.to_string_lossy().contains(label))
}

/// Find the mount point of `label` in mount-table text.
pub fn find_mounted(mount_table: &str, label: &str) -> Option<PathBuf> {
    parse_mounts(mount_table)
        .into_iter()
        .map(|entry| entry.mount_point)
        .find(|mp| mount_point_matches(mp, label))
}

/// A node of `lsblk -J` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BlockDevice {
    /// Kernel name, e.g. `sda1`.
    pub name: String,
    /// Filesystem label.
    #[serde(default)]
    pub label: Option<String>,
    /// Mount point (older util-linux).
    #[serde(default)]
    pub mountpoint: Option<String>,
    /// Mount points (util-linux 2.37+).
    #[serde(default)]
    pub mountpoints: Vec<Option<String>>,
    /// Partitions and stacked devices.
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// First reported mount point, whichever lsblk schema produced it.
    pub fn mount_point(&self) -> Option<PathBuf> {
        self.mountpoint
            .iter()
            .chain(self.mountpoints.iter().flatten())
            .find(|mp| !mp.is_empty())
            .map(PathBuf::from)
    }

    /// Device node path.
    pub fn dev_path(&self) -> PathBuf {
        if self.name.starts_with('/') {
            PathBuf::from(&self.name)
        } else {
            Path::new("/dev").join(&self.name)
        }
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

/// Parse `lsblk -J` output into the top-level device list.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    Ok(serde_json::from_str::<LsblkOutput>(json)?.blockdevices)
}

/// Depth-first walk over a block-device forest, parents before children.
pub fn walk_block_devices(roots: &[BlockDevice]) -> impl Iterator<Item = &BlockDevice> {
    let mut stack: Vec<&BlockDevice> = roots.iter().rev().collect();
    std::iter::from_fn(move || {
        let next = stack.pop()?;
        stack.extend(next.children.iter().rev());
        Some(next)
    })
}

/// Operating-system view of mounts and block devices.
pub trait StorageSource: Send + Sync {
    /// Raw mount table text.
    fn mount_table(&self) -> Result<String>;

    /// Current block-device tree.
    fn block_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Mount `device` somewhere; the new mount point is found on the next
    /// pass.
    fn mount(&self, device: &BlockDevice) -> Result<()>;
}

/// Linux implementation: `/proc/mounts`, `lsblk` and `udisksctl`.
pub struct SystemStorage {
    runner: Arc<dyn CommandRunner>,
    mounts_path: PathBuf,
}

impl SystemStorage {
    /// Storage source running tools through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            mounts_path: PathBuf::from("/proc/mounts"),
        }
    }
}

impl StorageSource for SystemStorage {
    fn mount_table(&self) -> Result<String> {
        Ok(fs::read_to_string(&self.mounts_path)?)
    }

    fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let invocation = Invocation::new("lsblk")
            .args(["-J", "-o", "NAME,LABEL,MOUNTPOINT"])
            .with_timeout(LSBLK_TIMEOUT);
        let result = self.runner.run(&invocation)?.into_checked(&invocation)?;
        parse_lsblk(&result.stdout)
    }

    fn mount(&self, device: &BlockDevice) -> Result<()> {
        let invocation = Invocation::new("udisksctl")
            .args(["mount", "-b"])
            .arg(device.dev_path().to_string_lossy())
            .with_timeout(MOUNT_TIMEOUT);
        self.runner.run(&invocation)?.into_checked(&invocation)?;
        Ok(())
    }
}

/// Polls a [`StorageSource`] for a labelled volume.
pub struct MassStorageLocator {
    source: Box<dyn StorageSource>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl MassStorageLocator {
    /// Locator polling every 0.5s.
    pub fn new(source: Box<dyn StorageSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            interval: crate::device::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Mount point of `label` if it is mounted right now (fast path only).
    pub fn find_mounted_now(&self, label: &str) -> Option<PathBuf> {
        match self.source.mount_table() {
            Ok(table) => find_mounted(&table, label),
            Err(e) => {
                debug!("Cannot read mount table: {e}");
                None
            },
        }
    }

    /// One fast-path plus slow-path pass. A matching but unmounted device
    /// gets a mount attempt; its mount point shows up on a later pass.
    fn locate_once(&self, label: &str) -> Option<PathBuf> {
        if let Some(mp) = self.find_mounted_now(label) {
            return Some(mp);
        }

        let devices = match self.source.block_devices() {
            Ok(devices) => devices,
            Err(e) => {
                debug!("Block device scan failed: {e}");
                return None;
            },
        };

        let device = walk_block_devices(&devices).find(|d| d.label.as_deref() == Some(label))?;
        if let Some(mp) = device.mount_point() {
            return Some(mp);
        }

        info!("Mounting {} ({label})", device.dev_path().display());
        if let Err(e) = self.source.mount(device) {
            warn!("Mount of {} failed: {e}", device.dev_path().display());
        }
        None
    }

    /// Wait up to `timeout` for the volume labelled `label`.
    pub fn find_volume(&self, label: &str, timeout: Duration) -> Result<PathBuf> {
        let what = format!("volume {label}");
        let found = poll_until(self.clock.as_ref(), self.interval, timeout, &what, || {
            Ok(self.locate_once(label))
        });

        match found {
            Ok(mp) => {
                info!("Volume {label} mounted at {}", mp.display());
                Ok(mp)
            },
            Err(Error::Timeout(_)) => Err(Error::DeviceNotFound(format!(
                "{label} drive not found within {:.1}s",
                timeout.as_secs_f64()
            ))),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStorage, ManualClock};

    const LSBLK_NESTED: &str = r#"{
        "blockdevices": [
            {"name": "nvme0n1", "label": null, "mountpoint": null, "children": [
                {"name": "nvme0n1p1", "label": "EFI", "mountpoint": "/boot/efi"},
                {"name": "nvme0n1p2", "label": "root", "mountpoint": "/"}
            ]},
            {"name": "sdb", "label": null, "mountpoint": null, "children": [
                {"name": "sdb1", "label": null, "mountpoint": null, "children": [
                    {"name": "sdb1a", "label": null, "mountpoint": null, "children": [
                        {"name": "sdc1", "label": "RPI-RP2", "mountpoint": null}
                    ]}
                ]}
            ]}
        ]
    }"#;

    #[test]
    fn test_parse_mounts_decodes_escapes() {
        let table = "/dev/sdc1 /media/ci/RPI\\040RP2 vfat rw 0 0\nproc /proc proc rw 0 0\n";
        let entries = parse_mounts(table);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mount_point, PathBuf::from("/media/ci/RPI RP2"));
        assert_eq!(entries[0].fs_type, "vfat");
    }

    #[test]
    fn test_find_mounted_matches_last_component() {
        let table = "/dev/sdc1 /media/ci/RPI-RP2 vfat rw 0 0\n";
        assert_eq!(
            find_mounted(table, "RPI-RP2"),
            Some(PathBuf::from("/media/ci/RPI-RP2"))
        );
        let decoy = "/dev/sda2 /home/RPI-RP2-backup/data ext4 rw 0 0\n";
        assert_eq!(find_mounted(decoy, "RPI-RP2"), None);
    }

    #[test]
    fn test_walk_reaches_any_depth_in_order() {
        let devices = parse_lsblk(LSBLK_NESTED).unwrap();
        let names: Vec<&str> = walk_block_devices(&devices)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(
            names,
            ["nvme0n1", "nvme0n1p1", "nvme0n1p2", "sdb", "sdb1", "sdb1a", "sdc1"]
        );
        let found = walk_block_devices(&devices)
            .find(|d| d.label.as_deref() == Some("RPI-RP2"))
            .unwrap();
        assert_eq!(found.dev_path(), PathBuf::from("/dev/sdc1"));
    }

    #[test]
    fn test_mountpoints_array_schema() {
        let json = r#"{"blockdevices": [
            {"name": "sdc1", "label": "RPI-RP2", "mountpoints": [null, "/run/media/ci/RPI-RP2"]}
        ]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(
            devices[0].mount_point(),
            Some(PathBuf::from("/run/media/ci/RPI-RP2"))
        );
    }

    #[test]
    fn test_fast_path_wins() {
        let storage = FakeStorage::new();
        storage.set_mount_table("/dev/sdc1 /media/ci/RPI-RP2 vfat rw 0 0\n");
        let locator = MassStorageLocator::new(Box::new(storage.clone()), Arc::new(ManualClock::new()));

        let mp = locator.find_volume("RPI-RP2", Duration::from_secs(5)).unwrap();
        assert_eq!(mp, PathBuf::from("/media/ci/RPI-RP2"));
        assert_eq!(storage.lsblk_calls(), 0);
    }

    #[test]
    fn test_unmounted_nested_device_gets_mounted() {
        let storage = FakeStorage::new();
        storage.set_block_devices(parse_lsblk(LSBLK_NESTED).unwrap());
        storage.mount_to("sdc1", "/media/ci/RPI-RP2");
        let clock = Arc::new(ManualClock::new());
        let locator = MassStorageLocator::new(Box::new(storage.clone()), clock.clone());

        let mp = locator.find_volume("RPI-RP2", Duration::from_secs(5)).unwrap();
        assert_eq!(mp, PathBuf::from("/media/ci/RPI-RP2"));
        assert_eq!(storage.mounted(), vec!["sdc1".to_string()]);
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn test_missing_volume_is_device_not_found() {
        let storage = FakeStorage::new();
        let clock = Arc::new(ManualClock::new());
        let locator = MassStorageLocator::new(Box::new(storage), clock.clone());

        let err = locator.find_volume("RPI-RP2", Duration::from_secs(2)).unwrap_err();
        assert!(err.is_device_not_found());
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_failed_mount_keeps_polling() {
        let storage = FakeStorage::new();
        storage.set_block_devices(parse_lsblk(LSBLK_NESTED).unwrap());
        let locator = MassStorageLocator::new(Box::new(storage.clone()), Arc::new(ManualClock::new()));

        assert!(locator.find_volume("RPI-RP2", Duration::from_secs(1)).is_err());
        assert_eq!(storage.mounted().len(), 3);
    }
}
