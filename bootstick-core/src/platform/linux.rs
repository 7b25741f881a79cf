use super::{DeviceIo, DeviceSource};
use crate::config::DevicePolicy;
use crate::device::{BlockDevice, BusType};
use crate::error::{Error, Result};
use crate::progress::parse_sectors_written;
use crate::safety::{self, MountEntry, MountSource};
use log::{debug, warn};
use nix::{ioctl_none, ioctl_read};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_none!(blkflsbuf, 0x12, 97);

/// Kernel name prefixes that never designate a flashable disk.
const SKIPPED_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "sr", "md"];

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

fn read_sys_u64(device_name: &str, file: &str) -> Option<u64> {
    read_sys_file(device_name, file)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
}

fn read_sys_string(device_name: &str, file: &str) -> Option<String> {
    read_sys_file(device_name, file)
        .ok()
        .filter(|s| !s.is_empty())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            if path_str[index + 1..].chars().all(|c| c.is_ascii_digit())
                && index + 1 < path_str.len()
            {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// Reads the mount table through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounts;

impl MountSource for SystemMounts {
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        Ok(disks
            .iter()
            .map(|disk| MountEntry {
                source: PathBuf::from("/dev/").join(disk.name()),
                target: disk.mount_point().to_path_buf(),
            })
            .collect())
    }
}

fn system_disk(mounts: &[MountEntry]) -> Option<PathBuf> {
    mounts
        .iter()
        .find(|m| m.target == Path::new("/"))
        .map(|m| get_parent_device_path(&m.source))
}

/// Builds a snapshot of `/sys/block/<device_name>`, or `None` if it has no
/// media.
fn read_device(device_name: &str, mounts: &[MountEntry]) -> Option<BlockDevice> {
    let path = PathBuf::from("/dev/").join(device_name);

    // sysfs always counts `size` in 512-byte units.
    let mut size_bytes = read_sys_u64(device_name, "size").unwrap_or(0) * 512;
    if size_bytes == 0 {
        size_bytes = ioctl_size(&path).unwrap_or(0);
    }
    if size_bytes == 0 {
        return None;
    }

    let sysfs_path = fs::canonicalize(PathBuf::from("/sys/block").join(device_name))
        .unwrap_or_default();

    Some(BlockDevice {
        name: device_name.to_string(),
        path,
        size_bytes,
        sector_size: read_sys_u64(device_name, "queue/logical_block_size")
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(512),
        bus: BusType::from_sysfs_path(device_name, &sysfs_path),
        removable: read_sys_file(device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false),
        mountpoints: safety::mountpoints_for(device_name, mounts),
        vendor: read_sys_string(device_name, "device/vendor"),
        model: read_sys_string(device_name, "device/model"),
    })
}

fn ioctl_size(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) }.ok()?;
    Some(size_bytes)
}

fn accepted_by_policy(device: &BlockDevice, policy: &DevicePolicy) -> bool {
    if policy.usb_only && device.bus != BusType::Usb {
        return false;
    }
    device.removable || (device.bus == BusType::Usb && policy.include_non_removable)
}

/// Scans for all removable block devices on a Linux system.
///
/// This function discovers devices by iterating through the `/sys/block` directory.
/// It applies several filters to ensure that only suitable, removable devices are
/// returned, excluding the main system drive for safety.
///
/// The filtering logic is as follows:
/// 1.  Find the main system drive (the disk backing `/`) and exclude it.
/// 2.  Skip loop, ram, device-mapper and optical devices.
/// 3.  Apply the [`DevicePolicy`]: by default only USB devices whose
///     `/sys/block/<device>/removable` flag is set are kept.
/// 4.  Skip devices reporting a size of zero, which often corresponds to
///     empty card readers.
/// 5.  Drop every device that fails [`safety::is_eligible`].
pub fn get_removable_devices(
    policy: &DevicePolicy,
    mount_source: &dyn MountSource,
) -> Result<Vec<BlockDevice>> {
    let mounts = mount_source.mounts()?;
    let system_disk_parent = system_disk(&mounts);
    if system_disk_parent.is_none() {
        warn!("Could not determine the system drive; relying on mountpoint checks only");
    }

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block").map_err(|e| Error::io("/sys/block", e))?;

    for entry in block_dir.filter_map(std::result::Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();

        if SKIPPED_PREFIXES.iter().any(|p| device_name.starts_with(p)) {
            continue;
        }

        let Some(device) = read_device(&device_name, &mounts) else {
            continue;
        };

        if system_disk_parent.as_deref() == Some(device.path.as_path()) {
            continue;
        }

        if !accepted_by_policy(&device, policy) {
            debug!("Skipping {} (bus {}, removable {})", device.name, device.bus, device.removable);
            continue;
        }

        if !safety::is_eligible(&device) {
            debug!("Skipping {}: hosts a system mountpoint", device.name);
            continue;
        }

        devices.push(device);
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

/// Builds a snapshot for an explicitly named whole-disk device such as
/// `/dev/sdb`.
pub fn probe(path: &Path, mount_source: &dyn MountSource) -> Result<BlockDevice> {
    let resolved = fs::canonicalize(path).map_err(|e| Error::io(path, e))?;
    let name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Configuration(format!("{} is not a device", path.display())))?;

    if !Path::new("/sys/block").join(&name).exists() {
        return Err(Error::Configuration(format!(
            "{} is not a whole block device",
            path.display()
        )));
    }

    let mounts = mount_source.mounts()?;
    read_device(&name, &mounts)
        .ok_or_else(|| Error::Configuration(format!("{} has no media", path.display())))
}

/// Lists devices with the configured policy; used by the hotplug monitor.
pub struct SystemDevices {
    policy: DevicePolicy,
    mounts: Arc<dyn MountSource>,
}

impl SystemDevices {
    pub fn new(policy: DevicePolicy, mounts: Arc<dyn MountSource>) -> Self {
        Self { policy, mounts }
    }
}

impl DeviceSource for SystemDevices {
    fn devices(&self) -> Result<Vec<BlockDevice>> {
        get_removable_devices(&self.policy, self.mounts.as_ref())
    }
}

/// Reads I/O counters from sysfs and flushes through the block layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxDeviceIo;

impl DeviceIo for LinuxDeviceIo {
    fn sectors_written(&self, device: &BlockDevice) -> Option<u64> {
        read_sys_file(&device.name, "stat")
            .ok()
            .and_then(|stat| parse_sectors_written(&stat))
    }

    fn flush(&self, device: &Path) -> Result<()> {
        nix::unistd::sync();

        let file = match OpenOptions::new().read(true).open(device) {
            Ok(file) => file,
            // The global sync above already pushed the page cache out; an
            // unprivileged caller cannot reach the device's own cache.
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!("No direct access to {}; relying on sync()", device.display());
                return Ok(());
            }
            Err(e) => return Err(Error::io(device, e)),
        };

        file.sync_all().map_err(|e| Error::io(device, e))?;
        // SAFETY: BLKFLSBUF takes no argument.
        unsafe { blkflsbuf(file.as_raw_fd()) }
            .map_err(|e| Error::io(device, io::Error::from(e)))?;
        Ok(())
    }
}
