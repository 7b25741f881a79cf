//! Decides whether a device may be erased.
//!
//! A device is ineligible as soon as it, or any of its partitions, is mounted
//! at a path that hosts the running system. The check is cheap and is run
//! twice: once when devices are listed, and again against a fresh mount table
//! right before the first destructive call.
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Mountpoints that mark a device as hosting the running system.
pub const FORBIDDEN_MOUNTS: &[&str] = &["/", "/boot", "/boot/efi", "/home"];

/// One line of the system mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    /// The mounted device node, e.g. `/dev/sdb1`.
    pub source: PathBuf,
    /// Where it is mounted.
    pub target: PathBuf,
}

/// Anything that can report the current mount table.
pub trait MountSource: Send + Sync {
    fn mounts(&self) -> Result<Vec<MountEntry>>;
}

pub fn is_forbidden_mount(mountpoint: &Path) -> bool {
    FORBIDDEN_MOUNTS.iter().any(|f| mountpoint == Path::new(f))
        || mountpoint.to_string_lossy().starts_with("/home/")
}

/// Returns `true` if none of the device's mountpoints is forbidden.
pub fn is_eligible(device: &BlockDevice) -> bool {
    !device.mountpoints.iter().any(|mp| is_forbidden_mount(mp))
}

/// Collects the mountpoints of `device_name` and of every node whose base name
/// it prefixes (`sda` pulls in `sda1`, `sda2`, ...).
pub fn mountpoints_for(device_name: &str, mounts: &[MountEntry]) -> Vec<PathBuf> {
    mounts
        .iter()
        .filter(|m| {
            m.source
                .file_name()
                .map(|base| base.to_string_lossy().starts_with(device_name))
                .unwrap_or(false)
        })
        .map(|m| m.target.clone())
        .collect()
}

/// Refreshes a device snapshot against the live mount table and aborts if it
/// has become ineligible since enumeration.
pub fn revalidate(device: &BlockDevice, source: &dyn MountSource) -> Result<BlockDevice> {
    let mounts = source.mounts()?;
    let mut fresh = device.clone();
    fresh.mountpoints = mountpoints_for(&device.name, &mounts);
    debug!(
        "Revalidated {}: {} mountpoint(s)",
        fresh.path.display(),
        fresh.mountpoints.len()
    );

    if let Some(mp) = fresh.mountpoints.iter().find(|mp| is_forbidden_mount(mp)) {
        warn!(
            "{} is mounted at {}; refusing destructive operation",
            fresh.path.display(),
            mp.display()
        );
        return Err(Error::safety(
            &fresh.path,
            format!("a partition is mounted at {}", mp.display()),
        ));
    }
    Ok(fresh)
}
