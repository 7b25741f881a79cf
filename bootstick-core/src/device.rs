use std::fmt;
use std::path::{Path, PathBuf};

/// How a block device is attached to the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusType {
    Usb,
    Ata,
    Scsi,
    Nvme,
    Mmc,
    Virtio,
    Unknown,
}

impl BusType {
    /// Derives the bus from a device's canonical sysfs path
    /// (e.g. `/sys/devices/pci0000:00/.../usb2/2-1/.../block/sdb`).
    pub fn from_sysfs_path(name: &str, sysfs_path: &Path) -> Self {
        let path = sysfs_path.to_string_lossy();
        if path.contains("/usb") {
            BusType::Usb
        } else if name.starts_with("nvme") {
            BusType::Nvme
        } else if name.starts_with("mmcblk") {
            BusType::Mmc
        } else if path.contains("/virtio") {
            BusType::Virtio
        } else if path.contains("/ata") {
            BusType::Ata
        } else if name.starts_with("sd") {
            BusType::Scsi
        } else {
            BusType::Unknown
        }
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusType::Usb => "usb",
            BusType::Ata => "ata",
            BusType::Scsi => "scsi",
            BusType::Nvme => "nvme",
            BusType::Mmc => "mmc",
            BusType::Virtio => "virtio",
            BusType::Unknown => "unknown",
        })
    }
}

/// A snapshot of a block device taken at enumeration time.
///
/// The snapshot goes stale as soon as it is taken: mounts can appear between
/// enumeration and the first destructive call, so it must be re-validated with
/// [`crate::safety::revalidate`] right before partitioning.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockDevice {
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Logical sector size in bytes.
    pub sector_size: u32,
    pub bus: BusType,
    pub removable: bool,
    /// Mountpoints of the device and all of its partitions.
    pub mountpoints: Vec<PathBuf>,
    pub vendor: Option<String>,
    pub model: Option<String>,
}

impl BlockDevice {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    pub fn is_mounted(&self) -> bool {
        !self.mountpoints.is_empty()
    }

    /// A human-facing name such as "SanDisk Cruzer (14.9 GB)".
    pub fn display_name(&self) -> String {
        let label = match (&self.vendor, &self.model) {
            (Some(vendor), Some(model)) => format!("{vendor} {model}"),
            (None, Some(model)) => model.clone(),
            (Some(vendor), None) => vendor.clone(),
            (None, None) => self.path.display().to_string(),
        };
        format!("{label} ({:.1} GB)", self.size_gb())
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match self.mountpoints.first() {
            Some(mp) if self.mountpoints.len() > 1 => {
                format!("[Mounted at {} +{}]", mp.display(), self.mountpoints.len() - 1)
            }
            Some(mp) => format!("[Mounted at {}]", mp.display()),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<15} {:.1} GB {}",
            self.path.display(),
            self.size_gb(),
            mount_info
        )
    }
}
