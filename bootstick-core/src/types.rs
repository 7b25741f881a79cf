//! Small value types shared by the partition engine, the format dispatcher
//! and the orchestrator.
use crate::error::Error;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// The partition table flavour written to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStyle {
    #[default]
    Mbr,
    Gpt,
}

impl PartitionStyle {
    /// The label name `sfdisk` uses for this style.
    pub fn sfdisk_label(self) -> &'static str {
        match self {
            PartitionStyle::Mbr => "dos",
            PartitionStyle::Gpt => "gpt",
        }
    }
}

impl fmt::Display for PartitionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionStyle::Mbr => "MBR",
            PartitionStyle::Gpt => "GPT",
        })
    }
}

impl FromStr for PartitionStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mbr" | "dos" | "msdos" => Ok(PartitionStyle::Mbr),
            "gpt" => Ok(PartitionStyle::Gpt),
            other => Err(Error::Configuration(format!(
                "unknown partition style '{other}'"
            ))),
        }
    }
}

/// The firmware the prepared drive must boot on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetFirmware {
    #[default]
    Bios,
    Uefi,
    BiosAndUefi,
}

impl TargetFirmware {
    pub fn requires_uefi(self) -> bool {
        matches!(self, TargetFirmware::Uefi | TargetFirmware::BiosAndUefi)
    }
}

impl fmt::Display for TargetFirmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetFirmware::Bios => "BIOS",
            TargetFirmware::Uefi => "UEFI",
            TargetFirmware::BiosAndUefi => "BIOS+UEFI",
        })
    }
}

impl FromStr for TargetFirmware {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bios" | "legacy" => Ok(TargetFirmware::Bios),
            "uefi" | "efi" => Ok(TargetFirmware::Uefi),
            "bios+uefi" | "hybrid" | "both" => Ok(TargetFirmware::BiosAndUefi),
            other => Err(Error::Configuration(format!(
                "unknown target firmware '{other}'"
            ))),
        }
    }
}

/// Filesystems the format dispatcher knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilesystemKind {
    Fat16,
    #[default]
    Fat32,
    Ntfs,
    Exfat,
    Ext2,
    Ext3,
    Ext4,
    Udf,
    Unknown,
}

impl FilesystemKind {
    pub fn is_fat(self) -> bool {
        matches!(self, FilesystemKind::Fat16 | FilesystemKind::Fat32)
    }

    pub fn is_ext(self) -> bool {
        matches!(
            self,
            FilesystemKind::Ext2 | FilesystemKind::Ext3 | FilesystemKind::Ext4
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            FilesystemKind::Fat16 => "FAT16",
            FilesystemKind::Fat32 => "FAT32",
            FilesystemKind::Ntfs => "NTFS",
            FilesystemKind::Exfat => "exFAT",
            FilesystemKind::Ext2 => "ext2",
            FilesystemKind::Ext3 => "ext3",
            FilesystemKind::Ext4 => "ext4",
            FilesystemKind::Udf => "UDF",
            FilesystemKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FilesystemKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fat16" => Ok(FilesystemKind::Fat16),
            "fat32" | "vfat" | "fat" => Ok(FilesystemKind::Fat32),
            "ntfs" => Ok(FilesystemKind::Ntfs),
            "exfat" => Ok(FilesystemKind::Exfat),
            "ext2" => Ok(FilesystemKind::Ext2),
            "ext3" => Ok(FilesystemKind::Ext3),
            "ext4" => Ok(FilesystemKind::Ext4),
            "udf" => Ok(FilesystemKind::Udf),
            other => Err(Error::Configuration(format!(
                "unsupported filesystem '{other}'"
            ))),
        }
    }
}
