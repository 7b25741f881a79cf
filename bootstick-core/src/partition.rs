//! Partition tables and partitions.
//!
//! The engine never writes a table itself: it drives `sfdisk` with a script on
//! standard input and trusts its exit status. Every mutation is followed by a
//! settle delay so the kernel can publish the new partition nodes before
//! anything addresses them by path.
//!
//! A failed step aborts the whole layout and leaves whatever was already
//! written in place; [`PartitionEngine::create_table`] resets the device.
use crate::clock::Ticker;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::process::{Invocation, Launcher, Output, Privilege};
use crate::types::{FilesystemKind, PartitionStyle, TargetFirmware};
use log::{debug, info};
use serde::Deserialize;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size of the EFI System Partition in a two-partition UEFI layout.
pub const ESP_SIZE: u64 = 256 * 1024 * 1024;
pub const ESP_LABEL: &str = "EFI";

const SFDISK: &str = "sfdisk";

const MBR_TYPE_FAT16: u8 = 0x06;
const MBR_TYPE_FAT32_LBA: u8 = 0x0C;
const MBR_TYPE_NTFS: u8 = 0x07;
const MBR_TYPE_LINUX: u8 = 0x83;
const MBR_TYPE_EFI: u8 = 0xEF;

const GPT_TYPE_EFI: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
const GPT_TYPE_LINUX: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
const GPT_TYPE_MSDATA: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";

/// One partition, either requested or read back from a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Start offset in bytes; 0 follows the previous partition.
    pub start: u64,
    /// Size in bytes; 0 consumes the rest of the device.
    pub size: u64,
    pub filesystem: FilesystemKind,
    /// Active flag; only honoured for MBR tables.
    pub bootable: bool,
    /// Partition name; only honoured for GPT tables.
    pub label: Option<String>,
    /// Marks an EFI System Partition.
    pub efi_system: bool,
}

impl PartitionEntry {
    pub fn new(filesystem: FilesystemKind) -> Self {
        Self {
            start: 0,
            size: 0,
            filesystem,
            bootable: false,
            label: None,
            efi_system: false,
        }
    }

    /// A 256 MiB FAT32 EFI System Partition named "EFI".
    pub fn efi_system_partition() -> Self {
        Self {
            size: ESP_SIZE,
            label: Some(ESP_LABEL.to_string()),
            efi_system: true,
            ..Self::new(FilesystemKind::Fat32)
        }
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn bootable(mut self, bootable: bool) -> Self {
        self.bootable = bootable;
        self
    }

    pub fn with_label(mut self, label: Option<&str>) -> Self {
        self.label = label.filter(|l| !l.is_empty()).map(str::to_string);
        self
    }
}

/// A table style plus its partitions in on-disk order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionLayout {
    pub style: PartitionStyle,
    pub partitions: Vec<PartitionEntry>,
}

/// The partition type written into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionType {
    Mbr(u8),
    Gpt(&'static str),
}

impl PartitionType {
    pub fn for_entry(style: PartitionStyle, entry: &PartitionEntry) -> Self {
        match style {
            PartitionStyle::Mbr => PartitionType::Mbr(if entry.efi_system {
                MBR_TYPE_EFI
            } else {
                match entry.filesystem {
                    FilesystemKind::Fat16 => MBR_TYPE_FAT16,
                    FilesystemKind::Ntfs | FilesystemKind::Exfat => MBR_TYPE_NTFS,
                    fs if fs.is_ext() => MBR_TYPE_LINUX,
                    _ => MBR_TYPE_FAT32_LBA,
                }
            }),
            PartitionStyle::Gpt => PartitionType::Gpt(if entry.efi_system {
                GPT_TYPE_EFI
            } else if entry.filesystem.is_ext() {
                GPT_TYPE_LINUX
            } else {
                GPT_TYPE_MSDATA
            }),
        }
    }

    /// Best-effort reverse mapping for layouts read back from a device.
    /// Returns the filesystem the type suggests and whether it is an ESP.
    fn describe(code: &str) -> (FilesystemKind, bool) {
        let code = code.trim();
        if let Ok(byte) = u8::from_str_radix(code.trim_start_matches("0x"), 16) {
            return match byte {
                MBR_TYPE_EFI => (FilesystemKind::Fat32, true),
                MBR_TYPE_FAT16 | 0x04 | 0x0E => (FilesystemKind::Fat16, false),
                MBR_TYPE_FAT32_LBA | 0x0B => (FilesystemKind::Fat32, false),
                MBR_TYPE_NTFS => (FilesystemKind::Ntfs, false),
                MBR_TYPE_LINUX => (FilesystemKind::Ext4, false),
                _ => (FilesystemKind::Unknown, false),
            };
        }
        match code.to_ascii_uppercase().as_str() {
            GPT_TYPE_EFI => (FilesystemKind::Fat32, true),
            GPT_TYPE_LINUX => (FilesystemKind::Ext4, false),
            _ => (FilesystemKind::Unknown, false),
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Mbr(code) => write!(f, "{code:02X}"),
            PartitionType::Gpt(guid) => f.write_str(guid),
        }
    }
}

/// Derives the device node of partition `index` (1-based).
///
/// Disks whose name ends in a digit, and NVMe, MMC and loop devices, take a
/// `p` before the index: `/dev/nvme0n1` -> `/dev/nvme0n1p1`, while
/// `/dev/sda` -> `/dev/sda1`.
pub fn partition_path(device: &Path, index: u32) -> PathBuf {
    let base = device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let needs_p = ["nvme", "mmcblk", "loop"]
        .iter()
        .any(|prefix| base.starts_with(prefix))
        || base.ends_with(|c: char| c.is_ascii_digit());

    let mut path = OsString::from(device.as_os_str());
    if needs_p {
        path.push("p");
    }
    path.push(index.to_string());
    PathBuf::from(path)
}

/// A single partition spanning the device, flagged active under MBR.
pub fn plan_single(
    style: PartitionStyle,
    filesystem: FilesystemKind,
    label: Option<&str>,
) -> PartitionLayout {
    PartitionLayout {
        style,
        partitions: vec![PartitionEntry::new(filesystem).bootable(true).with_label(label)],
    }
}

/// A single partition of EFI type spanning the device, for file-copy installs.
pub fn plan_single_efi(style: PartitionStyle, label: Option<&str>) -> PartitionLayout {
    let mut entry = PartitionEntry::new(FilesystemKind::Fat32)
        .bootable(true)
        .with_label(label);
    entry.efi_system = true;
    PartitionLayout {
        style,
        partitions: vec![entry],
    }
}

/// The layout for a bootable drive: ESP plus data partition when booting
/// UEFI from GPT, a single active partition otherwise.
pub fn plan_bootable_layout(
    style: PartitionStyle,
    firmware: TargetFirmware,
    filesystem: FilesystemKind,
    label: Option<&str>,
) -> PartitionLayout {
    if firmware.requires_uefi() && style == PartitionStyle::Gpt {
        return PartitionLayout {
            style,
            partitions: vec![
                PartitionEntry::efi_system_partition(),
                PartitionEntry::new(filesystem).with_label(label),
            ],
        };
    }
    plan_single(style, filesystem, label)
}

/// Renders one `sfdisk` script line: `start, size, type[, *]`, with start
/// and size in sectors and left blank when automatic.
pub fn script_line(style: PartitionStyle, entry: &PartitionEntry, sector_size: u32) -> String {
    let sector = u64::from(sector_size.max(1));
    let start = match entry.start {
        0 => String::new(),
        bytes => bytes.div_ceil(sector).to_string(),
    };
    let size = match entry.size {
        0 => String::new(),
        bytes => (bytes / sector).max(1).to_string(),
    };
    let mut line = format!("{start}, {size}, {}", PartitionType::for_entry(style, entry));
    if style == PartitionStyle::Mbr && entry.bootable {
        line.push_str(", *");
    }
    line.push('\n');
    line
}

#[derive(Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Deserialize)]
struct SfdiskTable {
    label: String,
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Deserialize)]
struct SfdiskPartition {
    start: u64,
    size: u64,
    #[serde(rename = "type")]
    type_code: String,
    #[serde(default)]
    bootable: bool,
    #[serde(default)]
    name: Option<String>,
}

/// Parses `sfdisk --json` output into a [`PartitionLayout`].
pub fn parse_sfdisk_json(json: &[u8], default_sector_size: u32) -> Result<PartitionLayout> {
    let dump: SfdiskDump = serde_json::from_slice(json)
        .map_err(|e| Error::process(SFDISK, format!("unreadable table dump: {e}")))?;
    let table = dump.partitiontable;
    let style = table.label.parse::<PartitionStyle>()?;
    let sector = table
        .sectorsize
        .unwrap_or_else(|| u64::from(default_sector_size));

    let partitions = table
        .partitions
        .into_iter()
        .map(|p| {
            let (filesystem, efi_system) = PartitionType::describe(&p.type_code);
            PartitionEntry {
                start: p.start * sector,
                size: p.size * sector,
                filesystem,
                bootable: p.bootable,
                label: p.name.filter(|n| !n.is_empty()),
                efi_system,
            }
        })
        .collect();

    Ok(PartitionLayout { style, partitions })
}

/// Creates and inspects partition tables through `sfdisk`.
pub struct PartitionEngine {
    launcher: Arc<dyn Launcher>,
    privilege: Privilege,
    settle: Ticker,
}

impl PartitionEngine {
    pub fn new(launcher: Arc<dyn Launcher>, privilege: Privilege, settle: Ticker) -> Self {
        Self {
            launcher,
            privilege,
            settle,
        }
    }

    pub fn is_available(&self) -> bool {
        self.launcher.resolve(SFDISK).is_some()
    }

    fn sfdisk(&self, invocation: Invocation) -> Result<Output> {
        let invocation = self.privilege.wrap(invocation)?;
        debug!("Running: {invocation}");
        self.launcher.output(&invocation)?.check(SFDISK)
    }

    fn settle(&self) {
        debug!("Waiting {:?} for device nodes to settle", self.settle.interval());
        self.settle.tick();
    }

    /// Wipes the device and writes an empty table of `style`.
    pub fn create_table(&self, device: &BlockDevice, style: PartitionStyle) -> Result<()> {
        let script = format!("label: {}\n", style.sfdisk_label());
        self.sfdisk(
            Invocation::new(SFDISK)
                .args(["--wipe", "always", "--wipe-partitions", "always", "--lock"])
                .arg(&device.path)
                .stdin(script),
        )?;
        self.settle();
        info!("Created {style} partition table on {}", device.path.display());
        Ok(())
    }

    /// Appends partition `index` (1-based) to the existing table and returns
    /// its device node.
    pub fn add_partition(
        &self,
        device: &BlockDevice,
        entry: &PartitionEntry,
        index: u32,
    ) -> Result<PathBuf> {
        let current = self.get_layout(device)?;
        let expected = current.partitions.len() as u32 + 1;
        if index != expected {
            return Err(Error::Configuration(format!(
                "cannot add partition {index} to {}: next free slot is {expected}",
                device.path.display()
            )));
        }

        let line = script_line(current.style, entry, device.sector_size);
        self.sfdisk(
            Invocation::new(SFDISK)
                .args(["--append", "--wipe-partitions", "always", "--lock"])
                .arg(&device.path)
                .stdin(line),
        )?;

        if current.style == PartitionStyle::Gpt {
            if let Some(label) = &entry.label {
                self.sfdisk(
                    Invocation::new(SFDISK)
                        .args(["--lock", "--part-label"])
                        .arg(&device.path)
                        .arg(index.to_string())
                        .arg(label),
                )?;
            }
        }

        self.settle();
        info!("Added partition {index} to {}", device.path.display());
        Ok(partition_path(&device.path, index))
    }

    /// Writes a fresh table and then each partition of `layout`, in order.
    pub fn apply(&self, device: &BlockDevice, layout: &PartitionLayout) -> Result<Vec<PathBuf>> {
        self.create_table(device, layout.style)?;
        layout
            .partitions
            .iter()
            .zip(1u32..)
            .map(|(entry, index)| self.add_partition(device, entry, index))
            .collect()
    }

    pub fn create_single(
        &self,
        device: &BlockDevice,
        style: PartitionStyle,
        filesystem: FilesystemKind,
        label: Option<&str>,
    ) -> Result<PathBuf> {
        let mut nodes = self.apply(device, &plan_single(style, filesystem, label))?;
        Ok(nodes.remove(0))
    }

    pub fn create_single_efi(
        &self,
        device: &BlockDevice,
        style: PartitionStyle,
        label: Option<&str>,
    ) -> Result<PathBuf> {
        let mut nodes = self.apply(device, &plan_single_efi(style, label))?;
        Ok(nodes.remove(0))
    }

    /// Lays out a bootable drive (see [`plan_bootable_layout`]) and returns
    /// the partition nodes; the data partition is always the last one.
    pub fn create_bootable_layout(
        &self,
        device: &BlockDevice,
        style: PartitionStyle,
        firmware: TargetFirmware,
        filesystem: FilesystemKind,
        label: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        self.apply(device, &plan_bootable_layout(style, firmware, filesystem, label))
    }

    /// Removes every partition, keeping the current table style (MBR if the
    /// device has no readable table).
    pub fn delete_all(&self, device: &BlockDevice) -> Result<()> {
        let style = self
            .get_layout(device)
            .map(|layout| layout.style)
            .unwrap_or(PartitionStyle::Mbr);
        self.create_table(device, style)
    }

    /// Reads the current table without modifying the device.
    pub fn get_layout(&self, device: &BlockDevice) -> Result<PartitionLayout> {
        let output = self.sfdisk(Invocation::new(SFDISK).arg("--json").arg(&device.path))?;
        parse_sfdisk_json(&output.stdout, device.sector_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLauncher, ManualClock, usb_stick};
    use std::time::Duration;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn engine(launcher: &Arc<FakeLauncher>) -> PartitionEngine {
        engine_with_clock(launcher, Arc::new(ManualClock::new()))
    }

    fn engine_with_clock(launcher: &Arc<FakeLauncher>, clock: Arc<ManualClock>) -> PartitionEngine {
        PartitionEngine::new(
            launcher.clone(),
            Privilege::elevated(),
            Ticker::new(clock, Duration::from_millis(500)),
        )
    }

    #[test]
    fn partition_nodes_follow_kernel_naming() {
        assert_eq!(partition_path(Path::new("/dev/sda"), 1), PathBuf::from("/dev/sda1"));
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 2),
            PathBuf::from("/dev/mmcblk0p2")
        );
        assert_eq!(partition_path(Path::new("/dev/loop0"), 1), PathBuf::from("/dev/loop0p1"));
        assert_eq!(partition_path(Path::new("/dev/md127"), 3), PathBuf::from("/dev/md127p3"));
    }

    #[test]
    fn type_codes_follow_the_filesystem() {
        let mbr = |fs| PartitionType::for_entry(PartitionStyle::Mbr, &PartitionEntry::new(fs));
        assert_eq!(mbr(FilesystemKind::Fat16), PartitionType::Mbr(0x06));
        assert_eq!(mbr(FilesystemKind::Fat32), PartitionType::Mbr(0x0C));
        assert_eq!(mbr(FilesystemKind::Ntfs), PartitionType::Mbr(0x07));
        assert_eq!(mbr(FilesystemKind::Exfat), PartitionType::Mbr(0x07));
        assert_eq!(mbr(FilesystemKind::Ext3), PartitionType::Mbr(0x83));
        assert_eq!(mbr(FilesystemKind::Udf), PartitionType::Mbr(0x0C));

        let esp = PartitionEntry::efi_system_partition();
        assert_eq!(PartitionType::for_entry(PartitionStyle::Mbr, &esp), PartitionType::Mbr(0xEF));
        assert_eq!(
            PartitionType::for_entry(PartitionStyle::Gpt, &esp),
            PartitionType::Gpt(GPT_TYPE_EFI)
        );
        assert_eq!(
            PartitionType::for_entry(PartitionStyle::Gpt, &PartitionEntry::new(FilesystemKind::Ext4)),
            PartitionType::Gpt(GPT_TYPE_LINUX)
        );
        assert_eq!(
            PartitionType::for_entry(PartitionStyle::Gpt, &PartitionEntry::new(FilesystemKind::Ntfs)),
            PartitionType::Gpt(GPT_TYPE_MSDATA)
        );
    }

    #[test]
    fn uefi_gpt_layout_has_esp_then_remainder() {
        for firmware in [TargetFirmware::Uefi, TargetFirmware::BiosAndUefi] {
            let layout = plan_bootable_layout(
                PartitionStyle::Gpt,
                firmware,
                FilesystemKind::Ntfs,
                Some("DATA"),
            );
            assert_eq!(layout.partitions.len(), 2);
            let esp = &layout.partitions[0];
            assert_eq!(esp.size, 256 * 1024 * 1024);
            assert!(esp.efi_system);
            assert!(!esp.bootable);
            assert_eq!(esp.label.as_deref(), Some("EFI"));
            let data = &layout.partitions[1];
            assert_eq!((data.start, data.size), (0, 0));
            assert_eq!(data.filesystem, FilesystemKind::Ntfs);
        }
    }

    #[test]
    fn other_layouts_fall_back_to_one_partition() {
        let bios_gpt = plan_bootable_layout(
            PartitionStyle::Gpt,
            TargetFirmware::Bios,
            FilesystemKind::Fat32,
            None,
        );
        assert_eq!(bios_gpt.partitions.len(), 1);
        let uefi_mbr = plan_bootable_layout(
            PartitionStyle::Mbr,
            TargetFirmware::Uefi,
            FilesystemKind::Fat32,
            None,
        );
        assert_eq!(uefi_mbr.partitions.len(), 1);
        assert!(uefi_mbr.partitions[0].bootable);
    }

    #[test]
    fn script_lines_are_sector_aligned() {
        let entry = PartitionEntry::new(FilesystemKind::Fat32)
            .with_start(1_048_577)
            .with_size(1_048_575)
            .bootable(true);
        assert_eq!(script_line(PartitionStyle::Mbr, &entry, 512), "2049, 2047, 0C, *\n");
        // Bootable markers are an MBR concept only.
        assert_eq!(
            script_line(PartitionStyle::Gpt, &entry, 512),
            format!("2049, 2047, {GPT_TYPE_MSDATA}\n")
        );
        let esp = PartitionEntry::efi_system_partition();
        assert_eq!(
            script_line(PartitionStyle::Gpt, &esp, 4096),
            format!(", 65536, {GPT_TYPE_EFI}\n")
        );
    }

    #[test]
    fn parses_sfdisk_dumps() {
        let json = br#"{
           "partitiontable": {
              "label": "gpt",
              "id": "5B1C1E9A-0C0C-4B3E-9D7B-9F0C2C4A2E11",
              "device": "/dev/sdb",
              "unit": "sectors",
              "firstlba": 2048,
              "lastlba": 15633374,
              "sectorsize": 512,
              "partitions": [
                 {"node": "/dev/sdb1", "start": 2048, "size": 524288,
                  "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "name": "EFI"},
                 {"node": "/dev/sdb2", "start": 526336, "size": 15107039,
                  "type": "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7"}
              ]
           }
        }"#;
        let layout = parse_sfdisk_json(json, 512).unwrap();
        assert_eq!(layout.style, PartitionStyle::Gpt);
        assert_eq!(layout.partitions.len(), 2);
        assert_eq!(layout.partitions[0].size, ESP_SIZE);
        assert!(layout.partitions[0].efi_system);
        assert_eq!(layout.partitions[1].start, 526336 * 512);

        let empty = br#"{"partitiontable": {"label": "dos", "unit": "sectors"}}"#;
        let layout = parse_sfdisk_json(empty, 512).unwrap();
        assert_eq!(layout.style, PartitionStyle::Mbr);
        assert!(layout.partitions.is_empty());
    }

    #[test]
    fn create_table_is_idempotent() {
        let launcher = Arc::new(FakeLauncher::new(8 * GIB));
        let engine = engine(&launcher);
        let dev = usb_stick("sdb", 8 * GIB);

        engine
            .create_bootable_layout(&dev, PartitionStyle::Gpt, TargetFirmware::Uefi, FilesystemKind::Fat32, None)
            .unwrap();
        assert_eq!(engine.get_layout(&dev).unwrap().partitions.len(), 2);

        for _ in 0..2 {
            engine.create_table(&dev, PartitionStyle::Gpt).unwrap();
            let layout = engine.get_layout(&dev).unwrap();
            assert_eq!(layout.style, PartitionStyle::Gpt);
            assert!(layout.partitions.is_empty());
        }
    }

    #[test]
    fn uefi_gpt_layout_on_disk() {
        let launcher = Arc::new(FakeLauncher::new(8 * GIB));
        let engine = engine(&launcher);
        let dev = usb_stick("sdb", 8 * GIB);

        let nodes = engine
            .create_bootable_layout(&dev, PartitionStyle::Gpt, TargetFirmware::Uefi, FilesystemKind::Fat32, Some("STICK"))
            .unwrap();
        assert_eq!(nodes, vec![PathBuf::from("/dev/sdb1"), PathBuf::from("/dev/sdb2")]);

        let layout = engine.get_layout(&dev).unwrap();
        assert_eq!(layout.partitions[0].size, ESP_SIZE);
        assert!(layout.partitions[0].efi_system);
        assert_eq!(layout.partitions[0].label.as_deref(), Some("EFI"));
        let data = &layout.partitions[1];
        assert_eq!(data.start, layout.partitions[0].start + ESP_SIZE);
        assert_eq!(data.start + data.size, launcher.disk_end_bytes());
        assert_eq!(data.label.as_deref(), Some("STICK"));

        // Every sfdisk call wiped signatures and took the device lock.
        let calls = launcher.calls_to("sfdisk");
        assert!(calls[0].has_arg("--wipe") && calls[0].has_arg("--wipe-partitions"));
        assert!(calls.iter().filter(|c| c.has_arg("--append")).all(|c| c.has_arg("--lock")));
    }

    #[test]
    fn mbr_single_partition_is_active() {
        let launcher = Arc::new(FakeLauncher::new(8 * GIB));
        let engine = engine(&launcher);
        let dev = usb_stick("sdb", 8 * GIB);

        let node = engine
            .create_single(&dev, PartitionStyle::Mbr, FilesystemKind::Fat32, Some("ignored"))
            .unwrap();
        assert_eq!(node, PathBuf::from("/dev/sdb1"));
        let layout = engine.get_layout(&dev).unwrap();
        assert_eq!(layout.partitions.len(), 1);
        assert!(layout.partitions[0].bootable);
        assert_eq!(layout.partitions[0].label, None);
    }

    #[test]
    fn failed_table_write_aborts_the_layout() {
        let launcher = Arc::new(FakeLauncher::new(8 * GIB));
        launcher.fail_program("sfdisk");
        let engine = engine(&launcher);
        let dev = usb_stick("sdb", 8 * GIB);

        let err = engine
            .create_bootable_layout(&dev, PartitionStyle::Gpt, TargetFirmware::Uefi, FilesystemKind::Fat32, None)
            .unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
        assert_eq!(launcher.calls_to("sfdisk").len(), 1);
    }

    #[test]
    fn partitions_must_be_appended_in_order() {
        let launcher = Arc::new(FakeLauncher::new(8 * GIB));
        let engine = engine(&launcher);
        let dev = usb_stick("sdb", 8 * GIB);
        engine.create_table(&dev, PartitionStyle::Mbr).unwrap();
        let err = engine
            .add_partition(&dev, &PartitionEntry::new(FilesystemKind::Fat32), 2)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn delete_all_keeps_the_table_style() {
        let launcher = Arc::new(FakeLauncher::new(8 * GIB));
        let engine = engine(&launcher);
        let dev = usb_stick("sdb", 8 * GIB);
        engine
            .create_single(&dev, PartitionStyle::Gpt, FilesystemKind::Ext4, None)
            .unwrap();
        engine.delete_all(&dev).unwrap();
        let layout = engine.get_layout(&dev).unwrap();
        assert_eq!(layout.style, PartitionStyle::Gpt);
        assert!(layout.partitions.is_empty());
    }

    #[test]
    fn every_table_mutation_waits_to_settle() {
        let launcher = Arc::new(FakeLauncher::new(8 * GIB));
        let clock = Arc::new(ManualClock::new());
        let engine = engine_with_clock(&launcher, clock.clone());
        let dev = usb_stick("sdb", 8 * GIB);

        engine.create_table(&dev, PartitionStyle::Gpt).unwrap();
        assert_eq!(clock.sleeps(), 1);

        engine
            .add_partition(&dev, &PartitionEntry::efi_system_partition(), 1)
            .unwrap();
        assert_eq!(clock.sleeps(), 2);
        engine
            .add_partition(&dev, &PartitionEntry::new(FilesystemKind::Ext4).with_label(Some("data")), 2)
            .unwrap();
        assert_eq!(clock.sleeps(), 3);
        assert_eq!(clock.elapsed(), Duration::from_millis(1500));

        // A rejected append changes nothing, so there is nothing to wait for.
        assert!(engine
            .add_partition(&dev, &PartitionEntry::new(FilesystemKind::Ext4), 5)
            .is_err());
        assert_eq!(clock.sleeps(), 3);
    }
}
