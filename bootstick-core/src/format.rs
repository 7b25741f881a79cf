//! Creating filesystems with the system's `mkfs` family.
use crate::clock::Ticker;
use crate::error::{Error, Result};
use crate::process::{Invocation, Launcher, Privilege};
use crate::types::FilesystemKind;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

/// How one formatting tool is driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatTool {
    pub program: &'static str,
    label_flag: &'static str,
    /// `None` when the tool takes no cluster/block size.
    size_flag: Option<&'static str>,
    max_label: usize,
}

pub fn tool_for(filesystem: FilesystemKind) -> Option<FormatTool> {
    let tool = |program, label_flag, size_flag, max_label| FormatTool {
        program,
        label_flag,
        size_flag,
        max_label,
    };
    Some(match filesystem {
        FilesystemKind::Fat16 | FilesystemKind::Fat32 => tool("mkfs.fat", "-n", Some("-s"), 11),
        FilesystemKind::Ntfs => tool("mkfs.ntfs", "-L", Some("-c"), 32),
        FilesystemKind::Exfat => tool("mkfs.exfat", "-L", Some("-c"), 11),
        FilesystemKind::Ext2 => tool("mkfs.ext2", "-L", Some("-b"), 16),
        FilesystemKind::Ext3 => tool("mkfs.ext3", "-L", Some("-b"), 16),
        FilesystemKind::Ext4 => tool("mkfs.ext4", "-L", Some("-b"), 16),
        FilesystemKind::Udf => tool("mkudffs", "-l", None, 30),
        FilesystemKind::Unknown => return None,
    })
}

/// What to put on a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatRequest {
    pub filesystem: FilesystemKind,
    pub label: Option<String>,
    /// Cluster or block size in bytes; 0 keeps the tool's default.
    pub cluster_size: u32,
    /// Logical sector size of the target device in bytes.
    pub sector_size: u32,
    pub quick: bool,
}

impl FormatRequest {
    pub fn new(filesystem: FilesystemKind) -> Self {
        Self {
            filesystem,
            label: None,
            cluster_size: 0,
            sector_size: 512,
            quick: true,
        }
    }

    pub fn with_label(mut self, label: Option<&str>) -> Self {
        self.label = label.filter(|l| !l.is_empty()).map(str::to_string);
        self
    }

    pub fn with_cluster_size(mut self, bytes: u32) -> Self {
        self.cluster_size = bytes;
        self
    }

    pub fn with_sector_size(mut self, bytes: u32) -> Self {
        self.sector_size = bytes;
        self
    }

    /// Rejects requests no tool could carry out, before anything runs.
    pub fn validate(&self) -> Result<()> {
        if tool_for(self.filesystem).is_none() {
            return Err(Error::Configuration(format!("cannot format as {}", self.filesystem)));
        }
        if self.filesystem.is_fat() && self.cluster_size > 0 {
            sectors_per_cluster(self)?;
        }
        Ok(())
    }
}

/// mkfs.fat accepts 1 to 128 sectors per cluster, in powers of two.
const MAX_FAT_SECTORS_PER_CLUSTER: u32 = 128;

/// Converts a FAT cluster size in bytes to the sectors-per-cluster count
/// `mkfs.fat -s` expects.
fn sectors_per_cluster(request: &FormatRequest) -> Result<u32> {
    let sector = request.sector_size;
    let size = request.cluster_size;
    if sector == 0 || size % sector != 0 {
        return Err(Error::Configuration(format!(
            "cluster size {size} is not a multiple of the {sector}-byte sector"
        )));
    }
    let sectors = size / sector;
    if !sectors.is_power_of_two() || sectors > MAX_FAT_SECTORS_PER_CLUSTER {
        return Err(Error::Configuration(format!(
            "cluster size {size} must be a power of two between {sector} and {} bytes",
            u64::from(sector) * u64::from(MAX_FAT_SECTORS_PER_CLUSTER)
        )));
    }
    Ok(sectors)
}

/// Shortens `label` to what `tool` accepts, warning when it had to.
fn fit_label(tool: &FormatTool, label: &str) -> String {
    if label.chars().count() <= tool.max_label {
        return label.to_string();
    }
    let short: String = label.chars().take(tool.max_label).collect();
    warn!(
        "Label '{label}' is longer than {} allows; using '{short}'",
        tool.program
    );
    short
}

/// Builds the `mkfs` argument vector for `partition`.
pub fn build_invocation(partition: &Path, request: &FormatRequest) -> Result<Invocation> {
    let tool = tool_for(request.filesystem).ok_or_else(|| {
        Error::Configuration(format!("cannot format as {}", request.filesystem))
    })?;
    let mut invocation = Invocation::new(tool.program);

    match request.filesystem {
        FilesystemKind::Fat16 => invocation = invocation.args(["-F", "16"]),
        FilesystemKind::Fat32 => invocation = invocation.args(["-F", "32"]),
        FilesystemKind::Ntfs if request.quick => invocation = invocation.arg("-Q"),
        _ => {}
    }

    if let Some(label) = &request.label {
        invocation = invocation
            .arg(tool.label_flag)
            .arg(fit_label(&tool, label));
    }

    if let (Some(flag), size) = (tool.size_flag, request.cluster_size) {
        if size > 0 {
            let value = if request.filesystem.is_fat() {
                sectors_per_cluster(request)?
            } else {
                size
            };
            invocation = invocation.arg(flag).arg(value.to_string());
        }
    }

    Ok(invocation.arg(partition))
}

/// The synthetic progress shown while a tool runs: 2% per tick, held just
/// short of done until the tool exits.
fn ramp(ticks: u32) -> f64 {
    (f64::from(ticks) * 0.02).min(0.99)
}

/// Runs formatting tools, one process per partition.
pub struct FormatDispatcher {
    launcher: Arc<dyn Launcher>,
    privilege: Privilege,
    ticker: Ticker,
}

impl FormatDispatcher {
    pub fn new(launcher: Arc<dyn Launcher>, privilege: Privilege, ticker: Ticker) -> Self {
        Self {
            launcher,
            privilege,
            ticker,
        }
    }

    pub fn is_supported(&self, filesystem: FilesystemKind) -> bool {
        tool_for(filesystem).is_some_and(|tool| self.launcher.resolve(tool.program).is_some())
    }

    /// Formats `partition` and blocks until the tool exits. `on_progress`
    /// receives a fraction and a short status message.
    pub fn format<F>(&self, partition: &Path, request: &FormatRequest, mut on_progress: F) -> Result<()>
    where
        F: FnMut(f64, &str),
    {
        if !self.is_supported(request.filesystem) {
            return Err(Error::Configuration(format!(
                "{} is not supported: no formatting tool found",
                request.filesystem
            )));
        }
        let invocation = build_invocation(partition, request)?;
        let program = invocation.program_name();
        let invocation = self.privilege.wrap(invocation)?;
        info!("Formatting {} as {}", partition.display(), request.filesystem);
        debug!("Running: {invocation}");

        on_progress(0.0, "Starting format");
        let mut child = self.launcher.spawn(&invocation)?;
        let mut ticks = 0;
        let exit = loop {
            child.drain()?;
            if let Some(exit) = child.try_wait()? {
                break exit;
            }
            self.ticker.tick();
            ticks += 1;
            on_progress(ramp(ticks), "Formatting");
        };

        if !exit.success() {
            return Err(Error::process(program, exit.to_string()));
        }
        on_progress(1.0, "Format complete");
        Ok(())
    }
}
