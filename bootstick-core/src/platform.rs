//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! perform tasks that are not cross-platform: discovering removable block
//! devices, reading the mount table, sampling a device's I/O counters and
//! flushing it.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct
//! implementation for the target OS. Each submodule exposes the same public
//! API, so that the rest of the library can use it without worrying about the
//! underlying platform.
use crate::device::BlockDevice;
use crate::error::Result;
use std::path::Path;

/// Low-level access to a block device that the raw writer needs.
pub trait DeviceIo: Send + Sync {
    /// The device's cumulative sectors-written counter, or `None` when the
    /// counter cannot be read.
    fn sectors_written(&self, device: &BlockDevice) -> Option<u64>;

    /// Flushes every buffered write down to the device.
    fn flush(&self, device: &Path) -> Result<()>;
}

/// Something that can list candidate devices, e.g. for the hotplug monitor.
pub trait DeviceSource: Send + Sync {
    fn devices(&self) -> Result<Vec<BlockDevice>>;
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
