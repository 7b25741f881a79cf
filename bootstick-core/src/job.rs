//! A single deployment job and the state it shares with its observers.
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::types::{FilesystemKind, PartitionStyle, TargetFirmware};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where a job is in its pipeline.
///
/// States only move forward. `Error` and `Cancelled` are terminal and can be
/// entered from any non-terminal state; `Complete` is terminal too.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriteState {
    Idle,
    Partitioning,
    Formatting,
    Writing,
    Syncing,
    Complete,
    Error,
    Cancelled,
}

impl WriteState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WriteState::Complete | WriteState::Error | WriteState::Cancelled
        )
    }

    pub(crate) fn rank(self) -> u8 {
        match self {
            WriteState::Idle => 0,
            WriteState::Partitioning => 1,
            WriteState::Formatting => 2,
            WriteState::Writing => 3,
            WriteState::Syncing => 4,
            WriteState::Complete | WriteState::Error | WriteState::Cancelled => 5,
        }
    }

    /// Forward moves may skip stages (raw writes never format).
    pub fn can_transition_to(self, next: WriteState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            WriteState::Error | WriteState::Cancelled => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteState::Idle => "idle",
            WriteState::Partitioning => "partitioning",
            WriteState::Formatting => "formatting",
            WriteState::Writing => "writing",
            WriteState::Syncing => "syncing",
            WriteState::Complete => "complete",
            WriteState::Error => "error",
            WriteState::Cancelled => "cancelled",
        })
    }
}

/// Facts about the source contributed by image analysis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceFacts {
    /// The image carries EFI boot files.
    pub uefi_bootable: bool,
    pub windows: bool,
}

/// What ends up on the device.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Copy the image byte for byte onto the whole device.
    RawImage { image: PathBuf },
    /// Format a FAT32 partition and unpack the image's file tree into it.
    FilesystemExtract { archive: PathBuf, facts: SourceFacts },
    /// Only partition and format.
    FormatOnly,
}

impl Payload {
    /// The last state in which this pipeline still acts on a cancellation
    /// request. Extraction and formatting run to completion once started.
    pub fn cancel_window(&self) -> WriteState {
        match self {
            Payload::RawImage { .. } => WriteState::Writing,
            Payload::FilesystemExtract { .. } | Payload::FormatOnly => WriteState::Formatting,
        }
    }

    pub fn source(&self) -> Option<&Path> {
        match self {
            Payload::RawImage { image } => Some(image),
            Payload::FilesystemExtract { archive, .. } => Some(archive),
            Payload::FormatOnly => None,
        }
    }
}

/// Layout and filesystem choices for the target.
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutOptions {
    pub style: PartitionStyle,
    pub firmware: TargetFirmware,
    pub filesystem: FilesystemKind,
    pub label: Option<String>,
    /// Cluster or block size in bytes; 0 uses the tool's default.
    pub cluster_size: u32,
    pub quick_format: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            style: PartitionStyle::Mbr,
            firmware: TargetFirmware::Bios,
            filesystem: FilesystemKind::Fat32,
            label: None,
            cluster_size: 0,
            quick_format: true,
        }
    }
}

/// A request to prepare one device.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteJob {
    pub device: BlockDevice,
    pub payload: Payload,
    pub layout: LayoutOptions,
}

impl WriteJob {
    pub fn new(device: BlockDevice, payload: Payload, layout: LayoutOptions) -> Self {
        Self {
            device,
            payload,
            layout,
        }
    }
}

#[derive(Debug)]
struct JobState {
    state: WriteState,
    cancel_requested: bool,
    cancel_window: WriteState,
    child: Option<u32>,
}

impl JobState {
    fn cancellable(&self) -> bool {
        !self.state.is_terminal() && self.state.rank() <= self.cancel_window.rank()
    }
}

/// The mutable half of a job, shared between its worker and observers.
///
/// State, cancellation flag and child pid sit behind one mutex; nothing reads
/// or writes them outside it.
#[derive(Clone, Debug)]
pub struct JobControl {
    inner: Arc<Mutex<JobState>>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        Self::with_cancel_window(WriteState::Writing)
    }

    /// A control whose cancellation requests are only acknowledged up to and
    /// including `last`.
    pub fn with_cancel_window(last: WriteState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(JobState {
                state: WriteState::Idle,
                cancel_requested: false,
                cancel_window: last,
                child: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> WriteState {
        self.lock().state
    }

    /// Moves to `next`, rejecting backwards moves and anything after a
    /// terminal state.
    pub fn transition(&self, next: WriteState) -> Result<WriteState> {
        let mut guard = self.lock();
        let from = guard.state;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        guard.state = next;
        Ok(from)
    }

    /// Like [`transition`](Self::transition), but fails with
    /// [`Error::Cancelled`] instead when a cancellation was acknowledged and
    /// is still pending. Check and move happen under one lock, so a request
    /// that returned `true` is never lost at a stage boundary.
    pub fn advance(&self, next: WriteState) -> Result<WriteState> {
        let mut guard = self.lock();
        if guard.cancel_requested && guard.cancellable() {
            return Err(Error::Cancelled);
        }
        let from = guard.state;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        guard.state = next;
        Ok(from)
    }

    /// Asks the job to stop. Returns whether the job is still inside its
    /// cancel window and so will act on the request.
    pub fn request_cancel(&self) -> bool {
        let mut guard = self.lock();
        guard.cancel_requested = true;
        guard.cancellable()
    }

    /// Whether a pending request must be honoured now.
    pub fn should_stop(&self) -> bool {
        let guard = self.lock();
        guard.cancel_requested && guard.cancellable()
    }

    pub fn cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    pub fn set_child(&self, pid: Option<u32>) {
        self.lock().child = pid;
    }

    /// The pid of the external process currently doing the job's work.
    pub fn child(&self) -> Option<u32> {
        self.lock().child
    }
}
