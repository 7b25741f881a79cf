//! Runs deployment jobs from submission to a terminal state.
//!
//! Everything that can be checked without touching the device is checked in
//! [`Orchestrator::validate`] before a worker thread is spawned, so safety and
//! configuration errors surface while the job is still `Idle`. The worker then
//! walks the stages in order, reporting over a channel; its last message is
//! always [`JobEvent::Finished`].
use crate::clock::{Clock, Ticker};
use crate::config::Config;
use crate::device::{BlockDevice, BusType};
use crate::error::{Error, ErrorKind, Result};
use crate::extract::FilesystemExtractor;
use crate::format::{FormatDispatcher, FormatRequest};
use crate::job::{JobControl, LayoutOptions, Payload, WriteJob, WriteState};
use crate::partition::{self, PartitionEngine};
use crate::platform::DeviceIo;
use crate::process::{Invocation, Launcher, Privilege};
use crate::progress::WriteProgress;
use crate::safety::{self, MountSource};
use crate::types::FilesystemKind;
use crate::write::{self, RawImageWriter, WriteOutcome};
use log::{debug, error, info};
use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// The system seams every stage runs against.
#[derive(Clone)]
pub struct Services {
    pub launcher: Arc<dyn Launcher>,
    pub device_io: Arc<dyn DeviceIo>,
    pub mounts: Arc<dyn MountSource>,
    pub clock: Arc<dyn Clock>,
    pub privilege: Privilege,
}

impl Services {
    /// Real processes, sysfs, the live mount table and the wall clock.
    #[cfg(target_os = "linux")]
    pub fn system(config: &Config) -> Self {
        use crate::clock::SystemClock;
        use crate::platform::{LinuxDeviceIo, SystemMounts};
        use crate::process::SystemLauncher;

        Self {
            launcher: Arc::new(SystemLauncher),
            device_io: Arc::new(LinuxDeviceIo),
            mounts: Arc::new(SystemMounts),
            clock: Arc::new(SystemClock),
            privilege: Privilege::detect(&config.privilege.launchers),
        }
    }
}

/// Why a job ended in `Error` or `Cancelled`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub reason: String,
}

/// The final word on a job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobReport {
    pub state: WriteState,
    pub bytes_written: u64,
    pub failure: Option<JobFailure>,
}

/// Notifications sent from a job's worker, in the order they happen.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// The job entered a new state.
    State(WriteState),
    /// Coarse progress of a stage without byte-level reporting.
    Stage {
        state: WriteState,
        fraction: f64,
        message: String,
    },
    /// Copy progress; `bytes_written` never decreases within a job.
    Bytes(WriteProgress),
    Finished(JobReport),
}

/// Marks a device as taken until dropped.
struct DeviceClaim {
    busy: Arc<Mutex<HashSet<PathBuf>>>,
    device: PathBuf,
}

fn lock_busy(busy: &Mutex<HashSet<PathBuf>>) -> MutexGuard<'_, HashSet<PathBuf>> {
    busy.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceClaim {
    fn acquire(busy: &Arc<Mutex<HashSet<PathBuf>>>, device: &Path) -> Result<Self> {
        if !lock_busy(busy).insert(device.to_path_buf()) {
            return Err(Error::DeviceBusy(device.to_path_buf()));
        }
        Ok(Self {
            busy: busy.clone(),
            device: device.to_path_buf(),
        })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        lock_busy(&self.busy).remove(&self.device);
    }
}

/// A running job.
pub struct JobHandle {
    control: JobControl,
    join: Option<thread::JoinHandle<JobReport>>,
}

impl JobHandle {
    pub fn state(&self) -> WriteState {
        self.control.state()
    }

    /// Requests cancellation; see [`JobControl::request_cancel`].
    pub fn cancel(&self) -> bool {
        self.control.request_cancel()
    }

    pub fn control(&self) -> &JobControl {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Waits for the worker and returns its report.
    pub fn join(mut self) -> JobReport {
        let Some(join) = self.join.take() else {
            return JobReport {
                state: self.control.state(),
                bytes_written: 0,
                failure: None,
            };
        };
        match join.join() {
            Ok(report) => report,
            Err(_) => JobReport {
                state: self.control.state(),
                bytes_written: 0,
                failure: Some(JobFailure {
                    kind: ErrorKind::Process,
                    reason: "job worker panicked".to_string(),
                }),
            },
        }
    }
}

/// The format request for a job's data partition.
fn data_request(layout: &LayoutOptions, sector_size: u32) -> FormatRequest {
    FormatRequest {
        quick: layout.quick_format,
        ..FormatRequest::new(layout.filesystem)
            .with_label(layout.label.as_deref())
            .with_cluster_size(layout.cluster_size)
            .with_sector_size(sector_size)
    }
}

/// Validates jobs and runs each on its own worker thread, one job per device.
pub struct Orchestrator {
    services: Services,
    config: Config,
    busy: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Orchestrator {
    pub fn new(services: Services, config: Config) -> Self {
        Self {
            services,
            config,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ticker(&self, interval: std::time::Duration) -> Ticker {
        Ticker::new(self.services.clock.clone(), interval)
    }

    /// An engine wired to this orchestrator's services, e.g. for read-only
    /// layout inspection.
    pub fn partition_engine(&self) -> PartitionEngine {
        PartitionEngine::new(
            self.services.launcher.clone(),
            self.services.privilege.clone(),
            self.ticker(self.config.timing.settle_delay()),
        )
    }

    fn format_dispatcher(&self) -> FormatDispatcher {
        FormatDispatcher::new(
            self.services.launcher.clone(),
            self.services.privilege.clone(),
            self.ticker(self.config.timing.format_tick()),
        )
    }

    fn raw_writer(&self) -> RawImageWriter {
        RawImageWriter::new(
            self.services.launcher.clone(),
            self.services.device_io.clone(),
            self.services.privilege.clone(),
            self.ticker(self.config.timing.poll_interval()),
            self.config.copy.block_size.clone(),
        )
    }

    fn extractor(&self) -> FilesystemExtractor {
        FilesystemExtractor::new(self.services.launcher.clone(), self.services.privilege.clone())
    }

    /// Checks everything that can be checked before the first destructive
    /// call and returns a freshly revalidated device snapshot.
    pub fn validate(&self, job: &WriteJob) -> Result<BlockDevice> {
        let device = safety::revalidate(&job.device, self.services.mounts.as_ref())?;

        if self.config.devices.usb_only && device.bus != BusType::Usb {
            return Err(Error::safety(
                &device.path,
                format!("only USB devices are accepted, this one is on the {} bus", device.bus),
            ));
        }

        self.services.privilege.ensure_available()?;

        let engine = self.partition_engine();
        if !engine.is_available() {
            return Err(Error::Configuration("sfdisk not found".to_string()));
        }

        let dispatcher = self.format_dispatcher();
        match &job.payload {
            Payload::RawImage { .. } => {
                if !self.raw_writer().is_available() {
                    return Err(Error::Configuration("dd not found".to_string()));
                }
            }
            Payload::FilesystemExtract { facts, .. } => {
                if !facts.uefi_bootable {
                    return Err(Error::Precondition(
                        "file-copy mode needs an image with EFI boot files".to_string(),
                    ));
                }
                if facts.windows {
                    return Err(Error::Precondition(
                        "Windows images cannot be deployed in file-copy mode".to_string(),
                    ));
                }
                if job.layout.filesystem != FilesystemKind::Fat32 {
                    return Err(Error::Precondition(format!(
                        "file-copy mode needs FAT32, not {}",
                        job.layout.filesystem
                    )));
                }
                if self.extractor().available_tool().is_none() {
                    return Err(Error::Configuration(
                        "no extraction tool found (xorriso, bsdtar or 7z)".to_string(),
                    ));
                }
            }
            Payload::FormatOnly => {}
        }
        if !matches!(job.payload, Payload::RawImage { .. }) {
            if !dispatcher.is_supported(job.layout.filesystem) {
                return Err(Error::Configuration(format!(
                    "{} is not supported: no formatting tool found",
                    job.layout.filesystem
                )));
            }
            data_request(&job.layout, device.sector_size).validate()?;
        }

        if let Some(source) = job.payload.source() {
            let len = std::fs::metadata(source)
                .map_err(|e| Error::io(source, e))?
                .len();
            // Compressed images are measured again once decompressed.
            if len > device.size_bytes {
                return Err(Error::safety(
                    &device.path,
                    format!(
                        "source is {len} bytes but the device holds only {} bytes",
                        device.size_bytes
                    ),
                ));
            }
        }

        Ok(device)
    }

    /// Validates `job`, claims its device and starts the worker.
    ///
    /// An `Err` here means nothing was started and the device was not
    /// touched.
    pub fn submit(&self, job: WriteJob, events: Sender<JobEvent>) -> Result<JobHandle> {
        let device = self.validate(&job)?;
        let claim = DeviceClaim::acquire(&self.busy, &device.path)?;
        let control = JobControl::with_cancel_window(job.payload.cancel_window());

        let worker = Worker {
            job: WriteJob { device, ..job },
            control: control.clone(),
            events,
            mounts: self.services.mounts.clone(),
            launcher: self.services.launcher.clone(),
            device_io: self.services.device_io.clone(),
            privilege: self.services.privilege.clone(),
            engine: self.partition_engine(),
            dispatcher: self.format_dispatcher(),
            writer: self.raw_writer(),
            extractor: self.extractor(),
            bytes_written: Cell::new(0),
        };

        let join = thread::Builder::new()
            .name("write-job".to_string())
            .spawn(move || {
                let _claim = claim;
                worker.run()
            })
            .map_err(|e| Error::io("write-job", e))?;

        Ok(JobHandle {
            control,
            join: Some(join),
        })
    }
}

struct Worker {
    job: WriteJob,
    control: JobControl,
    events: Sender<JobEvent>,
    mounts: Arc<dyn MountSource>,
    launcher: Arc<dyn Launcher>,
    device_io: Arc<dyn DeviceIo>,
    privilege: Privilege,
    engine: PartitionEngine,
    dispatcher: FormatDispatcher,
    writer: RawImageWriter,
    extractor: FilesystemExtractor,
    bytes_written: Cell<u64>,
}

impl Worker {
    fn send(&self, event: JobEvent) {
        // The caller may stop listening at any time.
        let _ = self.events.send(event);
    }

    fn enter(&self, state: WriteState) -> Result<()> {
        self.control.advance(state)?;
        info!("{}: {state}", self.job.device.path.display());
        self.send(JobEvent::State(state));
        Ok(())
    }

    fn stage(&self, fraction: f64, message: &str) {
        self.send(JobEvent::Stage {
            state: self.control.state(),
            fraction,
            message: message.to_string(),
        });
    }

    fn bytes(&self, progress: WriteProgress) {
        self.bytes_written.set(progress.bytes_written);
        self.send(JobEvent::Bytes(progress));
    }

    fn checkpoint(&self) -> Result<()> {
        if self.control.should_stop() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn run(self) -> JobReport {
        let result = self.execute();
        let failure = match result {
            Ok(()) => None,
            Err(e) => {
                let terminal = if matches!(e, Error::Cancelled) {
                    WriteState::Cancelled
                } else {
                    error!("{}: {e}", self.job.device.path.display());
                    WriteState::Error
                };
                if self.control.transition(terminal).is_ok() {
                    self.send(JobEvent::State(terminal));
                }
                Some(JobFailure {
                    kind: e.kind(),
                    reason: e.to_string(),
                })
            }
        };

        let report = JobReport {
            state: self.control.state(),
            bytes_written: self.bytes_written.get(),
            failure,
        };
        self.send(JobEvent::Finished(report.clone()));
        report
    }

    fn execute(&self) -> Result<()> {
        let image = match &self.job.payload {
            Payload::RawImage { image } => Some(self.prepare_image(image)?),
            _ => None,
        };

        self.checkpoint()?;
        // Mounts may have changed since the job was validated.
        let device = safety::revalidate(&self.job.device, self.mounts.as_ref())?;
        self.unmount_all(&device)?;

        self.enter(WriteState::Partitioning)?;
        let layout = &self.job.layout;
        let label = layout.label.as_deref();

        match &self.job.payload {
            Payload::RawImage { .. } => {
                self.engine
                    .create_single(&device, layout.style, layout.filesystem, label)?;
                let image = image.ok_or_else(|| Error::Precondition("no source image".to_string()))?;
                self.write_raw(&device, &image)
            }
            Payload::FilesystemExtract { archive, .. } => {
                let data = self.engine.create_single_efi(&device, layout.style, label)?;
                self.enter(WriteState::Formatting)?;
                self.format(&data, &self.data_request())?;

                self.enter(WriteState::Writing)?;
                self.extractor
                    .extract(archive, &data, |fraction, message| self.stage(fraction, message))?;
                self.sync(&device)
            }
            Payload::FormatOnly => {
                let plan = partition::plan_bootable_layout(
                    layout.style,
                    layout.firmware,
                    layout.filesystem,
                    label,
                );
                let nodes = self.engine.apply(&device, &plan)?;
                self.enter(WriteState::Formatting)?;
                for (node, entry) in nodes.iter().zip(&plan.partitions) {
                    self.checkpoint()?;
                    let request = if entry.efi_system {
                        FormatRequest::new(FilesystemKind::Fat32)
                            .with_label(Some(partition::ESP_LABEL))
                            .with_sector_size(device.sector_size)
                    } else {
                        self.data_request()
                    };
                    self.format(node, &request)?;
                }
                self.sync(&device)
            }
        }
    }

    /// Decompresses a raw image while the job is still `Idle` and checks the
    /// real size against the device.
    fn prepare_image(&self, image: &Path) -> Result<write::DecompressedImage> {
        if write::is_compressed(image) {
            self.stage(0.0, "Decompressing image");
        }
        let image = write::decompress_image(image, || self.control.should_stop(), |_| {})?;
        debug!("Source image is {} bytes", image.len());
        if image.len() > self.job.device.size_bytes {
            return Err(Error::safety(
                &self.job.device.path,
                format!(
                    "image is {} bytes but the device holds only {} bytes",
                    image.len(),
                    self.job.device.size_bytes
                ),
            ));
        }
        Ok(image)
    }

    fn data_request(&self) -> FormatRequest {
        data_request(&self.job.layout, self.job.device.sector_size)
    }

    fn format(&self, partition: &Path, request: &FormatRequest) -> Result<()> {
        self.dispatcher
            .format(partition, request, |fraction, message| self.stage(fraction, message))
    }

    fn unmount_all(&self, device: &BlockDevice) -> Result<()> {
        for mountpoint in &device.mountpoints {
            info!("Unmounting {}", mountpoint.display());
            let invocation = self
                .privilege
                .wrap(Invocation::new("umount").arg(mountpoint))?;
            self.launcher.output(&invocation)?.check("umount")?;
        }
        Ok(())
    }

    fn write_raw(&self, device: &BlockDevice, image: &write::DecompressedImage) -> Result<()> {
        self.enter(WriteState::Writing)?;
        let outcome = self
            .writer
            .write(&self.control, image.path(), image.len(), device, |p| self.bytes(p))?;
        match outcome {
            WriteOutcome::Cancelled => Err(Error::Cancelled),
            WriteOutcome::Copied(mut sampler) => {
                self.enter(WriteState::Syncing)?;
                self.writer.sync(&device.path)?;
                self.bytes(sampler.finish());
                self.enter(WriteState::Complete)
            }
        }
    }

    fn sync(&self, device: &BlockDevice) -> Result<()> {
        self.enter(WriteState::Syncing)?;
        self.device_io.flush(&device.path)?;
        self.enter(WriteState::Complete)
    }
}
