//! Contains the logic for writing a raw image onto a whole device.
//!
//! Writing happens in two steps:
//! 1.  Decompressing the image to a temporary file if it is compressed
//!     (`.gz`, `.xz`, `.zst`), so that its real size is known up front.
//! 2.  Copying the image onto the device with an external `dd` while sampling
//!     the device's sectors-written counter for progress.
use crate::clock::Ticker;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::job::JobControl;
use crate::platform::DeviceIo;
use crate::process::{Exit, Invocation, Launcher, Privilege, Process};
use crate::progress::{ProgressSampler, STAT_SECTOR_BYTES, WriteProgress};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Some(Compression::Gzip),
            "xz" => Some(Compression::Xz),
            "zst" | "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

pub fn is_compressed(path: &Path) -> bool {
    Compression::from_path(path).is_some()
}

/// A raw image ready for copying.
/// If the image was decompressed to a temp file, this struct holds the handle
/// and will delete the file on drop.
#[derive(Debug)]
pub struct DecompressedImage {
    path: PathBuf,
    len: u64,
    _temp_handle: Option<TempPath>,
}

impl DecompressedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<Path> for DecompressedImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

fn file_len(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::io(path, e))
}

/// Decompresses `input_path` to a temporary file if its extension says it is
/// compressed; otherwise returns the file itself. `cancelled` is polled
/// between buffers; `on_progress` receives the decompressed byte count.
pub fn decompress_image<C, F>(
    input_path: &Path,
    cancelled: C,
    mut on_progress: F,
) -> Result<DecompressedImage>
where
    C: Fn() -> bool,
    F: FnMut(u64),
{
    let Some(compression) = Compression::from_path(input_path) else {
        return Ok(DecompressedImage {
            path: input_path.to_path_buf(),
            len: file_len(input_path)?,
            _temp_handle: None,
        });
    };

    let input_file = File::open(input_path).map_err(|e| Error::io(input_path, e))?;
    let mut reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(input_file))),
        Compression::Xz => Box::new(XzDecoder::new(BufReader::new(input_file))),
        Compression::Zstd => Box::new(
            ZstdDecoder::new(input_file).map_err(|e| Error::io(input_path, e))?,
        ),
    };

    info!("Decompressing {} ({compression:?})", input_path.display());
    let mut temp_file = NamedTempFile::new().map_err(|e| Error::io(std::env::temp_dir(), e))?;
    let temp_name = temp_file.path().to_path_buf();
    let mut total: u64 = 0;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            if cancelled() {
                return Err(Error::Cancelled);
            }

            let n = reader
                .read(&mut buffer)
                .map_err(|e| Error::io(input_path, e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .map_err(|e| Error::io(&temp_name, e))?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush().map_err(|e| Error::io(&temp_name, e))?;
    }
    debug!("Decompressed {total} bytes to {}", temp_name.display());

    // Hand over ownership of the temp file to the DecompressedImage struct.
    let temp_path = temp_file.into_temp_path();
    Ok(DecompressedImage {
        path: temp_path.to_path_buf(),
        len: total,
        _temp_handle: Some(temp_path),
    })
}

/// How a copy ended when it did not fail.
#[derive(Debug)]
pub enum WriteOutcome {
    /// `dd` exited zero. The sampler still has to be finished once the
    /// device has been flushed.
    Copied(ProgressSampler),
    Cancelled,
}

enum Polled {
    Exited(Exit),
    Cancelled,
}

/// Copies an image onto a device with `dd`.
pub struct RawImageWriter {
    launcher: Arc<dyn Launcher>,
    device_io: Arc<dyn DeviceIo>,
    privilege: Privilege,
    ticker: Ticker,
    block_size: String,
}

impl RawImageWriter {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        device_io: Arc<dyn DeviceIo>,
        privilege: Privilege,
        ticker: Ticker,
        block_size: impl Into<String>,
    ) -> Self {
        Self {
            launcher,
            device_io,
            privilege,
            ticker,
            block_size: block_size.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.launcher.resolve("dd").is_some()
    }

    /// `dd bs=<block> if=<image> of=<device> conv=fsync`
    pub fn copy_invocation(&self, image: &Path, device: &Path) -> Invocation {
        let operand = |key: &str, path: &Path| {
            let mut arg = OsString::from(key);
            arg.push(path);
            arg
        };
        Invocation::new("dd")
            .arg(format!("bs={}", self.block_size))
            .arg(operand("if=", image))
            .arg(operand("of=", device))
            .arg("conv=fsync")
    }

    /// Runs the copy to completion or cancellation, reporting progress after
    /// every poll. `total` is the image size in bytes.
    ///
    /// A cancellation requested before the copy starts is honoured without
    /// spawning anything.
    pub fn write<F>(
        &self,
        control: &JobControl,
        image: &Path,
        total: u64,
        device: &BlockDevice,
        mut on_progress: F,
    ) -> Result<WriteOutcome>
    where
        F: FnMut(WriteProgress),
    {
        if control.should_stop() {
            return Ok(WriteOutcome::Cancelled);
        }

        // Capture the baseline before dd issues its first write.
        let baseline = self.device_io.sectors_written(device);
        if baseline.is_none() {
            warn!("No I/O counters for {}; progress will stay at zero", device.name);
        }
        let mut sampler = ProgressSampler::new(baseline, STAT_SECTOR_BYTES, total, self.ticker.now());

        let invocation = self
            .privilege
            .wrap(self.copy_invocation(image, &device.path))?;
        let mut child = self.launcher.spawn(&invocation)?;
        info!("Started dd with PID {}", child.id());
        control.set_child(Some(child.id()));

        let polled = self.poll(control, device, child.as_mut(), &mut sampler, &mut on_progress);
        control.set_child(None);

        match polled {
            Ok(Polled::Cancelled) => Ok(WriteOutcome::Cancelled),
            Ok(Polled::Exited(exit)) if exit.success() => Ok(WriteOutcome::Copied(sampler)),
            Ok(Polled::Exited(exit)) => Err(Error::process("dd", exit.to_string())),
            Err(e) => {
                // Never leave a copier running behind a failed job.
                if child.terminate().is_ok() {
                    let _ = child.wait();
                }
                Err(e)
            }
        }
    }

    fn poll<F>(
        &self,
        control: &JobControl,
        device: &BlockDevice,
        child: &mut dyn Process,
        sampler: &mut ProgressSampler,
        on_progress: &mut F,
    ) -> Result<Polled>
    where
        F: FnMut(WriteProgress),
    {
        loop {
            if control.should_stop() {
                info!("Cancelling dd (PID {})", child.id());
                child.terminate()?;
                let exit = child.wait()?;
                debug!("dd stopped: {exit}");
                return Ok(Polled::Cancelled);
            }

            // Drain dd's pipes so that it never blocks on a full pipe.
            child.drain()?;
            let exited = child.try_wait()?;
            on_progress(sampler.sample(self.device_io.sectors_written(device), self.ticker.now()));
            if let Some(exit) = exited {
                debug!("dd exited: {exit}");
                return Ok(Polled::Exited(exit));
            }
            self.ticker.tick();
        }
    }

    /// Pushes everything down to the device.
    pub fn sync(&self, device: &Path) -> Result<()> {
        info!("Flushing {}", device.display());
        self.device_io.flush(device)
    }
}
