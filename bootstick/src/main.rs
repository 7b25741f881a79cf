use anyhow::{Result, anyhow, bail};
use bootstick_core::clock::{SystemClock, Ticker};
use bootstick_core::config::Config;
use bootstick_core::device::BlockDevice;
use bootstick_core::digest;
use bootstick_core::job::{LayoutOptions, Payload, SourceFacts, WriteJob, WriteState};
use bootstick_core::monitor::{DeviceEvent, DeviceMonitor};
use bootstick_core::orchestrator::{JobEvent, JobReport, Orchestrator, Services};
use bootstick_core::platform::{self, SystemDevices, SystemMounts};
use bootstick_core::types::{FilesystemKind, PartitionStyle, TargetFirmware};
use bootstick_core::write;
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::io::{self, IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const EVENT_WAIT: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "bootstick")]
#[command(about = "A safe, interactive tool for preparing bootable USB drives", version)]
struct Cli {
    /// Configuration file [default: $XDG_CONFIG_HOME/bootstick/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter such as "info" or "bootstick_core=debug" (overrides RUST_LOG)
    #[arg(long = "log-filter", global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device interactively
    Write {
        /// Image file to write (.img, .iso, or .gz/.xz/.zst compressed)
        #[arg(required = true)]
        image: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Copy the image byte for byte, or unpack its files onto FAT32
        #[arg(long, value_enum, default_value_t = Mode::Raw)]
        mode: Mode,

        /// The image carries EFI boot files (required by extract mode)
        #[arg(long = "efi")]
        uefi_bootable: bool,

        /// The image is a Windows installer
        #[arg(long)]
        windows: bool,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,
    },
    /// Partition and format a device without writing an image
    Format {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show the partition table of a device
    Layout {
        /// Device to inspect (prompts when omitted)
        device: Option<PathBuf>,
    },
    /// Print the digest of a file
    Hash {
        #[arg(required = true)]
        file: PathBuf,

        /// Digest algorithm: sha256 or sha512
        #[arg(short, long, default_value = "sha256")]
        algorithm: digest::Algorithm,
    },
    /// Report devices as they are plugged in and removed
    Watch,
    /// List available removable devices
    List,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Raw,
    Extract,
}

#[derive(Args)]
struct TargetArgs {
    /// Target device such as /dev/sdb (prompts when omitted)
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Partition table style: mbr or gpt
    #[arg(long, default_value = "mbr")]
    style: PartitionStyle,

    /// Firmware the drive must boot on: bios, uefi or hybrid
    #[arg(long, default_value = "bios")]
    target: TargetFirmware,

    /// Filesystem of the data partition
    #[arg(long = "fs", default_value = "fat32")]
    filesystem: FilesystemKind,

    /// Volume label
    #[arg(short, long)]
    label: Option<String>,

    /// Cluster or block size in bytes (0 lets the tool decide)
    #[arg(long, default_value_t = 0)]
    cluster_size: u32,

    /// Do a full format where the filesystem tool distinguishes one
    #[arg(long)]
    full_format: bool,
}

impl TargetArgs {
    fn layout(&self) -> LayoutOptions {
        LayoutOptions {
            style: self.style,
            firmware: self.target,
            filesystem: self.filesystem,
            label: self.label.clone(),
            cluster_size: self.cluster_size,
            quick_format: !self.full_format,
        }
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// By disabling it, we can have a cleaner exit when the user cancels the
/// operation, as the `ctrlc` handler will print its own message.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                // Disable printing of control characters.
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(filter: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs().init();
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[BlockDevice], prompt: &str) -> Result<BlockDevice> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Uses the device given on the command line, or asks for one.
fn resolve_device(config: &Config, device: Option<&Path>, prompt: &str) -> Result<BlockDevice> {
    match device {
        Some(path) => Ok(platform::probe(path, &SystemMounts)?),
        None => {
            let devices = platform::get_removable_devices(&config.devices, &SystemMounts)?;
            select_device(&devices, prompt)
        }
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Names the device and what will happen to it, then asks.
fn confirm_erase(device: &BlockDevice, details: &[(&str, String)]) -> Result<bool> {
    println!(
        "{} This will erase all data on '{}' ({:.1} GB). This cannot be undone.",
        style("WARNING:").red().bold(),
        device.display_name(),
        device.size_gb(),
    );
    println!("  {:<8} {}", "Device:", style(device.path.display()).cyan());
    for (key, value) in details {
        println!("  {:<8} {}", format!("{key}:"), style(value).cyan());
    }
    if device.is_mounted() {
        println!(
            "  {} its mounted partitions will be unmounted first.",
            style("Note:").yellow()
        );
    }
    println!();

    confirm_operation("Are you sure you want to proceed?")
}

fn bytes_style(color: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(&format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
        ))?
        .progress_chars("■ "))
}

fn stage_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{prefix:12} [{elapsed_precise}] [{bar:40.cyan/black}] {percent:>3}% {msg}")?
        .progress_chars("■ "))
}

fn spinner_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {bytes} ({bytes_per_sec}) {msg}")?)
}

fn stage_name(state: WriteState) -> &'static str {
    match state {
        WriteState::Idle => "Preparing",
        WriteState::Partitioning => "Partition",
        WriteState::Formatting => "Format",
        WriteState::Writing => "Writing",
        WriteState::Syncing => "Syncing",
        WriteState::Complete => "Done",
        WriteState::Error => "Failed",
        WriteState::Cancelled => "Cancelled",
    }
}

/// Submits `job` and renders its events until it finishes. Ctrl+C is turned
/// into a cancellation request.
fn run_job(orchestrator: &Orchestrator, job: WriteJob, running: &AtomicBool) -> Result<JobReport> {
    let (tx, rx) = mpsc::channel();
    let handle = orchestrator.submit(job, tx)?;

    let pb = ProgressBar::new(100);
    pb.set_style(stage_style()?);
    pb.set_prefix(stage_name(WriteState::Idle));
    let mut copying = false;
    let mut cancel_sent = false;

    loop {
        if !running.load(Ordering::SeqCst) && !cancel_sent {
            cancel_sent = true;
            if handle.cancel() {
                pb.println("Cancelling...");
            } else {
                pb.println("Too late to cancel; waiting for the device to settle.");
            }
        }

        match rx.recv_timeout(EVENT_WAIT) {
            Ok(JobEvent::State(state)) => {
                if copying {
                    copying = false;
                    pb.set_style(stage_style()?);
                }
                pb.set_prefix(stage_name(state));
                pb.set_length(100);
                pb.set_position(0);
                pb.set_message("");
            }
            Ok(JobEvent::Stage {
                fraction, message, ..
            }) => {
                pb.set_position((fraction.clamp(0.0, 1.0) * 100.0) as u64);
                pb.set_message(message);
            }
            Ok(JobEvent::Bytes(progress)) => {
                if !copying {
                    copying = true;
                    pb.set_style(bytes_style("green")?);
                }
                pb.set_length(progress.total_bytes);
                pb.set_position(progress.bytes_written);
            }
            Ok(JobEvent::Finished(_)) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    let report = handle.join();
    match report.state {
        WriteState::Complete => pb.finish_with_message("Complete."),
        _ => pb.abandon(),
    }
    Ok(report)
}

/// Turns a finished job into the command's outcome.
fn check_report(report: &JobReport) -> Result<()> {
    match (report.state, &report.failure) {
        (WriteState::Complete, _) => Ok(()),
        (WriteState::Cancelled, _) => bail!("Operation cancelled."),
        (_, Some(failure)) => bail!("{} ({:?} error)", failure.reason, failure.kind),
        (state, None) => bail!("Job ended in state {state}"),
    }
}

/// Decompresses `image` up front with a spinner so the same bytes can be
/// verified afterwards. Returns `None` for uncompressed images.
fn decompress_for_write(
    image: &Path,
    running: &AtomicBool,
) -> Result<Option<write::DecompressedImage>> {
    if !write::is_compressed(image) {
        return Ok(None);
    }

    let pb = ProgressBar::new_spinner();
    pb.set_prefix("Decompress");
    pb.set_style(spinner_style()?);
    pb.enable_steady_tick(Duration::from_millis(100));

    let result = write::decompress_image(
        image,
        || !running.load(Ordering::SeqCst),
        |bytes| pb.set_position(bytes),
    );
    match result {
        Ok(decompressed) => {
            pb.finish_with_message("Decompression complete.");
            Ok(Some(decompressed))
        }
        Err(e) => {
            pb.finish_with_message("❌ Operation failed.");
            Err(e.into())
        }
    }
}

fn verify(image: &Path, device: &BlockDevice, running: &AtomicBool) -> Result<()> {
    let len = std::fs::metadata(image)?.len();
    let pb = ProgressBar::new(len);
    pb.set_prefix("Verifying");
    pb.set_style(bytes_style("magenta")?);

    match digest::verify_device(image, &device.path, running, |bytes| pb.set_position(bytes)) {
        Ok(()) => {
            pb.finish_with_message("Verification successful.");
            Ok(())
        }
        Err(bootstick_core::Error::Io { source, .. })
            if source.kind() == io::ErrorKind::PermissionDenied =>
        {
            pb.finish_and_clear();
            println!(
                "{} cannot read {} back without root; verification skipped.",
                style("Note:").yellow(),
                device.path.display()
            );
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            Err(e.into())
        }
    }
}

fn write_command(
    config: Config,
    image: PathBuf,
    target: TargetArgs,
    mode: Mode,
    facts: SourceFacts,
    no_verify: bool,
    running: &AtomicBool,
) -> Result<()> {
    let device = resolve_device(
        &config,
        target.device.as_deref(),
        "Select the target device to WRITE to",
    )?;
    let layout = target.layout();

    let mode_detail = match mode {
        Mode::Raw => "raw copy".to_string(),
        Mode::Extract => format!("extract files onto FAT32 ({} table)", layout.style),
    };
    if !confirm_erase(
        &device,
        &[("Image", image.display().to_string()), ("Mode", mode_detail)],
    )? {
        println!("Write operation cancelled.");
        return Ok(());
    }
    println!();

    let orchestrator = Orchestrator::new(Services::system(&config), config);
    let (job, verify_source) = match mode {
        Mode::Raw => {
            let decompressed = decompress_for_write(&image, running)?;
            let source = decompressed
                .as_ref()
                .map_or_else(|| image.clone(), |d| d.path().to_path_buf());
            let job = WriteJob::new(
                device.clone(),
                Payload::RawImage {
                    image: source.clone(),
                },
                layout,
            );
            (job, Some((source, decompressed)))
        }
        Mode::Extract => {
            let job = WriteJob::new(
                device.clone(),
                Payload::FilesystemExtract {
                    archive: image.clone(),
                    facts,
                },
                layout,
            );
            (job, None)
        }
    };

    let report = run_job(&orchestrator, job, running)?;
    check_report(&report)?;

    match verify_source {
        Some((source, _decompressed)) if !no_verify => verify(&source, &device, running)?,
        Some(_) => println!("Write complete (verification skipped)."),
        None => {}
    }

    println!(
        "\n✨ Successfully flashed {} with {}.",
        style(device.path.display()).cyan(),
        style(image.display()).cyan()
    );
    Ok(())
}

fn format_command(config: Config, target: TargetArgs, running: &AtomicBool) -> Result<()> {
    let device = resolve_device(
        &config,
        target.device.as_deref(),
        "Select the device to FORMAT",
    )?;
    let layout = target.layout();

    let detail = format!(
        "{} table, {} for {}",
        layout.style, layout.filesystem, layout.firmware
    );
    if !confirm_erase(&device, &[("Layout", detail)])? {
        println!("Format operation cancelled.");
        return Ok(());
    }
    println!();

    let orchestrator = Orchestrator::new(Services::system(&config), config);
    let report = run_job(
        &orchestrator,
        WriteJob::new(device.clone(), Payload::FormatOnly, layout),
        running,
    )?;
    check_report(&report)?;

    println!("\n✨ Successfully formatted {}.", style(device.path.display()).cyan());
    Ok(())
}

fn layout_command(config: Config, device: Option<PathBuf>) -> Result<()> {
    let device = resolve_device(&config, device.as_deref(), "Select the device to inspect")?;
    let orchestrator = Orchestrator::new(Services::system(&config), config);
    let layout = orchestrator.partition_engine().get_layout(&device)?;

    println!(
        "{} ({}): {} partition table",
        device.path.display(),
        device.display_name(),
        layout.style
    );
    if layout.partitions.is_empty() {
        println!("  (no partitions)");
        return Ok(());
    }
    println!(
        "\n  {:<16} {:>12} {:>10} {:<8} {:<5} {}",
        "PARTITION", "START", "SIZE", "FS", "BOOT", "LABEL"
    );
    println!("  {:-<16} {:-<12} {:-<10} {:-<8} {:-<5} {:-<12}", "", "", "", "", "", "");
    for (i, entry) in layout.partitions.iter().enumerate() {
        let node = bootstick_core::partition::partition_path(&device.path, i as u32 + 1);
        let kind = if entry.efi_system {
            "ESP".to_string()
        } else {
            entry.filesystem.to_string()
        };
        println!(
            "  {:<16} {:>12} {:>7.1} GB {:<8} {:<5} {}",
            node.display(),
            entry.start,
            entry.size as f64 / (1024.0 * 1024.0 * 1024.0),
            kind,
            if entry.bootable { "*" } else { "" },
            entry.label.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn hash_command(file: &Path, algorithm: digest::Algorithm, running: &AtomicBool) -> Result<()> {
    let len = std::fs::metadata(file)?.len();
    let pb = ProgressBar::new(len);
    pb.set_prefix("Hashing");
    pb.set_style(bytes_style("blue")?);

    let digest = digest::file_digest(file, algorithm, running, |bytes| pb.set_position(bytes));
    pb.finish_and_clear();
    println!("{}  {}", digest?, file.display());
    Ok(())
}

fn watch_command(config: Config, running: &AtomicBool) -> Result<()> {
    let source = SystemDevices::new(config.devices.clone(), Arc::new(SystemMounts));
    let ticker = Ticker::new(Arc::new(SystemClock), config.timing.monitor_interval());
    let mut monitor = DeviceMonitor::new(Arc::new(source), ticker);
    let events = monitor.start()?;

    println!("Watching for devices. Press Ctrl+C to stop.\n");
    while running.load(Ordering::SeqCst) {
        match events.next_timeout(EVENT_WAIT) {
            Some(DeviceEvent::Added(device)) => {
                println!("  {} {device}", style("+").green().bold());
            }
            Some(DeviceEvent::Removed(path)) => {
                println!("  {} {}", style("-").red().bold(), path.display());
            }
            None => {}
        }
    }
    monitor.stop();
    Ok(())
}

fn list_command(config: &Config) -> Result<()> {
    let devices = platform::get_removable_devices(&config.devices, &SystemMounts)?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<25} {:<10} {:<6} {}",
        "DEVICE", "NAME", "SIZE", "BUS", "LOCATION"
    );
    println!("  {:-<12} {:-<25} {:-<10} {:-<6} {:-<20}", "", "", "", "", "");
    for device in devices {
        let name = match (&device.vendor, &device.model) {
            (Some(vendor), Some(model)) => format!("{vendor} {model}"),
            (_, Some(model)) => model.clone(),
            (Some(vendor), None) => vendor.clone(),
            (None, None) => device.name.clone(),
        };
        let location = if device.mountpoints.is_empty() {
            "(Not mounted)".to_string()
        } else {
            device
                .mountpoints
                .iter()
                .map(|mp| mp.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "  {:<12} {:<25} {:>7.1} GB {:<6} {}",
            device.path.display(),
            name,
            device.size_gb(),
            device.bus.to_string(),
            location
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Set up the Ctrl+C handler to toggle the `running` flag.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());
    let config = Config::load_or_default(cli.config.as_deref())?;
    debug!("Configuration: {config:?}");

    match cli.command {
        Commands::Write {
            image,
            target,
            mode,
            uefi_bootable,
            windows,
            no_verify,
        } => {
            let facts = SourceFacts {
                uefi_bootable,
                windows,
            };
            write_command(config, image, target, mode, facts, no_verify, &running)
        }
        Commands::Format { target } => format_command(config, target, &running),
        Commands::Layout { device } => layout_command(config, device),
        Commands::Hash { file, algorithm } => hash_command(&file, algorithm, &running),
        Commands::Watch => watch_command(config, &running),
        Commands::List => list_command(&config),
    }
}
