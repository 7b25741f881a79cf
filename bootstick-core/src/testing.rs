//! In-memory stand-ins for the system seams, shared by the unit tests.
use crate::clock::Clock;
use crate::device::{BlockDevice, BusType};
use crate::error::{Error, Result};
use crate::platform::{DeviceIo, DeviceSource};
use crate::process::{Exit, Invocation, Launcher, Output, Process};
use crate::safety::{MountEntry, MountSource};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn usb_stick(name: &str, size_bytes: u64) -> BlockDevice {
    BlockDevice {
        name: name.to_string(),
        path: PathBuf::from("/dev").join(name),
        size_bytes,
        sector_size: 512,
        bus: BusType::Usb,
        removable: true,
        mountpoints: Vec::new(),
        vendor: Some("Generic".to_string()),
        model: Some("Flash Disk".to_string()),
    }
}

/// A mount table that only changes when the test says so.
#[derive(Default)]
pub struct StaticMounts {
    entries: Mutex<Vec<MountEntry>>,
}

impl StaticMounts {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        let mounts = Self::default();
        mounts.set(entries);
        mounts
    }

    pub fn set(&self, entries: &[(&str, &str)]) {
        *self.entries.lock().unwrap() = entries
            .iter()
            .map(|(source, target)| MountEntry {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
            })
            .collect();
    }
}

impl MountSource for StaticMounts {
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }
}

/// A clock whose time only moves when something sleeps on it.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
    sleeps: AtomicUsize,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: AtomicUsize::new(0),
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.offset.lock().unwrap() += duration;
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        // Gives observer threads a chance to run.
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Replays a scripted sequence of sector counters and counts flushes.
pub struct FakeDeviceIo {
    readings: Mutex<VecDeque<Option<u64>>>,
    last: Mutex<Option<u64>>,
    flushes: AtomicUsize,
    fail_flush: bool,
}

impl FakeDeviceIo {
    /// Once the script runs out the last reading repeats.
    pub fn new(readings: impl IntoIterator<Item = Option<u64>>) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().collect()),
            last: Mutex::new(None),
            flushes: AtomicUsize::new(0),
            fail_flush: false,
        }
    }

    pub fn failing_flush(mut self) -> Self {
        self.fail_flush = true;
        self
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl DeviceIo for FakeDeviceIo {
    fn sectors_written(&self, _device: &BlockDevice) -> Option<u64> {
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.readings.lock().unwrap().pop_front() {
            *last = next;
        }
        *last
    }

    fn flush(&self, device: &Path) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush {
            return Err(Error::io(
                device,
                std::io::Error::other("simulated flush failure"),
            ));
        }
        Ok(())
    }
}

/// Hands out whatever device list the test last stored.
#[derive(Default)]
pub struct FakeDevices {
    devices: Mutex<Vec<BlockDevice>>,
}

impl FakeDevices {
    pub fn set(&self, devices: Vec<BlockDevice>) {
        *self.devices.lock().unwrap() = devices;
    }
}

impl DeviceSource for FakeDevices {
    fn devices(&self) -> Result<Vec<BlockDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

const SECTOR: u64 = 512;
const FIRST_LBA: u64 = 2048;
const GPT_BACKUP_SECTORS: u64 = 33;

#[derive(Clone, Debug)]
struct FakePartition {
    start: u64,
    size: u64,
    type_code: String,
    bootable: bool,
    name: Option<String>,
}

#[derive(Clone, Debug)]
struct FakeTable {
    label: String,
    partitions: Vec<FakePartition>,
}

struct LauncherState {
    calls: Vec<Invocation>,
    table: Option<FakeTable>,
    failing: HashSet<String>,
    holding: HashSet<String>,
    gated: HashSet<String>,
    missing: HashSet<String>,
    polls_before_exit: u32,
}

/// Pretends to be the system's tool chest.
///
/// `sfdisk` is simulated against an in-memory partition table. Spawned
/// programs exit successfully after a few polls unless told to fail or to
/// run until terminated. Everything else succeeds silently.
pub struct FakeLauncher {
    disk_sectors: u64,
    state: Mutex<LauncherState>,
    next_pid: AtomicU32,
    terminations: Arc<AtomicUsize>,
}

const KNOWN_TOOLS: &[&str] = &[
    "sfdisk",
    "dd",
    "mkfs.fat",
    "mkfs.ntfs",
    "mkfs.exfat",
    "mkfs.ext2",
    "mkfs.ext3",
    "mkfs.ext4",
    "mkudffs",
    "mount",
    "umount",
    "xorriso",
    "bsdtar",
    "7z",
];

fn simulated_failure() -> Output {
    Output {
        exit: Exit { code: Some(1) },
        stdout: Vec::new(),
        stderr: b"simulated failure".to_vec(),
    }
}

fn ok(stdout: Vec<u8>) -> Output {
    Output {
        exit: Exit { code: Some(0) },
        stdout,
        stderr: Vec::new(),
    }
}

/// Strips a privilege-escalation prefix so calls are recorded by tool name.
fn unwrap_privilege(invocation: &Invocation) -> Invocation {
    if invocation.program_name() == "pkexec" && !invocation.args.is_empty() {
        let mut args = invocation.args.clone();
        let program = args.remove(0);
        return Invocation {
            program,
            args,
            stdin: invocation.stdin.clone(),
        };
    }
    invocation.clone()
}

impl FakeLauncher {
    pub fn new(disk_bytes: u64) -> Self {
        Self {
            disk_sectors: disk_bytes / SECTOR,
            state: Mutex::new(LauncherState {
                calls: Vec::new(),
                table: None,
                failing: HashSet::new(),
                holding: HashSet::new(),
                gated: HashSet::new(),
                missing: HashSet::new(),
                polls_before_exit: 3,
            }),
            next_pid: AtomicU32::new(4000),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_program(&self, program: &str) {
        self.state.lock().unwrap().failing.insert(program.to_string());
    }

    /// Spawned instances of `program` never exit on their own.
    pub fn hold_program(&self, program: &str) {
        self.state.lock().unwrap().holding.insert(program.to_string());
    }

    /// Run-to-completion calls of `program` block until [`open_gate`] is
    /// called for it.
    ///
    /// [`open_gate`]: Self::open_gate
    pub fn gate_program(&self, program: &str) {
        self.state.lock().unwrap().gated.insert(program.to_string());
    }

    pub fn open_gate(&self, program: &str) {
        self.state.lock().unwrap().gated.remove(program);
    }

    pub fn remove_tool(&self, program: &str) {
        self.state.lock().unwrap().missing.insert(program.to_string());
    }

    pub fn set_polls_before_exit(&self, polls: u32) {
        self.state.lock().unwrap().polls_before_exit = polls;
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program_name() == program)
            .collect()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    fn last_usable(&self, label: &str) -> u64 {
        if label == "gpt" {
            self.disk_sectors - GPT_BACKUP_SECTORS - 1
        } else {
            self.disk_sectors - 1
        }
    }

    /// One past the last byte a partition may occupy under the current table.
    pub fn disk_end_bytes(&self) -> u64 {
        let label = self
            .state
            .lock()
            .unwrap()
            .table
            .as_ref()
            .map(|t| t.label.clone())
            .unwrap_or_default();
        (self.last_usable(&label) + 1) * SECTOR
    }

    fn sfdisk(&self, invocation: &Invocation, state: &mut LauncherState) -> Output {
        let stdin = invocation
            .stdin
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();

        if invocation.has_arg("--json") {
            return match &state.table {
                Some(table) => ok(self.dump(table).into_bytes()),
                None => Output {
                    exit: Exit { code: Some(1) },
                    stdout: Vec::new(),
                    stderr: b"does not contain a recognized partition table".to_vec(),
                },
            };
        }

        if invocation.has_arg("--part-label") {
            let args: Vec<String> = invocation
                .args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect();
            let at = args.iter().position(|a| a == "--part-label").unwrap_or(0);
            let index: usize = args[at + 2].parse().unwrap();
            let label = args[at + 3].clone();
            if let Some(p) = state
                .table
                .as_mut()
                .and_then(|t| t.partitions.get_mut(index - 1))
            {
                p.name = Some(label);
                return ok(Vec::new());
            }
            return simulated_failure();
        }

        if invocation.has_arg("--append") {
            let Some(table) = state.table.as_mut() else {
                return simulated_failure();
            };
            let fields: Vec<&str> = stdin.trim().split(',').map(str::trim).collect();
            let previous_end = table
                .partitions
                .last()
                .map(|p| p.start + p.size)
                .unwrap_or(FIRST_LBA);
            let start = match fields[0] {
                "" => previous_end,
                s => s.parse().unwrap(),
            };
            let last = self.last_usable(&table.label);
            let size = match fields[1] {
                "" => last - start + 1,
                s => s.parse().unwrap(),
            };
            table.partitions.push(FakePartition {
                start,
                size,
                type_code: fields[2].to_string(),
                bootable: fields.get(3) == Some(&"*"),
                name: None,
            });
            return ok(Vec::new());
        }

        let label = stdin
            .lines()
            .find_map(|l| l.strip_prefix("label:"))
            .map(str::trim)
            .unwrap_or("dos")
            .to_string();
        state.table = Some(FakeTable {
            label,
            partitions: Vec::new(),
        });
        ok(Vec::new())
    }

    fn dump(&self, table: &FakeTable) -> String {
        let partitions: Vec<_> = table
            .partitions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut value = json!({
                    "node": format!("/dev/sdx{}", i + 1),
                    "start": p.start,
                    "size": p.size,
                    "type": p.type_code,
                });
                if p.bootable {
                    value["bootable"] = json!(true);
                }
                if let Some(name) = &p.name {
                    value["name"] = json!(name);
                }
                value
            })
            .collect();
        json!({
            "partitiontable": {
                "label": table.label,
                "unit": "sectors",
                "sectorsize": SECTOR,
                "partitions": partitions,
            }
        })
        .to_string()
    }
}

impl Launcher for FakeLauncher {
    fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn Process>> {
        let call = unwrap_privilege(invocation);
        let name = call.program_name();
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        let polls = (!state.holding.contains(&name)).then_some(state.polls_before_exit);
        let code = if state.failing.contains(&name) { 1 } else { 0 };
        Ok(Box::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            polls_left: polls,
            code,
            terminated: false,
            terminations: self.terminations.clone(),
        }))
    }

    fn output(&self, invocation: &Invocation) -> Result<Output> {
        let call = unwrap_privilege(invocation);
        let name = call.program_name();
        self.state.lock().unwrap().calls.push(call.clone());
        while self.state.lock().unwrap().gated.contains(&name) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&name) {
            return Ok(simulated_failure());
        }
        if name == "sfdisk" {
            return Ok(self.sfdisk(&call, &mut state));
        }
        Ok(ok(Vec::new()))
    }

    fn resolve(&self, program: &str) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        (KNOWN_TOOLS.contains(&program) && !state.missing.contains(program))
            .then(|| PathBuf::from("/usr/bin").join(program))
    }
}

struct FakeProcess {
    pid: u32,
    /// `None` runs until terminated.
    polls_left: Option<u32>,
    code: i32,
    terminated: bool,
    terminations: Arc<AtomicUsize>,
}

impl Process for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<Exit>> {
        if self.terminated {
            return Ok(Some(Exit { code: None }));
        }
        match self.polls_left.as_mut() {
            None => Ok(None),
            Some(0) => Ok(Some(Exit {
                code: Some(self.code),
            })),
            Some(n) => {
                *n -= 1;
                Ok(None)
            }
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if !self.terminated {
            self.terminated = true;
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<Exit> {
        if self.terminated || self.polls_left.is_none() {
            return Ok(Exit { code: None });
        }
        Ok(Exit {
            code: Some(self.code),
        })
    }

    fn drain(&mut self) -> Result<usize> {
        Ok(0)
    }
}
