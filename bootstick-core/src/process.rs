//! Launching the external tools every stage delegates to.
//!
//! Commands are always built as an argument vector and handed straight to the
//! spawn primitive; nothing here ever goes through a shell. When the caller is
//! not root, destructive invocations are wrapped in a privilege-escalation
//! launcher by [`Privilege::wrap`].
use crate::error::{Error, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};

/// A program and its arguments, plus optional bytes for its standard input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// The program's name as used in error messages.
    pub fn program_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .unwrap_or(&self.program)
            .to_string_lossy()
            .into_owned()
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a child process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exit {
    /// The exit code, or `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl Exit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// The result of running a command to completion.
#[derive(Clone, Debug)]
pub struct Output {
    pub exit: Exit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    /// Turns a non-zero exit into a [`Error::Process`] carrying stderr.
    pub fn check(self, program: &str) -> Result<Self> {
        if self.exit.success() {
            return Ok(self);
        }
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stderr = stderr.trim();
        let reason = if stderr.is_empty() {
            self.exit.to_string()
        } else {
            format!("{}: {stderr}", self.exit)
        };
        Err(Error::process(program, reason))
    }
}

/// A running child process.
pub trait Process: Send {
    fn id(&self) -> u32;
    fn try_wait(&mut self) -> Result<Option<Exit>>;
    /// Sends SIGTERM. A process that has already exited is not an error.
    fn terminate(&mut self) -> Result<()>;
    fn wait(&mut self) -> Result<Exit>;
    /// Reads and discards whatever output is pending without blocking, so
    /// the child never stalls on a full pipe. Returns the number of bytes
    /// drained.
    fn drain(&mut self) -> Result<usize>;
}

/// Spawns external programs.
pub trait Launcher: Send + Sync {
    fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn Process>>;
    fn output(&self, invocation: &Invocation) -> Result<Output>;
    /// Looks a program up on the execution path.
    fn resolve(&self, program: &str) -> Option<PathBuf>;
}

/// Launches real processes with `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

fn launch_error(invocation: &Invocation, err: io::Error) -> Error {
    let reason = if err.kind() == io::ErrorKind::NotFound {
        "not found on PATH".to_string()
    } else {
        format!("failed to launch: {err}")
    };
    Error::process(invocation.program_name(), reason)
}

fn command_for(invocation: &Invocation) -> Command {
    let mut command = Command::new(&invocation.program);
    command.args(&invocation.args);
    command.stdin(if invocation.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    command
}

fn feed_stdin(child: &mut Child, invocation: &Invocation) -> Result<()> {
    if let (Some(bytes), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
        stdin
            .write_all(bytes)
            .map_err(|e| Error::process(invocation.program_name(), format!("stdin: {e}")))?;
    }
    Ok(())
}

fn set_nonblocking(fd: impl AsFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(&fd, FcntlArg::F_GETFL)?);
    fcntl(&fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

impl Launcher for SystemLauncher {
    fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn Process>> {
        debug!("Spawning: {invocation}");
        let mut child = command_for(invocation)
            .spawn()
            .map_err(|e| launch_error(invocation, e))?;
        feed_stdin(&mut child, invocation)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        for result in [
            stdout.as_ref().map(set_nonblocking),
            stderr.as_ref().map(set_nonblocking),
        ]
        .into_iter()
        .flatten()
        {
            result.map_err(|e| {
                Error::process(invocation.program_name(), format!("pipe setup: {e}"))
            })?;
        }

        Ok(Box::new(ChildProcess {
            program: invocation.program_name(),
            child,
            stdout,
            stderr,
        }))
    }

    fn output(&self, invocation: &Invocation) -> Result<Output> {
        debug!("Running: {invocation}");
        let mut child = command_for(invocation)
            .spawn()
            .map_err(|e| launch_error(invocation, e))?;
        feed_stdin(&mut child, invocation)?;
        let output = child
            .wait_with_output()
            .map_err(|e| Error::process(invocation.program_name(), e.to_string()))?;
        Ok(Output {
            exit: Exit {
                code: output.status.code(),
            },
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn resolve(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

struct ChildProcess {
    program: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

fn drain_pipe(pipe: &mut Option<impl Read>) -> io::Result<usize> {
    let Some(reader) = pipe.as_mut() else {
        return Ok(0);
    };
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                // EOF: the child closed its end.
                *pipe = None;
                return Ok(total);
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

impl Process for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<Exit>> {
        self.child
            .try_wait()
            .map(|status| status.map(|s| Exit { code: s.code() }))
            .map_err(|e| Error::process(&self.program, format!("wait failed: {e}")))
    }

    fn terminate(&mut self) -> Result<()> {
        match kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::process(&self.program, format!("kill failed: {e}"))),
        }
    }

    fn wait(&mut self) -> Result<Exit> {
        self.child
            .wait()
            .map(|s| Exit { code: s.code() })
            .map_err(|e| Error::process(&self.program, format!("wait failed: {e}")))
    }

    fn drain(&mut self) -> Result<usize> {
        let out = drain_pipe(&mut self.stdout);
        let err = drain_pipe(&mut self.stderr);
        match (out, err) {
            (Ok(a), Ok(b)) => Ok(a + b),
            (Err(e), _) | (_, Err(e)) => {
                Err(Error::process(&self.program, format!("output drain failed: {e}")))
            }
        }
    }
}

/// Whether destructive commands can run directly or need escalation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Privilege {
    elevated: bool,
    launcher: Option<PathBuf>,
}

impl Privilege {
    /// Inspects the effective user and looks for the first executable
    /// launcher among `candidates`.
    pub fn detect(candidates: &[PathBuf]) -> Self {
        let elevated = nix::unistd::geteuid().is_root();
        let launcher = candidates.iter().find(|p| is_executable(p)).cloned();
        debug!("Privilege: elevated={elevated}, launcher={launcher:?}");
        Self { elevated, launcher }
    }

    /// Already running as root; nothing is wrapped.
    pub fn elevated() -> Self {
        Self {
            elevated: true,
            launcher: None,
        }
    }

    pub fn unprivileged(launcher: Option<PathBuf>) -> Self {
        Self {
            elevated: false,
            launcher,
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Fails if destructive commands could not be run at all.
    pub fn ensure_available(&self) -> Result<()> {
        if self.elevated || self.launcher.is_some() {
            Ok(())
        } else {
            Err(Error::Configuration(
                "not running as root and no privilege-escalation launcher (pkexec) was found"
                    .to_string(),
            ))
        }
    }

    /// Prefixes `invocation` with the escalation launcher when needed.
    pub fn wrap(&self, invocation: Invocation) -> Result<Invocation> {
        if self.elevated {
            return Ok(invocation);
        }
        self.ensure_available()?;
        let launcher = self.launcher.as_ref().ok_or_else(|| {
            Error::Configuration("privilege-escalation launcher missing".to_string())
        })?;
        let Invocation {
            program,
            args,
            stdin,
        } = invocation;
        Ok(Invocation {
            program: launcher.clone().into_os_string(),
            args: std::iter::once(program).chain(args).collect(),
            stdin,
        })
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_renders_without_a_shell() {
        let inv = Invocation::new("mkfs.fat")
            .args(["-F", "32"])
            .arg("/dev/sdb1");
        assert_eq!(inv.to_string(), "mkfs.fat -F 32 /dev/sdb1");
        assert_eq!(inv.program_name(), "mkfs.fat");
        assert!(inv.has_arg("-F"));
    }

    #[test]
    fn elevated_invocations_are_left_alone() {
        let inv = Invocation::new("sfdisk").arg("/dev/sdb").stdin("label: gpt\n");
        assert_eq!(Privilege::elevated().wrap(inv.clone()).unwrap(), inv);
    }

    #[test]
    fn unprivileged_invocations_are_wrapped() {
        let privilege = Privilege::unprivileged(Some("/usr/bin/pkexec".into()));
        let inv = Invocation::new("sfdisk").arg("/dev/sdb").stdin("label: gpt\n");
        let wrapped = privilege.wrap(inv).unwrap();
        assert_eq!(wrapped.to_string(), "/usr/bin/pkexec sfdisk /dev/sdb");
        assert_eq!(wrapped.stdin.as_deref(), Some(&b"label: gpt\n"[..]));
        assert_eq!(wrapped.program_name(), "pkexec");
    }

    #[test]
    fn missing_launcher_is_a_hard_failure() {
        let privilege = Privilege::unprivileged(None);
        let err = privilege.wrap(Invocation::new("dd")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(privilege.ensure_available().is_err());
    }

    #[test]
    fn non_zero_exit_carries_stderr() {
        let output = Output {
            exit: Exit { code: Some(1) },
            stdout: vec![],
            stderr: b"sfdisk: cannot open /dev/sdz\n".to_vec(),
        };
        let err = output.check("sfdisk").unwrap_err();
        assert_eq!(
            err.to_string(),
            "sfdisk failed: exit status 1: sfdisk: cannot open /dev/sdz"
        );
    }

    #[test]
    fn system_launcher_runs_and_drains() {
        let launcher = SystemLauncher;
        if launcher.resolve("sh").is_none() {
            return;
        }
        let out = launcher
            .output(&Invocation::new("sh").args(["-c", "cat; echo done >&2"]).stdin("hi"))
            .unwrap();
        assert!(out.exit.success());
        assert_eq!(out.stdout, b"hi");

        let mut child = launcher
            .spawn(&Invocation::new("sh").args(["-c", "echo noisy; exit 3"]))
            .unwrap();
        let exit = loop {
            child.drain().unwrap();
            if let Some(exit) = child.try_wait().unwrap() {
                break exit;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };
        assert_eq!(exit.code, Some(3));
    }
}
