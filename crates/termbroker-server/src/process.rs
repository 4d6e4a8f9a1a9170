//! OS process capability: liveness, signals, executable resolution.
//!
//! The orchestrator and the persistence store only talk to processes through
//! [`ProcessOps`], so tests can substitute a scripted fake.

use std::path::{Path, PathBuf};

use termbroker_core::protocol::SignalSpec;
use termbroker_core::{BrokerError, BrokerResult};

/// Signals the broker sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Term,
    Kill,
    Int,
    Hup,
    Quit,
    Other(i32),
}

impl Signal {
    pub fn number(self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Int => libc::SIGINT,
            Signal::Hup => libc::SIGHUP,
            Signal::Quit => libc::SIGQUIT,
            Signal::Other(n) => n,
        }
    }

    pub fn from_number(n: i32) -> Self {
        match n {
            libc::SIGTERM => Signal::Term,
            libc::SIGKILL => Signal::Kill,
            libc::SIGINT => Signal::Int,
            libc::SIGHUP => Signal::Hup,
            libc::SIGQUIT => Signal::Quit,
            other => Signal::Other(other),
        }
    }

    /// Parse `"SIGTERM"`, `"term"`, `"15"` and friends.
    pub fn parse(raw: &str) -> BrokerResult<Self> {
        let trimmed = raw.trim();
        if let Ok(n) = trimmed.parse::<i32>() {
            return Self::checked_number(n);
        }
        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" => Ok(Signal::Term),
            "KILL" => Ok(Signal::Kill),
            "INT" => Ok(Signal::Int),
            "HUP" => Ok(Signal::Hup),
            "QUIT" => Ok(Signal::Quit),
            "USR1" => Ok(Signal::Other(libc::SIGUSR1)),
            "USR2" => Ok(Signal::Other(libc::SIGUSR2)),
            "WINCH" => Ok(Signal::Other(libc::SIGWINCH)),
            "CONT" => Ok(Signal::Other(libc::SIGCONT)),
            "STOP" => Ok(Signal::Other(libc::SIGSTOP)),
            _ => Err(BrokerError::validation(format!("unknown signal {raw:?}"))),
        }
    }

    fn checked_number(n: i32) -> BrokerResult<Self> {
        if (1..=64).contains(&n) {
            Ok(Self::from_number(n))
        } else {
            Err(BrokerError::validation(format!("signal number {n} out of range")))
        }
    }

    pub fn from_spec(spec: &SignalSpec) -> BrokerResult<Self> {
        match spec {
            SignalSpec::Number(n) => Self::checked_number(*n),
            SignalSpec::Name(name) => Self::parse(name),
        }
    }
}

/// Result of a signal delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The target no longer exists.
    NoSuchProcess,
}

/// How a command's executable was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFrom {
    /// Looked up on `PATH`.
    Path,
    /// argv[0] already named a file.
    Explicit,
    /// Empty argv: the user's login shell.
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub resolved_from: ResolvedFrom,
}

pub trait ProcessOps: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    fn send_signal(&self, pid: u32, signal: Signal) -> BrokerResult<Delivery>;

    fn resolve_executable(&self, argv: &[String]) -> BrokerResult<ResolvedCommand>;

    /// Best-effort command line of a running process.
    fn command_line(&self, pid: u32) -> Option<String>;
}

/// Unix implementation backed by `kill(2)`, `PATH` lookup and `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessOps;

impl ProcessOps for SystemProcessOps {
    fn is_alive(&self, pid: u32) -> bool {
        let pid_t: libc::pid_t = match pid.try_into() {
            Ok(p) if p > 0 => p,
            _ => return false,
        };
        // SAFETY: signal 0 performs only the existence/permission check.
        let rc = unsafe { libc::kill(pid_t, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> BrokerResult<Delivery> {
        let pid_t: libc::pid_t = match pid.try_into() {
            Ok(p) if p > 0 => p,
            _ => return Err(BrokerError::process(format!("invalid pid {pid}"))),
        };
        // SAFETY: plain kill(2) on a positive pid.
        let rc = unsafe { libc::kill(pid_t, signal.number()) };
        if rc == 0 {
            return Ok(Delivery::Sent);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(Delivery::NoSuchProcess);
        }
        Err(BrokerError::process(format!(
            "signal {:?} to pid {pid}: {err}",
            signal
        )))
    }

    fn resolve_executable(&self, argv: &[String]) -> BrokerResult<ResolvedCommand> {
        let Some(first) = argv.first() else {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            return Ok(ResolvedCommand {
                program: PathBuf::from(shell),
                args: Vec::new(),
                resolved_from: ResolvedFrom::Shell,
            });
        };
        let args = argv[1..].to_vec();

        if first.contains('/') {
            let path = Path::new(first);
            if path.is_file() {
                return Ok(ResolvedCommand {
                    program: path.to_path_buf(),
                    args,
                    resolved_from: ResolvedFrom::Explicit,
                });
            }
            return Err(BrokerError::spawn(format!("executable not found: {first}")));
        }

        match which::which(first) {
            Ok(program) => Ok(ResolvedCommand {
                program,
                args,
                resolved_from: ResolvedFrom::Path,
            }),
            Err(e) => Err(BrokerError::spawn(format!(
                "command not found: {first} ({e})"
            ))),
        }
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        if let Ok(bytes) = std::fs::read(format!("/proc/{pid}/cmdline")) {
            return parse_cmdline_bytes(&bytes);
        }
        let output = std::process::Command::new("ps")
            .args(["-o", "command=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

fn parse_cmdline_bytes(bytes: &[u8]) -> Option<String> {
    let decoded = String::from_utf8_lossy(bytes);
    let trimmed = decoded.trim_matches(|ch: char| ch == '\0' || ch.is_whitespace());
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.replace('\0', " "))
}
