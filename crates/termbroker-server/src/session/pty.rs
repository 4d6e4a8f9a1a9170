//! PTY wrapper using portable-pty.
//!
//! Spawns a resolved command on a fresh pseudo-terminal and exposes the
//! blocking reader, writer, resize and wait operations through tokio's
//! blocking pool.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use termbroker_core::{BrokerError, BrokerResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::process::ResolvedCommand;

const READ_CHUNK: usize = 8 * 1024;

pub type PtyWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// A spawned child on its own PTY.
pub struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: PtyWriter,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    pid: u32,
}

impl PtyHandle {
    pub fn spawn(
        command: &ResolvedCommand,
        working_dir: &Path,
        cols: u16,
        rows: u16,
        env: &[(String, String)],
    ) -> BrokerResult<Self> {
        let pair = native_pty_system()
            .openpty(size(cols, rows))
            .map_err(|e| BrokerError::spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        cmd.cwd(working_dir);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            BrokerError::spawn(format!(
                "failed to spawn {}: {e}",
                command.program.display()
            ))
        })?;
        // Only the child may hold the slave, so reads hit EOF when it exits.
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| BrokerError::spawn("spawned child has no pid"))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BrokerError::spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BrokerError::spawn(format!("failed to take PTY writer: {e}")))?;

        info!(pid, cols, rows, program = %command.program.display(), "PTY spawned");

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            reader: Mutex::new(Some(reader)),
            child: Mutex::new(Some(child)),
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Forward PTY output into `tx` until EOF. Can only be started once.
    pub fn start_reader(&self, tx: mpsc::Sender<Vec<u8>>) -> BrokerResult<JoinHandle<()>> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| BrokerError::process("PTY reader lock poisoned"))?
            .take()
            .ok_or_else(|| BrokerError::process("PTY reader already taken"))?;
        let pid = self.pid;
        Ok(tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the child side is gone.
                    Err(e) => {
                        debug!(pid, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        }))
    }

    pub fn writer(&self) -> PtyWriter {
        self.writer.clone()
    }

    /// Resize the terminal. The kernel delivers SIGWINCH to the foreground job.
    pub fn resize(&self, cols: u16, rows: u16) -> BrokerResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| BrokerError::process("PTY master lock poisoned"))?;
        master
            .resize(size(cols, rows))
            .map_err(|e| BrokerError::process(format!("PTY resize failed: {e}")))?;
        debug!(pid = self.pid, cols, rows, "PTY resized");
        Ok(())
    }

    /// Process group currently in the terminal's foreground.
    pub fn foreground_pgid(&self) -> Option<u32> {
        let master = self.master.lock().ok()?;
        master
            .process_group_leader()
            .and_then(|pgid| u32::try_from(pgid).ok())
    }

    /// Wait for the child to exit and return its exit code. Only the first
    /// caller gets to wait.
    pub async fn wait(&self) -> BrokerResult<i32> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| BrokerError::process("PTY child lock poisoned"))?
            .take()
            .ok_or_else(|| BrokerError::process("PTY child already awaited"))?;
        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(|e| BrokerError::process(format!("wait task failed: {e}")))?
            .map_err(|e| BrokerError::process(format!("wait failed: {e}")))?;
        let code = i32::try_from(status.exit_code()).unwrap_or(-1);
        info!(pid = self.pid, code, "PTY child exited");
        Ok(code)
    }
}

/// Write `data` to the PTY on the blocking pool.
pub async fn write_all(writer: &PtyWriter, data: Vec<u8>) -> BrokerResult<()> {
    let writer = writer.clone();
    tokio::task::spawn_blocking(move || {
        let mut w = writer
            .lock()
            .map_err(|_| BrokerError::process("PTY writer lock poisoned"))?;
        w.write_all(&data)
            .and_then(|_| w.flush())
            .map_err(|e| BrokerError::process(format!("PTY write failed: {e}")))
    })
    .await
    .map_err(|e| BrokerError::process(format!("write task failed: {e}")))?
}

fn size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
