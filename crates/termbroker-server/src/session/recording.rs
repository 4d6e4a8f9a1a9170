//! Cast-format session recording.
//!
//! The file starts with one JSON header line followed by one JSON array per
//! event: `[seconds, kind, data]` with kind `o` (output), `i` (input),
//! `r` (resize, data `"COLSxROWS"`) or `m` (marker). Writes are queued to a
//! background task so callers never wait on disk I/O; the header is written
//! before `create` returns.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use termbroker_core::{BrokerError, BrokerResult};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::escape::OutputAligner;
use super::pruning::find_last_pruning_sequence;

/// On-disk size is checked against the tracked position every this many bytes.
const VALIDATION_INTERVAL: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    Input,
    Resize,
    Marker,
}

impl EventKind {
    pub fn code(self) -> &'static str {
        match self {
            EventKind::Output => "o",
            EventKind::Input => "i",
            EventKind::Resize => "r",
            EventKind::Marker => "m",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CastHeader {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Byte accounting for the cast file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub written: u64,
    pub pending: u64,
    pub total: u64,
}

/// A pruning sequence as it landed in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct PruningEvent {
    pub sequence: &'static str,
    /// File offset just past the sequence inside the JSON-escaped event data.
    pub offset: u64,
    pub timestamp: f64,
}

pub type PruningCallback = Box<dyn Fn(PruningEvent) + Send + Sync>;

/// Pruning hit relative to the start of its event line.
struct PendingHit {
    sequence: &'static str,
    line_offset: u64,
    timestamp: f64,
}

enum Command {
    Line(String, Option<PendingHit>),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<BrokerResult<()>>),
}

struct Counters {
    written: AtomicU64,
    pending: AtomicU64,
    open: AtomicBool,
}

pub struct RecordingWriter {
    path: PathBuf,
    started: Instant,
    counters: Arc<Counters>,
    tx: mpsc::UnboundedSender<Command>,
    /// Serializes timestamping and enqueueing so lines stay in time order.
    aligner: std::sync::Mutex<OutputAligner>,
    pruning: Arc<std::sync::Mutex<Option<PruningCallback>>>,
}

impl RecordingWriter {
    /// Create (truncating) the cast file and write its header.
    pub async fn create(
        path: impl AsRef<Path>,
        width: u16,
        height: u16,
        command: Option<String>,
        title: Option<String>,
        env: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> BrokerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence_err(&path, "create parent", e))?;
        }

        let header = CastHeader {
            version: 2,
            width,
            height,
            timestamp: chrono::Utc::now().timestamp(),
            command,
            title,
            env,
        };
        let mut line = serde_json::to_string(&header)?;
        line.push('\n');

        let mut file = File::create(&path)
            .await
            .map_err(|e| persistence_err(&path, "create", e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| persistence_err(&path, "write header", e))?;
        file.flush()
            .await
            .map_err(|e| persistence_err(&path, "flush header", e))?;

        let counters = Arc::new(Counters {
            written: AtomicU64::new(line.len() as u64),
            pending: AtomicU64::new(0),
            open: AtomicBool::new(true),
        });
        let pruning: Arc<std::sync::Mutex<Option<PruningCallback>>> =
            Arc::new(std::sync::Mutex::new(None));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(
            file,
            path.clone(),
            rx,
            counters.clone(),
            pruning.clone(),
        ));

        debug!(path = %path.display(), width, height, "recording started");

        Ok(Self {
            path,
            started: Instant::now(),
            counters,
            tx,
            aligner: std::sync::Mutex::new(OutputAligner::new()),
            pruning,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.counters.open.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> Position {
        let written = self.counters.written.load(Ordering::SeqCst);
        let pending = self.counters.pending.load(Ordering::SeqCst);
        Position {
            written,
            pending,
            total: written + pending,
        }
    }

    /// Register the pruning-sequence callback (replaces any previous one).
    pub fn on_pruning_sequence(&self, callback: PruningCallback) {
        if let Ok(mut slot) = self.pruning.lock() {
            *slot = Some(callback);
        }
    }

    pub fn write_output(&self, data: &[u8]) -> BrokerResult<()> {
        let mut aligner = self.lock_aligner()?;
        self.ensure_open()?;
        let ready = aligner.push(data);
        if ready.is_empty() {
            return Ok(());
        }
        self.enqueue_output(&ready)
    }

    pub fn write_input(&self, text: &str) -> BrokerResult<()> {
        let _order = self.lock_aligner()?;
        self.enqueue_event(EventKind::Input, text)
    }

    pub fn write_resize(&self, cols: u16, rows: u16) -> BrokerResult<()> {
        let _order = self.lock_aligner()?;
        self.enqueue_event(EventKind::Resize, &format!("{cols}x{rows}"))
    }

    pub fn write_marker(&self, text: &str) -> BrokerResult<()> {
        let _order = self.lock_aligner()?;
        self.enqueue_event(EventKind::Marker, text)
    }

    /// Append an arbitrary JSON value as its own line.
    pub fn write_raw_event(&self, value: &serde_json::Value) -> BrokerResult<()> {
        let _order = self.lock_aligner()?;
        self.ensure_open()?;
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        self.send_line(line, None)
    }

    /// Wait until every queued line is on disk.
    pub async fn flush(&self) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).is_err() {
            return Err(BrokerError::persistence("recording writer is closed"));
        }
        rx.await
            .map_err(|_| BrokerError::persistence("recording writer stopped"))
    }

    /// Emit withheld bytes, fsync and close. Idempotent.
    pub async fn close(&self) -> BrokerResult<()> {
        let rx = {
            let mut aligner = self.lock_aligner()?;
            if !self.is_open() {
                return Ok(());
            }
            let tail = aligner.take_all();
            if !tail.is_empty() {
                self.enqueue_output(&tail)?;
            }
            self.counters.open.store(false, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            if self.tx.send(Command::Close(tx)).is_err() {
                return Err(BrokerError::persistence("recording task is gone"));
            }
            rx
        };
        let result = rx
            .await
            .map_err(|_| BrokerError::persistence("recording task stopped before close"))?;
        debug!(path = %self.path.display(), "recording closed");
        result
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn lock_aligner(&self) -> BrokerResult<std::sync::MutexGuard<'_, OutputAligner>> {
        self.aligner
            .lock()
            .map_err(|_| BrokerError::persistence("recording writer lock poisoned"))
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_open() {
            return Ok(());
        }
        error!(path = %self.path.display(), "write to closed recording");
        Err(BrokerError::persistence(format!(
            "recording {} is closed",
            self.path.display()
        )))
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn enqueue_output(&self, bytes: &[u8]) -> BrokerResult<()> {
        let text = String::from_utf8_lossy(bytes);
        let timestamp = self.elapsed();
        let prefix = event_prefix(timestamp, EventKind::Output)?;
        let data = serde_json::to_string(text.as_ref())?;

        let hit = match find_last_pruning_sequence(&text) {
            Some(m) => {
                // Escaped length of the data up to the sequence end, minus the
                // closing quote.
                let escaped = serde_json::to_string(&text[..m.end])?;
                Some(PendingHit {
                    sequence: m.sequence,
                    line_offset: (prefix.len() + escaped.len() - 1) as u64,
                    timestamp,
                })
            }
            None => None,
        };

        self.send_line(format!("{prefix}{data}]\n"), hit)
    }

    fn enqueue_event(&self, kind: EventKind, data: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let prefix = event_prefix(self.elapsed(), kind)?;
        let data = serde_json::to_string(data)?;
        self.send_line(format!("{prefix}{data}]\n"), None)
    }

    fn send_line(&self, line: String, hit: Option<PendingHit>) -> BrokerResult<()> {
        let len = line.len() as u64;
        self.counters.pending.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(Command::Line(line, hit)).is_err() {
            self.counters.pending.fetch_sub(len, Ordering::SeqCst);
            return Err(BrokerError::persistence("recording task is gone"));
        }
        Ok(())
    }
}

fn event_prefix(timestamp: f64, kind: EventKind) -> BrokerResult<String> {
    Ok(format!(
        "[{},\"{}\",",
        serde_json::to_string(&timestamp)?,
        kind.code()
    ))
}

fn persistence_err(path: &Path, op: &str, e: std::io::Error) -> BrokerError {
    BrokerError::persistence(format!("{op} {}: {e}", path.display()))
}

async fn write_loop(
    mut file: File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Command>,
    counters: Arc<Counters>,
    pruning: Arc<std::sync::Mutex<Option<PruningCallback>>>,
) {
    let mut next_check = counters.written.load(Ordering::SeqCst) + VALIDATION_INTERVAL;
    let mut failed = false;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Line(line, hit) => {
                let len = line.len() as u64;
                counters.pending.fetch_sub(len, Ordering::SeqCst);
                if failed {
                    continue;
                }
                if let Err(e) = write_line(&mut file, &line).await {
                    error!(path = %path.display(), error = %e, "recording write failed");
                    failed = true;
                    continue;
                }
                let start = counters.written.fetch_add(len, Ordering::SeqCst);

                if let Some(hit) = hit {
                    if let Ok(slot) = pruning.lock() {
                        if let Some(callback) = slot.as_ref() {
                            callback(PruningEvent {
                                sequence: hit.sequence,
                                offset: start + hit.line_offset,
                                timestamp: hit.timestamp,
                            });
                        }
                    }
                }

                let written = start + len;
                if written >= next_check {
                    next_check = written + VALIDATION_INTERVAL;
                    validate_position(&file, &path, written).await;
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Close(done) => {
                let result = file
                    .sync_all()
                    .await
                    .map_err(|e| persistence_err(&path, "fsync", e));
                let _ = done.send(result);
                return;
            }
        }
    }

    // Writer dropped without close.
    let _ = file.sync_all().await;
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

async fn validate_position(file: &File, path: &Path, expected: u64) {
    match file.metadata().await {
        Ok(meta) if meta.len() != expected => {
            warn!(
                path = %path.display(),
                expected,
                actual = meta.len(),
                "recording position mismatch"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(path = %path.display(), error = %e, "recording size check failed"),
    }
}
