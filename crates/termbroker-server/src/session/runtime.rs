//! In-memory state of a session held by this orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use termbroker_client::ControlClient;
use termbroker_core::protocol::FollowModeStatus;
use termbroker_core::{BrokerError, BrokerResult, Message, SessionId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::escape::escape_end;
use super::foreground::ForegroundTracker;
use super::info::{ActivityStatus, SessionInfo, SessionPaths};
use super::pty::PtyHandle;
use super::recording::RecordingWriter;
use super::scrollback::Scrollback;
use super::title::TitleInjector;

/// Queue depth per stdout subscriber before it is dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

pub enum Backend {
    /// PTY owned by this process.
    Local(Arc<PtyHandle>),
    /// Session owned by another process, driven over its control socket.
    External(ControlClient),
}

struct Fanout {
    scrollback: Scrollback,
    subscribers: Vec<mpsc::Sender<Message>>,
}

pub struct SessionRuntime {
    pub id: SessionId,
    pub paths: SessionPaths,
    pub backend: Backend,
    pub recorder: Option<Arc<RecordingWriter>>,
    info: Mutex<SessionInfo>,
    input_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    fanout: Mutex<Fanout>,
    activity: Mutex<ActivityStatus>,
    title: Mutex<TitleInjector>,
    foreground: Mutex<ForegroundTracker>,
    follow_mode: Mutex<Option<FollowModeStatus>>,
    exited: AtomicBool,
    released: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRuntime {
    pub fn new(
        info: SessionInfo,
        paths: SessionPaths,
        backend: Backend,
        recorder: Option<Arc<RecordingWriter>>,
        input_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
        scrollback_bytes: usize,
        title: TitleInjector,
    ) -> Self {
        Self {
            id: info.id.clone(),
            paths,
            backend,
            recorder,
            info: Mutex::new(info),
            input_tx,
            fanout: Mutex::new(Fanout {
                scrollback: Scrollback::new(scrollback_bytes),
                subscribers: Vec::new(),
            }),
            activity: Mutex::new(ActivityStatus::default()),
            title: Mutex::new(title),
            foreground: Mutex::new(ForegroundTracker::new()),
            follow_mode: Mutex::new(None),
            exited: AtomicBool::new(false),
            released: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local(_))
    }

    pub fn info(&self) -> SessionInfo {
        lock(&self.info).clone()
    }

    pub fn update_info<F: FnOnce(&mut SessionInfo)>(&self, f: F) {
        f(&mut lock(&self.info));
    }

    pub fn set_info(&self, info: SessionInfo) {
        *lock(&self.info) = info;
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Returns true for the caller that flipped the flag.
    pub fn mark_exited(&self) -> bool {
        !self.exited.swap(true, Ordering::SeqCst)
    }

    /// Queue bytes for the PTY writer task.
    pub fn push_input(&self, data: Vec<u8>) -> BrokerResult<()> {
        let tx = self
            .input_tx
            .as_ref()
            .ok_or_else(|| BrokerError::process("session has no local input queue"))?;
        tx.send(data)
            .map_err(|_| BrokerError::process("session input queue closed").with_session(self.id.as_str()))
    }

    /// Record a chunk of output and hand it to every subscriber.
    pub fn emit_output(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.write_output(data) {
                debug!(session_id = %self.id, error = %e, "output not recorded");
            }
        }
        let mut fanout = lock(&self.fanout);
        fanout.scrollback.write(data);
        let id = &self.id;
        fanout.subscribers.retain(|tx| {
            match tx.try_send(Message::StdoutData(data.to_vec())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(session_id = %id, "stdout subscriber fell behind, dropping it");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Replay scrollback to `tx`, then add it as a live subscriber.
    pub fn subscribe(&self, tx: mpsc::Sender<Message>) {
        let mut fanout = lock(&self.fanout);
        let snapshot = fanout.scrollback.snapshot();
        if !snapshot.is_empty() && tx.try_send(Message::StdoutData(snapshot)).is_err() {
            return;
        }
        fanout.subscribers.push(tx);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.fanout).subscribers.len()
    }

    pub fn activity(&self) -> ActivityStatus {
        lock(&self.activity).clone()
    }

    pub fn set_activity(&self, status: ActivityStatus) {
        *lock(&self.activity) = status;
    }

    pub fn with_title<R>(&self, f: impl FnOnce(&mut TitleInjector) -> R) -> R {
        f(&mut lock(&self.title))
    }

    pub fn with_foreground<R>(&self, f: impl FnOnce(&mut ForegroundTracker) -> R) -> R {
        f(&mut lock(&self.foreground))
    }

    pub fn foreground_command(&self) -> Option<String> {
        lock(&self.foreground).current().map(|j| j.command.clone())
    }

    pub fn follow_mode(&self) -> Option<FollowModeStatus> {
        lock(&self.follow_mode).clone()
    }

    /// Store new follow-mode state and return the previous one.
    pub fn set_follow_mode(&self, status: Option<FollowModeStatus>) -> Option<FollowModeStatus> {
        std::mem::replace(&mut *lock(&self.follow_mode), status)
    }

    pub fn add_task(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).push(handle);
    }

    #[cfg(test)]
    pub(crate) fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Stop every task and drop subscribers. Runs once; later calls return
    /// false. Callers running inside one of the session's own tasks must not
    /// await after this.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Backend::External(client) = &self.backend {
            client.disconnect().await;
        }
        lock(&self.fanout).subscribers.clear();
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
        debug!(session_id = %self.id, "session runtime released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether `data` rings the bell. BEL bytes that terminate an OSC sequence do
/// not count.
pub fn contains_bell(data: &[u8]) -> bool {
    let mut pos = 0;
    while pos < data.len() {
        match data[pos] {
            0x07 => return true,
            0x1b => match escape_end(data, pos) {
                Some(end) => pos = end,
                None => return false,
            },
            _ => pos += 1,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::tests::info;
    use crate::session::info::SessionStatus;
    use std::path::Path;
    use std::time::Duration;

    fn runtime(input: Option<mpsc::UnboundedSender<Vec<u8>>>) -> SessionRuntime {
        let info = info("rt", "rt", SessionStatus::Running, Some(1));
        let paths = SessionPaths::new(Path::new("/tmp/none"), &info.id);
        SessionRuntime::new(
            info,
            paths,
            Backend::Local(Arc::new(dummy_pty())),
            None,
            input,
            8,
            TitleInjector::new(Duration::from_millis(100), Duration::from_secs(5)),
        )
    }

    fn dummy_pty() -> PtyHandle {
        use crate::process::{ResolvedCommand, ResolvedFrom};
        let cmd = ResolvedCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "exit 0".into()],
            resolved_from: ResolvedFrom::Explicit,
        };
        PtyHandle::spawn(&cmd, Path::new("/"), 80, 24, &[]).unwrap()
    }

    #[test]
    fn bell_detection_skips_osc_terminators() {
        assert!(contains_bell(b"ding\x07"));
        assert!(!contains_bell(b"\x1b]0;title\x07text"));
        assert!(contains_bell(b"\x1b]0;title\x07\x07"));
        assert!(!contains_bell(b"plain"));
    }

    #[tokio::test]
    async fn late_subscriber_gets_scrollback_then_live_output() {
        let rt = runtime(None);
        rt.emit_output(b"0123456789");

        let (tx, mut rx) = mpsc::channel(4);
        rt.subscribe(tx);
        assert_eq!(rx.recv().await, Some(Message::StdoutData(b"23456789".to_vec())));

        rt.emit_output(b"x");
        assert_eq!(rx.recv().await, Some(Message::StdoutData(b"x".to_vec())));
        assert_eq!(rt.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn full_or_closed_subscribers_are_dropped() {
        let rt = runtime(None);
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (gone_tx, gone_rx) = mpsc::channel(4);
        rt.subscribe(slow_tx);
        rt.subscribe(gone_tx);
        drop(gone_rx);

        rt.emit_output(b"a");
        assert_eq!(rt.subscriber_count(), 1);
        rt.emit_output(b"b");
        assert_eq!(rt.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn input_queue_and_release() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rt = runtime(Some(tx));
        rt.push_input(b"ls\n".to_vec()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"ls\n");

        rt.add_task(tokio::spawn(std::future::pending::<()>()));
        assert!(rt.release().await);
        assert!(!rt.release().await);
        assert!(rt.is_released());

        assert!(rt.mark_exited());
        assert!(!rt.mark_exited());
    }
}
