//! Session lifecycle: create, attach, drive, kill and tear down sessions.
//!
//! The orchestrator owns the registry of sessions held by this process.
//! Local sessions run a PTY child and serve a control socket; externally
//! attached sessions are owned by another process and every operation is
//! proxied over that process's control socket.

use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use termbroker_client::{ClientEvent, ClientOptions, ControlClient, MAX_SOCKET_PATH_LEN};
use termbroker_core::protocol::SignalSpec;
use termbroker_core::{BrokerError, BrokerResult, Message, SessionId};
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::control;
use super::events::OrchestratorEvent;
use super::foreground::{multiplexer_detach_keys, ForegroundChange};
use super::info::{
    GitContext, RemoteOrigin, SessionInfo, SessionPaths, SessionStatus, SessionSummary,
};
use super::kill::{self, KillOutcome, KillPolicy};
use super::pty::{self, PtyHandle, PtyWriter};
use super::recording::{PruningEvent, RecordingWriter};
use super::runtime::{contains_bell, Backend, SessionRuntime};
use super::store::SessionStore;
use super::title::{
    compose_title, generate_session_name, Injection, TitleContext, TitleFilter, TitleInjector,
    TitleMode,
};
use crate::config::BrokerConfig;
use crate::process::{ProcessOps, ResolvedCommand, Signal};

const EVENT_CHANNEL: usize = 256;
const OUTPUT_CHANNEL: usize = 64;
/// How often pending title injections are checked.
const TITLE_TICK: Duration = Duration::from_millis(25);
/// How long to wait for the PTY to drain after the child exits.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);
/// Pause after sending multiplexer detach keys.
const DETACH_WAIT: Duration = Duration::from_millis(500);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);
/// How long an external kill waits for the owner to close the socket.
const EXTERNAL_HANGUP_WAIT: Duration = Duration::from_secs(2);

/// Options for [`SessionOrchestrator::create_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub session_id: Option<SessionId>,
    pub name: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub title_mode: Option<TitleMode>,
    pub env: Vec<(String, String)>,
    pub remote: Option<RemoteOrigin>,
    pub git: GitContext,
}

/// Keys that have no printable form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKey {
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    Escape,
    Enter,
    CtrlEnter,
    ShiftEnter,
    Tab,
    Backspace,
}

impl SpecialKey {
    pub fn sequence(self) -> &'static str {
        match self {
            SpecialKey::ArrowUp => "\x1b[A",
            SpecialKey::ArrowDown => "\x1b[B",
            SpecialKey::ArrowRight => "\x1b[C",
            SpecialKey::ArrowLeft => "\x1b[D",
            SpecialKey::Escape => "\x1b",
            SpecialKey::Enter => "\r",
            SpecialKey::CtrlEnter => "\n",
            SpecialKey::ShiftEnter => "\r\n",
            SpecialKey::Tab => "\t",
            SpecialKey::Backspace => "\x7f",
        }
    }
}

impl std::str::FromStr for SpecialKey {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "arrow_up" | "up" => Ok(SpecialKey::ArrowUp),
            "arrow_down" | "down" => Ok(SpecialKey::ArrowDown),
            "arrow_left" | "left" => Ok(SpecialKey::ArrowLeft),
            "arrow_right" | "right" => Ok(SpecialKey::ArrowRight),
            "escape" | "esc" => Ok(SpecialKey::Escape),
            "enter" => Ok(SpecialKey::Enter),
            "ctrl_enter" => Ok(SpecialKey::CtrlEnter),
            "shift_enter" => Ok(SpecialKey::ShiftEnter),
            "tab" => Ok(SpecialKey::Tab),
            "backspace" => Ok(SpecialKey::Backspace),
            _ => Err(BrokerError::validation(format!("unknown key {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Text(String),
    Key(SpecialKey),
}

impl SessionInput {
    fn into_text(self) -> String {
        match self {
            SessionInput::Text(text) => text,
            SessionInput::Key(key) => key.sequence().to_string(),
        }
    }
}

pub struct SessionOrchestrator {
    config: BrokerConfig,
    store: SessionStore,
    ops: Arc<dyn ProcessOps>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionRuntime>>>,
    events: broadcast::Sender<OrchestratorEvent>,
    initialized: Mutex<bool>,
    /// Held while choosing a unique name and writing the first metadata.
    create_lock: Mutex<()>,
    maintenance: std::sync::Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<SessionOrchestrator>,
}

impl SessionOrchestrator {
    pub fn new(config: BrokerConfig, ops: Arc<dyn ProcessOps>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL);
        Arc::new_cyclic(|weak_self| Self {
            store: SessionStore::new(&config.control_dir),
            config,
            ops,
            sessions: RwLock::new(HashMap::new()),
            events,
            initialized: Mutex::new(false),
            create_lock: Mutex::new(()),
            maintenance: std::sync::Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Version cleanup and zombie marking. Runs once per instance.
    pub async fn initialize(&self) -> BrokerResult<()> {
        let mut done = self.initialized.lock().await;
        if *done {
            return Ok(());
        }
        tokio::fs::create_dir_all(self.store.root()).await.map_err(|e| {
            BrokerError::persistence(format!(
                "create control dir {}: {e}",
                self.store.root().display()
            ))
        })?;

        let removed = self
            .store
            .cleanup_old_version_sessions(&self.config.version, self.ops.as_ref())
            .await?;
        let zombies = self.store.update_zombie_sessions(self.ops.as_ref()).await?;
        info!(
            control_dir = %self.store.root().display(),
            version = %self.config.version,
            removed = removed.len(),
            zombies = zombies.len(),
            "orchestrator initialized"
        );
        *done = true;
        Ok(())
    }

    // ── Creation ─────────────────────────────────────────────────────

    /// Spawn `argv` (the user's shell when empty) on a new PTY.
    pub async fn create_session(
        &self,
        argv: Vec<String>,
        options: SessionOptions,
    ) -> BrokerResult<SessionInfo> {
        self.initialize().await?;

        let id = options.session_id.clone().unwrap_or_else(SessionId::generate);
        if self.runtime(&id).await.is_some() || self.store.load_session_info(&id).await?.is_some()
        {
            return Err(BrokerError::validation(format!("session {id} already exists"))
                .with_session(id.as_str()));
        }

        let paths = self.store.paths(&id);
        check_socket_path(&paths.socket)?;

        let resolved = self
            .ops
            .resolve_executable(&argv)
            .map_err(|e| e.with_session(id.as_str()))?;

        let working_dir = match options.working_dir.clone() {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|e| BrokerError::spawn(format!("no current directory: {e}")))?,
        };
        if !working_dir.is_dir() {
            return Err(BrokerError::spawn(format!(
                "working directory {} does not exist",
                working_dir.display()
            ))
            .with_session(id.as_str()));
        }

        let cols = options.cols.unwrap_or(self.config.default_cols);
        let rows = options.rows.unwrap_or(self.config.default_rows);
        validate_size(cols, rows)?;

        let command = if argv.is_empty() {
            std::iter::once(resolved.program.display().to_string())
                .chain(resolved.args.iter().cloned())
                .collect()
        } else {
            argv
        };
        let working_dir_str = working_dir.to_string_lossy().into_owned();

        let info = {
            let _guard = self.create_lock.lock().await;
            let candidate = options
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| generate_session_name(&command, &working_dir_str));
            let name = self.store.ensure_unique_name(&candidate, None).await?;

            self.store.create_session_directory(&id).await?;
            let info = SessionInfo {
                id: id.clone(),
                name,
                command,
                working_dir: working_dir_str,
                status: SessionStatus::Starting,
                pid: None,
                exit_code: None,
                started_at: Utc::now(),
                cols,
                rows,
                initial_cols: cols,
                initial_rows: rows,
                title_mode: options.title_mode.unwrap_or(self.config.title_mode),
                version: Some(self.config.version.clone()),
                last_clear_offset: None,
                remote: options.remote.clone(),
                git: options.git.clone(),
            };
            if let Err(e) = self.store.save_session_info(&id, &info).await {
                self.discard_directory(&id).await;
                return Err(e);
            }
            info
        };
        debug!(session_id = %id, name = %info.name, "session metadata written");

        match self
            .launch_local(info, paths, &resolved, &working_dir, options.env)
            .await
        {
            Ok(info) => Ok(info),
            Err(e) => {
                warn!(session_id = %id, error = %e, "session start failed, cleaning up");
                self.discard_directory(&id).await;
                Err(e.with_session(id.as_str()))
            }
        }
    }

    async fn launch_local(
        &self,
        info: SessionInfo,
        paths: SessionPaths,
        resolved: &ResolvedCommand,
        working_dir: &Path,
        mut env: Vec<(String, String)>,
    ) -> BrokerResult<SessionInfo> {
        env.push(("TERMBROKER_SESSION_ID".into(), info.id.to_string()));
        let pty = Arc::new(PtyHandle::spawn(
            resolved,
            working_dir,
            info.cols,
            info.rows,
            &env,
        )?);
        let pid = pty.pid();

        let result = self.wire_local(info, paths, pty, env).await;
        if result.is_err() {
            if let Err(e) = self.ops.send_signal(pid, Signal::Kill) {
                warn!(pid, error = %e, "failed to kill half-started session");
            }
        }
        result
    }

    async fn wire_local(
        &self,
        mut info: SessionInfo,
        paths: SessionPaths,
        pty: Arc<PtyHandle>,
        env: Vec<(String, String)>,
    ) -> BrokerResult<SessionInfo> {
        let id = info.id.clone();
        let pid = pty.pid();

        let mut cast_env = serde_json::Map::new();
        cast_env.insert("TERM".into(), "xterm-256color".into());
        if let Some((_, shell)) = env.iter().find(|(k, _)| k == "SHELL") {
            cast_env.insert("SHELL".into(), shell.clone().into());
        } else if let Ok(shell) = std::env::var("SHELL") {
            cast_env.insert("SHELL".into(), shell.into());
        }
        let recorder = Arc::new(
            RecordingWriter::create(
                &paths.stdout,
                info.cols,
                info.rows,
                Some(info.command.join(" ")),
                Some(info.name.clone()),
                Some(cast_env),
            )
            .await?,
        );

        let _ = tokio::fs::remove_file(&paths.socket).await;
        let listener = UnixListener::bind(&paths.socket).map_err(|e| {
            BrokerError::persistence(format!("bind {}: {e}", paths.socket.display()))
        })?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL);
        let reader = pty.start_reader(output_tx)?;

        info.status = SessionStatus::Running;
        info.pid = Some(pid);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(SessionRuntime::new(
            info.clone(),
            paths,
            Backend::Local(pty.clone()),
            Some(recorder.clone()),
            Some(input_tx),
            self.config.scrollback_bytes,
            TitleInjector::new(self.config.title_quiet, self.config.title_injection_timeout),
        ));

        let (clear_tx, clear_rx) = mpsc::unbounded_channel();
        recorder.on_pruning_sequence(Box::new(move |event: PruningEvent| {
            let _ = clear_tx.send(event.offset);
        }));

        let weak = self.weak_self.clone();
        let (drained_tx, drained_rx) = oneshot::channel();
        runtime.add_task(reader);
        runtime.add_task(tokio::spawn(output_loop(
            weak.clone(),
            runtime.clone(),
            output_rx,
            drained_tx,
        )));
        runtime.add_task(tokio::spawn(input_loop(
            runtime.clone(),
            pty.writer(),
            input_rx,
        )));
        runtime.add_task(tokio::spawn(control::serve(
            listener,
            weak.clone(),
            runtime.clone(),
        )));
        runtime.add_task(tokio::spawn(foreground_loop(
            weak.clone(),
            runtime.clone(),
            pty.clone(),
            self.config.foreground_poll,
        )));
        runtime.add_task(tokio::spawn(clear_offset_loop(
            weak.clone(),
            runtime.clone(),
            clear_rx,
        )));
        if let Some(forwarder) = spawn_stdin_forwarder(&runtime) {
            runtime.add_task(forwarder);
        }

        self.sessions.write().await.insert(id.clone(), runtime.clone());

        if let Err(e) = self.store.save_session_info(&id, &info).await {
            self.sessions.write().await.remove(&id);
            runtime.release().await;
            let _ = recorder.close().await;
            return Err(e);
        }

        // Not in the task list: it must outlive release to record the exit.
        tokio::spawn(exit_watch(weak, runtime.clone(), pty, drained_rx));

        if info.title_mode.injects() {
            self.refresh_title(&runtime, false);
        }
        info!(session_id = %id, pid, name = %info.name, "session started");
        Ok(info)
    }

    /// Drive a session owned by another process through its control socket.
    pub async fn attach_external(&self, id: &SessionId) -> BrokerResult<SessionInfo> {
        self.initialize().await?;
        if let Some(runtime) = self.runtime(id).await {
            return Ok(runtime.info());
        }

        let info = self
            .store
            .load_session_info(id)
            .await?
            .ok_or_else(|| BrokerError::not_found(id.as_str()))?;
        if info.is_exited() {
            return Err(BrokerError::validation(format!("session {id} has exited"))
                .with_session(id.as_str()));
        }

        let paths = self.store.paths(id);
        let client = ControlClient::connect(&paths.socket, ClientOptions::default())
            .await
            .map_err(|e| e.with_session(id.as_str()))?;
        let events = client.events();
        client.subscribe_stdout().await?;

        let runtime = Arc::new(SessionRuntime::new(
            info.clone(),
            paths,
            Backend::External(client),
            None,
            None,
            self.config.scrollback_bytes,
            TitleInjector::new(self.config.title_quiet, self.config.title_injection_timeout),
        ));
        runtime.add_task(tokio::spawn(external_watch(
            self.weak_self.clone(),
            runtime.clone(),
            events,
        )));
        self.sessions.write().await.insert(id.clone(), runtime);
        info!(session_id = %id, "attached to external session");
        Ok(info)
    }

    // ── Operations ───────────────────────────────────────────────────

    pub async fn send_input(&self, id: &SessionId, input: SessionInput) -> BrokerResult<()> {
        let runtime = self.live_runtime(id).await?;
        let text = input.into_text();
        match &runtime.backend {
            Backend::Local(_) => queue_local_input(&runtime, text.into_bytes()),
            Backend::External(client) => client.send_stdin(text).await,
        }
    }

    pub async fn resize_session(&self, id: &SessionId, cols: u16, rows: u16) -> BrokerResult<()> {
        validate_size(cols, rows)?;
        let runtime = self.live_runtime(id).await?;
        match &runtime.backend {
            Backend::Local(pty) => {
                pty.resize(cols, rows)?;
                if let Some(recorder) = &runtime.recorder {
                    if let Err(e) = recorder.write_resize(cols, rows) {
                        debug!(session_id = %id, error = %e, "resize not recorded");
                    }
                }
                let info = self
                    .store
                    .update_session(id, |info| {
                        info.cols = cols;
                        info.rows = rows;
                    })
                    .await?;
                runtime.set_info(info);
            }
            Backend::External(client) => {
                client.resize(cols, rows).await?;
                runtime.update_info(|info| {
                    info.cols = cols;
                    info.rows = rows;
                });
            }
        }
        debug!(session_id = %id, cols, rows, "session resized");
        Ok(())
    }

    pub async fn reset_session_size(&self, id: &SessionId) -> BrokerResult<()> {
        let runtime = self.live_runtime(id).await?;
        match &runtime.backend {
            Backend::Local(_) => {
                let info = runtime.info();
                self.resize_session(id, info.initial_cols, info.initial_rows)
                    .await
            }
            Backend::External(client) => client.reset_size().await,
        }
    }

    /// Rename a session, returning the unique name actually stored.
    pub async fn update_session_name(&self, id: &SessionId, name: &str) -> BrokerResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BrokerError::validation("session name must not be empty"));
        }
        let unique = self.store.update_session_name(id, name).await?;

        if let Some(runtime) = self.runtime(id).await {
            runtime.update_info(|info| info.name = unique.clone());
            match &runtime.backend {
                Backend::External(client) => client.update_title(unique.clone()).await?,
                Backend::Local(_) => self.refresh_title(&runtime, false),
            }
        }
        info!(session_id = %id, name = %unique, "session renamed");
        self.emit(OrchestratorEvent::SessionNameChanged {
            session_id: id.clone(),
            name: unique.clone(),
        });
        Ok(unique)
    }

    /// Terminate a session: detach a foreground multiplexer if there is one,
    /// send `signal` (SIGTERM by default) and escalate to SIGKILL.
    pub async fn kill_session(&self, id: &SessionId, signal: Option<Signal>) -> BrokerResult<()> {
        let runtime = self.require_runtime(id).await?;
        let signal = signal.unwrap_or(Signal::Term);
        let policy = KillPolicy {
            grace: self.config.kill_grace,
            poll: self.config.kill_poll,
        };

        let pty = match &runtime.backend {
            Backend::External(client) => {
                client
                    .kill(Some(SignalSpec::Number(signal.number())))
                    .await?;
                return self.confirm_external_kill(&runtime, signal, policy).await;
            }
            Backend::Local(pty) => pty.clone(),
        };
        if runtime.is_exited() {
            return Ok(());
        }

        if let Some(command) = runtime.foreground_command() {
            if let Some(keys) = multiplexer_detach_keys(&command) {
                info!(session_id = %id, %command, "detaching multiplexer before kill");
                queue_local_input(&runtime, keys.to_vec())?;
                tokio::time::sleep(DETACH_WAIT).await;
            }
        }

        let pid = pty.pid();
        let ops = self.ops.clone();
        let watched = runtime.clone();
        let outcome = kill::terminate(self.ops.as_ref(), pid, signal, policy, move || {
            !watched.is_exited() && ops.is_alive(pid)
        })
        .await
        .map_err(|e| e.with_session(id.as_str()))?;

        match outcome {
            KillOutcome::Unconfirmed => {
                warn!(session_id = %id, pid, "could not confirm session process died")
            }
            outcome => info!(session_id = %id, pid, ?outcome, "session killed"),
        }
        Ok(())
    }

    /// Wait for an externally owned session to die after its owner was
    /// asked to kill it, escalating to SIGKILL ourselves after the grace
    /// period, then drop it from the registry.
    async fn confirm_external_kill(
        &self,
        runtime: &Arc<SessionRuntime>,
        signal: Signal,
        policy: KillPolicy,
    ) -> BrokerResult<()> {
        let id = &runtime.id;
        if let Some(pid) = runtime.info().pid {
            let ops = self.ops.clone();
            let outcome = kill::confirm(self.ops.as_ref(), pid, signal, policy, move || {
                ops.is_alive(pid)
            })
            .await
            .map_err(|e| e.with_session(id.as_str()))?;
            match outcome {
                KillOutcome::Unconfirmed => {
                    warn!(session_id = %id, pid, "could not confirm external session died")
                }
                outcome => info!(session_id = %id, pid, ?outcome, "external session killed"),
            }
        }

        // The watcher publishes the exit once the owner hangs up.
        let deadline = Instant::now() + EXTERNAL_HANGUP_WAIT;
        while !runtime.is_released() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !runtime.is_released() {
            debug!(session_id = %id, "owner still connected after kill, detaching");
            runtime.mark_exited();
            self.deregister(runtime).await;
            runtime.release().await;
        }
        Ok(())
    }

    /// Merge persisted sessions with what this process holds. A session held
    /// here reports its in-memory info.

    pub async fn list_sessions(&self) -> BrokerResult<Vec<SessionSummary>> {
        let stored = self.store.list_sessions().await?;
        let sessions = self.sessions.read().await;
        Ok(stored
            .into_iter()
            .map(|s| {
                let runtime = sessions.get(&s.info.id);
                SessionSummary {
                    active: runtime.is_some(),
                    activity: runtime.map(|r| r.activity()).unwrap_or_default(),
                    info: runtime.map(|r| r.info()).unwrap_or(s.info),
                    last_modified: s.last_modified,
                }
            })
            .collect())
    }

    pub async fn get_session(&self, id: &SessionId) -> BrokerResult<Option<SessionSummary>> {
        let Some(info) = self.store.load_session_info(id).await? else {
            return Ok(None);
        };
        let runtime = self.runtime(id).await;
        let stdout = self.store.paths(id).stdout;
        let last_modified = tokio::fs::metadata(&stdout)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or(info.started_at);
        Ok(Some(SessionSummary {
            active: runtime.is_some(),
            activity: runtime.as_ref().map(|r| r.activity()).unwrap_or_default(),
            info: runtime.map(|r| r.info()).unwrap_or(info),
            last_modified,
        }))
    }

    /// Stop (if needed) and forget a session, removing its directory.
    pub async fn cleanup_session(&self, id: &SessionId) -> BrokerResult<()> {
        self.drop_runtime(id).await?;
        self.store.cleanup_session(id).await?;
        info!(session_id = %id, "session cleaned up");
        Ok(())
    }

    /// Remove every session persisted as exited, releasing any runtime this
    /// process still holds for them.
    pub async fn cleanup_exited_sessions(&self) -> BrokerResult<Vec<SessionId>> {
        let removed = self.store.cleanup_exited_sessions().await?;
        for id in &removed {
            if let Err(e) = self.drop_runtime(id).await {
                warn!(session_id = %id, error = %e, "failed to stop removed session");
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "removed exited sessions");
        }
        Ok(removed)
    }

    /// Kill a still-running local session, then deregister and release it.
    async fn drop_runtime(&self, id: &SessionId) -> BrokerResult<()> {
        let Some(runtime) = self.runtime(id).await else {
            return Ok(());
        };
        if runtime.is_local() && !runtime.is_exited() {
            self.kill_session(id, None).await?;
        }
        self.deregister(&runtime).await;
        runtime.release().await;
        Ok(())
    }

    /// Sessions held by this process that have not exited.
    pub async fn active_session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|r| !r.is_exited())
            .count()
    }

    /// Run the zombie check every `interval` until shutdown.
    pub fn spawn_maintenance(&self, interval: Duration) {
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orch) = weak.upgrade() else {
                    break;
                };
                match orch.store.update_zombie_sessions(orch.ops.as_ref()).await {
                    Ok(ids) if !ids.is_empty() => {
                        info!(count = ids.len(), "marked zombie sessions as exited")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "zombie check failed"),
                }
            }
        });
        if let Ok(mut slot) = self.maintenance.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    /// Kill local sessions, detach external ones and stop background work.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.maintenance.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        let runtimes: Vec<Arc<SessionRuntime>> =
            self.sessions.read().await.values().cloned().collect();
        info!(sessions = runtimes.len(), "shutting down orchestrator");

        let stops = runtimes.iter().map(|runtime| async move {
            if runtime.is_local() {
                if let Err(e) = self.kill_session(&runtime.id, None).await {
                    warn!(session_id = %runtime.id, error = %e, "kill during shutdown failed");
                }
            } else {
                self.deregister(runtime).await;
                runtime.release().await;
            }
        });
        futures_util::future::join_all(stops).await;

        // Exit watchers finish the local sessions; wait for them briefly.
        let deadline = Instant::now() + SHUTDOWN_WAIT;
        while Instant::now() < deadline && !self.sessions.read().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let leftovers: Vec<_> = self.sessions.write().await.drain().map(|(_, r)| r).collect();
        for runtime in leftovers {
            warn!(session_id = %runtime.id, "session still registered at shutdown");
            runtime.release().await;
        }
        info!("orchestrator shut down");
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn runtime(&self, id: &SessionId) -> Option<Arc<SessionRuntime>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn require_runtime(&self, id: &SessionId) -> BrokerResult<Arc<SessionRuntime>> {
        self.runtime(id)
            .await
            .ok_or_else(|| BrokerError::not_found(id.as_str()))
    }

    async fn live_runtime(&self, id: &SessionId) -> BrokerResult<Arc<SessionRuntime>> {
        let runtime = self.require_runtime(id).await?;
        if runtime.is_exited() {
            return Err(
                BrokerError::process(format!("session {id} has exited")).with_session(id.as_str())
            );
        }
        Ok(runtime)
    }

    /// Remove `runtime` from the registry if it is still the registered one.
    async fn deregister(&self, runtime: &Arc<SessionRuntime>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&runtime.id)
            .is_some_and(|current| Arc::ptr_eq(current, runtime))
        {
            sessions.remove(&runtime.id);
        }
    }

    async fn discard_directory(&self, id: &SessionId) {
        if let Err(e) = self.store.cleanup_session(id).await {
            warn!(session_id = %id, error = %e, "failed to remove session directory");
        }
    }

    /// Recompute the title for an injecting session. `foreground_only`
    /// limits the refresh to dynamic mode.
    pub(crate) fn refresh_title(&self, runtime: &SessionRuntime, foreground_only: bool) {
        if !runtime.is_local() {
            return;
        }
        let info = runtime.info();
        if foreground_only && info.title_mode != TitleMode::Dynamic {
            return;
        }
        let foreground = runtime.foreground_command();
        let activity = runtime.activity();
        let ctx = TitleContext {
            working_dir: &info.working_dir,
            command: &info.command,
            session_name: &info.name,
            foreground: foreground.as_deref(),
            activity: activity.specific_status.as_ref(),
        };
        if let Some(title) = compose_title(info.title_mode, &ctx) {
            runtime.with_title(|t| t.request(title, Instant::now()));
        }
    }

    /// Persist the exit, notify listeners and release the runtime.
    async fn finish_session(&self, runtime: &Arc<SessionRuntime>, exit_code: Option<i32>) {
        let id = &runtime.id;
        match self
            .store
            .update_session_status(id, SessionStatus::Exited, None, exit_code)
            .await
        {
            Ok(info) => runtime.set_info(info),
            Err(e) => debug!(session_id = %id, error = %e, "exit status not persisted"),
        }
        let _ = tokio::fs::remove_file(&runtime.paths.socket).await;
        self.deregister(runtime).await;
        info!(session_id = %id, ?exit_code, "session exited");
        self.emit(OrchestratorEvent::SessionExited {
            session_id: id.clone(),
            exit_code,
        });
        runtime.release().await;
    }
}

fn validate_size(cols: u16, rows: u16) -> BrokerResult<()> {
    if cols == 0 || rows == 0 {
        return Err(BrokerError::validation(format!(
            "terminal size {cols}x{rows} is invalid"
        )));
    }
    Ok(())
}

fn check_socket_path(path: &Path) -> BrokerResult<()> {
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH_LEN {
        return Err(BrokerError::validation(format!(
            "control socket path {} is {len} bytes, limit is {MAX_SOCKET_PATH_LEN}",
            path.display()
        )));
    }
    Ok(())
}

/// Record an `i` event and queue bytes for the PTY writer.
fn queue_local_input(runtime: &SessionRuntime, data: Vec<u8>) -> BrokerResult<()> {
    if let Some(recorder) = &runtime.recorder {
        if let Err(e) = recorder.write_input(&String::from_utf8_lossy(&data)) {
            debug!(session_id = %runtime.id, error = %e, "input not recorded");
        }
    }
    runtime.push_input(data)
}

// ── Session tasks ────────────────────────────────────────────────────

/// PTY output → title filter → title injection → recording → scrollback →
/// subscribers.
async fn output_loop(
    orchestrator: Weak<SessionOrchestrator>,
    runtime: Arc<SessionRuntime>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    drained: oneshot::Sender<()>,
) {
    let mode = runtime.info().title_mode;
    let mut filter = mode.filters().then(TitleFilter::new);
    let mut ticker = tokio::time::interval(TITLE_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            chunk = rx.recv() => {
                let Some(data) = chunk else { break };
                let data = match filter.as_mut() {
                    Some(f) => f.filter(&data),
                    None => data,
                };
                if data.is_empty() {
                    continue;
                }
                runtime.with_title(|t| t.note_output(Instant::now()));
                if contains_bell(&data) {
                    if let Some(orch) = orchestrator.upgrade() {
                        orch.emit(OrchestratorEvent::Bell { session_id: runtime.id.clone() });
                    }
                }
                runtime.emit_output(&data);
            }

            _ = ticker.tick(), if mode.injects() => {
                match runtime.with_title(|t| t.poll(Instant::now())) {
                    Injection::Inject(seq) => {
                        debug!(session_id = %runtime.id, "injecting title");
                        runtime.emit_output(seq.as_bytes());
                    }
                    Injection::Deferred => {
                        debug!(session_id = %runtime.id, "output never settled, title deferred");
                    }
                    Injection::Idle => {}
                }
            }
        }
    }

    if let Some(f) = filter.as_mut() {
        runtime.emit_output(&f.finish());
    }
    let _ = drained.send(());
}

/// Single writer so input reaches the PTY in submission order.
async fn input_loop(
    runtime: Arc<SessionRuntime>,
    writer: PtyWriter,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = pty::write_all(&writer, data).await {
            warn!(session_id = %runtime.id, error = %e, "PTY write failed");
        }
    }
}

async fn foreground_loop(
    orchestrator: Weak<SessionOrchestrator>,
    runtime: Arc<SessionRuntime>,
    pty: Arc<PtyHandle>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(orch) = orchestrator.upgrade() else {
            break;
        };
        if runtime.is_exited() {
            break;
        }
        let shell_pid = pty.pid();
        let pgid = pty.foreground_pgid();
        let job = pgid.filter(|&p| p != shell_pid);
        let known = runtime.with_foreground(|tracker| tracker.current().map(|j| j.pgid));
        let command = match job {
            Some(job) if known != Some(job) => {
                let ops = orch.ops.clone();
                tokio::task::spawn_blocking(move || ops.command_line(job))
                    .await
                    .ok()
                    .flatten()
            }
            _ => None,
        };
        let changes = runtime.with_foreground(|tracker| {
            tracker.observe(shell_pid, pgid, Instant::now(), |_| command)
        });
        if changes.is_empty() {
            continue;
        }
        for change in changes {
            let event = match change {
                ForegroundChange::Started { command } => {
                    debug!(session_id = %runtime.id, %command, "foreground command started");
                    OrchestratorEvent::CommandStarted {
                        session_id: runtime.id.clone(),
                        command,
                    }
                }
                ForegroundChange::Finished { command, duration } => {
                    debug!(session_id = %runtime.id, %command, ?duration, "foreground command finished");
                    OrchestratorEvent::CommandFinished {
                        session_id: runtime.id.clone(),
                        command,
                        duration,
                    }
                }
            };
            orch.emit(event);
        }
        orch.refresh_title(&runtime, true);
    }
}

/// Persist the newest pruning offset as `lastClearOffset`.
async fn clear_offset_loop(
    orchestrator: Weak<SessionOrchestrator>,
    runtime: Arc<SessionRuntime>,
    mut rx: mpsc::UnboundedReceiver<u64>,
) {
    while let Some(mut offset) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            offset = newer;
        }
        let Some(orch) = orchestrator.upgrade() else {
            break;
        };
        runtime.update_info(|info| info.last_clear_offset = Some(offset));
        if let Err(e) = orch
            .store
            .update_session(&runtime.id, |info| info.last_clear_offset = Some(offset))
            .await
        {
            warn!(session_id = %runtime.id, error = %e, "failed to persist clear offset");
        }
    }
}

/// Forward bytes written to the session's stdin FIFO into the PTY.
fn spawn_stdin_forwarder(runtime: &Arc<SessionRuntime>) -> Option<JoinHandle<()>> {
    let path = runtime.paths.stdin.clone();
    let is_fifo = std::fs::metadata(&path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false);
    if !is_fifo {
        debug!(session_id = %runtime.id, "stdin is not a FIFO, forwarder disabled");
        return None;
    }

    let opened = tokio::net::unix::pipe::OpenOptions::new()
        .open_receiver(&path)
        .and_then(|rx| {
            // Holding a writer open keeps reads from hitting EOF between
            // external writers.
            let keepalive = tokio::net::unix::pipe::OpenOptions::new().open_sender(&path)?;
            Ok((rx, keepalive))
        });
    let (mut receiver, keepalive) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            warn!(session_id = %runtime.id, error = %e, "cannot open stdin FIFO");
            return None;
        }
    };

    let runtime = runtime.clone();
    Some(tokio::spawn(async move {
        let _keepalive = keepalive;
        let mut buf = vec![0u8; 4096];
        loop {
            match receiver.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = queue_local_input(&runtime, buf[..n].to_vec()) {
                        debug!(session_id = %runtime.id, error = %e, "stdin forwarder stopping");
                        break;
                    }
                }
                Err(e) => {
                    warn!(session_id = %runtime.id, error = %e, "stdin FIFO read failed");
                    break;
                }
            }
        }
    }))
}

/// Wait for the child, record the exit and release the session.
async fn exit_watch(
    orchestrator: Weak<SessionOrchestrator>,
    runtime: Arc<SessionRuntime>,
    pty: Arc<PtyHandle>,
    drained: oneshot::Receiver<()>,
) {
    let exit_code = match pty.wait().await {
        Ok(code) => Some(code),
        Err(e) => {
            error!(session_id = %runtime.id, error = %e, "failed to wait for session process");
            None
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN, drained).await.is_err() {
        debug!(session_id = %runtime.id, "PTY still open after exit, not waiting for it");
    }
    runtime.mark_exited();

    if let Some(recorder) = &runtime.recorder {
        let event = serde_json::json!(["exit", exit_code, runtime.id.as_str()]);
        if let Err(e) = recorder.write_raw_event(&event) {
            debug!(session_id = %runtime.id, error = %e, "exit event not recorded");
        }
        if let Err(e) = recorder.close().await {
            warn!(session_id = %runtime.id, error = %e, "failed to close recording");
        }
    }

    match orchestrator.upgrade() {
        Some(orch) => orch.finish_session(&runtime, exit_code).await,
        None => {
            runtime.release().await;
        }
    }
}

/// Mirror output of an external session and drop it when the owner goes away.
async fn external_watch(
    orchestrator: Weak<SessionOrchestrator>,
    runtime: Arc<SessionRuntime>,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Message(Message::StdoutData(data))) => runtime.emit_output(&data),
            Ok(ClientEvent::Disconnected) | Err(broadcast::error::RecvError::Closed) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(session_id = %runtime.id, skipped, "external event stream lagged");
            }
        }
    }

    let Some(orch) = orchestrator.upgrade() else {
        return;
    };
    info!(session_id = %runtime.id, "external session owner disconnected");
    runtime.mark_exited();
    orch.deregister(&runtime).await;
    if let Ok(Some(info)) = orch.store.load_session_info(&runtime.id).await {
        if info.is_exited() {
            orch.emit(OrchestratorEvent::SessionExited {
                session_id: runtime.id.clone(),
                exit_code: info.exit_code,
            });
        }
        runtime.set_info(info);
    }
    runtime.release().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemProcessOps;
    use crate::session::recording::EventKind;

    fn orchestrator(root: &Path) -> Arc<SessionOrchestrator> {
        let mut config = BrokerConfig::with_control_dir(root);
        config.kill_grace = Duration::from_millis(600);
        config.kill_poll = Duration::from_millis(100);
        SessionOrchestrator::new(config, Arc::new(SystemProcessOps))
    }

    fn shell() -> Vec<String> {
        match which::which("bash") {
            Ok(path) => vec![path.display().to_string(), "-l".into()],
            Err(_) => vec!["/bin/sh".into()],
        }
    }

    fn options(dir: &Path) -> SessionOptions {
        SessionOptions {
            working_dir: Some(dir.to_path_buf()),
            cols: Some(80),
            rows: Some(24),
            env: vec![("PS1".into(), "$ ".into())],
            ..Default::default()
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    fn cast_events(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .skip(1)
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn special_keys() {
        assert_eq!("arrow_up".parse::<SpecialKey>().unwrap().sequence(), "\x1b[A");
        assert_eq!("shift-enter".parse::<SpecialKey>().unwrap().sequence(), "\r\n");
        assert_eq!("ctrl_enter".parse::<SpecialKey>().unwrap().sequence(), "\n");
        assert!("f13".parse::<SpecialKey>().is_err());
    }

    #[test]
    fn socket_path_limit() {
        assert!(check_socket_path(Path::new("/tmp/s/ipc.sock")).is_ok());
        let long = format!("/tmp/{}/ipc.sock", "x".repeat(120));
        let err = check_socket_path(Path::new(&long)).unwrap_err();
        assert_eq!(err.kind(), termbroker_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn shell_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("c");
        let orch = orchestrator(&root);
        let mut events = orch.subscribe_events();

        let info = orch
            .create_session(shell(), options(dir.path()))
            .await
            .unwrap();
        let id = info.id.clone();
        assert_eq!(info.status, SessionStatus::Running);
        assert!(info.pid.is_some());
        assert_eq!((info.cols, info.rows), (80, 24));

        let stored = orch.store().load_session_info(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Running);
        assert_eq!(stored.pid, info.pid);
        assert_eq!(stored.working_dir, dir.path().to_string_lossy());
        assert_eq!(orch.active_session_count().await, 1);

        orch.send_input(&id, SessionInput::Text("echo hi\n".into()))
            .await
            .unwrap();
        orch.resize_session(&id, 100, 30).await.unwrap();
        let resized = orch.store().load_session_info(&id).await.unwrap().unwrap();
        assert_eq!((resized.cols, resized.rows), (100, 30));
        assert_eq!((resized.initial_cols, resized.initial_rows), (80, 24));

        let stdout = orch.store().paths(&id).stdout;
        wait_for(|| {
            let stdout = stdout.clone();
            async move {
                std::fs::read_to_string(&stdout)
                    .map(|s| s.contains("hi\\r\\n"))
                    .unwrap_or(false)
            }
        })
        .await;

        orch.kill_session(&id, None).await.unwrap();
        let exited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let OrchestratorEvent::SessionExited { session_id, .. } =
                    events.recv().await.unwrap()
                {
                    break session_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(exited, id);
        let stored = orch.store().load_session_info(&id).await.unwrap().unwrap();
        assert!(stored.is_exited());
        assert_eq!(orch.active_session_count().await, 0);

        let events_on_disk = cast_events(&stdout);
        assert!(events_on_disk
            .iter()
            .any(|e| e[1] == EventKind::Input.code() && e[2] == "echo hi\n"));
        assert!(events_on_disk
            .iter()
            .any(|e| e[1] == EventKind::Resize.code() && e[2] == "100x30"));
        assert_eq!(events_on_disk.last().unwrap()[0], "exit");
        assert_eq!(events_on_disk.last().unwrap()[2], id.as_str());
    }

    #[tokio::test]
    async fn control_socket_drives_session() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("c"));
        let info = orch
            .create_session(vec!["/bin/cat".into()], options(dir.path()))
            .await
            .unwrap();
        let socket = orch.store().paths(&info.id).socket;

        let client = ControlClient::connect(&socket, ClientOptions::default())
            .await
            .unwrap();
        let mut events = client.events();
        client.subscribe_stdout().await.unwrap();
        client.send_stdin("ping\n").await.unwrap();

        let mut seen = Vec::new();
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ClientEvent::Message(Message::StdoutData(d))) = events.recv().await {
                    seen.extend(d);
                    if String::from_utf8_lossy(&seen).contains("ping") {
                        return true;
                    }
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(found);

        let reply = client
            .request(Message::Heartbeat, termbroker_core::MessageType::Heartbeat, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, Message::Heartbeat);

        let status = client
            .request(
                Message::StatusRequest,
                termbroker_core::MessageType::StatusResponse,
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(matches!(status, Message::StatusResponse(s) if s.running));

        // Unsupported inbound message comes back as a remote error.
        let err = client
            .request(
                Message::StdoutData(b"x".to_vec()),
                termbroker_core::MessageType::StatusResponse,
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), termbroker_core::ErrorKind::Protocol);

        client.resize(120, 40).await.unwrap();
        wait_for(|| {
            let orch = orch.clone();
            let id = info.id.clone();
            async move {
                orch.store()
                    .load_session_info(&id)
                    .await
                    .unwrap()
                    .is_some_and(|i| i.cols == 120 && i.rows == 40)
            }
        })
        .await;

        client.update_title("renamed").await.unwrap();
        wait_for(|| {
            let orch = orch.clone();
            let id = info.id.clone();
            async move {
                orch.store()
                    .load_session_info(&id)
                    .await
                    .unwrap()
                    .is_some_and(|i| i.name == "renamed")
            }
        })
        .await;

        client.kill(None).await.unwrap();
        wait_for(|| {
            let orch = orch.clone();
            async move { orch.active_session_count().await == 0 }
        })
        .await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn external_attach_proxies_operations() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("c");
        let owner = orchestrator(&root);
        let info = owner
            .create_session(vec!["/bin/cat".into()], options(dir.path()))
            .await
            .unwrap();

        let other = orchestrator(&root);
        let attached = other.attach_external(&info.id).await.unwrap();
        assert_eq!(attached.id, info.id);
        assert_eq!(other.active_session_count().await, 1);

        other.resize_session(&info.id, 90, 20).await.unwrap();
        wait_for(|| {
            let owner = owner.clone();
            let id = info.id.clone();
            async move {
                owner
                    .store()
                    .load_session_info(&id)
                    .await
                    .unwrap()
                    .is_some_and(|i| i.cols == 90 && i.rows == 20)
            }
        })
        .await;

        other.kill_session(&info.id, None).await.unwrap();
        wait_for(|| {
            let other = other.clone();
            async move { other.active_session_count().await == 0 }
        })
        .await;
        wait_for(|| {
            let owner = owner.clone();
            async move { owner.active_session_count().await == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn unique_names_and_failed_spawn_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("c"));
        let mut opts = options(dir.path());
        opts.name = Some("work".into());

        let a = orch.create_session(vec!["/bin/cat".into()], opts.clone()).await.unwrap();
        let b = orch.create_session(vec!["/bin/cat".into()], opts.clone()).await.unwrap();
        assert_eq!(a.name, "work");
        assert_eq!(b.name, "work (2)");

        let err = orch
            .create_session(vec!["definitely-not-a-command-xyz".into()], opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), termbroker_core::ErrorKind::Spawn);
        assert_eq!(orch.active_session_count().await, 2);
        assert_eq!(orch.list_sessions().await.unwrap().len(), 2);

        orch.shutdown().await;
        assert_eq!(orch.active_session_count().await, 0);
        let listed = orch.list_sessions().await.unwrap();
        assert!(listed.iter().all(|s| s.info.is_exited() && !s.active));
        assert_eq!(orch.cleanup_exited_sessions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_sessions_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("c"));
        let id = SessionId::parse("nope").unwrap();
        let err = orch
            .send_input(&id, SessionInput::Key(SpecialKey::Enter))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), termbroker_core::ErrorKind::NotFound);
        assert!(orch.get_session(&id).await.unwrap().is_none());
        assert_eq!(
            orch.attach_external(&id).await.unwrap_err().kind(),
            termbroker_core::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn external_kill_escalates_when_owner_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("c");
        // The owner waits far longer than the attached side before escalating.
        let mut config = BrokerConfig::with_control_dir(&root);
        config.kill_grace = Duration::from_secs(30);
        config.kill_poll = Duration::from_millis(100);
        let owner = SessionOrchestrator::new(config, Arc::new(SystemProcessOps));
        let stubborn = vec![
            "/bin/sh".into(),
            "-c".into(),
            "trap '' TERM; while :; do sleep 1; done".into(),
        ];
        let info = owner
            .create_session(stubborn, options(dir.path()))
            .await
            .unwrap();
        let pid = info.pid.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let other = orchestrator(&root);
        other.attach_external(&info.id).await.unwrap();
        let started = Instant::now();
        other.kill_session(&info.id, None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(other.active_session_count().await, 0);

        wait_for(|| async move { !SystemProcessOps.is_alive(pid) }).await;
        wait_for(|| {
            let owner = owner.clone();
            async move { owner.active_session_count().await == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn control_connections_do_not_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("c"));
        let info = orch
            .create_session(vec!["/bin/cat".into()], options(dir.path()))
            .await
            .unwrap();
        let runtime = orch.runtime(&info.id).await.unwrap();
        let socket = orch.store().paths(&info.id).socket;
        let tasks = runtime.task_count();

        for _ in 0..20 {
            let client = ControlClient::connect(&socket, ClientOptions::default())
                .await
                .unwrap();
            let reply = client
                .request(
                    Message::Heartbeat,
                    termbroker_core::MessageType::Heartbeat,
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            assert_eq!(reply, Message::Heartbeat);
            client.disconnect().await;
        }
        assert_eq!(runtime.task_count(), tasks);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn listing_prefers_live_info_and_cleanup_releases_runtimes() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("c"));
        let info = orch
            .create_session(vec!["/bin/cat".into()], options(dir.path()))
            .await
            .unwrap();
        let id = info.id.clone();
        let pid = info.pid.unwrap();

        orch.store().update_session(&id, |i| i.cols = 1).await.unwrap();
        let listed = orch.list_sessions().await.unwrap();
        let summary = listed.iter().find(|s| s.info.id == id).unwrap();
        assert!(summary.active);
        assert_eq!(summary.info.cols, 80);
        assert_eq!(orch.get_session(&id).await.unwrap().unwrap().info.cols, 80);

        let runtime = orch.runtime(&id).await.unwrap();
        orch.store()
            .update_session_status(&id, SessionStatus::Exited, None, Some(0))
            .await
            .unwrap();
        assert_eq!(orch.cleanup_exited_sessions().await.unwrap(), vec![id.clone()]);
        assert!(runtime.is_released());
        assert_eq!(orch.active_session_count().await, 0);
        assert!(orch.get_session(&id).await.unwrap().is_none());

        wait_for(|| async move { !SystemProcessOps.is_alive(pid) }).await;
        assert!(!orch.store().paths(&id).control_dir.exists());
    }

    #[tokio::test]
    async fn spawn_failure_removes_session_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("c"));
        let script = dir.path().join("not-executable");
        std::fs::write(&script, "#!/bin/sh\necho never\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let id = SessionId::parse("doomed").unwrap();
        let opts = SessionOptions {
            session_id: Some(id.clone()),
            ..options(dir.path())
        };
        let err = orch
            .create_session(vec![script.display().to_string()], opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), termbroker_core::ErrorKind::Spawn);
        assert!(!orch.store().paths(&id).control_dir.exists());
        assert_eq!(orch.active_session_count().await, 0);
        assert!(orch.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreground_commands_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BrokerConfig::with_control_dir(dir.path().join("c"));
        config.foreground_poll = Duration::from_millis(100);
        let orch = SessionOrchestrator::new(config, Arc::new(SystemProcessOps));
        let mut events = orch.subscribe_events();
        let info = orch
            .create_session(shell(), options(dir.path()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        orch.send_input(&info.id, SessionInput::Text("sleep 2\n".into()))
            .await
            .unwrap();
        let (started, finished) = tokio::time::timeout(Duration::from_secs(10), async {
            let mut started = None;
            loop {
                match events.recv().await.unwrap() {
                    OrchestratorEvent::CommandStarted { command, .. } => started = Some(command),
                    OrchestratorEvent::CommandFinished { command, .. } => {
                        break (started, command)
                    }
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(started.is_some_and(|c| c.contains("sleep")));
        assert!(finished.contains("sleep"));
        orch.shutdown().await;
    }
}
