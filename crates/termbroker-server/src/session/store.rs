//! Filesystem-backed session metadata.
//!
//! Layout under the control root:
//!
//! ```text
//! <root>/.version
//! <root>/<id>/session.json
//! <root>/<id>/stdout
//! <root>/<id>/stdin
//! <root>/<id>/ipc.sock
//! ```
//!
//! Every metadata write goes to a uniquely named temp file in the session
//! directory, is fsynced, then renamed over `session.json`.

use std::collections::HashSet;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use termbroker_core::{BrokerError, BrokerResult, SessionId};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::info::{SessionInfo, SessionPaths, SessionStatus, StoredSession};
use crate::process::ProcessOps;

pub const VERSION_FILE: &str = ".version";

pub struct SessionStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on metadata files.
    update_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            update_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, id: &SessionId) -> SessionPaths {
        SessionPaths::new(&self.root, id)
    }

    /// Create the session directory and its stdin pipe.
    pub async fn create_session_directory(&self, id: &SessionId) -> BrokerResult<SessionPaths> {
        let paths = self.paths(id);
        tokio::fs::create_dir_all(&paths.control_dir)
            .await
            .map_err(|e| io_err(&paths.control_dir, "create directory", e).with_session(id.as_str()))?;

        if !paths.stdin.exists() {
            if let Err(e) = make_fifo(&paths.stdin) {
                warn!(session_id = %id, error = %e, "mkfifo failed, using a plain stdin file");
                tokio::fs::write(&paths.stdin, b"")
                    .await
                    .map_err(|e| io_err(&paths.stdin, "create", e).with_session(id.as_str()))?;
            }
        }

        debug!(session_id = %id, dir = %paths.control_dir.display(), "session directory created");
        Ok(paths)
    }

    /// Atomically replace `session.json`.
    pub async fn save_session_info(&self, id: &SessionId, info: &SessionInfo) -> BrokerResult<()> {
        let paths = self.paths(id);
        let body = serde_json::to_vec_pretty(info)?;
        atomic_write(&paths.control_dir, &paths.info, &body)
            .await
            .map_err(|e| e.with_session(id.as_str()))
    }

    /// `Ok(None)` when the session has no metadata file.
    pub async fn load_session_info(&self, id: &SessionId) -> BrokerResult<Option<SessionInfo>> {
        let path = self.paths(id).info;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, "read", e).with_session(id.as_str())),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            BrokerError::persistence(format!("parse {}: {e}", path.display()))
                .with_session(id.as_str())
        })
    }

    /// Generic read-modify-write of a session's metadata.
    pub async fn update_session<F>(&self, id: &SessionId, mutate: F) -> BrokerResult<SessionInfo>
    where
        F: FnOnce(&mut SessionInfo),
    {
        let _guard = self.update_lock.lock().await;
        let mut info = self
            .load_session_info(id)
            .await?
            .ok_or_else(|| BrokerError::not_found(id.as_str()))?;
        mutate(&mut info);
        self.save_session_info(id, &info).await?;
        Ok(info)
    }

    pub async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        pid: Option<u32>,
        exit_code: Option<i32>,
    ) -> BrokerResult<SessionInfo> {
        self.update_session(id, |info| {
            info.status = status;
            if pid.is_some() {
                info.pid = pid;
            }
            if exit_code.is_some() {
                info.exit_code = exit_code;
            }
        })
        .await
    }

    /// Rename a session, suffixing the name if another live session has it.
    pub async fn update_session_name(&self, id: &SessionId, name: &str) -> BrokerResult<String> {
        let unique = self.ensure_unique_name(name, Some(id)).await?;
        let chosen = unique.clone();
        self.update_session(id, move |info| info.name = chosen).await?;
        Ok(unique)
    }

    /// `candidate`, or `candidate (N)` for the smallest N ≥ 2 not used by any
    /// non-exited session other than `exclude`.
    pub async fn ensure_unique_name(
        &self,
        candidate: &str,
        exclude: Option<&SessionId>,
    ) -> BrokerResult<String> {
        let taken: HashSet<String> = self
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| !s.info.is_exited() && Some(&s.info.id) != exclude)
            .map(|s| s.info.name)
            .collect();

        if !taken.contains(candidate) {
            return Ok(candidate.to_string());
        }
        let mut n = 2u32;
        loop {
            let name = format!("{candidate} ({n})");
            if !taken.contains(&name) {
                return Ok(name);
            }
            n += 1;
        }
    }

    /// Every readable session, newest first.
    pub async fn list_sessions(&self) -> BrokerResult<Vec<StoredSession>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root, "read directory", e)),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err(&self.root, "read directory", e))?
        {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Ok(id) = SessionId::parse(&name.to_string_lossy()) else {
                continue;
            };
            match self.load_session_info(&id).await {
                Ok(Some(info)) => {
                    let last_modified = self.last_modified(&id, &info).await;
                    sessions.push(StoredSession { info, last_modified });
                }
                Ok(None) => {}
                Err(e) => warn!(session_id = %id, error = %e, "skipping unreadable session"),
            }
        }

        sessions.sort_by(|a, b| b.info.started_at.cmp(&a.info.started_at));
        Ok(sessions)
    }

    async fn last_modified(&self, id: &SessionId, info: &SessionInfo) -> DateTime<Utc> {
        match tokio::fs::metadata(self.paths(id).stdout).await {
            Ok(meta) => meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(info.started_at),
            Err(_) => info.started_at,
        }
    }

    /// One-time cleanup after an upgrade. Returns the removed ids.
    ///
    /// * marker equals `current`: nothing to do
    /// * marker differs: remove every session not stamped with `current`,
    ///   except sessions whose process is still running
    /// * no marker: remove unversioned sessions that have exited or whose
    ///   process is gone
    pub async fn cleanup_old_version_sessions(
        &self,
        current: &str,
        ops: &dyn ProcessOps,
    ) -> BrokerResult<Vec<SessionId>> {
        let marker_path = self.root.join(VERSION_FILE);
        let marker = match tokio::fs::read_to_string(&marker_path).await {
            Ok(s) => Some(s.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_err(&marker_path, "read", e)),
        };

        if marker.as_deref() == Some(current) {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for stored in self.list_sessions().await? {
            let info = &stored.info;
            let dead = info.is_exited() || !info.pid.is_some_and(|pid| ops.is_alive(pid));
            let remove = match &marker {
                Some(_) => info.version.as_deref() != Some(current) && dead,
                None => info.version.is_none() && dead,
            };
            if remove {
                self.cleanup_session(&info.id).await?;
                removed.push(info.id.clone());
            }
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_err(&self.root, "create directory", e))?;
        atomic_write(&self.root, &marker_path, current.as_bytes()).await?;

        if !removed.is_empty() {
            info!(
                previous = marker.as_deref().unwrap_or("none"),
                current,
                count = removed.len(),
                "cleaned up sessions from an older version"
            );
        }
        Ok(removed)
    }

    /// Mark `running` sessions whose process is gone as exited (code 1).
    pub async fn update_zombie_sessions(&self, ops: &dyn ProcessOps) -> BrokerResult<Vec<SessionId>> {
        let mut zombies = Vec::new();
        for stored in self.list_sessions().await? {
            let info = stored.info;
            if info.status != SessionStatus::Running {
                continue;
            }
            let Some(pid) = info.pid else {
                continue;
            };
            if ops.is_alive(pid) {
                continue;
            }
            self.update_session(&info.id, |i| {
                i.status = SessionStatus::Exited;
                if i.exit_code.is_none() {
                    i.exit_code = Some(1);
                }
            })
            .await?;
            debug!(session_id = %info.id, pid, "marked zombie session exited");
            zombies.push(info.id);
        }
        Ok(zombies)
    }

    pub async fn cleanup_session(&self, id: &SessionId) -> BrokerResult<()> {
        let dir = self.paths(id).control_dir;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(session_id = %id, "session directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir, "remove", e).with_session(id.as_str())),
        }
    }

    pub async fn cleanup_exited_sessions(&self) -> BrokerResult<Vec<SessionId>> {
        let mut removed = Vec::new();
        for stored in self.list_sessions().await? {
            if stored.info.is_exited() {
                self.cleanup_session(&stored.info.id).await?;
                removed.push(stored.info.id);
            }
        }
        Ok(removed)
    }

    /// Append to the session's stdin pipe. A pipe with no reader is an error
    /// rather than a blocked caller.
    pub async fn write_to_stdin(&self, id: &SessionId, data: &[u8]) -> BrokerResult<()> {
        let path = self.paths(id).stdin;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .await
            .map_err(|e| io_err(&path, "open", e).with_session(id.as_str()))?;
        file.write_all(data)
            .await
            .map_err(|e| io_err(&path, "write", e).with_session(id.as_str()))?;
        file.flush()
            .await
            .map_err(|e| io_err(&path, "flush", e).with_session(id.as_str()))
    }
}

fn io_err(path: &Path, op: &str, e: std::io::Error) -> BrokerError {
    BrokerError::persistence(format!("{op} {}: {e}", path.display()))
}

fn make_fifo(path: &Path) -> std::io::Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Write `body` to a fresh temp file in `dir`, fsync, then rename onto `target`.
async fn atomic_write(dir: &Path, target: &Path, body: &[u8]) -> BrokerResult<()> {
    use rand::Rng;
    let suffix: [u8; 6] = rand::thread_rng().gen();
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = dir.join(format!(".{file_name}.{}.tmp", hex::encode(suffix)));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_err(&tmp, "create", e))?;
        file.write_all(body)
            .await
            .map_err(|e| io_err(&tmp, "write", e))?;
        file.sync_all()
            .await
            .map_err(|e| io_err(&tmp, "fsync", e))?;
        drop(file);
        tokio::fs::rename(&tmp, target)
            .await
            .map_err(|e| io_err(target, "rename", e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::process::{Delivery, ResolvedCommand, Signal};
    use crate::session::info::GitContext;
    use crate::session::title::TitleMode;
    use std::collections::HashSet as Set;
    use std::sync::Mutex as StdMutex;

    /// Process capability whose live pids are set by the test.
    #[derive(Default)]
    pub(crate) struct FakeOps {
        pub alive: StdMutex<Set<u32>>,
        pub signals: StdMutex<Vec<(u32, Signal, tokio::time::Instant)>>,
    }

    impl FakeOps {
        pub fn with_alive(pids: &[u32]) -> Self {
            Self {
                alive: StdMutex::new(pids.iter().copied().collect()),
                ..Default::default()
            }
        }

        pub fn set_dead(&self, pid: u32) {
            self.alive.lock().unwrap().remove(&pid);
        }

        pub fn sent(&self) -> Vec<(u32, Signal, tokio::time::Instant)> {
            self.signals.lock().unwrap().clone()
        }
    }

    impl ProcessOps for FakeOps {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
        fn send_signal(&self, pid: u32, signal: Signal) -> BrokerResult<Delivery> {
            if !self.is_alive(pid) {
                return Ok(Delivery::NoSuchProcess);
            }
            self.signals
                .lock()
                .unwrap()
                .push((pid, signal, tokio::time::Instant::now()));
            Ok(Delivery::Sent)
        }
        fn resolve_executable(&self, _argv: &[String]) -> BrokerResult<ResolvedCommand> {
            Err(BrokerError::spawn("not supported"))
        }
        fn command_line(&self, _pid: u32) -> Option<String> {
            None
        }
    }

    pub(crate) fn info(id: &str, name: &str, status: SessionStatus, pid: Option<u32>) -> SessionInfo {
        SessionInfo {
            id: SessionId::parse(id).unwrap(),
            name: name.into(),
            command: vec!["bash".into()],
            working_dir: "/tmp".into(),
            status,
            pid,
            exit_code: None,
            started_at: Utc::now(),
            cols: 80,
            rows: 24,
            initial_cols: 80,
            initial_rows: 24,
            title_mode: TitleMode::None,
            version: None,
            last_clear_offset: None,
            remote: None,
            git: GitContext::default(),
        }
    }

    async fn seed(store: &SessionStore, info: &SessionInfo) {
        store.create_session_directory(&info.id).await.unwrap();
        store.save_session_info(&info.id, info).await.unwrap();
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let i = info("s1", "one", SessionStatus::Starting, None);
        seed(&store, &i).await;
        assert_eq!(store.load_session_info(&i.id).await.unwrap(), Some(i.clone()));

        let missing = SessionId::parse("nope").unwrap();
        assert_eq!(store.load_session_info(&missing).await.unwrap(), None);

        let updated = store
            .update_session_status(&i.id, SessionStatus::Running, Some(77), None)
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert_eq!(updated.pid, Some(77));
    }

    #[tokio::test]
    async fn stdin_is_a_fifo() {
        use std::os::unix::fs::FileTypeExt;
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let id = SessionId::parse("fifo").unwrap();
        let paths = store.create_session_directory(&id).await.unwrap();
        let meta = std::fs::metadata(&paths.stdin).unwrap();
        assert!(meta.file_type().is_fifo() || meta.is_file());
    }

    #[tokio::test]
    async fn stale_temp_file_does_not_affect_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let i = info("atomic", "a", SessionStatus::Running, Some(1));
        seed(&store, &i).await;

        // A crash mid-save leaves only a truncated temp file behind.
        let paths = store.paths(&i.id);
        std::fs::write(paths.control_dir.join(".session.json.dead.tmp"), b"{\"id\":").unwrap();

        assert_eq!(store.load_session_info(&i.id).await.unwrap(), Some(i.clone()));
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unique_names_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert_eq!(store.ensure_unique_name("dev", None).await.unwrap(), "dev");

        seed(&store, &info("a", "dev", SessionStatus::Running, Some(1))).await;
        assert_eq!(store.ensure_unique_name("dev", None).await.unwrap(), "dev (2)");

        seed(&store, &info("b", "dev (2)", SessionStatus::Running, Some(2))).await;
        assert_eq!(store.ensure_unique_name("dev", None).await.unwrap(), "dev (3)");

        // Exited sessions don't reserve names, and a session doesn't collide with itself.
        seed(&store, &info("c", "old", SessionStatus::Exited, None)).await;
        assert_eq!(store.ensure_unique_name("old", None).await.unwrap(), "old");
        let a = SessionId::parse("a").unwrap();
        assert_eq!(store.ensure_unique_name("dev", Some(&a)).await.unwrap(), "dev");

        let renamed = store.update_session_name(&a, "dev (2)").await.unwrap();
        assert_eq!(renamed, "dev (2) (2)");
    }

    #[tokio::test]
    async fn list_is_newest_first_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let mut older = info("old", "old", SessionStatus::Running, Some(1));
        older.started_at = Utc::now() - chrono::Duration::seconds(60);
        seed(&store, &older).await;
        seed(&store, &info("new", "new", SessionStatus::Running, Some(2))).await;

        let bad = SessionId::parse("bad").unwrap();
        let paths = store.create_session_directory(&bad).await.unwrap();
        std::fs::write(paths.info, b"not json").unwrap();
        std::fs::create_dir_all(dir.path().join("not a valid id")).unwrap();

        let ids: Vec<String> = store
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.info.id.to_string())
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn zombies_are_marked_exited() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        seed(&store, &info("live", "l", SessionStatus::Running, Some(10))).await;
        seed(&store, &info("dead", "d", SessionStatus::Running, Some(11))).await;
        seed(&store, &info("done", "x", SessionStatus::Exited, Some(12))).await;

        let ops = FakeOps::with_alive(&[10]);
        let zombies = store.update_zombie_sessions(&ops).await.unwrap();
        assert_eq!(zombies, vec![SessionId::parse("dead").unwrap()]);

        let dead = store
            .load_session_info(&SessionId::parse("dead").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dead.status, SessionStatus::Exited);
        assert_eq!(dead.exit_code, Some(1));
    }

    #[tokio::test]
    async fn version_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let ops = FakeOps::with_alive(&[1]);

        // No marker: only dead unversioned sessions go.
        seed(&store, &info("alive", "a", SessionStatus::Running, Some(1))).await;
        seed(&store, &info("gone", "g", SessionStatus::Running, Some(2))).await;
        let removed = store.cleanup_old_version_sessions("1.0.0", &ops).await.unwrap();
        assert_eq!(removed, vec![SessionId::parse("gone").unwrap()]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(VERSION_FILE)).unwrap(),
            "1.0.0"
        );

        // Same version: no-op.
        assert!(store
            .cleanup_old_version_sessions("1.0.0", &ops)
            .await
            .unwrap()
            .is_empty());

        // Upgrade: old sessions go unless their process is still running.
        let mut current = info("cur", "c", SessionStatus::Running, Some(1));
        current.version = Some("2.0.0".into());
        seed(&store, &current).await;
        let mut stale = info("stale", "s", SessionStatus::Exited, None);
        stale.version = Some("1.0.0".into());
        seed(&store, &stale).await;
        let mut old_dead = info("olddead", "o", SessionStatus::Running, Some(3));
        old_dead.version = Some("1.0.0".into());
        seed(&store, &old_dead).await;
        let removed: Set<String> = store
            .cleanup_old_version_sessions("2.0.0", &ops)
            .await
            .unwrap()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(
            removed,
            Set::from(["stale".to_string(), "olddead".to_string()])
        );
        for kept in ["cur", "alive"] {
            let id = SessionId::parse(kept).unwrap();
            assert!(store.load_session_info(&id).await.unwrap().is_some(), "{kept}");
        }
    }

    #[tokio::test]
    async fn cleanup_exited() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        seed(&store, &info("run", "r", SessionStatus::Running, Some(1))).await;
        seed(&store, &info("ex", "e", SessionStatus::Exited, None)).await;
        let removed = store.cleanup_exited_sessions().await.unwrap();
        assert_eq!(removed, vec![SessionId::parse("ex").unwrap()]);
        assert!(!dir.path().join("ex").exists());
        assert!(dir.path().join("run").exists());
    }

    #[tokio::test]
    async fn stdin_without_reader_is_an_error_for_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let id = SessionId::parse("w").unwrap();
        let paths = store.create_session_directory(&id).await.unwrap();
        let is_fifo = {
            use std::os::unix::fs::FileTypeExt;
            std::fs::metadata(&paths.stdin).unwrap().file_type().is_fifo()
        };
        let result = store.write_to_stdin(&id, b"hi").await;
        if is_fifo {
            assert!(result.is_err());
        } else {
            result.unwrap();
            assert_eq!(std::fs::read(&paths.stdin).unwrap(), b"hi");
        }
    }
}
