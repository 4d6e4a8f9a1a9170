//! Persisted session metadata and derived paths.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use termbroker_core::SessionId;

use super::title::TitleMode;

pub const INFO_FILE: &str = "session.json";
pub const STDOUT_FILE: &str = "stdout";
pub const STDIN_FILE: &str = "stdin";
pub const SOCKET_FILE: &str = "ipc.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// Where a session was created when it was forwarded from another broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrigin {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Repository context captured at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ahead_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_behind_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_has_changes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_is_worktree: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_main_repo_path: Option<String>,
}

/// Contents of `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
    pub initial_cols: u16,
    pub initial_rows: u16,
    #[serde(default)]
    pub title_mode: TitleMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_clear_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteOrigin>,
    #[serde(flatten)]
    pub git: GitContext,
}

impl SessionInfo {
    pub fn is_exited(&self) -> bool {
        self.status == SessionStatus::Exited
    }
}

/// Activity reported over the control socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStatus {
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_status: Option<SpecificStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificStatus {
    pub app: String,
    pub status: String,
}

/// A persisted session plus its cast-file mtime.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub info: SessionInfo,
    pub last_modified: DateTime<Utc>,
}

/// Listing entry: persisted state merged with live runtime state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub info: SessionInfo,
    /// Held by this orchestrator.
    pub active: bool,
    pub activity: ActivityStatus,
    pub last_modified: DateTime<Utc>,
}

/// Filesystem locations for one session, derived from its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub control_dir: PathBuf,
    pub stdout: PathBuf,
    pub stdin: PathBuf,
    pub info: PathBuf,
    pub socket: PathBuf,
}

impl SessionPaths {
    pub fn new(root: &Path, id: &SessionId) -> Self {
        let control_dir = root.join(id.as_str());
        Self {
            stdout: control_dir.join(STDOUT_FILE),
            stdin: control_dir.join(STDIN_FILE),
            info: control_dir.join(INFO_FILE),
            socket: control_dir.join(SOCKET_FILE),
            control_dir,
        }
    }
}
