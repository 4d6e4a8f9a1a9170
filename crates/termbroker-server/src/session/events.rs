//! Notifications broadcast by the orchestrator.

use std::time::Duration;

use termbroker_core::protocol::GitEventKind;
use termbroker_core::SessionId;

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    SessionExited {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    SessionNameChanged {
        session_id: SessionId,
        name: String,
    },
    Bell {
        session_id: SessionId,
    },
    CommandStarted {
        session_id: SessionId,
        command: String,
    },
    CommandFinished {
        session_id: SessionId,
        command: String,
        duration: Duration,
    },
    GitEvent {
        session_id: SessionId,
        repo_path: String,
        kind: GitEventKind,
    },
}

impl OrchestratorEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            OrchestratorEvent::SessionExited { session_id, .. }
            | OrchestratorEvent::SessionNameChanged { session_id, .. }
            | OrchestratorEvent::Bell { session_id }
            | OrchestratorEvent::CommandStarted { session_id, .. }
            | OrchestratorEvent::CommandFinished { session_id, .. }
            | OrchestratorEvent::GitEvent { session_id, .. } => session_id,
        }
    }
}
