//! Per-session control socket.
//!
//! Every local session listens on `<control_dir>/ipc.sock`. Each accepted
//! connection gets its own read loop and an outbound queue; frames are
//! dispatched to the orchestrator and replies are written back on the same
//! connection. Protocol errors are answered with an ERROR frame and the
//! connection stays up.

use std::sync::{Arc, Weak};
use std::time::Duration;

use termbroker_core::protocol::{
    ControlCommand, ErrorMessage, FollowModeStatus, GitEventAck, GitFollowRequest,
    GitFollowResponse, StatusResponse,
};
use termbroker_core::{BrokerError, Message, MessageParser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::events::OrchestratorEvent;
use super::info::{ActivityStatus, SpecificStatus};
use super::orchestrator::{SessionInput, SessionOrchestrator};
use super::runtime::{SessionRuntime, SUBSCRIBER_QUEUE};
use crate::process::Signal;

const READ_BUF: usize = 16 * 1024;

/// Accept connections until the session is released. Connection tasks live
/// in a set owned by this loop, so they are reaped as they finish and
/// aborted with it.
pub async fn serve(
    listener: UnixListener,
    orchestrator: Weak<SessionOrchestrator>,
    runtime: Arc<SessionRuntime>,
) {
    debug!(session_id = %runtime.id, path = %runtime.paths.socket.display(), "control socket listening");
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    debug!(session_id = %runtime.id, "control connection accepted");
                    connections.spawn(handle_connection(
                        stream,
                        orchestrator.clone(),
                        runtime.clone(),
                    ));
                }
                Err(e) => {
                    warn!(session_id = %runtime.id, error = %e, "control socket accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },

            Some(done) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        warn!(session_id = %runtime.id, error = %e, "control connection panicked");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    orchestrator: Weak<SessionOrchestrator>,
    runtime: Arc<SessionRuntime>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(SUBSCRIBER_QUEUE);
    let mut parser = MessageParser::new();
    let mut buf = vec![0u8; READ_BUF];

    loop {
        tokio::select! {
            Some(msg) = out_rx.recv() => {
                if write_message(&mut writer, &msg).await.is_err() {
                    break;
                }
            }

            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(session_id = %runtime.id, error = %e, "control connection read failed");
                        break;
                    }
                };
                parser.add_data(&buf[..n]);
                let parsed: Vec<_> = parser.parse_messages().collect();

                for result in parsed {
                    let reply = match result {
                        Ok(msg) => {
                            let Some(orch) = orchestrator.upgrade() else {
                                return;
                            };
                            dispatch(&orch, &runtime, msg, &out_tx).await
                        }
                        Err(e) => {
                            debug!(session_id = %runtime.id, error = %e, "bad frame on control socket");
                            Some(error_reply(&e))
                        }
                    };
                    if let Some(reply) = reply {
                        if write_message(&mut writer, &reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
    debug!(session_id = %runtime.id, "control connection closed");
}

async fn write_message(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    msg: &Message,
) -> std::io::Result<()> {
    let frame = msg
        .to_frame()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&frame).await
}

fn error_reply(err: &BrokerError) -> Message {
    Message::Error(ErrorMessage {
        code: err.code().to_string(),
        message: err.message().to_string(),
        details: None,
    })
}

/// Handle one inbound message; the return value is written back.
async fn dispatch(
    orch: &Arc<SessionOrchestrator>,
    runtime: &Arc<SessionRuntime>,
    msg: Message,
    out_tx: &mpsc::Sender<Message>,
) -> Option<Message> {
    let id = &runtime.id;
    let result = match msg {
        Message::StdinData(text) => orch.send_input(id, SessionInput::Text(text)).await,
        Message::ControlCmd(cmd) => return control_command(orch, runtime, cmd).await,
        Message::StatusUpdate(update) => {
            debug!(session_id = %id, app = %update.app, status = %update.status, "status update");
            runtime.set_activity(ActivityStatus {
                is_active: true,
                specific_status: Some(SpecificStatus {
                    app: update.app,
                    status: update.status,
                }),
            });
            orch.refresh_title(runtime, true);
            Ok(())
        }
        Message::Heartbeat => return Some(Message::Heartbeat),
        Message::StatusRequest => {
            return Some(Message::StatusResponse(StatusResponse {
                running: !runtime.is_exited(),
                version: Some(orch.config().version.clone()),
                follow_mode: runtime.follow_mode(),
                ..Default::default()
            }));
        }
        Message::StdoutSubscribe => {
            runtime.subscribe(out_tx.clone());
            Ok(())
        }
        Message::GitFollowRequest(req) => return Some(git_follow(runtime, req)),
        Message::GitEventNotify(event) => {
            info!(session_id = %id, repo = %event.repo_path, kind = ?event.kind, "git event");
            orch.emit(OrchestratorEvent::GitEvent {
                session_id: id.clone(),
                repo_path: event.repo_path,
                kind: event.kind,
            });
            return Some(Message::GitEventAck(GitEventAck { handled: true }));
        }
        other => {
            return Some(Message::error(
                "UNSUPPORTED_MESSAGE",
                format!("{:?} is not accepted by a session owner", other.message_type()),
            ));
        }
    };
    result.err().map(|e| error_reply(&e))
}

async fn control_command(
    orch: &Arc<SessionOrchestrator>,
    runtime: &Arc<SessionRuntime>,
    cmd: ControlCommand,
) -> Option<Message> {
    let id = &runtime.id;
    let result = match cmd {
        ControlCommand::Resize { cols, rows } => orch.resize_session(id, cols, rows).await,
        ControlCommand::ResetSize => orch.reset_session_size(id).await,
        ControlCommand::UpdateTitle { title } => {
            orch.update_session_name(id, &title).await.map(|_| ())
        }
        ControlCommand::Kill { signal } => {
            let signal = match signal.as_ref().map(Signal::from_spec).transpose() {
                Ok(signal) => signal,
                Err(e) => return Some(error_reply(&e)),
            };
            // Escalation takes seconds; keep reading frames meanwhile.
            let orch = orch.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = orch.kill_session(&id, signal).await {
                    warn!(session_id = %id, error = %e, "kill over control socket failed");
                }
            });
            Ok(())
        }
    };
    result.err().map(|e| error_reply(&e))
}

fn git_follow(runtime: &SessionRuntime, req: GitFollowRequest) -> Message {
    let next = req.enable.then(|| FollowModeStatus {
        enabled: true,
        branch: req.branch.clone(),
        repo_path: req.repo_path.clone().or_else(|| req.main_repo_path.clone()),
    });
    let previous = runtime.set_follow_mode(next);
    info!(session_id = %runtime.id, enable = req.enable, branch = ?req.branch, "follow mode updated");
    Message::GitFollowResponse(GitFollowResponse {
        success: true,
        current_branch: if req.enable { req.branch } else { None },
        previous_branch: previous.and_then(|p| p.branch),
        error: None,
    })
}
