//! termbrokerd: host terminal sessions and drive them from the command line.
//!
//! `run` owns a session for its whole life; the other subcommands talk to
//! whichever process owns a session through its control socket, or read the
//! control directory directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use termbroker_client::{ClientOptions, ControlClient};
use termbroker_core::{BrokerError, BrokerResult, Message, MessageType, SessionId, SignalSpec};
use termbroker_server::config::BrokerConfig;
use termbroker_server::process::SystemProcessOps;
use termbroker_server::session::{
    OrchestratorEvent, SessionOptions, SessionOrchestrator, SessionStore, SpecialKey, TitleMode,
};
use tracing::{error, info, warn};

/// termbrokerd: terminal session broker
#[derive(Parser, Debug)]
#[command(name = "termbrokerd", version, about = "Terminal session broker")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "~/.termbroker/config.toml")]
    config: String,

    /// Control directory (overrides the config file)
    #[arg(long, global = true)]
    control_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session and host it until it exits
    Run {
        /// Session name (defaults to "command (dir)")
        #[arg(long)]
        name: Option<String>,

        /// Session id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,

        #[arg(long)]
        cols: Option<u16>,

        #[arg(long)]
        rows: Option<u16>,

        /// Title handling: none, filter, static, dynamic
        #[arg(long)]
        title_mode: Option<TitleMode>,

        /// Command to run (the login shell when empty)
        #[arg(trailing_var_arg = true)]
        cmd: Vec<String>,
    },

    /// List sessions in the control directory
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Send text or a named key to a session
    Send {
        session: String,

        /// Text to type
        text: Option<String>,

        /// Named key (enter, tab, escape, arrow_up, ...)
        #[arg(long, conflicts_with = "text")]
        key: Option<String>,
    },

    /// Resize a session's terminal
    Resize {
        session: String,
        cols: u16,
        rows: u16,
    },

    /// Rename a session
    Rename { session: String, name: String },

    /// Signal a session (SIGTERM, escalating to SIGKILL)
    Kill {
        session: String,

        /// Signal name or number
        #[arg(long)]
        signal: Option<String>,
    },

    /// Ask a session's owner for its status
    Status { session: String },

    /// Remove exited sessions from the control directory
    Cleanup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match BrokerConfig::load(Some(&config_path), cli.control_dir.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Run {
            name,
            id,
            cwd,
            cols,
            rows,
            title_mode,
            cmd,
        } => {
            let options = SessionOptions {
                session_id: id.as_deref().map(SessionId::parse).transpose().unwrap_or_else(|e| {
                    error!(error = %e, "invalid session id");
                    std::process::exit(2);
                }),
                name,
                working_dir: cwd,
                cols,
                rows,
                title_mode,
                ..Default::default()
            };
            run(config, cmd, options).await
        }
        Command::List { json } => list(config, json).await,
        Command::Send { session, text, key } => send(config, &session, text, key).await,
        Command::Resize {
            session,
            cols,
            rows,
        } => with_client(&config, &session, |c| async move { c.resize(cols, rows).await }).await,
        Command::Rename { session, name } => {
            with_client(&config, &session, |c| async move { c.update_title(name).await }).await
        }
        Command::Kill { session, signal } => {
            let spec = signal.map(|s| match s.parse::<i32>() {
                Ok(n) => SignalSpec::Number(n),
                Err(_) => SignalSpec::Name(s),
            });
            with_client(&config, &session, |c| async move { c.kill(spec).await }).await
        }
        Command::Status { session } => status(&config, &session).await,
        Command::Cleanup => cleanup(config).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, code = e.code(), "command failed");
            std::process::exit(1);
        }
    }
}

/// Host one session; the process exit code mirrors the session's.
async fn run(config: BrokerConfig, cmd: Vec<String>, options: SessionOptions) -> BrokerResult<i32> {
    let zombie_interval = config.zombie_interval;
    let orchestrator = SessionOrchestrator::new(config, Arc::new(SystemProcessOps));
    let mut events = orchestrator.subscribe_events();

    let session = orchestrator.create_session(cmd, options).await?;
    orchestrator.spawn_maintenance(zombie_interval);
    info!(
        session_id = %session.id,
        name = %session.name,
        pid = ?session.pid,
        version = env!("CARGO_PKG_VERSION"),
        "hosting session"
    );
    println!("{}", session.id);

    let exit_code = tokio::select! {
        code = wait_for_exit(&mut events, &session.id) => code,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            None
        }
    };

    orchestrator.shutdown().await;
    info!(session_id = %session.id, ?exit_code, "termbrokerd stopped");
    Ok(exit_code.unwrap_or(0))
}

async fn wait_for_exit(
    events: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
    id: &SessionId,
) -> Option<i32> {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(OrchestratorEvent::SessionExited {
                session_id,
                exit_code,
            }) if &session_id == id => return exit_code,
            Ok(OrchestratorEvent::Bell { .. }) => {}
            Ok(event) => tracing::debug!(?event, "session event"),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn list(config: BrokerConfig, json: bool) -> BrokerResult<i32> {
    let orchestrator = SessionOrchestrator::new(config, Arc::new(SystemProcessOps));
    orchestrator.initialize().await?;
    let sessions = orchestrator.list_sessions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(0);
    }
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(0);
    }
    println!("{:<24} {:<8} {:>7} {:>9}  NAME", "ID", "STATUS", "PID", "SIZE");
    for s in &sessions {
        let status = match (s.info.status, s.info.exit_code) {
            (termbroker_server::session::SessionStatus::Exited, Some(code)) => {
                format!("exit {code}")
            }
            (status, _) => format!("{status:?}").to_lowercase(),
        };
        println!(
            "{:<24} {:<8} {:>7} {:>9}  {}",
            s.info.id.as_str(),
            status,
            s.info.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            format!("{}x{}", s.info.cols, s.info.rows),
            s.info.name
        );
    }
    Ok(0)
}

async fn send(
    config: BrokerConfig,
    session: &str,
    text: Option<String>,
    key: Option<String>,
) -> BrokerResult<i32> {
    let payload = match (text, key) {
        (_, Some(key)) => key.parse::<SpecialKey>()?.sequence().to_string(),
        (Some(text), None) => text,
        (None, None) => return Err(BrokerError::validation("nothing to send: give text or --key")),
    };
    with_client(&config, session, |c| async move { c.send_stdin(payload).await }).await
}

async fn status(config: &BrokerConfig, session: &str) -> BrokerResult<i32> {
    let client = connect(config, session).await?;
    let reply = client
        .request(
            Message::StatusRequest,
            MessageType::StatusResponse,
            Duration::from_secs(5),
        )
        .await;
    client.disconnect().await;
    match reply? {
        Message::StatusResponse(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(if status.running { 0 } else { 1 })
        }
        other => Err(BrokerError::protocol(format!(
            "unexpected reply {:?}",
            other.message_type()
        ))),
    }
}

async fn cleanup(config: BrokerConfig) -> BrokerResult<i32> {
    let orchestrator = SessionOrchestrator::new(config, Arc::new(SystemProcessOps));
    orchestrator.initialize().await?;
    let removed = orchestrator.cleanup_exited_sessions().await?;
    for id in &removed {
        println!("removed {id}");
    }
    Ok(0)
}

async fn connect(config: &BrokerConfig, session: &str) -> BrokerResult<ControlClient> {
    let id = SessionId::parse(session)?;
    let socket = SessionStore::new(&config.control_dir).paths(&id).socket;
    ControlClient::connect(&socket, ClientOptions::default())
        .await
        .map_err(|e| e.with_session(id.as_str()))
}

/// Connect, run one fire-and-forget operation, then give the frame a moment
/// to leave before disconnecting.
async fn with_client<F, Fut>(config: &BrokerConfig, session: &str, op: F) -> BrokerResult<i32>
where
    F: FnOnce(Arc<ControlClient>) -> Fut,
    Fut: std::future::Future<Output = BrokerResult<()>>,
{
    let client = Arc::new(connect(config, session).await?);
    let result = op(client.clone()).await;
    // Round-trip a heartbeat so the frame is handled before we hang up.
    if result.is_ok() {
        let _ = client
            .request(Message::Heartbeat, MessageType::Heartbeat, Duration::from_secs(2))
            .await;
    }
    client.disconnect().await;
    result.map(|()| 0)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            ctrl_c.await.ok();
        }
    }
}
