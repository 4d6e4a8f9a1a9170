//! Control-socket client.
//!
//! `ControlClient` owns one Unix-socket connection to a session's `ipc.sock`.
//! A connection task pumps outgoing frames and incoming messages, routes
//! responses to waiting requests, and reconnects with backoff when enabled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use termbroker_core::codec::MessageParser;
use termbroker_core::error::{BrokerError, BrokerResult, ErrorKind};
use termbroker_core::protocol::{Message, MessageType, SignalSpec};

/// Longest socket path most Unix platforms accept in `sun_path`.
pub const MAX_SOCKET_PATH_LEN: usize = 103;

type Waiters = Arc<Mutex<HashMap<u8, Vec<oneshot::Sender<Message>>>>>;

/// Connection behaviour.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Reconnect with exponential backoff after the socket drops.
    pub auto_reconnect: bool,
    /// Send HEARTBEAT frames at this interval (`None` = disabled).
    pub heartbeat_interval: Option<Duration>,
    /// First reconnect delay.
    pub reconnect_delay: Duration,
    /// Backoff cap.
    pub max_reconnect_delay: Duration,
    /// Deadline for a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            heartbeat_interval: None,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection lifecycle and inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Message(Message),
}

struct Shared {
    path: PathBuf,
    options: ClientOptions,
    connected: AtomicBool,
    closing: AtomicBool,
    waiters: Waiters,
    events: broadcast::Sender<ClientEvent>,
    last_heartbeat: std::sync::Mutex<Option<Instant>>,
}

pub struct ControlClient {
    shared: Arc<Shared>,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ControlClient {
    /// Connect to a control socket.
    pub async fn connect(path: impl AsRef<Path>, options: ClientOptions) -> BrokerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let path_len = path.as_os_str().len();
        if path_len > MAX_SOCKET_PATH_LEN {
            tracing::warn!(
                path = %path.display(),
                len = path_len,
                "control socket path exceeds the Unix socket limit of {} bytes",
                MAX_SOCKET_PATH_LEN
            );
        }

        let stream = connect_once(&path, options.connect_timeout).await?;
        tracing::debug!(path = %path.display(), "control client connected");

        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            path,
            options,
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            events,
            last_heartbeat: std::sync::Mutex::new(None),
        });

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Vec<u8>>(256);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(connection_loop(
            shared.clone(),
            stream,
            outgoing_rx,
        )));

        if let Some(interval) = shared.options.heartbeat_interval {
            let shared = shared.clone();
            let outgoing = outgoing_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = time::interval(interval);
                ticker.tick().await; // skip first immediate tick
                loop {
                    ticker.tick().await;
                    if shared.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    if !shared.connected.load(Ordering::SeqCst) {
                        continue;
                    }
                    match Message::Heartbeat.to_frame() {
                        Ok(frame) => {
                            if outgoing.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("failed to encode heartbeat: {}", e),
                    }
                }
                tracing::debug!("heartbeat loop ended");
            }));
        }

        let _ = shared.events.send(ClientEvent::Connected);

        Ok(Self {
            shared,
            outgoing_tx,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// When the last HEARTBEAT frame arrived from the peer.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.shared
            .last_heartbeat
            .lock()
            .map(|guard| *guard)
            .unwrap_or(None)
    }

    /// Subscribe to connection events and every inbound message.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Send a message without waiting for a reply.
    pub async fn send(&self, msg: Message) -> BrokerResult<()> {
        if !self.is_connected() {
            return Err(BrokerError::connection(format!(
                "not connected to {}",
                self.shared.path.display()
            )));
        }
        let frame = msg.to_frame()?;
        self.outgoing_tx
            .send(frame)
            .await
            .map_err(|_| BrokerError::connection("outgoing channel closed"))
    }

    pub async fn send_stdin(&self, text: impl Into<String>) -> BrokerResult<()> {
        self.send(Message::stdin(text)).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> BrokerResult<()> {
        self.send(Message::resize(cols, rows)).await
    }

    pub async fn kill(&self, signal: Option<SignalSpec>) -> BrokerResult<()> {
        self.send(Message::kill(signal)).await
    }

    pub async fn reset_size(&self) -> BrokerResult<()> {
        self.send(Message::reset_size()).await
    }

    pub async fn update_title(&self, title: impl Into<String>) -> BrokerResult<()> {
        self.send(Message::update_title(title)).await
    }

    pub async fn send_status(
        &self,
        app: impl Into<String>,
        status: impl Into<String>,
        extra: Option<Map<String, Value>>,
    ) -> BrokerResult<()> {
        self.send(Message::status(app, status, extra)).await
    }

    /// Ask the server to stream PTY output as STDOUT_DATA events.
    pub async fn subscribe_stdout(&self) -> BrokerResult<()> {
        self.send(Message::StdoutSubscribe).await
    }

    /// Send a message and wait for the first reply of `expected_type`.
    ///
    /// An ERROR frame received while waiting fails the request with a
    /// `Protocol` error carrying the remote code.
    pub async fn request(
        &self,
        msg: Message,
        expected_type: MessageType,
        timeout: Duration,
    ) -> BrokerResult<Message> {
        let (tx, rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        {
            let mut waiters = self.shared.waiters.lock().await;
            waiters.entry(expected_type.into()).or_default().push(tx);
            if expected_type != MessageType::Error {
                waiters
                    .entry(MessageType::Error.into())
                    .or_default()
                    .push(err_tx);
            }
        }

        let result = async move {
            self.send(msg).await?;
            tokio::select! {
                result = rx => {
                    result.map_err(|_| BrokerError::connection("connection closed while waiting for response"))
                }
                Ok(err) = err_rx => {
                    match err {
                        Message::Error(e) => Err(BrokerError::protocol(format!("remote error [{}]: {}", e.code, e.message))),
                        other => Ok(other),
                    }
                }
                _ = time::sleep(timeout) => {
                    Err(BrokerError::timeout(format!(
                        "no {expected_type:?} response within {}ms",
                        timeout.as_millis()
                    )))
                }
            }
        }
        .await;

        // Our receivers are gone now; drop whichever senders nobody fired.
        self.shared.waiters.lock().await.retain(|_, pending| {
            pending.retain(|tx| !tx.is_closed());
            !pending.is_empty()
        });
        result
    }

    #[cfg(test)]
    async fn pending_waiters(&self) -> usize {
        self.shared.waiters.lock().await.values().map(Vec::len).sum()
    }

    /// Stop all tasks and close the connection.
    pub async fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let was_connected = self.shared.connected.swap(false, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
        self.shared.waiters.lock().await.clear();
        if was_connected {
            let _ = self.shared.events.send(ClientEvent::Disconnected);
        }
        tracing::debug!(path = %self.shared.path.display(), "control client disconnected");
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

// ── Internal ─────────────────────────────────────────────────────────

async fn connect_once(path: &Path, timeout: Duration) -> BrokerResult<UnixStream> {
    match time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(BrokerError::connection(format!(
            "connect {}: {}",
            path.display(),
            e
        ))),
        Err(_) => Err(BrokerError::timeout(format!(
            "connect {} timed out",
            path.display()
        ))),
    }
}

enum PumpEnd {
    Disconnected,
    Closed,
}

async fn connection_loop(
    shared: Arc<Shared>,
    mut stream: UnixStream,
    mut outgoing_rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        let end = pump(&shared, stream, &mut outgoing_rx).await;

        shared.connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every pending request.
        shared.waiters.lock().await.clear();
        let _ = shared.events.send(ClientEvent::Disconnected);

        if matches!(end, PumpEnd::Closed)
            || !shared.options.auto_reconnect
            || shared.closing.load(Ordering::SeqCst)
        {
            break;
        }

        // Frames queued against the dead connection are stale.
        while outgoing_rx.try_recv().is_ok() {}

        match reconnect(&shared).await {
            Some(s) => {
                stream = s;
                shared.connected.store(true, Ordering::SeqCst);
                let _ = shared.events.send(ClientEvent::Connected);
            }
            None => break,
        }
    }
    tracing::debug!(path = %shared.path.display(), "connection loop ended");
}

async fn reconnect(shared: &Shared) -> Option<UnixStream> {
    let mut delay = shared.options.reconnect_delay;
    loop {
        time::sleep(delay).await;
        if shared.closing.load(Ordering::SeqCst) {
            return None;
        }
        match connect_once(&shared.path, shared.options.connect_timeout).await {
            Ok(stream) => {
                tracing::info!(path = %shared.path.display(), "control client reconnected");
                return Some(stream);
            }
            Err(e) => {
                tracing::debug!(path = %shared.path.display(), "reconnect failed: {}", e);
                delay = (delay * 2).min(shared.options.max_reconnect_delay);
            }
        }
    }
}

async fn pump(
    shared: &Shared,
    stream: UnixStream,
    outgoing_rx: &mut mpsc::Receiver<Vec<u8>>,
) -> PumpEnd {
    let (mut reader, mut writer) = stream.into_split();
    let mut parser = MessageParser::new();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            frame = outgoing_rx.recv() => {
                let Some(frame) = frame else {
                    return PumpEnd::Closed;
                };
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::warn!(path = %shared.path.display(), "control socket write failed: {}", e);
                    return PumpEnd::Disconnected;
                }
            }

            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => return PumpEnd::Disconnected,
                    Ok(n) => {
                        parser.add_data(&buf[..n]);
                        let messages: Vec<_> = parser.parse_messages().collect();
                        for result in messages {
                            match result {
                                Ok(msg) => handle_incoming(shared, msg).await,
                                Err(e) => tracing::warn!("failed to decode control message: {}", e),
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %shared.path.display(), "control socket read failed: {}", e);
                        return PumpEnd::Disconnected;
                    }
                }
            }
        }
    }
}

async fn handle_incoming(shared: &Shared, msg: Message) {
    match &msg {
        Message::Heartbeat => {
            if let Ok(mut last) = shared.last_heartbeat.lock() {
                *last = Some(Instant::now());
            }
        }
        Message::Error(err) => {
            tracing::debug!("server error [{}]: {}", err.code, err.message);
        }
        _ => {}
    }

    let tag: u8 = msg.message_type().into();
    {
        let mut waiters = shared.waiters.lock().await;
        if let Some(queue) = waiters.get_mut(&tag) {
            while !queue.is_empty() {
                let tx = queue.remove(0);
                if tx.send(msg.clone()).is_ok() {
                    break;
                }
            }
            if queue.is_empty() {
                waiters.remove(&tag);
            }
        }
    }

    let _ = shared.events.send(ClientEvent::Message(msg));
}

/// Convenience: is this error a refused/missing socket rather than a protocol issue?
pub fn is_unreachable(err: &BrokerError) -> bool {
    matches!(err.kind(), ErrorKind::Connection | ErrorKind::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use termbroker_core::protocol::{ControlCommand, StatusResponse};
    use tokio::net::UnixListener;

    /// Accept one connection and feed every decoded message to `tx`, replying
    /// to STATUS_REQUEST and echoing HEARTBEAT.
    fn serve_one(listener: UnixListener, tx: mpsc::UnboundedSender<Message>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut parser = MessageParser::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                parser.add_data(&buf[..n]);
                let msgs: Vec<_> = parser.parse_messages().collect();
                for msg in msgs {
                    let msg = msg.unwrap();
                    let reply = match &msg {
                        Message::StatusRequest => Some(Message::StatusResponse(StatusResponse {
                            running: true,
                            version: Some("test".into()),
                            ..Default::default()
                        })),
                        Message::Heartbeat => Some(Message::Heartbeat),
                        Message::ControlCmd(ControlCommand::UpdateTitle { .. }) => {
                            Some(Message::error("BAD", "nope"))
                        }
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        stream.write_all(&reply.to_frame().unwrap()).await.unwrap();
                    }
                    let _ = tx.send(msg);
                }
            }
        })
    }

    #[tokio::test]
    async fn finished_requests_leave_no_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        serve_one(listener, tx);

        let client = ControlClient::connect(&path, ClientOptions::default())
            .await
            .unwrap();
        let reply = client
            .request(Message::Heartbeat, MessageType::Heartbeat, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, Message::Heartbeat);
        assert_eq!(client.pending_waiters().await, 0);

        // The server never answers stdout frames.
        for _ in 0..3 {
            let err = client
                .request(
                    Message::StdoutData(b"x".to_vec()),
                    MessageType::StatusResponse,
                    Duration::from_millis(100),
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);
        }
        assert_eq!(client.pending_waiters().await, 0);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn sends_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        serve_one(listener, tx);

        let client = ControlClient::connect(&path, ClientOptions::default())
            .await
            .unwrap();
        client.send_stdin("echo hi\n").await.unwrap();
        client.resize(100, 30).await.unwrap();
        client.kill(None).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Message::stdin("echo hi\n"));
        assert_eq!(rx.recv().await.unwrap(), Message::resize(100, 30));
        assert_eq!(rx.recv().await.unwrap(), Message::kill(None));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn request_routes_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        serve_one(listener, tx);

        let client = ControlClient::connect(&path, ClientOptions::default())
            .await
            .unwrap();
        let resp = client
            .request(
                Message::StatusRequest,
                MessageType::StatusResponse,
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        match resp {
            Message::StatusResponse(s) => assert!(s.running),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_surfaces_remote_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        serve_one(listener, tx);

        let client = ControlClient::connect(&path, ClientOptions::default())
            .await
            .unwrap();
        let err = client
            .request(
                Message::update_title("x"),
                MessageType::StatusResponse,
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.message().contains("BAD"));
    }

    #[tokio::test]
    async fn request_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        serve_one(listener, tx);

        let client = ControlClient::connect(&path, ClientOptions::default())
            .await
            .unwrap();
        let err = client
            .request(
                Message::reset_size(),
                MessageType::GitEventAck,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn heartbeat_is_sent_and_echo_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        serve_one(listener, tx);

        let client = ControlClient::connect(
            &path,
            ClientOptions {
                heartbeat_interval: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::Heartbeat);
        let deadline = Instant::now() + Duration::from_secs(2);
        while client.last_heartbeat().is_none() && Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.last_heartbeat().is_some());
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ControlClient::connect(dir.path().join("nope.sock"), ClientOptions::default())
            .await
            .err()
            .unwrap();
        assert!(is_unreachable(&err));
    }

    #[tokio::test]
    async fn disconnect_reported_and_send_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = go_rx.await;
            drop(stream);
        });

        let client = ControlClient::connect(&path, ClientOptions::default())
            .await
            .unwrap();
        let mut events = client.events();
        go_tx.send(()).unwrap();
        server.await.unwrap();

        let ev = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev, ClientEvent::Disconnected);
        assert!(!client.is_connected());
        let err = client.send_stdin("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn reconnects_after_server_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let first = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = go_rx.await;
            drop(stream);
            drop(listener);
        });

        let client = ControlClient::connect(
            &path,
            ClientOptions {
                auto_reconnect: true,
                reconnect_delay: Duration::from_millis(50),
                max_reconnect_delay: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let mut events = client.events();
        go_tx.send(()).unwrap();
        first.await.unwrap();

        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        serve_one(listener, tx);

        loop {
            let ev = time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if ev == ClientEvent::Connected {
                break;
            }
        }
        client.send_stdin("again").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::stdin("again"));
        client.disconnect().await;
    }
}
