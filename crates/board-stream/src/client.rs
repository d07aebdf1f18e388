use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::connector::{Connector, SocketChannel};
use crate::frame::{Frame, FrameKind};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("stream setup failed: {0}")]
    Setup(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream is not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request {0} timed out")]
    Timeout(u64),
    #[error("remote error: {0}")]
    Remote(Value),
    #[error("stream client stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    SocketOpen,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The liveness ping resolved; RPC routing works.
    Connected,
    /// A fire-and-forget event pushed by the server.
    Notify(Value),
    /// The socket went away. Pending requests have been rejected.
    Closed,
}

pub type StreamEvents = mpsc::UnboundedReceiver<StreamEvent>;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Credential attached to every call.
    pub token: String,
    pub rpc_timeout: Duration,
    /// Bound on each connection step: handshake, socket open and the
    /// server's connect frame.
    pub connect_timeout: Duration,
    pub backoff: Backoff,
}

impl StreamConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: Backoff::default(),
        }
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Serialize)]
struct CallPayload<'a> {
    #[serde(rename = "sFxn")]
    function: &'a str,
    #[serde(rename = "rgarg")]
    args: &'a [Value],
    reqid: u64,
    token: &'a str,
}

enum Command {
    Call {
        function: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value, StreamError>>,
    },
    Disconnect,
}

/// Handle to one push-transport connection.
///
/// The connection itself, including the pending request table, lives in a
/// single task spawned by [`StreamClient::connect`]; the handle only sends
/// commands to it.
#[derive(Clone)]
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    idle: Arc<Mutex<Option<Driver>>>,
}

impl StreamClient {
    pub fn new(config: StreamConfig, connector: Arc<dyn Connector>) -> (Self, StreamEvents) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let driver = Driver {
            connector,
            config,
            commands: commands_rx,
            events: events_tx,
            state: state_tx,
            next_reqid: 0,
            pending: HashMap::new(),
            awaiting_connect: false,
        };
        let client = Self {
            commands: commands_tx,
            state: state_rx,
            idle: Arc::new(Mutex::new(Some(driver))),
        };
        (client, events_rx)
    }

    /// Starts the connection task. Returns `false` if it was already started.
    pub fn connect(&self) -> bool {
        match self.idle.lock().take() {
            Some(driver) => {
                tokio::spawn(driver.run());
                true
            }
            None => false,
        }
    }

    /// Issues an RPC and waits for the response with the same request id.
    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, StreamError> {
        if self.idle.lock().is_some() {
            return Err(StreamError::NotConnected);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Call {
                function: function.to_string(),
                args,
                reply,
            })
            .map_err(|_| StreamError::Stopped)?;
        response.await.map_err(|_| StreamError::ConnectionClosed)?
    }

    pub async fn ping(&self) -> Result<Value, StreamError> {
        self.call("ping", Vec::new()).await
    }

    pub async fn subscribe(&self, board_id: &str) -> Result<Value, StreamError> {
        self.call(
            "subscribeToBoard",
            vec![Value::String(board_id.to_string()), Value::Array(Vec::new())],
        )
        .await
    }

    /// Closes the socket and stops reconnecting. Pending calls are rejected.
    pub fn disconnect(&self) {
        if self.idle.lock().take().is_some() {
            return;
        }
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

enum Reply {
    Caller(oneshot::Sender<Result<Value, StreamError>>),
    /// The internal ping issued after the server's connect frame.
    Liveness,
}

struct Pending {
    reply: Reply,
    deadline: Instant,
}

enum SessionEnd {
    /// Disconnect requested or every handle dropped.
    Stopped { socket_opened: bool },
    Lost,
    Failed(StreamError),
}

enum Flow {
    Continue,
    Close,
}

struct Driver {
    connector: Arc<dyn Connector>,
    config: StreamConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<StreamEvent>,
    state: watch::Sender<ConnectionState>,
    next_reqid: u64,
    pending: HashMap<u64, Pending>,
    /// Set while the open socket has not yet delivered its connect frame.
    awaiting_connect: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut backoff = self.config.backoff.clone();
        loop {
            let end = self.run_session(&mut backoff).await;
            self.set_state(ConnectionState::Disconnected);
            self.fail_pending(StreamError::ConnectionClosed);

            match end {
                SessionEnd::Stopped { socket_opened } => {
                    if socket_opened {
                        self.emit(StreamEvent::Closed);
                    }
                    info!(target = "stream", "stream client disconnected");
                    break;
                }
                SessionEnd::Lost => {
                    self.emit(StreamEvent::Closed);
                }
                SessionEnd::Failed(err) => {
                    warn!(target = "stream", error = %err, "stream connection attempt failed");
                }
            }

            let delay = backoff.next_delay();
            info!(
                target = "stream",
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting after delay"
            );
            if !self.idle_for(delay).await {
                info!(target = "stream", "stream client disconnected");
                break;
            }
        }
    }

    async fn run_session(&mut self, backoff: &mut Backoff) -> SessionEnd {
        self.set_state(ConnectionState::Handshaking);
        let connector = Arc::clone(&self.connector);
        let limit = self.config.connect_timeout;
        let handshake = tokio::time::timeout(limit, connector.handshake());
        let session_id = match self.until_stopped(handshake).await {
            None => return SessionEnd::Stopped { socket_opened: false },
            Some(Err(_)) => {
                return SessionEnd::Failed(StreamError::Handshake(format!(
                    "no response within {limit:?}"
                )));
            }
            Some(Ok(Err(err))) => return SessionEnd::Failed(err),
            Some(Ok(Ok(id))) => id,
        };
        debug!(target = "stream", session_id = %session_id, "handshake complete");

        let open = tokio::time::timeout(limit, connector.open(&session_id));
        let mut socket = match self.until_stopped(open).await {
            None => return SessionEnd::Stopped { socket_opened: false },
            Some(Err(_)) => {
                return SessionEnd::Failed(StreamError::Transport(format!(
                    "socket did not open within {limit:?}"
                )));
            }
            Some(Ok(Err(err))) => return SessionEnd::Failed(err),
            Some(Ok(Ok(socket))) => socket,
        };
        self.set_state(ConnectionState::SocketOpen);
        self.awaiting_connect = true;
        let connect_deadline = Instant::now() + limit;

        let mut sweep = tokio::time::interval(
            self.config
                .rpc_timeout
                .clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL),
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let awaiting_connect = self.awaiting_connect;
            tokio::select! {
                line = socket.incoming.recv() => match line {
                    Some(line) => {
                        if let Flow::Close = self.handle_line(&socket, &line, backoff) {
                            return SessionEnd::Lost;
                        }
                    }
                    None => {
                        debug!(target = "stream", "socket closed by remote");
                        return SessionEnd::Lost;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Call { function, args, reply }) => {
                        self.issue(&socket, &function, &args, Reply::Caller(reply));
                    }
                    Some(Command::Disconnect) | None => {
                        return SessionEnd::Stopped { socket_opened: true };
                    }
                },
                _ = sweep.tick() => {
                    if let Flow::Close = self.expire_pending() {
                        return SessionEnd::Lost;
                    }
                }
                _ = tokio::time::sleep_until(connect_deadline), if awaiting_connect => {
                    self.awaiting_connect = false;
                    return SessionEnd::Failed(StreamError::Transport(format!(
                        "no connect frame within {limit:?}"
                    )));
                }
            }
        }
    }

    /// Drives `fut` while answering commands; calls are rejected because no
    /// socket is open yet. Returns `None` when a disconnect is requested.
    async fn until_stopped<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                command = self.commands.recv() => match command {
                    Some(Command::Call { reply, .. }) => {
                        let _ = reply.send(Err(StreamError::NotConnected));
                    }
                    Some(Command::Disconnect) | None => return None,
                },
            }
        }
    }

    async fn idle_for(&mut self, delay: Duration) -> bool {
        self.until_stopped(tokio::time::sleep(delay)).await.is_some()
    }

    fn handle_line(&mut self, socket: &SocketChannel, line: &str, backoff: &mut Backoff) -> Flow {
        trace!(target = "stream", direction = "in", frame = %line);
        let frame = match Frame::parse(line) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target = "stream", error = %err, "discarding undecodable frame");
                return Flow::Continue;
            }
        };

        match frame.kind {
            FrameKind::Connect => {
                if self.awaiting_connect {
                    self.awaiting_connect = false;
                    self.issue(socket, "ping", &[], Reply::Liveness);
                } else {
                    debug!(target = "stream", "ignoring repeated connect frame");
                }
                Flow::Continue
            }
            FrameKind::Heartbeat => {
                self.send(socket, &Frame::heartbeat());
                Flow::Continue
            }
            FrameKind::Json => match frame.payload {
                Some(payload) => self.handle_json(payload, backoff),
                None => {
                    warn!(target = "stream", "json frame without payload");
                    Flow::Continue
                }
            },
            FrameKind::Disconnect => {
                info!(target = "stream", "server requested disconnect");
                Flow::Close
            }
            FrameKind::Error => {
                warn!(target = "stream", endpoint = ?frame.endpoint, payload = ?frame.payload, "server reported error");
                Flow::Continue
            }
            other => {
                debug!(target = "stream", kind = ?other, "ignoring frame");
                Flow::Continue
            }
        }
    }

    fn handle_json(&mut self, payload: Value, backoff: &mut Backoff) -> Flow {
        let Value::Object(mut fields) = payload else {
            warn!(target = "stream", "json frame payload is not an object");
            return Flow::Continue;
        };

        if let Some(notify) = fields.remove("notify") {
            self.emit(StreamEvent::Notify(notify));
            return Flow::Continue;
        }

        let Some(reqid) = fields.get("reqid").and_then(Value::as_u64) else {
            debug!(target = "stream", "json frame without notify or reqid");
            return Flow::Continue;
        };
        let Some(pending) = self.pending.remove(&reqid) else {
            debug!(target = "stream", reqid, "response for unknown request");
            return Flow::Continue;
        };

        let outcome = match fields.remove("error") {
            Some(error) if !error.is_null() => Err(StreamError::Remote(error)),
            _ => Ok(fields.remove("result").unwrap_or(Value::Null)),
        };

        match pending.reply {
            Reply::Caller(reply) => {
                let _ = reply.send(outcome);
                Flow::Continue
            }
            Reply::Liveness => match outcome {
                Ok(_) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Ready);
                    info!(target = "stream", "stream connected");
                    self.emit(StreamEvent::Connected);
                    Flow::Continue
                }
                Err(err) => {
                    warn!(target = "stream", error = %err, "liveness ping failed");
                    Flow::Close
                }
            },
        }
    }

    fn issue(&mut self, socket: &SocketChannel, function: &str, args: &[Value], reply: Reply) {
        let reqid = self.next_reqid;
        self.next_reqid += 1;

        let payload = CallPayload {
            function,
            args,
            reqid,
            token: &self.config.token,
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(err) => {
                if let Reply::Caller(reply) = reply {
                    let _ = reply.send(Err(StreamError::Setup(err.to_string())));
                }
                return;
            }
        };

        if !self.send(socket, &Frame::call(payload)) {
            if let Reply::Caller(reply) = reply {
                let _ = reply.send(Err(StreamError::ConnectionClosed));
            }
            return;
        }
        debug!(target = "stream", reqid, function, "issued call");
        self.pending.insert(
            reqid,
            Pending {
                reply,
                deadline: Instant::now() + self.config.rpc_timeout,
            },
        );
    }

    fn send(&self, socket: &SocketChannel, frame: &Frame) -> bool {
        let text = frame.encode();
        trace!(target = "stream", direction = "out", frame = %text);
        socket.outgoing.send(text).is_ok()
    }

    fn expire_pending(&mut self) -> Flow {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(reqid, _)| *reqid)
            .collect();

        let mut flow = Flow::Continue;
        for reqid in expired {
            let Some(pending) = self.pending.remove(&reqid) else {
                continue;
            };
            warn!(target = "stream", reqid, "request timed out");
            match pending.reply {
                Reply::Caller(reply) => {
                    let _ = reply.send(Err(StreamError::Timeout(reqid)));
                }
                Reply::Liveness => flow = Flow::Close,
            }
        }
        flow
    }

    fn fail_pending(&mut self, error: StreamError) {
        for (reqid, pending) in self.pending.drain() {
            debug!(target = "stream", reqid, "rejecting pending request");
            if let Reply::Caller(reply) = pending.reply {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_payload_uses_wire_names() {
        let args = vec![json!("board-1"), json!([])];
        let payload = CallPayload {
            function: "subscribeToBoard",
            args: &args,
            reqid: 3,
            token: "secret",
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({
                "sFxn": "subscribeToBoard",
                "rgarg": ["board-1", []],
                "reqid": 3,
                "token": "secret",
            })
        );
    }

    #[test]
    fn config_defaults() {
        let config = StreamConfig::new("tok");
        assert_eq!(config.token, "tok");
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
    }
}
