//! Websocket transport primitives.
//!
//! A [`Transport`] owns at most one live connection. Opening is asynchronous:
//! outcomes are reported through the [`TransportEvents`] sink handed to
//! [`Transport::open`], tagged with the generation of the attempt that
//! produced them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::stream::session::SessionEvent;

/// Identifies one connection attempt.
pub type Generation = u64;

const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ABNORMAL_CLOSE_CODE: u16 = 1006;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Error reported by the underlying connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket protocol or I/O error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Error raised by a non-websocket transport.
    #[error("transport error: {0}")]
    Other(String),
}

/// Close code and reason of a finished connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code, or `None` when the peer sent an empty close frame.
    pub code: Option<u16>,
    /// Close reason text; empty when none was given.
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    /// Connection dropped without a close handshake.
    pub fn abnormal() -> Self {
        Self::new(ABNORMAL_CLOSE_CODE, "")
    }

    fn from_frame(frame: Option<CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self::new(u16::from(frame.code), frame.reason.into_owned()),
            None => Self {
                code: None,
                reason: String::new(),
            },
        }
    }
}

/// Event raised by a transport connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// Handshake completed; the connection accepts sends.
    Opened,
    /// One inbound frame, text or binary, as raw bytes.
    Frame(Vec<u8>),
    /// Connection or socket failure. A `Closed` event follows.
    Errored(TransportError),
    /// The connection ended. Raised once per connection.
    Closed(CloseInfo),
}

/// Sink through which a transport reports events for one connection attempt.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    generation: Generation,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl TransportEvents {
    pub(crate) fn new(generation: Generation, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn opened(&self) {
        self.emit(TransportEvent::Opened);
    }

    pub fn frame(&self, bytes: Vec<u8>) {
        self.emit(TransportEvent::Frame(bytes));
    }

    pub fn errored(&self, error: TransportError) {
        self.emit(TransportEvent::Errored(error));
    }

    pub fn closed(&self, info: CloseInfo) {
        self.emit(TransportEvent::Closed(info));
    }

    fn emit(&self, event: TransportEvent) {
        // The session may already be gone; late events are meaningless then.
        let _ = self.tx.send(SessionEvent::Transport {
            generation: self.generation,
            event,
        });
    }
}

/// Raw bidirectional connection primitive driven by the session.
pub trait Transport: Send {
    /// Starts a new connection attempt, replacing any previous connection.
    fn open(&mut self, endpoint: &str, events: TransportEvents);

    /// Queues a text frame. Silently dropped unless connected.
    fn send(&mut self, text: String);

    /// Starts a graceful shutdown. Idempotent.
    fn close(&mut self);

    fn is_connected(&self) -> bool;
}

enum SocketCommand {
    Send(String),
    Close,
}

/// [`Transport`] backed by `tokio-tungstenite`.
///
/// Each [`open`](Transport::open) spawns a worker task that owns the socket.
/// A connected worker emits exactly one `Closed` event when it ends; an
/// attempt cancelled by [`close`](Transport::close) before the handshake
/// completes ends silently.
#[derive(Debug, Default)]
pub struct WsTransport {
    connected: Arc<AtomicBool>,
    commands: Option<mpsc::UnboundedSender<SocketCommand>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for WsTransport {
    fn open(&mut self, endpoint: &str, events: TransportEvents) {
        self.close();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        self.connected = Arc::clone(&connected);
        self.commands = Some(commands_tx);

        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            socket_worker(endpoint, commands_rx, events, connected).await;
        });
    }

    fn send(&mut self, text: String) {
        if !self.is_connected() {
            return;
        }
        if let Some(commands) = &self.commands {
            let _ = commands.send(SocketCommand::Send(text));
        }
    }

    fn close(&mut self) {
        self.connected.store(false, Ordering::Release);
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(SocketCommand::Close);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

async fn socket_worker(
    endpoint: String,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: TransportEvents,
    connected: Arc<AtomicBool>,
) {
    let mut socket = tokio::select! {
        result = connect_async(endpoint.as_str()) => match result {
            Ok((socket, _)) => socket,
            Err(err) => {
                events.errored(TransportError::WebSocket(err));
                events.closed(CloseInfo::abnormal());
                return;
            }
        },
        _ = wait_for_close(&mut commands) => {
            debug!(event = "ws_connect_cancelled", generation = events.generation());
            return;
        }
    };

    connected.store(true, Ordering::Release);
    events.opened();

    let info = run_socket(&mut socket, &mut commands, &events).await;

    connected.store(false, Ordering::Release);
    events.closed(info);
}

async fn run_socket(
    socket: &mut Socket,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    events: &TransportEvents,
) -> CloseInfo {
    let mut close_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            command = commands.recv(), if close_deadline.is_none() => match command {
                Some(SocketCommand::Send(text)) => {
                    if let Err(err) = socket.send(Message::Text(text)).await {
                        events.errored(err.into());
                        return CloseInfo::abnormal();
                    }
                }
                Some(SocketCommand::Close) | None => {
                    if let Err(err) = socket.close(None).await {
                        debug!(event = "ws_close_send_failed", error = %err);
                        return CloseInfo::abnormal();
                    }
                    close_deadline = Some(Instant::now() + CLOSE_HANDSHAKE_TIMEOUT);
                }
            },
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Text(text))) => events.frame(text.into_bytes()),
                Some(Ok(Message::Binary(bytes))) => events.frame(bytes),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    // Flushes the queued close reply.
                    let _ = socket.close(None).await;
                    return CloseInfo::from_frame(frame);
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | None => return CloseInfo::abnormal(),
                Some(Err(err)) => {
                    events.errored(err.into());
                    return CloseInfo::abnormal();
                }
            },
            _ = sleep_until_deadline(close_deadline) => {
                debug!(event = "ws_close_handshake_timeout");
                return CloseInfo::abnormal();
            }
        }
    }
}

async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<SocketCommand>) {
    // Sends are gated on `connected`, so only close requests arrive here.
    while let Some(command) = commands.recv().await {
        if matches!(command, SocketCommand::Close) {
            return;
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
