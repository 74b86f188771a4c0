//! Cloneable handle onto a running stream session.
//!
//! [`StreamClient::spawn`] moves a websocket-backed [`StreamSession`] onto a
//! background task and returns a handle. Handle operations never block: they
//! queue a command for the session task and return immediately. Connection
//! status and the subscription set are answered synchronously from state
//! shared with the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexSet;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::stream::config::{ConfigError, StreamConfig};
use crate::stream::observers::Observer;
use crate::stream::proto::ClientMessage;
use crate::stream::session::{now_ms, Command, SessionEvent, StreamSession};
use crate::stream::transport::TransportError;

/// State visible to both the session task and its handles.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    connected: AtomicBool,
    subscriptions: RwLock<IndexSet<String>>,
}

impl SharedState {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) fn insert_subscription(&self, channel: String) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel);
    }

    pub(crate) fn remove_subscription(&self, channel: &str) {
        // shift_remove keeps the remaining replay order intact.
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(channel);
    }
}

/// Cloneable handle for a stream session.
#[derive(Clone, Debug)]
pub struct StreamClient {
    tx: mpsc::UnboundedSender<SessionEvent>,
    shared: Arc<SharedState>,
}

impl StreamClient {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>, shared: Arc<SharedState>) -> Self {
        Self { tx, shared }
    }

    /// Spawns a websocket session for `config` on the current runtime.
    ///
    /// The session is idle until [`connect`](Self::connect) is called. The
    /// returned task finishes once the session is closed for good.
    pub fn spawn(config: StreamConfig) -> Result<(Self, JoinHandle<()>), ConfigError> {
        let session = StreamSession::new(config)?;
        let client = session.client();
        let task = tokio::spawn(session.run());
        Ok((client, task))
    }

    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    pub fn close(&self) {
        self.command(Command::Close);
    }

    /// Adds `channel` to the subscription set and subscribes now if open.
    pub fn subscribe(&self, channel: impl Into<String>) {
        let channel = channel.into();
        self.shared.insert_subscription(channel.clone());
        self.command(Command::Subscribe(channel));
    }

    pub fn unsubscribe(&self, channel: &str) {
        self.shared.remove_subscription(channel);
        self.command(Command::Unsubscribe(channel.to_string()));
    }

    /// Sends a one-shot query. `id` defaults to the current timestamp in ms.
    pub fn request(&self, channel: impl Into<String>, id: Option<String>) {
        let id = id.unwrap_or_else(|| now_ms().to_string());
        self.command(Command::Send(ClientMessage::request(channel, id)));
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Returns the subscription set in replay order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions()
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.command(Command::Register(Observer::Message(Box::new(handler))));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: FnMut(&TransportError) + Send + 'static,
    {
        self.command(Command::Register(Observer::Error(Box::new(handler))));
    }

    pub fn on_open<F>(&self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.command(Command::Register(Observer::Open(Box::new(handler))));
    }

    pub fn on_close<F>(&self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.command(Command::Register(Observer::Close(Box::new(handler))));
    }

    fn command(&self, command: Command) {
        if self.tx.send(SessionEvent::Command(command)).is_err() {
            debug!(event = "stream_command_dropped", reason = "session finished");
        }
    }
}
