//! Stateful streaming session.
//!
//! `StreamSession` owns one logical connection: it reopens the transport after
//! unexpected closes, runs the heartbeat, answers remote probes, and replays
//! the subscription set onto every new connection. All transport events,
//! timer ticks, and handle commands are funneled through a single queue and
//! applied one at a time, so no session state is mutated concurrently.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::retry::ReconnectPolicy;
use crate::stream::client::{SharedState, StreamClient};
use crate::stream::codec::decode_frame;
use crate::stream::config::{ConfigError, StreamConfig};
use crate::stream::observers::{Observer, Observers};
use crate::stream::proto::{ClientMessage, InboundMessage};
use crate::stream::transport::{
    CloseInfo, Generation, Transport, TransportError, TransportEvent, TransportEvents,
    WsTransport,
};

/// How long [`StreamSession::run`] waits for the final close event after a
/// user-initiated close.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Never connected.
    Idle,
    /// Waiting for the transport handshake.
    Connecting,
    /// Connected; heartbeat running and subscriptions replayed.
    Open,
    /// Closed unexpectedly; a reconnect is scheduled.
    Reconnecting,
    /// Closed by the user, or by the remote with reconnect disabled.
    Closed,
}

/// Operation queued by a [`StreamClient`] handle.
#[derive(Debug)]
pub enum Command {
    /// Start connecting unless already connecting or open.
    Connect,
    /// Close for good; no reconnect follows.
    Close,
    /// Send a subscribe unless the channel went out in the latest replay.
    /// The handle has already added it to the subscription set.
    Subscribe(String),
    /// Send an unsubscribe. The handle has already removed the channel.
    Unsubscribe(String),
    /// Send a one-shot envelope as is.
    Send(ClientMessage),
    /// Append an observer to its list.
    Register(Observer),
}

/// Unit of work applied by [`StreamSession::handle`].
#[derive(Debug)]
pub enum SessionEvent {
    Transport {
        generation: Generation,
        event: TransportEvent,
    },
    HeartbeatTick {
        generation: Generation,
    },
    ReconnectDue {
        generation: Generation,
    },
    Command(Command),
}

/// Reconnecting, heartbeating session over a [`Transport`].
#[derive(Debug)]
pub struct StreamSession<T = WsTransport> {
    config: StreamConfig,
    policy: ReconnectPolicy,
    transport: T,
    state: SessionState,
    closed_by_user: bool,
    awaiting_close: bool,
    generation: Generation,
    reconnect_attempt: usize,
    shared: Arc<SharedState>,
    replayed: HashSet<String>,
    observers: Observers,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl StreamSession<WsTransport> {
    /// Creates a session over a websocket transport.
    pub fn new(config: StreamConfig) -> Result<Self, ConfigError> {
        Self::with_transport(config, WsTransport::new())
    }
}

impl<T: Transport> StreamSession<T> {
    /// Creates a session over an explicit transport.
    pub fn with_transport(config: StreamConfig, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            policy: config.reconnect_policy(),
            config,
            transport,
            state: SessionState::Idle,
            closed_by_user: false,
            awaiting_close: false,
            generation: 0,
            reconnect_attempt: 0,
            shared: Arc::new(SharedState::default()),
            replayed: HashSet::new(),
            observers: Observers::default(),
            heartbeat: None,
            reconnect: None,
            events_tx,
            events_rx,
        })
    }

    /// Returns a cloneable handle that queues operations onto this session.
    pub fn client(&self) -> StreamClient {
        StreamClient::new(self.events_tx.clone(), Arc::clone(&self.shared))
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Returns the subscription set in replay order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions()
    }

    pub fn on_message<F>(&mut self, handler: F)
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.observers.register(Observer::Message(Box::new(handler)));
    }

    pub fn on_error<F>(&mut self, handler: F)
    where
        F: FnMut(&TransportError) + Send + 'static,
    {
        self.observers.register(Observer::Error(Box::new(handler)));
    }

    pub fn on_open<F>(&mut self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.observers.register(Observer::Open(Box::new(handler)));
    }

    pub fn on_close<F>(&mut self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.observers.register(Observer::Close(Box::new(handler)));
    }

    /// Starts connecting. No-op while already connecting or open.
    pub fn connect(&mut self) {
        if matches!(self.state, SessionState::Connecting | SessionState::Open) {
            debug!(event = "stream_connect_ignored", state = ?self.state);
            return;
        }
        self.closed_by_user = false;
        self.cancel_reconnect();
        self.reconnect_attempt = 0;
        self.open_transport();
    }

    /// Closes the session. Safe to call repeatedly in any state; no reconnect
    /// is scheduled afterwards, including one that was already pending.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            info!(event = "stream_close_requested", endpoint = %self.config.endpoint);
        }
        self.closed_by_user = true;
        self.stop_heartbeat();
        self.cancel_reconnect();
        if self.transport.is_connected() {
            self.awaiting_close = true;
        }
        self.state = SessionState::Closed;
        self.shared.set_connected(false);
        self.transport.close();
    }

    /// Adds `channel` to the subscription set and subscribes now if open.
    pub fn subscribe(&mut self, channel: impl Into<String>) {
        let channel = channel.into();
        self.shared.insert_subscription(channel.clone());
        self.send(&ClientMessage::subscribe(channel));
    }

    /// Removes `channel` from the subscription set and sends an unsubscribe.
    pub fn unsubscribe(&mut self, channel: &str) {
        self.shared.remove_subscription(channel);
        self.send(&ClientMessage::unsubscribe(channel));
    }

    /// Sends a one-shot query. `id` defaults to the current timestamp in ms.
    pub fn request(&mut self, channel: impl Into<String>, id: Option<String>) {
        let id = id.unwrap_or_else(|| now_ms().to_string());
        self.send(&ClientMessage::request(channel, id));
    }

    /// Waits for the next queued event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Applies every event already queued without waiting. Returns how many
    /// were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Drives the session until it is closed for good.
    pub async fn run(mut self) {
        while !self.is_finished() {
            let next = if self.state == SessionState::Closed {
                match tokio::time::timeout(CLOSE_GRACE, self.next_event()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(event = "stream_close_grace_elapsed");
                        break;
                    }
                }
            } else {
                self.next_event().await
            };
            let Some(event) = next else {
                break;
            };
            self.handle(event);
        }
        debug!(event = "stream_session_finished", endpoint = %self.config.endpoint);
    }

    /// Closed and no longer waiting for the transport to confirm it.
    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Closed && !self.awaiting_close
    }

    /// Applies one event.
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transport { generation, event } => {
                if generation != self.generation {
                    debug!(
                        event = "stream_stale_transport_event",
                        generation,
                        current = self.generation
                    );
                    return;
                }
                self.on_transport_event(event);
            }
            SessionEvent::HeartbeatTick { generation } => {
                if generation == self.generation && self.state == SessionState::Open {
                    self.send_heartbeat();
                }
            }
            SessionEvent::ReconnectDue { generation } => {
                if generation == self.generation
                    && self.state == SessionState::Reconnecting
                    && !self.closed_by_user
                {
                    self.reconnect = None;
                    self.open_transport();
                }
            }
            SessionEvent::Command(command) => self.apply_command(command),
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Close => self.close(),
            Command::Subscribe(channel) => {
                // Queued behind the open that already replayed it.
                if !self.replayed.remove(&channel) {
                    self.send(&ClientMessage::subscribe(channel));
                }
            }
            Command::Unsubscribe(channel) => {
                self.replayed.remove(&channel);
                self.send(&ClientMessage::unsubscribe(channel));
            }
            Command::Send(message) => self.send(&message),
            Command::Register(observer) => self.observers.register(observer),
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Frame(bytes) => self.on_frame(&bytes),
            TransportEvent::Errored(err) => {
                error!(event = "stream_transport_error", error = %err);
                self.observers.dispatch_error(&err);
            }
            TransportEvent::Closed(info) => self.on_closed(info),
        }
    }

    fn on_opened(&mut self) {
        if self.closed_by_user {
            // Handshake finished after close(); tear the connection down.
            debug!(event = "stream_opened_after_close");
            self.awaiting_close = true;
            self.transport.close();
            return;
        }

        info!(
            event = "stream_open",
            endpoint = %self.config.endpoint,
            generation = self.generation
        );
        self.state = SessionState::Open;
        self.reconnect_attempt = 0;
        self.shared.set_connected(true);
        self.start_heartbeat();

        self.replayed.clear();
        for channel in self.shared.subscriptions() {
            self.send(&ClientMessage::subscribe(channel.clone()));
            self.replayed.insert(channel);
        }

        self.observers.dispatch_open();
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        match decode_frame(bytes) {
            Ok(InboundMessage::Ping(echo)) => self.send(&ClientMessage::pong(echo)),
            Ok(InboundMessage::Data(message)) => self.observers.dispatch_message(&message),
            Err(err) => {
                warn!(event = "stream_frame_decode_failed", error = %err, len = bytes.len());
            }
        }
    }

    fn on_closed(&mut self, info: CloseInfo) {
        let expected = match self.state {
            SessionState::Connecting | SessionState::Open => true,
            SessionState::Closed => self.awaiting_close,
            SessionState::Idle | SessionState::Reconnecting => false,
        };
        if !expected {
            debug!(event = "stream_duplicate_close_ignored", state = ?self.state);
            return;
        }

        warn!(
            event = "stream_closed",
            code = ?info.code,
            reason = %info.reason,
            by_user = self.closed_by_user
        );
        self.stop_heartbeat();
        self.awaiting_close = false;
        self.shared.set_connected(false);
        self.observers.dispatch_close();

        if self.closed_by_user || !self.policy.enabled {
            self.state = SessionState::Closed;
            return;
        }

        self.reconnect_attempt += 1;
        let delay = self.policy.delay_for_attempt(self.reconnect_attempt);
        info!(
            event = "stream_reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            attempt = self.reconnect_attempt
        );
        self.state = SessionState::Reconnecting;
        self.schedule_reconnect(delay);
    }

    fn open_transport(&mut self) {
        self.generation += 1;
        self.state = SessionState::Connecting;
        // A close confirmation from the previous generation is now stale.
        self.awaiting_close = false;
        self.replayed.clear();
        info!(
            event = "stream_connecting",
            endpoint = %self.config.endpoint,
            generation = self.generation
        );
        let events = TransportEvents::new(self.generation, self.events_tx.clone());
        self.transport.open(&self.config.endpoint, events);
    }

    fn send(&mut self, message: &ClientMessage) {
        if !self.transport.is_connected() {
            debug!(event = "stream_send_dropped", message = ?message);
            return;
        }
        match message.to_text() {
            Ok(text) => self.transport.send(text),
            Err(err) => warn!(event = "stream_encode_failed", error = %err),
        }
    }

    fn send_heartbeat(&mut self) {
        if self.transport.is_connected() {
            self.send(&ClientMessage::ping(now_ms()));
        }
    }

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();

        let period = self.config.heartbeat_interval();
        let generation = self.generation;
        let events_tx = self.events_tx.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events_tx
                    .send(SessionEvent::HeartbeatTick { generation })
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_reconnect();

        let generation = self.generation;
        let events_tx = self.events_tx.clone();
        self.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(SessionEvent::ReconnectDue { generation });
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

impl<T> Drop for StreamSession<T> {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::time::Instant;

    use super::{SessionEvent, SessionState, StreamSession};
    use crate::stream::codec::gzip_text;
    use crate::stream::config::StreamConfig;
    use crate::stream::transport::mock::MockTransport;
    use crate::stream::transport::TransportError;

    const ENDPOINT: &str = "wss://ws.example.com/kline-api/ws";
    const TICKER: &str = "market_BTCUSDT_ticker";
    const KLINE: &str = "market_BTCUSDT_kline_1min";

    fn session_with(config: StreamConfig) -> (StreamSession<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        let session =
            StreamSession::with_transport(config, transport.clone()).expect("valid config");
        (session, transport)
    }

    fn session() -> (StreamSession<MockTransport>, MockTransport) {
        session_with(StreamConfig::new(ENDPOINT))
    }

    fn open(session: &mut StreamSession<MockTransport>, transport: &MockTransport) {
        session.connect();
        transport.fire_opened();
        session.process_pending();
        assert_eq!(session.state(), SessionState::Open);
    }

    fn counter() -> (Arc<Mutex<usize>>, impl FnMut() + Send + 'static) {
        let count = Arc::new(Mutex::new(0usize));
        let handle = Arc::clone(&count);
        (count, move || *handle.lock().expect("counter") += 1)
    }

    fn received(session: &mut StreamSession<MockTransport>) -> Arc<Mutex<Vec<Value>>> {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        session.on_message(move |message: &Value| {
            sink.lock().expect("messages").push(message.clone());
        });
        messages
    }

    #[tokio::test]
    async fn subscribe_before_connect_is_sent_on_open() {
        let (mut session, transport) = session();
        session.subscribe(TICKER);
        assert!(transport.sent().is_empty());

        session.connect();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(transport.opens(), vec![ENDPOINT.to_string()]);

        transport.fire_opened();
        session.process_pending();

        assert_eq!(transport.sent(), vec![json!({"sub": TICKER})]);
        assert!(session.is_connected());
        assert_eq!(session.subscriptions(), vec![TICKER.to_string()]);
    }

    #[tokio::test]
    async fn open_replays_before_open_callbacks_run() {
        let (mut session, transport) = session();
        session.subscribe(TICKER);
        let seen_at_open = Arc::new(Mutex::new(Vec::new()));
        {
            let probe = transport.clone();
            let seen_at_open = Arc::clone(&seen_at_open);
            session.on_open(move || {
                *seen_at_open.lock().expect("seen") = probe.sent();
            });
        }

        open(&mut session, &transport);
        assert_eq!(*seen_at_open.lock().expect("seen"), vec![json!({"sub": TICKER})]);
    }

    #[tokio::test]
    async fn reconnect_replays_exactly_the_current_set() {
        let (mut session, transport) = session_with(
            StreamConfig::new(ENDPOINT).with_reconnect_delay(Duration::from_millis(5)),
        );
        session.subscribe("a");
        session.subscribe(TICKER);
        open(&mut session, &transport);

        session.subscribe(KLINE);
        session.unsubscribe("a");
        session.subscribe("b");
        session.unsubscribe("b");
        session.subscribe("a");
        session.subscribe(TICKER);

        transport.fire_closed();
        session.process_pending();
        assert_eq!(session.state(), SessionState::Reconnecting);
        transport.clear_sent();

        let due = session.next_event().await.expect("reconnect due");
        session.handle(due);
        assert_eq!(transport.opens().len(), 2);

        transport.fire_opened();
        session.process_pending();

        assert_eq!(
            transport.sent(),
            vec![json!({"sub": TICKER}), json!({"sub": KLINE}), json!({"sub": "a"})]
        );
        assert_eq!(
            session.subscriptions(),
            vec![TICKER.to_string(), KLINE.to_string(), "a".to_string()]
        );
    }

    #[tokio::test]
    async fn inbound_ping_is_answered_and_not_forwarded() {
        let (mut session, transport) = session();
        let messages = received(&mut session);
        open(&mut session, &transport);
        transport.clear_sent();

        transport.fire_frame(br#"{"ping":12345}"#.to_vec());
        session.process_pending();

        assert_eq!(transport.sent(), vec![json!({"pong": 12345})]);
        assert!(messages.lock().expect("messages").is_empty());
    }

    #[tokio::test]
    async fn gzip_and_plain_frames_reach_handlers_in_order() {
        let (mut session, transport) = session();
        let messages = received(&mut session);
        let (second_calls, second) = counter();
        session.on_message({
            let mut second = second;
            move |_: &Value| second()
        });
        open(&mut session, &transport);

        transport.fire_frame(gzip_text(r#"{"channel":"t","tick":{"close":1}}"#).expect("gzip"));
        transport.fire_frame(br#"{"channel":"t","tick":{"close":2}}"#.to_vec());
        session.process_pending();

        assert_eq!(
            *messages.lock().expect("messages"),
            vec![
                json!({"channel": "t", "tick": {"close": 1}}),
                json!({"channel": "t", "tick": {"close": 2}})
            ]
        );
        assert_eq!(*second_calls.lock().expect("counter"), 2);
    }

    #[tokio::test]
    async fn undecodable_frame_is_dropped_without_state_change() {
        let (mut session, transport) = session();
        let messages = received(&mut session);
        let (errors, on_error) = counter();
        session.on_error({
            let mut on_error = on_error;
            move |_: &TransportError| on_error()
        });
        open(&mut session, &transport);
        transport.clear_sent();

        let mut corrupt = vec![0x1f, 0x8b];
        corrupt.extend_from_slice(b"garbage");
        transport.fire_frame(corrupt);
        transport.fire_frame(b"{not json".to_vec());
        session.process_pending();

        assert!(messages.lock().expect("messages").is_empty());
        assert_eq!(*errors.lock().expect("counter"), 0);
        assert!(transport.sent().is_empty());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn transport_error_only_notifies_error_handlers() {
        let (mut session, transport) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            session.on_error(move |err: &TransportError| {
                seen.lock().expect("errors").push(err.to_string());
            });
        }
        open(&mut session, &transport);

        transport.fire_error("connection reset");
        session.process_pending();

        assert_eq!(
            *seen.lock().expect("errors"),
            vec!["transport error: connection reset".to_string()]
        );
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(transport.opens().len(), 1);
    }

    #[tokio::test]
    async fn double_close_schedules_nothing_and_notifies_once() {
        let (mut session, transport) = session();
        let (closes, on_close) = counter();
        session.on_close(on_close);
        open(&mut session, &transport);

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_finished());

        transport.fire_closed();
        session.process_pending();

        assert_eq!(*closes.lock().expect("counter"), 1);
        assert!(session.is_finished());
        assert_eq!(transport.opens().len(), 1);
        assert!(session.reconnect.is_none());
        assert!(session.heartbeat.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_event_after_user_close_never_reconnects() {
        let (mut session, transport) = session();
        open(&mut session, &transport);

        session.close();
        transport.fire_closed();
        session.process_pending();

        tokio::time::sleep(Duration::from_secs(10)).await;
        session.process_pending();

        assert_eq!(transport.opens().len(), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_a_pending_reconnect() {
        let (mut session, transport) = session();
        open(&mut session, &transport);

        transport.fire_closed();
        session.process_pending();
        assert!(session.reconnect.is_some());

        session.close();
        assert!(session.reconnect.is_none());
        assert!(session.is_finished());

        tokio::time::sleep(Duration::from_secs(10)).await;
        session.process_pending();
        assert_eq!(transport.opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_once_per_interval() {
        let (mut session, transport) = session_with(
            StreamConfig::new(ENDPOINT).with_heartbeat_interval(Duration::from_millis(10)),
        );
        open(&mut session, &transport);
        transport.clear_sent();
        let started = Instant::now();

        let tick = session.next_event().await.expect("heartbeat tick");
        assert!(matches!(tick, SessionEvent::HeartbeatTick { .. }));
        session.handle(tick);

        assert!(started.elapsed() >= Duration::from_millis(10));
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]["ping"].is_u64());
        assert_eq!(sent[0].as_object().map(|fields| fields.len()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_when_connection_drops() {
        let (mut session, transport) = session_with(
            StreamConfig::new(ENDPOINT)
                .with_heartbeat_interval(Duration::from_millis(10))
                .with_auto_reconnect(false),
        );
        open(&mut session, &transport);
        transport.fire_closed();
        session.process_pending();
        assert!(session.heartbeat.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.process_pending(), 0);
    }

    #[tokio::test]
    async fn stale_heartbeat_tick_is_ignored() {
        let (mut session, transport) = session();
        open(&mut session, &transport);
        transport.clear_sent();

        let stale = session.generation - 1;
        session.handle(SessionEvent::HeartbeatTick { generation: stale });
        assert!(transport.sent().is_empty());

        let current = session.generation;
        session.handle(SessionEvent::HeartbeatTick { generation: current });
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_reopens_after_default_delay() {
        let (mut session, transport) = session();
        let (closes, on_close) = counter();
        session.on_close(on_close);
        open(&mut session, &transport);

        transport.fire_closed();
        session.process_pending();
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(*closes.lock().expect("counter"), 1);
        let started = Instant::now();

        let due = session.next_event().await.expect("reconnect due");
        assert!(matches!(due, SessionEvent::ReconnectDue { .. }));
        assert!(started.elapsed() >= Duration::from_millis(1500));
        session.handle(due);

        assert_eq!(transport.opens(), vec![ENDPOINT.to_string(), ENDPOINT.to_string()]);
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_keep_retrying_with_fixed_delay() {
        let (mut session, transport) = session_with(
            StreamConfig::new(ENDPOINT).with_reconnect_delay(Duration::from_millis(100)),
        );
        session.connect();

        for attempt in 2..=5 {
            transport.fire_error("refused");
            transport.fire_closed();
            session.process_pending();
            let started = Instant::now();
            let due = session.next_event().await.expect("reconnect due");
            assert!(started.elapsed() >= Duration::from_millis(100));
            session.handle(due);
            assert_eq!(transport.opens().len(), attempt);
        }
    }

    #[tokio::test]
    async fn disabled_reconnect_closes_for_good() {
        let (mut session, transport) =
            session_with(StreamConfig::new(ENDPOINT).with_auto_reconnect(false));
        let (closes, on_close) = counter();
        session.on_close(on_close);
        open(&mut session, &transport);

        transport.fire_closed();
        session.process_pending();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_finished());
        assert!(session.reconnect.is_none());
        assert_eq!(*closes.lock().expect("counter"), 1);
    }

    #[tokio::test]
    async fn events_from_a_replaced_connection_are_ignored() {
        let (mut session, transport) = session_with(
            StreamConfig::new(ENDPOINT).with_reconnect_delay(Duration::from_millis(1)),
        );
        open(&mut session, &transport);
        let old = transport.events_for(session.generation);

        transport.fire_closed();
        session.process_pending();
        let due = session.next_event().await.expect("reconnect due");
        session.handle(due);
        transport.fire_opened();
        session.process_pending();
        transport.clear_sent();

        old.frame(br#"{"ping":1}"#.to_vec());
        old.closed(crate::stream::transport::CloseInfo::abnormal());
        session.process_pending();

        assert_eq!(session.state(), SessionState::Open);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn sends_while_disconnected_are_dropped() {
        let (mut session, transport) = session();
        session.subscribe(TICKER);
        session.unsubscribe(TICKER);
        session.request(KLINE, Some("1".to_string()));
        assert!(transport.sent().is_empty());
        assert!(session.subscriptions().is_empty());

        open(&mut session, &transport);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn request_uses_given_or_timestamp_id() {
        let (mut session, transport) = session();
        open(&mut session, &transport);

        session.request(KLINE, Some("req-7".to_string()));
        session.request(KLINE, None);

        let sent = transport.sent();
        assert_eq!(sent[0], json!({"req": KLINE, "id": "req-7"}));
        let id = sent[1]["id"].as_str().expect("string id");
        assert!(id.parse::<u64>().expect("numeric id") > 1_600_000_000_000);
        assert!(session.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_while_open_is_sent() {
        let (mut session, transport) = session();
        open(&mut session, &transport);

        session.subscribe(TICKER);
        session.unsubscribe(TICKER);

        assert_eq!(
            transport.sent(),
            vec![json!({"sub": TICKER}), json!({"unsub": TICKER})]
        );
    }

    #[tokio::test]
    async fn connect_while_open_is_a_no_op() {
        let (mut session, transport) = session();
        open(&mut session, &transport);
        session.connect();
        assert_eq!(transport.opens().len(), 1);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn reconnect_before_close_confirmation_does_not_wait_on_it() {
        let (mut session, transport) = session();
        open(&mut session, &transport);
        session.close();
        assert!(!session.is_finished());

        session.connect();
        assert_eq!(session.state(), SessionState::Connecting);
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn connect_after_close_starts_over() {
        let (mut session, transport) = session();
        session.subscribe(TICKER);
        open(&mut session, &transport);
        session.close();
        transport.fire_closed();
        session.process_pending();
        transport.clear_sent();

        open(&mut session, &transport);
        assert_eq!(transport.opens().len(), 2);
        assert_eq!(transport.sent(), vec![json!({"sub": TICKER})]);
    }

    #[tokio::test]
    async fn panicking_observer_does_not_break_dispatch() {
        let (mut session, transport) = session();
        session.on_open(|| panic!("open observer bug"));
        let (opens, on_open) = counter();
        session.on_open(on_open);
        session.on_message(|_: &Value| panic!("message observer bug"));
        let messages = received(&mut session);

        open(&mut session, &transport);
        transport.fire_frame(br#"{"tick":1}"#.to_vec());
        session.process_pending();

        assert_eq!(*opens.lock().expect("counter"), 1);
        assert_eq!(*messages.lock().expect("messages"), vec![json!({"tick": 1})]);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = StreamSession::with_transport(
            StreamConfig::new("http://ws.example.com"),
            MockTransport::default(),
        );
        assert!(result.is_err());
    }
}
