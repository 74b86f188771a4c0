//! Realtime stream modules.
//!
//! - `codec`: gzip/plain-text frame decoding.
//! - `transport`: websocket connection primitive and the `Transport` seam.
//! - `session`: reconnecting session with heartbeat and subscription replay.
//! - `client`: cloneable handle onto a spawned session.

/// Cloneable session handle.
pub mod client;
/// Inbound frame decoding.
pub mod codec;
/// Session configuration.
pub mod config;
/// Observer callback registry.
pub mod observers;
/// Wire envelopes and inbound message classification.
pub mod proto;
/// Session state machine.
pub mod session;
/// Websocket transport.
pub mod transport;

pub use client::StreamClient;
pub use config::{ConfigError, StreamConfig};
pub use session::{SessionState, StreamSession};
