//! Resilient market-data stream client.
//!
//! The crate keeps one subscription-oriented websocket session alive against
//! an exchange feed:
//! - `stream`: transport, frame codec, and the reconnecting session.
//! - `retry`: reconnect delay policy.

/// Reconnect delay policy.
pub mod retry;
/// Realtime stream client, protocol types, and session state.
pub mod stream;
