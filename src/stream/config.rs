//! Session construction parameters.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::ReconnectPolicy;

/// Default reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1500;
/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Streaming session configuration.
///
/// Deserializable so it can be embedded in a larger config file; every field
/// except `endpoint` has a default.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StreamConfig {
    /// Websocket endpoint (`ws://` or `wss://`).
    pub endpoint: String,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Cap for reconnect delay growth. Unset keeps the delay fixed.
    #[serde(default)]
    pub max_reconnect_delay_ms: Option<u64>,
    #[serde(default)]
    pub reconnect_jitter_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl StreamConfig {
    /// Creates a config for `endpoint` with default timings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim().to_string(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_reconnect_delay_ms: None,
            reconnect_jitter_ms: 0,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = duration_ms(delay);
        self
    }

    /// Lets the reconnect delay double per consecutive failure up to `cap`.
    pub fn with_max_reconnect_delay(mut self, cap: Duration) -> Self {
        self.max_reconnect_delay_ms = Some(duration_ms(cap));
        self
    }

    pub fn with_reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter_ms = duration_ms(jitter);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = duration_ms(interval);
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let delay = Duration::from_millis(self.reconnect_delay_ms);
        ReconnectPolicy {
            enabled: self.auto_reconnect,
            delay,
            max_delay: self
                .max_reconnect_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(delay),
            jitter: Duration::from_millis(self.reconnect_jitter_ms),
        }
    }

    /// Checks the endpoint scheme and timer settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        let scheme = self
            .endpoint
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        if scheme != "ws" && scheme != "wss" {
            return Err(ConfigError::UnsupportedScheme(self.endpoint.clone()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        Ok(())
    }
}

/// Invalid session configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stream endpoint is empty")]
    EmptyEndpoint,

    #[error("stream endpoint must use ws:// or wss://, got {0}")]
    UnsupportedScheme(String),

    #[error("heartbeat interval must be > 0")]
    ZeroHeartbeatInterval,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
