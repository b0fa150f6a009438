use crate::{Error, Result, protocol::DEFAULT_MAX_FRAME_LENGTH, transport::Transport};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the integration the server runs under, e.g. an editor
    pub client: String,

    /// Where the server listens
    pub transport: Transport,

    /// How long a new connection may take to send its `hello`
    pub handshake_timeout: Duration,

    /// How long a session whose connection dropped waits for a resume
    pub reconnect_grace: Duration,

    /// Budget for rebinding the listener during a restart
    pub restart_timeout: Duration,

    /// Largest accepted frame, in bytes
    pub max_frame_length: usize,

    /// Maximum number of connections served at once
    pub max_connections: usize,

    /// Buffer size of in-process connections
    pub memory_buffer: usize,

    /// Default number of messages produced by `test_stream`
    pub stream_length: usize,

    /// Default delay between `test_stream` messages
    pub stream_interval: Duration,

    /// Options the server does not recognize, kept as given
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: "vscode".to_string(),
            transport: Transport::Memory,
            handshake_timeout: Duration::from_secs(5),
            reconnect_grace: Duration::from_secs(30),
            restart_timeout: Duration::from_secs(5),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_connections: 1024,
            // 64 KiB
            memory_buffer: 64 * 1024,
            stream_length: 5,
            stream_interval: Duration::from_millis(10),
            extra: Map::new(),
        }
    }
}

/// JSON form of [`Config`]. Durations are given in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    client: Option<String>,
    transport: Option<String>,
    handshake_timeout_ms: Option<u64>,
    reconnect_grace_ms: Option<u64>,
    restart_timeout_ms: Option<u64>,
    max_frame_length: Option<usize>,
    max_connections: Option<usize>,
    memory_buffer: Option<usize>,
    stream_length: Option<usize>,
    stream_interval_ms: Option<u64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON object of options. Missing options keep their defaults and
    /// unrecognized ones are preserved in [`Config::extra`].
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawConfig = serde_json::from_value(value)?;
        let mut config = Self::default();

        if let Some(client) = raw.client {
            config.client = client;
        }
        if let Some(transport) = raw.transport {
            config.transport = transport.parse().map_err(Error::InvalidParams)?;
        }
        if let Some(ms) = raw.handshake_timeout_ms {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.reconnect_grace_ms {
            config.reconnect_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.restart_timeout_ms {
            config.restart_timeout = Duration::from_millis(ms);
        }
        if let Some(len) = raw.max_frame_length {
            config.max_frame_length = len;
        }
        if let Some(max) = raw.max_connections {
            config.max_connections = max;
        }
        if let Some(size) = raw.memory_buffer {
            config.memory_buffer = size;
        }
        if let Some(len) = raw.stream_length {
            config.stream_length = len;
        }
        if let Some(ms) = raw.stream_interval_ms {
            config.stream_interval = Duration::from_millis(ms);
        }
        config.extra = raw.extra;

        Ok(config)
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    pub fn with_restart_timeout(mut self, timeout: Duration) -> Self {
        self.restart_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_stream(mut self, length: usize, interval: Duration) -> Self {
        self.stream_length = length;
        self.stream_interval = interval;
        self
    }
}
