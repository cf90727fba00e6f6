use crate::codec::WireCodec;
use std::env;
use std::time::Duration;

const DEFAULT_MAX_QUEUE: usize = 64;

/// Worker-side settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Capacity of the command and message queues. A full queue blocks the
    /// sender; nothing is dropped.
    pub max_queue: usize,
    /// Initialize the engine before reading the first command.
    pub auto_initialize: bool,
    /// Codec for messages not answering a specific frame (the startup init).
    pub codec: WireCodec,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_MAX_QUEUE,
            auto_initialize: true,
            codec: WireCodec::Json,
        }
    }
}

impl WorkerConfig {
    /// Reads `SQLRELAY_MAX_QUEUE`, `SQLRELAY_AUTO_INIT` and `SQLRELAY_CODEC`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_queue: lookup("SQLRELAY_MAX_QUEUE")
                .and_then(|val| val.parse::<usize>().ok())
                .map(|val| val.max(1))
                .unwrap_or(defaults.max_queue),
            auto_initialize: lookup("SQLRELAY_AUTO_INIT")
                .and_then(|val| parse_flag(&val))
                .unwrap_or(defaults.auto_initialize),
            codec: lookup("SQLRELAY_CODEC")
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.codec),
        }
    }
}

/// Controller-side settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long a request may wait for its response. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Codec for command frames sent to a worker process.
    pub codec: WireCodec,
    /// Capacity of the queue between the link and the response router.
    ///
    /// Commands are never dropped. When the worker's command queue (for a
    /// thread worker, `WorkerConfig::max_queue`) or the pipe to a worker
    /// process is full, [`crate::Controller::send`] blocks the calling thread
    /// until the worker catches up. On a tokio runtime that parks the worker
    /// thread running the call.
    pub max_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            codec: WireCodec::Msgpack,
            max_queue: DEFAULT_MAX_QUEUE,
        }
    }
}

impl ClientConfig {
    /// Reads `SQLRELAY_REQUEST_TIMEOUT_MS` (0 disables the timeout),
    /// `SQLRELAY_CODEC` and `SQLRELAY_MAX_QUEUE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: match lookup("SQLRELAY_REQUEST_TIMEOUT_MS")
                .and_then(|val| val.parse::<u64>().ok())
            {
                Some(0) | None => defaults.request_timeout,
                Some(ms) => Some(Duration::from_millis(ms)),
            },
            codec: lookup("SQLRELAY_CODEC")
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.codec),
            max_queue: lookup("SQLRELAY_MAX_QUEUE")
                .and_then(|val| val.parse::<usize>().ok())
                .map(|val| val.max(1))
                .unwrap_or(defaults.max_queue),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
