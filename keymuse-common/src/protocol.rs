//! WebSocket wire protocol for the realtime pipeline
//!
//! Messages are JSON objects discriminated by a `type` field, decoded once
//! at the gateway boundary. Inbound and outbound kinds are closed sets;
//! anything else is answered with an `error` frame and the connection
//! stays open.
//!
//! Outbound frames whose serialized form reaches the configured
//! compression threshold are sent as a binary frame containing the
//! gzip-compressed JSON (only when compression strictly reduces size);
//! all other frames are plain text JSON.

use crate::events::{EmotionVector, NormalizedEvent, TypingStatistics};
use serde::{Deserialize, Serialize};

/// Messages a client may send over an established connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A single keystroke event
    TypingEvent {
        /// Optional echo of the session id; the connection's bound
        /// session is authoritative
        #[serde(skip_serializing_if = "Option::is_none", default)]
        session_id: Option<String>,
        event: NormalizedEvent,
    },

    /// Several keystroke events in client order
    BatchTypingEvents { events: Vec<NormalizedEvent> },

    /// Synchronous query for the latest typing pattern
    GetPattern,

    /// Client liveness probe
    Ping,
}

/// QoS parameters announced to the client at handshake time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosSummary {
    pub rate_limit_per_sec: u32,
    pub batch_interval_ms: u64,
    pub compression_threshold_bytes: usize,
    pub max_latency_ms: f64,
}

/// Statistics plus the most recent emotion vector for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternPayload {
    pub stats: TypingStatistics,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub emotion: Option<EmotionVector>,
}

/// Reason a pattern query could not produce statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotReadyReason {
    /// Fewer events buffered than the configured minimum sample size
    MinEvents,
    /// The extractor saw fewer than two keydown events
    InsufficientEvents,
    /// The window's keydown span is zero or negative
    InvalidTimeSpan,
}

/// Messages the server sends to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgement with the active QoS parameters
    ConnectionEstablished {
        session_id: String,
        qos_config: QosSummary,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Acknowledgement of a single accepted typing event
    EventProcessed { status: String, latency_ms: f64 },

    /// Acknowledgement of a batch; counts accepted vs. submitted events
    BatchProcessed {
        processed_count: usize,
        total_count: usize,
        latency_ms: f64,
    },

    /// Reply to `get_pattern` when statistics are available
    PatternData { pattern: PatternPayload },

    /// Reply to `get_pattern` when statistics are not yet computable
    PatternNotReady {
        reason: NotReadyReason,
        buffered: usize,
        required: usize,
    },

    /// Broadcast pushed to all connections of a session after each
    /// successful batch analysis
    PatternUpdate { pattern: PatternPayload },

    /// Structured error reply; `error` is a stable machine-readable code
    Error {
        error: String,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Reply to `ping`
    Pong,
}

impl ServerMessage {
    /// Build an error frame from a stable code and human-readable message
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            error: code.into(),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}
