//! Keystroke event, typing statistics and emotion vector types

use serde::{Deserialize, Serialize};

/// Key transition direction for a normalized event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEdge {
    KeyDown,
    KeyUp,
}

/// A single key press/release record as received from a client.
///
/// Timestamps are client-relative milliseconds and must be non-decreasing
/// within one connection's stream; the gateway rejects violations rather
/// than reordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Key identifier as reported by the client (e.g. "a", "Backspace")
    pub key: String,

    /// Client-relative timestamp in milliseconds
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,

    /// Press duration in milliseconds, when the client reports it
    #[serde(rename = "duration", skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,

    /// Press or release edge
    #[serde(rename = "type")]
    pub edge: KeyEdge,
}

impl NormalizedEvent {
    /// Whether this event is a correction keystroke
    pub fn is_backspace(&self) -> bool {
        self.key.eq_ignore_ascii_case("backspace")
    }
}

/// Typing statistics computed from one window of buffered events.
///
/// Ephemeral: recomputed fresh on every batch tick, no state carried
/// between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingStatistics {
    /// Total events in the window (keydown + keyup)
    pub keystroke_count: usize,
    /// KeyDown events in the window
    pub keydown_count: usize,
    /// Words per minute, using the 5-chars-per-word convention
    pub words_per_minute: f64,
    /// Mean delta between consecutive keydowns, milliseconds
    pub mean_interval_ms: f64,
    /// Standard deviation of keydown deltas, milliseconds
    pub interval_stddev_ms: f64,
    /// Mean key press duration in milliseconds, when clients report durations
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mean_duration_ms: Option<f64>,
    /// Deltas exceeding the configured pause threshold
    pub pause_count: usize,
    /// Deltas inside the optimal-pause band
    pub optimal_pause_count: usize,
    /// Deltas exceeding the long-pause threshold
    pub long_pause_count: usize,
    /// 1 - min(1, stddev/mean) over keydown deltas, clamped to [0, 1]
    pub rhythm_consistency: f64,
    /// Backspace events / total events, in [0, 1]
    pub error_rate: f64,
}

/// Four-axis emotion signal derived from typing cadence.
///
/// Exactly one previous vector is retained per session for smoothing;
/// it is overwritten on every successful computation and cleared when the
/// session's buffer is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionVector {
    /// Typing energy in [0, 1]
    pub energy: f64,
    /// Emotional valence in [-1, 1]
    pub valence: f64,
    /// Tension in [0, 1]
    pub tension: f64,
    /// Focus in [0, 1]
    pub focus: f64,
    /// Confidence of the estimate in [0, 1]; never smoothed
    pub confidence: f64,
}

impl EmotionVector {
    /// Clamp every axis into its documented range
    pub fn clamped(self) -> Self {
        Self {
            energy: self.energy.clamp(0.0, 1.0),
            valence: self.valence.clamp(-1.0, 1.0),
            tension: self.tension.clamp(0.0, 1.0),
            focus: self.focus.clamp(0.0, 1.0),
            confidence: self.confidence.clamp(0.0, 1.0),
        }
    }
}
