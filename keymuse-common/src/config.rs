//! Configuration loading for the realtime pipeline
//!
//! Resolution priority for the config file path:
//! 1. Command-line argument (highest priority)
//! 2. `KEYMUSE_CONFIG` environment variable
//! 3. `keymuse.toml` in the working directory
//! 4. Compiled defaults (fallback)
//!
//! A missing or unreadable config file logs a warning and falls back to
//! defaults; it never aborts startup. Every tuned constant of the
//! pipeline lives here so nothing is hard-coded at use sites.

use crate::protocol::QosSummary;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default config file name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "keymuse.toml";

/// Environment variable naming an alternate config file
pub const CONFIG_ENV_VAR: &str = "KEYMUSE_CONFIG";

/// Process-wide QoS and resource limits, immutable after startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Inbound messages allowed per connection per sliding second
    pub rate_limit_per_sec: u32,
    /// Batch scheduler tick interval
    pub batch_interval_ms: u64,
    /// Max distinct dirty sessions dispatched per tick
    pub batch_size: usize,
    /// Outbound payloads at or above this size are candidates for compression
    pub compression_threshold_bytes: usize,
    /// Acceptable per-connection processing latency; breaches are logged
    pub max_latency_ms: f64,
    /// Silence on a connection before the server probes it
    pub heartbeat_interval_secs: u64,
    /// Total silence before a connection is closed
    pub idle_timeout_secs: u64,
    /// Interval of the idle-connection reaper
    pub reap_interval_secs: u64,
    /// Per-session event buffer capacity
    pub buffer_capacity: usize,
    /// Concurrent session cap; exceeding it evicts the least-recently-active
    pub max_sessions: usize,
    /// Sessions with fewer buffered events than this are skipped by analysis
    pub min_events: usize,
    /// Buffered events older than this (relative to the newest) are GC'd
    pub event_max_age_ms: u64,
    /// Interval of the stale-event GC task
    pub gc_interval_secs: u64,
    /// Window of events handed to the extractor each analysis run
    pub analysis_window_ms: u64,
    /// Analysis worker threads; 0 selects the available core count
    pub worker_threads: usize,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 100,
            batch_interval_ms: 100,
            batch_size: 50,
            compression_threshold_bytes: 1024,
            max_latency_ms: 50.0,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 300,
            reap_interval_secs: 30,
            buffer_capacity: 1000,
            max_sessions: 1000,
            min_events: 10,
            event_max_age_ms: 300_000,
            gc_interval_secs: 60,
            analysis_window_ms: 60_000,
            worker_threads: 0,
        }
    }
}

impl QosConfig {
    /// The subset announced to clients in the handshake frame
    pub fn summary(&self) -> QosSummary {
        QosSummary {
            rate_limit_per_sec: self.rate_limit_per_sec,
            batch_interval_ms: self.batch_interval_ms,
            compression_threshold_bytes: self.compression_threshold_bytes,
            max_latency_ms: self.max_latency_ms,
        }
    }
}

/// Empirical constants of the extraction and emotion mapping steps.
///
/// These are tuned defaults, not derived invariants; they are kept in
/// configuration so deployments can adjust them without a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Keydown delta above which a gap counts as a pause
    pub pause_threshold_ms: f64,
    /// Lower bound of the pause band that counts toward focus
    pub optimal_pause_min_ms: f64,
    /// Upper bound of the pause band that counts toward focus
    pub optimal_pause_max_ms: f64,
    /// Pauses above this length penalize focus
    pub long_pause_threshold_ms: f64,
    /// Exponential smoothing factor applied to the four emotion axes
    pub smoothing_alpha: f64,
    /// WPM that maps to full energy before the duration factor
    pub wpm_normalization: f64,
    /// Interval stddev above which the tension penalty activates
    pub stddev_penalty_threshold_ms: f64,
    /// Event count at which sample-size confidence saturates
    pub confidence_saturation_events: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            pause_threshold_ms: 500.0,
            optimal_pause_min_ms: 200.0,
            optimal_pause_max_ms: 800.0,
            long_pause_threshold_ms: 3000.0,
            smoothing_alpha: 0.3,
            wpm_normalization: 100.0,
            stddev_penalty_threshold_ms: 50.0,
            confidence_saturation_events: 20,
        }
    }
}

/// Full pipeline configuration as loaded from TOML
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub qos: QosConfig,
    pub analysis: AnalysisConfig,
}

impl Config {
    /// Parse a TOML config file. Unspecified fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Resolve configuration following the priority order documented at
    /// the module level. Missing or invalid files degrade to defaults
    /// with a warning rather than terminating startup.
    pub fn resolve(cli_path: Option<&Path>) -> Self {
        let candidate: Option<PathBuf> = cli_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            });

        match candidate {
            Some(path) => match Self::load_from(&path) {
                Ok(config) => {
                    info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to load {}: {}; using defaults", path.display(), e);
                    Self::default()
                }
            },
            None => {
                info!("No config file found; using compiled defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.qos.rate_limit_per_sec, 100);
        assert_eq!(config.qos.batch_interval_ms, 100);
        assert_eq!(config.qos.batch_size, 50);
        assert_eq!(config.qos.buffer_capacity, 1000);
        assert_eq!(config.qos.max_sessions, 1000);
        assert_eq!(config.qos.min_events, 10);
        assert_eq!(config.analysis.pause_threshold_ms, 500.0);
        assert_eq!(config.analysis.smoothing_alpha, 0.3);
        assert_eq!(config.analysis.wpm_normalization, 100.0);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let config: Config = toml::from_str(
            r#"
            [qos]
            rate_limit_per_sec = 10

            [analysis]
            smoothing_alpha = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.qos.rate_limit_per_sec, 10);
        assert_eq!(config.qos.batch_size, 50);
        assert_eq!(config.analysis.smoothing_alpha, 0.5);
        assert_eq!(config.analysis.pause_threshold_ms, 500.0);
    }

    #[test]
    fn qos_summary_carries_handshake_fields() {
        let summary = QosConfig::default().summary();
        assert_eq!(summary.rate_limit_per_sec, 100);
        assert_eq!(summary.compression_threshold_bytes, 1024);
        assert_eq!(summary.max_latency_ms, 50.0);
    }
}
