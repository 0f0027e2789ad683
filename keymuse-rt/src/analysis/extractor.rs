//! Typing pattern extraction
//!
//! Pure function from a time-ordered window of normalized events to
//! [`TypingStatistics`]. Precondition failures are explicit outcomes,
//! never panics: the result feeds both the batch pipeline and synchronous
//! `get_pattern` queries.

use keymuse_common::config::AnalysisConfig;
use keymuse_common::events::{KeyEdge, NormalizedEvent, TypingStatistics};

/// Minimum keydown events required for a meaningful extraction
pub const MIN_KEYDOWNS: usize = 2;

/// Outcome of one extraction run
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Stats(TypingStatistics),
    /// Fewer than [`MIN_KEYDOWNS`] keydown events in the window
    InsufficientEvents { available: usize, required: usize },
    /// The keydown span is zero; rates are undefined
    InvalidTimeSpan,
}

/// Stateless extractor carrying only its tuning constants
pub struct PatternExtractor {
    config: AnalysisConfig,
}

impl PatternExtractor {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// Compute statistics for one window of events.
    ///
    /// The window must be timestamp-ordered (the session buffer maintains
    /// this). Re-running on an identical window yields identical output.
    pub fn extract(&self, events: &[NormalizedEvent]) -> Extraction {
        let keydown_times: Vec<u64> = events
            .iter()
            .filter(|e| e.edge == KeyEdge::KeyDown)
            .map(|e| e.timestamp_ms)
            .collect();
        let keydown_count = keydown_times.len();

        if keydown_count < MIN_KEYDOWNS {
            return Extraction::InsufficientEvents {
                available: keydown_count,
                required: MIN_KEYDOWNS,
            };
        }

        let span_ms = keydown_times[keydown_count - 1].saturating_sub(keydown_times[0]);
        if span_ms == 0 {
            return Extraction::InvalidTimeSpan;
        }

        let deltas: Vec<f64> = keydown_times
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) as f64)
            .collect();

        let mean_interval_ms = mean(&deltas).unwrap_or(0.0);
        let interval_stddev_ms = std_dev(&deltas).unwrap_or(0.0);

        // Fewer than 3 deltas is too little signal to call a rhythm
        let rhythm_consistency = if deltas.len() < 3 || mean_interval_ms <= 0.0 {
            0.0
        } else {
            (1.0 - (interval_stddev_ms / mean_interval_ms).min(1.0)).clamp(0.0, 1.0)
        };

        let pause_count = deltas
            .iter()
            .filter(|d| **d > self.config.pause_threshold_ms)
            .count();
        let optimal_pause_count = deltas
            .iter()
            .filter(|d| {
                **d >= self.config.optimal_pause_min_ms && **d <= self.config.optimal_pause_max_ms
            })
            .count();
        let long_pause_count = deltas
            .iter()
            .filter(|d| **d > self.config.long_pause_threshold_ms)
            .count();

        let backspaces = events.iter().filter(|e| e.is_backspace()).count();
        let error_rate = backspaces as f64 / events.len() as f64;

        let durations: Vec<f64> = events
            .iter()
            .filter_map(|e| e.duration_ms)
            .map(|d| d as f64)
            .collect();
        let mean_duration_ms = mean(&durations);

        // 5-chars-per-word convention over the keydown span
        let span_minutes = span_ms as f64 / 1000.0 / 60.0;
        let words_per_minute = (keydown_count as f64 / 5.0) / span_minutes;

        Extraction::Stats(TypingStatistics {
            keystroke_count: events.len(),
            keydown_count,
            words_per_minute,
            mean_interval_ms,
            interval_stddev_ms,
            mean_duration_ms,
            pause_count,
            optimal_pause_count,
            long_pause_count,
            rhythm_consistency,
            error_rate,
        })
    }
}

fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

fn std_dev(data: &[f64]) -> Option<f64> {
    let data_mean = mean(data)?;
    let variance = data
        .iter()
        .map(|value| {
            let diff = data_mean - *value;
            diff * diff
        })
        .sum::<f64>()
        / data.len() as f64;
    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> PatternExtractor {
        PatternExtractor::new(AnalysisConfig::default())
    }

    fn keydown(ts: u64, key: &str, duration: Option<u64>) -> NormalizedEvent {
        NormalizedEvent {
            key: key.to_string(),
            timestamp_ms: ts,
            duration_ms: duration,
            edge: KeyEdge::KeyDown,
        }
    }

    /// 15 keydowns at a fixed 200ms interval, 80ms press duration
    fn steady_events() -> Vec<NormalizedEvent> {
        (0..15)
            .map(|i| keydown(i * 200, "a", Some(80)))
            .collect()
    }

    #[test]
    fn steady_typing_scenario() {
        let Extraction::Stats(stats) = extractor().extract(&steady_events()) else {
            panic!("expected stats");
        };
        assert_eq!(stats.keydown_count, 15);
        // (15/5) words over 2.8 seconds
        assert!((stats.words_per_minute - 64.29).abs() < 0.05);
        assert!((stats.rhythm_consistency - 1.0).abs() < 1e-9);
        assert_eq!(stats.pause_count, 0);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!(stats.mean_interval_ms, 200.0);
        assert_eq!(stats.mean_duration_ms, Some(80.0));
    }

    #[test]
    fn extraction_is_idempotent() {
        let events = steady_events();
        let first = extractor().extract(&events);
        let second = extractor().extract(&events);
        assert_eq!(first, second);
    }

    #[test]
    fn wpm_is_never_negative_and_consistency_in_range() {
        let events: Vec<NormalizedEvent> = [0u64, 30, 700, 710, 4000, 4100]
            .iter()
            .map(|ts| keydown(*ts, "x", None))
            .collect();
        let Extraction::Stats(stats) = extractor().extract(&events) else {
            panic!("expected stats");
        };
        assert!(stats.words_per_minute >= 0.0);
        assert!((0.0..=1.0).contains(&stats.rhythm_consistency));
        assert!((0.0..=1.0).contains(&stats.error_rate));
    }

    #[test]
    fn fewer_than_two_keydowns_is_explicit() {
        let events = vec![keydown(0, "a", None)];
        assert_eq!(
            extractor().extract(&events),
            Extraction::InsufficientEvents {
                available: 1,
                required: 2
            }
        );
        assert_eq!(
            extractor().extract(&[]),
            Extraction::InsufficientEvents {
                available: 0,
                required: 2
            }
        );
    }

    #[test]
    fn keyups_do_not_count_toward_the_minimum() {
        let events = vec![
            NormalizedEvent {
                key: "a".to_string(),
                timestamp_ms: 0,
                duration_ms: None,
                edge: KeyEdge::KeyUp,
            },
            NormalizedEvent {
                key: "b".to_string(),
                timestamp_ms: 50,
                duration_ms: None,
                edge: KeyEdge::KeyUp,
            },
        ];
        assert!(matches!(
            extractor().extract(&events),
            Extraction::InsufficientEvents { available: 0, .. }
        ));
    }

    #[test]
    fn zero_span_is_invalid() {
        let events = vec![keydown(100, "a", None), keydown(100, "b", None)];
        assert_eq!(extractor().extract(&events), Extraction::InvalidTimeSpan);
    }

    #[test]
    fn two_deltas_have_zero_consistency() {
        let events = vec![
            keydown(0, "a", None),
            keydown(100, "b", None),
            keydown(200, "c", None),
        ];
        let Extraction::Stats(stats) = extractor().extract(&events) else {
            panic!("expected stats");
        };
        assert_eq!(stats.rhythm_consistency, 0.0);
    }

    #[test]
    fn pauses_are_classified_by_band() {
        // Deltas: 100, 600, 300, 3500
        let events: Vec<NormalizedEvent> = [0u64, 100, 700, 1000, 4500]
            .iter()
            .map(|ts| keydown(*ts, "x", None))
            .collect();
        let Extraction::Stats(stats) = extractor().extract(&events) else {
            panic!("expected stats");
        };
        assert_eq!(stats.pause_count, 2); // 600 and 3500 exceed 500ms
        assert_eq!(stats.optimal_pause_count, 2); // 600 and 300 in [200, 800]
        assert_eq!(stats.long_pause_count, 1); // 3500 exceeds 3000ms
    }

    #[test]
    fn backspaces_drive_error_rate() {
        let mut events = steady_events();
        events.push(keydown(3000, "Backspace", None));
        events.push(keydown(3200, "Backspace", None));
        let Extraction::Stats(stats) = extractor().extract(&events) else {
            panic!("expected stats");
        };
        assert!((stats.error_rate - 2.0 / 17.0).abs() < 1e-9);
    }
}
