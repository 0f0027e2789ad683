//! Emotion mapping
//!
//! Maps one [`TypingStatistics`] to a four-axis [`EmotionVector`], then
//! smooths the axes against the session's previous vector with an
//! exponential filter. Confidence reflects only the current sample and is
//! never smoothed. The previous vector is owned by the session store and
//! updated only on successful computation.

use keymuse_common::config::AnalysisConfig;
use keymuse_common::events::{EmotionVector, TypingStatistics};

/// Press durations at or above this many milliseconds bottom out the
/// energy duration factor.
const DURATION_FACTOR_SCALE_MS: f64 = 200.0;

/// Stateless mapper carrying only its tuning constants
pub struct EmotionMapper {
    config: AnalysisConfig,
}

impl EmotionMapper {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// Derive the emotion vector for one analysis run.
    ///
    /// The first computation for a session (no previous vector) is
    /// returned unsmoothed.
    pub fn map(&self, stats: &TypingStatistics, previous: Option<&EmotionVector>) -> EmotionVector {
        let raw = self.raw_vector(stats);
        match previous {
            None => raw,
            Some(prev) => {
                let alpha = self.config.smoothing_alpha;
                let blend = |new: f64, old: f64| alpha * new + (1.0 - alpha) * old;
                EmotionVector {
                    energy: blend(raw.energy, prev.energy),
                    valence: blend(raw.valence, prev.valence),
                    tension: blend(raw.tension, prev.tension),
                    focus: blend(raw.focus, prev.focus),
                    confidence: raw.confidence,
                }
                .clamped()
            }
        }
    }

    fn raw_vector(&self, stats: &TypingStatistics) -> EmotionVector {
        // Shorter presses read as higher arousal; factor bounded [0.5, 1.5]
        let duration_factor = match stats.mean_duration_ms {
            Some(d) => (1.5 - d / DURATION_FACTOR_SCALE_MS).clamp(0.5, 1.5),
            None => 1.0,
        };
        let speed = (stats.words_per_minute / self.config.wpm_normalization).clamp(0.0, 1.0);
        let energy = (speed * duration_factor).clamp(0.0, 1.0);

        let rhythm_term = (1.0 - stats.rhythm_consistency) * 0.4;
        let error_penalty = (stats.error_rate * 1.5).min(0.3);
        let stddev_penalty = if stats.interval_stddev_ms > self.config.stddev_penalty_threshold_ms {
            ((stats.interval_stddev_ms - self.config.stddev_penalty_threshold_ms) / 500.0).min(0.3)
        } else {
            0.0
        };
        let tension = (rhythm_term + error_penalty + stddev_penalty).clamp(0.0, 1.0);

        let interval_count = stats.keydown_count.saturating_sub(1);
        let focus = if interval_count == 0 {
            0.5
        } else {
            let optimal_ratio = stats.optimal_pause_count as f64 / interval_count as f64;
            let long_ratio = stats.long_pause_count as f64 / interval_count as f64;
            (0.4 + 0.4 * optimal_ratio - 0.4 * long_ratio + 0.2 * stats.rhythm_consistency)
                .clamp(0.0, 1.0)
        };

        let valence = (1.5 * (energy - tension)).clamp(-1.0, 1.0);

        let adequacy = (stats.keystroke_count as f64
            / self.config.confidence_saturation_events as f64)
            .min(1.0);
        let confidence = (0.6 * adequacy + 0.3 * stats.rhythm_consistency
            - 0.5 * stats.error_rate)
            .clamp(0.1, 1.0);

        EmotionVector {
            energy,
            valence,
            tension,
            focus,
            confidence,
        }
    }
}
