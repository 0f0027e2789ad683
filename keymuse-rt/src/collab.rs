//! Collaborator seams of the pipeline
//!
//! The core consumes three external services: session-token validation at
//! handshake time, fire-and-forget persistence of derived results, and
//! the downstream music trigger. All three are trait objects wired once
//! in main; the pipeline never calls an external API itself.

use keymuse_common::events::{EmotionVector, TypingStatistics};
use tracing::{debug, info};

/// Session-validation service, called once per connection handshake.
pub trait SessionValidator: Send + Sync {
    /// Returns the session id for a valid token, None for an invalid one.
    fn validate(&self, token: &str) -> Option<String>;
}

/// Persistence collaborator for derived results.
///
/// Calls are fire-and-forget: failures are the collaborator's to log and
/// are never surfaced on the live connection.
pub trait EmotionSink: Send + Sync {
    fn save_typing_pattern(&self, session_id: &str, stats: &TypingStatistics);
    fn save_emotion_profile(&self, session_id: &str, vector: &EmotionVector);
}

/// Downstream music-generation trigger, notified with the latest vector.
pub trait MusicTrigger: Send + Sync {
    fn emotion_updated(&self, session_id: &str, vector: &EmotionVector);
}

/// Development validator: any non-empty token names its own session.
///
/// Production deployments replace this with a client of the real
/// token-validation service.
pub struct TokenIsSessionValidator;

impl SessionValidator for TokenIsSessionValidator {
    fn validate(&self, token: &str) -> Option<String> {
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }
}

/// Sink that only logs; stands in until the persistence service is wired.
pub struct LoggingSink;

impl EmotionSink for LoggingSink {
    fn save_typing_pattern(&self, session_id: &str, stats: &TypingStatistics) {
        debug!(
            "save_typing_pattern session={} wpm={:.1} events={}",
            session_id, stats.words_per_minute, stats.keystroke_count
        );
    }

    fn save_emotion_profile(&self, session_id: &str, vector: &EmotionVector) {
        debug!(
            "save_emotion_profile session={} energy={:.2} valence={:.2}",
            session_id, vector.energy, vector.valence
        );
    }
}

/// Trigger that only logs the handoff to the generation step.
pub struct LoggingTrigger;

impl MusicTrigger for LoggingTrigger {
    fn emotion_updated(&self, session_id: &str, vector: &EmotionVector) {
        info!(
            "emotion update session={} energy={:.2} valence={:.2} tension={:.2} focus={:.2} confidence={:.2}",
            session_id, vector.energy, vector.valence, vector.tension, vector.focus, vector.confidence
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_invalid() {
        assert_eq!(TokenIsSessionValidator.validate(""), None);
        assert_eq!(TokenIsSessionValidator.validate("   "), None);
    }

    #[test]
    fn token_names_its_session() {
        assert_eq!(
            TokenIsSessionValidator.validate("session-42"),
            Some("session-42".to_string())
        );
    }
}
