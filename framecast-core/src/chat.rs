//! Chat message model and aging rules.
//!
//! Messages render at full opacity for 30 seconds, then fade linearly
//! to transparent over the following 5 seconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Age at which a message starts fading.
pub const FADE_START_SECS: f64 = 30.0;
/// Duration of the linear fade.
pub const FADE_DURATION_SECS: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub username: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Highlighted messages carry a persistent background tint.
    #[serde(default)]
    pub highlighted: bool,
}

impl ChatMessage {
    /// Rendered opacity of this message at `now`.
    ///
    /// 1.0 within the first 30s, 0.0 past 35s, linear in between.
    #[must_use]
    pub fn opacity_at(&self, now: DateTime<Utc>) -> f32 {
        let age = (now - self.timestamp).num_milliseconds() as f64 / 1000.0;
        if age <= FADE_START_SECS {
            return 1.0;
        }
        if age >= FADE_START_SECS + FADE_DURATION_SECS {
            return 0.0;
        }
        (1.0 - (age - FADE_START_SECS) / FADE_DURATION_SECS) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message_aged(secs: i64) -> (ChatMessage, DateTime<Utc>) {
        let now = Utc::now();
        let msg = ChatMessage {
            id: "m1".to_string(),
            username: "viewer".to_string(),
            text: "hello".to_string(),
            timestamp: now - Duration::seconds(secs),
            highlighted: false,
        };
        (msg, now)
    }

    #[test]
    fn fresh_message_fully_opaque() {
        let (msg, now) = message_aged(5);
        assert_eq!(msg.opacity_at(now), 1.0);
    }

    #[test]
    fn message_at_threshold_still_opaque() {
        let (msg, now) = message_aged(30);
        assert_eq!(msg.opacity_at(now), 1.0);
    }

    #[test]
    fn fade_is_monotonic() {
        let (msg, now) = message_aged(0);
        let mut last = 1.0f32;
        for secs in [31, 32, 33, 34] {
            let at = now + Duration::seconds(secs);
            let opacity = msg.opacity_at(at);
            assert!(opacity < last, "opacity must decrease at {secs}s");
            assert!(opacity > 0.0);
            last = opacity;
        }
    }

    #[test]
    fn fully_transparent_after_35s() {
        let (msg, now) = message_aged(36);
        assert_eq!(msg.opacity_at(now), 0.0);
    }
}
