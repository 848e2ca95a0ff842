use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::types::Message;

/// Natural identity of a message when its id cannot be trusted to differ:
/// who said it, in which chat, what was said and when. Two sends of the same
/// text are distinct messages because the server stamps each one.
pub fn message_fingerprint(message: &Message) -> String {
    format!(
        "{}|{}|{}|{}",
        message.sender_role.as_str(),
        message.session_id,
        message.created_at.timestamp_micros(),
        message.text.trim()
    )
}

/// Remembers fingerprints for `window`. Pruned on every check so memory stays
/// bounded by the traffic of one window.
#[derive(Debug, Clone)]
pub struct FingerprintCache {
    window: ChronoDuration,
    entries: HashMap<String, DateTime<Utc>>,
}

impl FingerprintCache {
    pub fn new(window: ChronoDuration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    pub fn window(&self) -> ChronoDuration {
        self.window
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.entries
            .retain(|_, seen_at| seen_at.checked_add_signed(window).map_or(true, |until| until > now));
    }

    /// Records `fingerprint`; returns false when it was already seen inside
    /// the window.
    pub fn check_and_insert(&mut self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        self.prune(now);
        if self.entries.contains_key(fingerprint) {
            return false;
        }
        self.entries.insert(fingerprint.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
