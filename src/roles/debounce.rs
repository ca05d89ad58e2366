//! Per-member cooldown for event-driven evaluation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::platform::UserId;

/// Drops evaluations for a member processed within the cooldown window.
///
/// Entries are never evicted; the map grows with the number of distinct
/// members seen during the process lifetime.
pub struct DebounceGuard {
    cooldown: Duration,
    last_processed: Mutex<HashMap<UserId, Instant>>,
}

impl DebounceGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_processed: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the member for processing at `now`.
    ///
    /// Returns `false` inside the cooldown window, leaving the recorded time
    /// untouched so the window is not extended.
    pub fn try_acquire_at(&self, member: UserId, now: Instant) -> bool {
        let mut last = self
            .last_processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(prev) = last.get(&member) {
            if now.saturating_duration_since(*prev) < self.cooldown {
                return false;
            }
        }
        last.insert(member, now);
        true
    }

    pub fn try_acquire(&self, member: UserId) -> bool {
        self.try_acquire_at(member, Instant::now())
    }

    pub fn tracked(&self) -> usize {
        self.last_processed
            .lock()
            .map(|m| m.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}
