use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use ekko_core::domain::conversation::UserId;

const PRUNE_THRESHOLD: usize = 1_024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownDecision {
    Ready,
    Wait(Duration),
}

/// Per-user minimum spacing between relayed messages.
#[derive(Debug)]
pub struct CooldownTracker {
    window: Duration,
    last_call: Mutex<HashMap<UserId, Instant>>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self { window, last_call: Mutex::new(HashMap::new()) }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check-and-set under one lock. A throttled call does not push the
    /// user's window forward.
    pub fn check_and_record(&self, user_id: &UserId) -> CooldownDecision {
        let now = Instant::now();
        let mut last_call = self.last_call.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = last_call.get(user_id) {
            let elapsed = now.saturating_duration_since(*previous);
            if elapsed < self.window {
                return CooldownDecision::Wait(self.window - elapsed);
            }
        }

        if last_call.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            last_call.retain(|_, previous| now.saturating_duration_since(*previous) < window);
        }
        last_call.insert(user_id.clone(), now);
        CooldownDecision::Ready
    }

    pub fn tracked_users(&self) -> usize {
        self.last_call.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Whole seconds shown to a throttled user, always at least one.
pub fn display_seconds(remaining: Duration) -> u64 {
    remaining.as_secs() + 1
}
