use std::collections::BTreeSet;
use std::time::Duration;

use ekko_core::domain::conversation::UserId;

use crate::cooldown::{display_seconds, CooldownDecision, CooldownTracker};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayDecision {
    Relay,
    Ignore { reason_code: &'static str },
    Throttle { remaining: Duration, user_message: String },
}

/// Decides whether an inbound chat message reaches the completion pipeline.
#[derive(Debug)]
pub struct RelayPolicy {
    target_channels: BTreeSet<String>,
    cooldown: CooldownTracker,
}

impl RelayPolicy {
    pub fn new(target_channels: impl IntoIterator<Item = String>, cooldown: Duration) -> Self {
        Self {
            target_channels: target_channels
                .into_iter()
                .map(|channel| channel.trim().to_string())
                .filter(|channel| !channel.is_empty())
                .collect(),
            cooldown: CooldownTracker::new(cooldown),
        }
    }

    pub fn target_channels(&self) -> impl Iterator<Item = &str> {
        self.target_channels.iter().map(String::as_str)
    }

    pub fn is_target_channel(&self, channel_name: &str) -> bool {
        self.target_channels.contains(channel_name)
    }

    /// Channel filter, then empty-message filter, then the per-user
    /// cooldown. Ignored messages never consume the user's cooldown.
    pub fn evaluate(
        &self,
        channel_name: &str,
        user_id: &UserId,
        text: &str,
        has_images: bool,
    ) -> RelayDecision {
        if !self.is_target_channel(channel_name) {
            return RelayDecision::Ignore { reason_code: "channel_not_targeted" };
        }

        if text.trim().is_empty() && !has_images {
            return RelayDecision::Ignore { reason_code: "empty_message" };
        }

        match self.cooldown.check_and_record(user_id) {
            CooldownDecision::Ready => RelayDecision::Relay,
            CooldownDecision::Wait(remaining) => RelayDecision::Throttle {
                remaining,
                user_message: format!("⏳ Chờ {}s.", display_seconds(remaining)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ekko_core::domain::conversation::UserId;

    use super::{RelayDecision, RelayPolicy};

    fn policy() -> RelayPolicy {
        RelayPolicy::new(vec!["hoi-dap".to_string(), " ".to_string()], Duration::from_secs(2))
    }

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn messages_outside_target_channels_are_ignored() {
        let decision = policy().evaluate("chung", &user("a"), "Xin chào", false);
        assert_eq!(decision, RelayDecision::Ignore { reason_code: "channel_not_targeted" });
    }

    #[tokio::test(start_paused = true)]
    async fn empty_messages_without_images_are_ignored_and_do_not_start_cooldown() {
        let policy = policy();

        assert_eq!(
            policy.evaluate("hoi-dap", &user("a"), "   ", false),
            RelayDecision::Ignore { reason_code: "empty_message" }
        );
        assert_eq!(policy.evaluate("hoi-dap", &user("a"), "", true), RelayDecision::Relay);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_second_message_is_throttled_with_countdown() {
        let policy = policy();

        assert_eq!(policy.evaluate("hoi-dap", &user("a"), "một", false), RelayDecision::Relay);
        tokio::time::advance(Duration::from_millis(300)).await;

        let decision = policy.evaluate("hoi-dap", &user("a"), "hai", false);
        assert_eq!(
            decision,
            RelayDecision::Throttle {
                remaining: Duration::from_millis(1_700),
                user_message: "⏳ Chờ 2s.".to_string(),
            }
        );
    }

    #[test]
    fn blank_channel_names_are_dropped() {
        let policy = policy();
        assert_eq!(policy.target_channels().collect::<Vec<_>>(), vec!["hoi-dap"]);
    }
}
