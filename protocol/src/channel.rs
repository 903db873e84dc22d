use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// How member threads take turns in a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnProtocol {
    /// Only the current turn holder may write; writing advances the turn.
    #[default]
    RoundRobin,
    /// Any member may write at any time.
    OnDemand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMember {
    pub thread_id: String,
    pub directive: String,
}

/// Persistent channel state, serialized to
/// `{threads_dir}/{channel_id}/channel.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: String,
    pub members: Vec<ChannelMember>,
    #[serde(default)]
    pub turn_protocol: TurnProtocol,
    pub turn_order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_turn: Option<String>,
    #[serde(default)]
    pub turn_count: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl ChannelState {
    pub fn is_member(&self, thread_id: &str) -> bool {
        self.members.iter().any(|m| m.thread_id == thread_id)
    }

    /// The member after `thread_id` in round-robin order.
    pub fn next_after(&self, thread_id: &str) -> Option<&str> {
        let idx = self.turn_order.iter().position(|t| t == thread_id)?;
        let next = (idx + 1) % self.turn_order.len();
        self.turn_order.get(next).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    fn channel() -> ChannelState {
        ChannelState {
            channel_id: "ch-1".to_string(),
            members: vec![
                ChannelMember {
                    thread_id: "a".to_string(),
                    directive: "planner".to_string(),
                },
                ChannelMember {
                    thread_id: "b".to_string(),
                    directive: "critic".to_string(),
                },
            ],
            turn_protocol: TurnProtocol::RoundRobin,
            turn_order: vec!["a".to_string(), "b".to_string()],
            current_turn: Some("a".to_string()),
            turn_count: 0,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn round_robin_wraps() {
        let ch = channel();
        assert_eq!(ch.next_after("a"), Some("b"));
        assert_eq!(ch.next_after("b"), Some("a"));
        assert_eq!(ch.next_after("zzz"), None);
    }
}
