//! Thread channels: multi-agent turn-based coordination over a shared
//! transcript.
//!
//! A channel is a directory `{threads_dir}/{channel_id}/` holding
//! `channel.json` (state) and `transcript.jsonl` (merged events). Write
//! permission depends on the turn protocol: round-robin admits only the
//! current turn holder and advances the turn on write; on-demand admits
//! any member.

use std::path::Path;
use std::path::PathBuf;

use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::error::Result;
use crate::error::RyeErr;
use crate::state::write_json_atomic;
use crate::transcript::TranscriptWriter;
use rye_protocol::ChannelMember;
use rye_protocol::ChannelState;
use rye_protocol::EventType;
use rye_protocol::TurnProtocol;

const CHANNEL_FILE: &str = "channel.json";

fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn channel_dir(threads_dir: &Path, channel_id: &str) -> PathBuf {
    threads_dir.join(channel_id)
}

/// Create a channel with the given members. Turn order follows member
/// order; the first member holds the first turn.
pub fn create_channel(
    threads_dir: &Path,
    channel_id: &str,
    members: Vec<ChannelMember>,
    turn_protocol: TurnProtocol,
) -> Result<ChannelState> {
    if members.is_empty() {
        return Err(RyeErr::Channel(
            "channel must have at least one member".to_string(),
        ));
    }

    let turn_order: Vec<String> = members.iter().map(|m| m.thread_id.clone()).collect();
    let now = now_iso();
    let state = ChannelState {
        channel_id: channel_id.to_string(),
        members,
        turn_protocol,
        current_turn: turn_order.first().cloned(),
        turn_order,
        turn_count: 0,
        created_at: now.clone(),
        updated_at: now,
    };

    let dir = channel_dir(threads_dir, channel_id);
    write_json_atomic(&dir.join(CHANNEL_FILE), &state)?;
    info!(channel_id, protocol = %state.turn_protocol, "channel created");
    Ok(state)
}

pub fn get_channel_state(threads_dir: &Path, channel_id: &str) -> Result<ChannelState> {
    let path = channel_dir(threads_dir, channel_id).join(CHANNEL_FILE);
    if !path.is_file() {
        return Err(RyeErr::Channel(format!("channel not found: {channel_id}")));
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Append a message to the channel transcript after a write-permission
/// check. Round-robin advances `current_turn` and bumps `turn_count`;
/// state persists atomically.
pub fn write_to_channel(
    threads_dir: &Path,
    channel_id: &str,
    origin_thread_id: &str,
    message: &str,
) -> Result<ChannelState> {
    let mut state = get_channel_state(threads_dir, channel_id)?;

    if !state.is_member(origin_thread_id) {
        return Err(RyeErr::Channel(format!(
            "'{origin_thread_id}' is not a member of channel '{channel_id}'"
        )));
    }
    if state.turn_protocol == TurnProtocol::RoundRobin
        && state.current_turn.as_deref() != Some(origin_thread_id)
    {
        return Err(RyeErr::Channel(format!(
            "not '{origin_thread_id}'s turn in channel '{channel_id}' (current: {})",
            state.current_turn.as_deref().unwrap_or("none")
        )));
    }

    let dir = channel_dir(threads_dir, channel_id);
    let transcript = TranscriptWriter::new(channel_id.to_string(), &dir);
    transcript.write_event(
        EventType::UserMessage,
        json!({
            "text": message,
            "origin": origin_thread_id,
            "at": now_iso(),
        }),
    )?;

    if state.turn_protocol == TurnProtocol::RoundRobin {
        state.current_turn = state.next_after(origin_thread_id).map(str::to_string);
        state.turn_count += 1;
    }
    state.updated_at = now_iso();
    write_json_atomic(&dir.join(CHANNEL_FILE), &state)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn members() -> Vec<ChannelMember> {
        vec![
            ChannelMember {
                thread_id: "planner".to_string(),
                directive: "plan".to_string(),
            },
            ChannelMember {
                thread_id: "critic".to_string(),
                directive: "review".to_string(),
            },
        ]
    }

    #[test]
    fn round_robin_enforces_and_advances_turns() {
        let tmp = tempfile::tempdir().unwrap();
        create_channel(tmp.path(), "ch-1", members(), TurnProtocol::RoundRobin).unwrap();

        // Out of turn: rejected.
        let err = write_to_channel(tmp.path(), "ch-1", "critic", "me first").unwrap_err();
        assert!(err.to_string().contains("not 'critic's turn"));

        let state = write_to_channel(tmp.path(), "ch-1", "planner", "plan: do X").unwrap();
        assert_eq!(state.current_turn.as_deref(), Some("critic"));
        assert_eq!(state.turn_count, 1);

        let state = write_to_channel(tmp.path(), "ch-1", "critic", "X is risky").unwrap();
        assert_eq!(state.current_turn.as_deref(), Some("planner"));
        assert_eq!(state.turn_count, 2);
    }

    #[test]
    fn on_demand_admits_any_member() {
        let tmp = tempfile::tempdir().unwrap();
        create_channel(tmp.path(), "ch-2", members(), TurnProtocol::OnDemand).unwrap();
        write_to_channel(tmp.path(), "ch-2", "critic", "jumping in").unwrap();
        let state = write_to_channel(tmp.path(), "ch-2", "planner", "fine").unwrap();
        // On-demand never advances the counter.
        assert_eq!(state.turn_count, 0);
    }

    #[test]
    fn non_members_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        create_channel(tmp.path(), "ch-3", members(), TurnProtocol::OnDemand).unwrap();
        let err = write_to_channel(tmp.path(), "ch-3", "stranger", "hi").unwrap_err();
        assert!(err.to_string().contains("not a member"));
    }

    #[test]
    fn messages_carry_origin_and_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        create_channel(tmp.path(), "ch-4", members(), TurnProtocol::RoundRobin).unwrap();
        write_to_channel(tmp.path(), "ch-4", "planner", "hello").unwrap();

        let transcript = TranscriptWriter::new("ch-4".to_string(), &tmp.path().join("ch-4"));
        let events = transcript.read_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["origin"], "planner");
        assert!(events[0].payload["at"].as_str().is_some());
    }

    #[test]
    fn empty_channel_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let err =
            create_channel(tmp.path(), "ch-5", Vec::new(), TurnProtocol::RoundRobin).unwrap_err();
        assert!(matches!(err, RyeErr::Channel(_)));
    }
}
