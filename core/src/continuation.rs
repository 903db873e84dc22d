//! Conversation-mode continuation: resume a paused thread with a new
//! message.
//!
//! Lifecycle: `running → paused → running → paused → ... → completed`.
//! Continuation is valid from `paused` only; completed threads are
//! terminal. The conversation is rebuilt from the transcript, the new
//! message is appended, and the loop re-enters with the cumulative cost.

use serde_json::Value;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::budget::BudgetLedger;
use crate::classifier::ErrorClassifier;
use crate::client::ProviderAdapter;
use crate::client::ProviderMessage;
use crate::client::ToolCall;
use crate::config::Config;
use crate::dispatch::ToolDispatcher;
use crate::error::Result;
use crate::error::RyeErr;
use crate::harness::SafetyHarness;
use crate::registry::ThreadRegistry;
use crate::runner::RunOutcome;
use crate::runner::ThreadRunner;
use crate::runner::ToolDef;
use crate::signing::Keypair;
use crate::state::load_metadata;
use crate::state::load_state;
use crate::state::save_metadata;
use crate::transcript::TranscriptWriter;
use rye_protocol::Awaiting;
use rye_protocol::EventType;
use rye_protocol::ThreadMode;
use rye_protocol::ThreadStatus;
use rye_protocol::TranscriptEvent;

/// Continue a paused conversation thread with a new user message.
pub async fn continue_thread<P: ProviderAdapter>(
    config: &Config,
    keypair: &Keypair,
    thread_id: &str,
    message: &str,
    provider: &P,
    dispatcher: &dyn ToolDispatcher,
    tool_defs: &[ToolDef],
) -> Result<RunOutcome> {
    let thread_dir = config.thread_dir(thread_id);
    let threads_dir = config.threads_dir();
    let mut meta = load_metadata(&thread_dir)?;

    if meta.thread_mode != ThreadMode::Conversation {
        return Err(RyeErr::InvalidContinuation {
            thread_id: thread_id.to_string(),
            reason: format!(
                "thread_mode is '{}', not 'conversation'; only conversation threads pause and resume",
                meta.thread_mode
            ),
        });
    }
    if meta.status != ThreadStatus::Paused {
        return Err(RyeErr::InvalidContinuation {
            thread_id: thread_id.to_string(),
            reason: format!(
                "status is '{}'; only paused threads can be continued",
                meta.status
            ),
        });
    }

    let state = load_state(&thread_dir)?;
    let transcript = TranscriptWriter::new(thread_id.to_string(), &thread_dir);

    // Resuming mid-conversation legitimately appends after the last
    // checkpoint, so verification runs lenient here.
    let store = crate::trust::TrustStore::new(config);
    let verification = transcript.verify(|fp| store.get_public_key(fp), true)?;
    if !verification.valid {
        return Err(RyeErr::Integrity(
            verification
                .error
                .unwrap_or_else(|| "transcript verification failed".to_string()),
        ));
    }

    let registry = ThreadRegistry::new(&threads_dir)?;
    let ledger = BudgetLedger::new(&threads_dir)?;

    meta.status = ThreadStatus::Running;
    meta.awaiting = None;
    meta.updated_at = now_iso();
    save_metadata(&thread_dir, &meta, keypair)?;
    registry.update_status(thread_id, ThreadStatus::Running)?;

    // Rebuild from the transcript as it stood at the pause, then append
    // the new message to both the conversation and the event log.
    let mut messages = rebuild_conversation(&transcript.read_events()?);
    messages.push(ProviderMessage::user(message));

    transcript.write_event(EventType::ThreadContinue, json!({"turn": state.cost.turns}))?;
    transcript.write_event(
        EventType::UserMessage,
        json!({"text": message, "role": "user", "directive": meta.directive}),
    )?;

    let harness = SafetyHarness::from_state(
        thread_id.to_string(),
        meta.directive.clone(),
        state.limits.clone(),
        state.hooks.clone(),
        state.capabilities.clone(),
        state.cancelled,
    );

    let classifier = ErrorClassifier::load(config);
    let runner = ThreadRunner {
        harness: &harness,
        provider,
        dispatcher,
        transcript: &transcript,
        registry: &registry,
        ledger: &ledger,
        keypair,
        classifier: &classifier,
        tool_defs,
        thread_dir: thread_dir.clone(),
        depth: 0,
        pause_on_complete: true,
    };

    info!(thread_id, "continuing conversation thread");
    let outcome = runner.run_loop(messages, state.cost).await?;

    meta.status = outcome.status;
    meta.turn_count = outcome.cost.turns;
    meta.cost = outcome.cost.clone();
    meta.awaiting = (outcome.status == ThreadStatus::Paused).then_some(Awaiting::User);
    meta.updated_at = now_iso();
    save_metadata(&thread_dir, &meta, keypair)?;

    Ok(outcome)
}

fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Reconstruct the provider conversation from transcript events.
pub fn rebuild_conversation(events: &[TranscriptEvent]) -> Vec<ProviderMessage> {
    let mut messages = Vec::new();
    for event in events {
        match event.event_type {
            EventType::UserMessage => {
                if let Some(text) = event.payload.get("text").and_then(Value::as_str) {
                    messages.push(ProviderMessage::user(text));
                }
            }
            EventType::CognitionOut => {
                let text = event
                    .payload
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                messages.push(ProviderMessage::assistant(text, Vec::new()));
            }
            EventType::ToolCallStart => {
                // Attach the call to the assistant message it belongs to.
                let call = ToolCall {
                    id: event
                        .payload
                        .get("call_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: event
                        .payload
                        .get("tool")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input: event.payload.get("input").cloned().unwrap_or(Value::Null),
                };
                if let Some(last) = messages.iter_mut().rev().find(|m| m.role == "assistant") {
                    last.tool_calls.push(call);
                }
            }
            EventType::ToolCallResult => {
                let call_id = event
                    .payload
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let output = event
                    .payload
                    .get("output")
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                messages.push(ProviderMessage::tool(call_id, output));
            }
            _ => {}
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn event(event_type: EventType, payload: Value) -> TranscriptEvent {
        TranscriptEvent {
            timestamp: 0.0,
            thread_id: "t-1".to_string(),
            event_type,
            payload,
        }
    }

    #[test]
    fn rebuild_orders_roles() {
        let events = vec![
            event(EventType::ThreadStart, json!({})),
            event(EventType::UserMessage, json!({"text": "hi"})),
            event(EventType::CognitionOut, json!({"text": "calling a tool"})),
            event(
                EventType::ToolCallStart,
                json!({"call_id": "c1", "tool": "rye_execute", "input": {"item_id": "x"}}),
            ),
            event(
                EventType::ToolCallResult,
                json!({"call_id": "c1", "output": {"status": "success"}}),
            ),
            event(EventType::CognitionOut, json!({"text": "done"})),
            event(EventType::Checkpoint, json!({})),
        ];
        let messages = rebuild_conversation(&events);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);
        assert_eq!(messages[1].tool_calls.len(), 1);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
    }
}
