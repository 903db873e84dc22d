//! The thread runner: the outer LLM loop.
//!
//! Each turn: refresh elapsed time, check limits (dispatching `limit`
//! hooks), check cancellation, call the provider, account usage, route
//! every tool call through the harness and the dispatcher, run
//! `after_step` hooks, write a signed checkpoint, and persist harness
//! state. The loop ends on a terminal provider response, a terminating
//! hook action, a permanent error, or cancellation.

use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::budget::BudgetLedger;
use crate::classifier::ErrorClass;
use crate::classifier::ErrorClassifier;
use crate::client::CompletionResponse;
use crate::client::ProviderAdapter;
use crate::client::ProviderMessage;
use crate::dispatch::DispatchRequest;
use crate::dispatch::ToolDispatcher;
use crate::error::Result;
use crate::harness::SafetyHarness;
use crate::registry::ThreadRegistry;
use crate::signing::Keypair;
use crate::state::HarnessState;
use crate::state::save_state;
use crate::transcript::TranscriptWriter;
use rye_protocol::ControlAction;
use rye_protocol::Cost;
use rye_protocol::EventType;
use rye_protocol::ThreadStatus;

/// Ceiling on loop roundtrips, bounding pathological conversations that
/// never produce a terminal response.
pub const MAX_ROUNDTRIPS: u64 = 256;

/// The tool id that spawns child threads; calls to it get the parent's
/// context injected.
pub const THREAD_DIRECTIVE_TOOL: &str = "rye/agent/threads/thread_directive";

/// A tool schema exposed to the model, mapping the model-visible name back
/// to the item id the dispatcher resolves.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub item_id: String,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub thread_id: String,
    pub status: ThreadStatus,
    pub success: bool,
    pub text: String,
    pub error: Option<String>,
    pub cost: Cost,
}

pub struct ThreadRunner<'a, P: ProviderAdapter> {
    pub harness: &'a SafetyHarness,
    pub provider: &'a P,
    pub dispatcher: &'a dyn ToolDispatcher,
    pub transcript: &'a TranscriptWriter,
    pub registry: &'a ThreadRegistry,
    pub ledger: &'a BudgetLedger,
    pub keypair: &'a Keypair,
    pub classifier: &'a ErrorClassifier,
    pub tool_defs: &'a [ToolDef],
    pub thread_dir: std::path::PathBuf,
    /// Depth of this thread below the root, for child-spawn injection.
    pub depth: u64,
    /// Conversation-mode threads pause on a terminal response instead of
    /// completing; the budget reservation stays live across the pause.
    pub pause_on_complete: bool,
}

impl<'a, P: ProviderAdapter> ThreadRunner<'a, P> {
    /// Build the first user message: `thread_started` context-injection
    /// hooks wrap the prompt with their before/after blocks.
    pub async fn build_first_message(&self, user_prompt: &str) -> Result<ProviderMessage> {
        let context = json!({
            "directive": self.harness.directive_name,
            "model": self.provider.model(),
            "limits": self.harness.limits,
        });
        let hook_context = self
            .harness
            .run_hooks_context("thread_started", &context, self.dispatcher)
            .await?;

        let mut parts: Vec<String> = Vec::new();
        if !hook_context.before.is_empty() {
            parts.push(hook_context.before);
        }
        parts.push(user_prompt.to_string());
        if !hook_context.after.is_empty() {
            parts.push(hook_context.after);
        }
        Ok(ProviderMessage::user(parts.join("\n\n")))
    }

    /// Run the loop over an existing conversation until a terminal
    /// condition. `cost` carries over across continuations.
    pub async fn run_loop(
        &self,
        mut messages: Vec<ProviderMessage>,
        mut cost: Cost,
    ) -> Result<RunOutcome> {
        let thread_id = self.harness.thread_id.clone();
        let started = Instant::now();
        let elapsed_base = cost.elapsed_seconds;
        let tool_schemas: Vec<Value> = self.tool_defs.iter().map(|t| t.schema.clone()).collect();
        let mut roundtrips = 0u64;

        let outcome = loop {
            roundtrips += 1;
            if roundtrips > MAX_ROUNDTRIPS {
                break self.finalize(
                    &mut cost,
                    FinishState::error(format!("roundtrip ceiling ({MAX_ROUNDTRIPS}) reached")),
                )?;
            }

            // Pre-turn: limits, then cancellation.
            cost.elapsed_seconds = elapsed_base + started.elapsed().as_secs_f64();
            if let Some(limit) = self.harness.check_limits(&cost) {
                let context = json!({"event": limit, "cost": cost});
                let action = self
                    .harness
                    .run_hooks("limit", &context, self.dispatcher)
                    .await?;
                let state = match action {
                    Some(action) if action.is_terminating() => control_to_finish(action),
                    _ => FinishState::error(format!(
                        "limit exceeded: {} ({} >= {})",
                        limit.limit_code, limit.current_value, limit.current_max
                    )),
                };
                break self.finalize(&mut cost, state)?;
            }

            if self.harness.is_cancelled() {
                break self.finalize(&mut cost, FinishState::cancelled())?;
            }

            // Provider call.
            if let Some(last) = messages.last() {
                self.transcript.write_event(
                    EventType::CognitionIn,
                    json!({"role": last.role, "text": last.content}),
                )?;
            }
            self.transcript
                .write_event(EventType::StepStart, json!({"turn": cost.turns + 1}))?;

            let response = match self.provider.create_completion(&messages, &tool_schemas).await {
                Ok(response) => response,
                Err(e) => match self.handle_provider_error(&mut cost, &e).await? {
                    ErrorDisposition::Retry(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    ErrorDisposition::Finish(state) => break self.finalize(&mut cost, state)?,
                },
            };

            cost.record_turn(response.input_tokens, response.output_tokens, response.spend);
            if response.spend > 0.0 {
                match self.ledger.increment_actual(&thread_id, response.spend) {
                    Ok(()) => {}
                    Err(e @ crate::error::RyeErr::BudgetOverspend { .. }) => {
                        break self.finalize(&mut cost, FinishState::error(e.to_string()))?;
                    }
                    Err(other) => return Err(other),
                }
            }
            self.registry
                .update_cost_snapshot(&self.harness.thread_id, &cost)?;
            self.emit_response_events(&response)?;

            // Terminal response: no tool calls.
            if response.tool_calls.is_empty() {
                self.transcript.write_event(
                    EventType::StepFinish,
                    json!({"turn": cost.turns, "finish_reason": "end_turn"}),
                )?;
                break self.finalize(&mut cost, FinishState::completed(response.text))?;
            }

            messages.push(ProviderMessage::assistant(
                response.text.clone(),
                response.tool_calls.clone(),
            ));

            // Tool calls are processed strictly in order: conversation
            // state depends on the ordering.
            for call in &response.tool_calls {
                let result_message = self.dispatch_tool_call(call).await?;
                messages.push(result_message);
            }

            self.transcript.write_event(
                EventType::StepFinish,
                json!({"turn": cost.turns, "finish_reason": "tool_use"}),
            )?;

            let after_context = json!({"cost": cost, "thread_id": thread_id});
            if let Some(action) = self
                .harness
                .run_hooks("after_step", &after_context, self.dispatcher)
                .await?
            {
                if action.is_terminating() {
                    break self.finalize(&mut cost, control_to_finish(action))?;
                }
            }

            self.turn_boundary(&cost)?;
        };

        Ok(outcome)
    }

    /// Checkpoint the transcript and persist harness state atomically.
    fn turn_boundary(&self, cost: &Cost) -> Result<()> {
        self.transcript.checkpoint(cost.turns, self.keypair)?;
        let transcript_offset = std::fs::metadata(self.transcript.path())
            .map(|m| m.len())
            .unwrap_or(0);
        save_state(
            &self.thread_dir,
            &HarnessState {
                capabilities: self.harness.capabilities().to_vec(),
                cost: cost.clone(),
                limits: self.harness.limits.clone(),
                hooks: self.harness.hooks().to_vec(),
                cancelled: self.harness.is_cancelled(),
                transcript_offset,
            },
        )
    }

    fn emit_response_events(&self, response: &CompletionResponse) -> Result<()> {
        self.transcript.write_event(
            EventType::CognitionOut,
            json!({
                "text": response.text,
                "model": self.provider.model(),
                "input_tokens": response.input_tokens,
                "output_tokens": response.output_tokens,
            }),
        )?;
        if let Some(reasoning) = &response.reasoning {
            self.transcript
                .write_event(EventType::AssistantReasoning, json!({"text": reasoning}))?;
        }
        if !response.text.is_empty() {
            self.transcript
                .write_event(EventType::AssistantText, json!({"text": response.text}))?;
        }
        Ok(())
    }

    /// Permission-check then dispatch one tool call, returning the `tool`
    /// message to append. Denials become tool errors fed back to the
    /// model, never raised.
    async fn dispatch_tool_call(&self, call: &crate::client::ToolCall) -> Result<ProviderMessage> {
        self.transcript.write_event(
            EventType::ToolCallStart,
            json!({"tool": call.name, "call_id": call.id, "input": call.input}),
        )?;

        // rye_execute -> execute, rye_search -> search, ...
        let primary = call
            .name
            .strip_prefix("rye_")
            .unwrap_or(&call.name)
            .to_string();
        let item_type = call
            .input
            .get("item_type")
            .and_then(Value::as_str)
            .unwrap_or("tool")
            .to_string();
        let item_id = call
            .input
            .get("item_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(denied) = self.harness.check_permission(&primary, &item_type, &item_id) {
            warn!(tool = %call.name, %item_id, "tool call denied");
            let denied_json = serde_json::to_value(&denied)?;
            self.transcript.write_event(
                EventType::ToolCallResult,
                json!({"call_id": call.id, "output": denied_json, "error": denied.error}),
            )?;
            return Ok(ProviderMessage::tool(
                call.id.clone(),
                denied_json.to_string(),
            ));
        }

        let resolved_id = self
            .tool_defs
            .iter()
            .find(|t| t.name == call.name)
            .map(|t| t.item_id.clone())
            .unwrap_or_else(|| item_id.clone());

        let mut params = call
            .input
            .get("params")
            .cloned()
            .unwrap_or_else(|| call.input.clone());
        if resolved_id == THREAD_DIRECTIVE_TOOL {
            if let Some(obj) = params.as_object_mut() {
                obj.entry("parent_thread_id")
                    .or_insert_with(|| Value::String(self.harness.thread_id.clone()));
                obj.entry("parent_depth").or_insert_with(|| json!(self.depth));
                obj.entry("parent_limits")
                    .or_insert_with(|| json!(self.harness.limits));
                obj.entry("parent_capabilities")
                    .or_insert_with(|| json!(self.harness.capabilities()));
            }
        }

        let result = self
            .dispatcher
            .dispatch(DispatchRequest {
                primary,
                item_type,
                item_id: resolved_id,
                params,
            })
            .await;

        let clean = match result {
            Ok(value) => clean_tool_result(value),
            // Child-thread and tool errors propagate through the result the
            // model sees; parents decide via their own hooks.
            Err(e) => json!({"status": "error", "error": e.to_string()}),
        };

        self.transcript.write_event(
            EventType::ToolCallResult,
            json!({"call_id": call.id, "output": clean}),
        )?;
        Ok(ProviderMessage::tool(call.id.clone(), clean.to_string()))
    }

    async fn handle_provider_error(
        &self,
        cost: &mut Cost,
        e: &crate::error::RyeErr,
    ) -> Result<ErrorDisposition> {
        let message = e.to_string();
        error!(thread_id = %self.harness.thread_id, "provider call failed: {message}");
        let classification = self.classifier.classify(&message);

        let context = json!({
            "error": {"message": message, "kind": e.kind()},
            "classification": {
                "retryable": classification.class == ErrorClass::Retryable,
                "pattern": classification.matched_pattern,
            },
        });
        let hook_action = self
            .harness
            .run_hooks("error", &context, self.dispatcher)
            .await?;

        if let Some(action) = hook_action {
            return Ok(match action {
                ControlAction::Retry { .. } => {
                    ErrorDisposition::Retry(classification.retry.delay(cost.turns + 1))
                }
                other if other.is_terminating() => {
                    // Hooks may decorate the failure but never blank the
                    // original message.
                    let mut state = control_to_finish(other);
                    if state.error.is_none() {
                        state.error = Some(message);
                    }
                    ErrorDisposition::Finish(state)
                }
                _ => ErrorDisposition::Finish(FinishState::error(message)),
            });
        }

        if classification.class == ErrorClass::Retryable
            && cost.turns < classification.retry.max_attempts
        {
            return Ok(ErrorDisposition::Retry(
                classification.retry.delay(cost.turns + 1),
            ));
        }
        Ok(ErrorDisposition::Finish(FinishState::error(message)))
    }

    /// Emit the terminal event, release the budget reservation, and record
    /// the terminal status in the registry.
    fn finalize(&self, cost: &mut Cost, mut state: FinishState) -> Result<RunOutcome> {
        let thread_id = self.harness.thread_id.clone();
        if self.pause_on_complete && state.status == ThreadStatus::Completed {
            state.status = ThreadStatus::Paused;
        }
        let event_type = match state.status {
            ThreadStatus::Completed => EventType::ThreadComplete,
            ThreadStatus::Cancelled => EventType::ThreadCancelled,
            ThreadStatus::Paused => EventType::ThreadPaused,
            _ => EventType::ThreadError,
        };
        self.transcript.write_event(
            event_type,
            json!({"cost": cost, "error": state.error, "status": state.status.to_string()}),
        )?;
        // The terminal event is part of the signed prefix: checkpoint after
        // writing it so completed transcripts verify strictly.
        self.turn_boundary(cost)?;

        if state.status != ThreadStatus::Paused {
            self.ledger.release(&thread_id, &state.status.to_string())?;
        }
        self.registry.update_cost_snapshot(&thread_id, cost)?;
        self.registry.update_status(&thread_id, state.status)?;

        debug!(%thread_id, status = %state.status, turns = cost.turns, "thread finalized");
        Ok(RunOutcome {
            thread_id,
            status: state.status,
            success: state.status == ThreadStatus::Completed
                || state.status == ThreadStatus::Paused,
            text: state.text,
            error: state.error,
            cost: cost.clone(),
        })
    }
}

enum ErrorDisposition {
    Retry(std::time::Duration),
    Finish(FinishState),
}

struct FinishState {
    status: ThreadStatus,
    text: String,
    error: Option<String>,
}

impl FinishState {
    fn completed(text: String) -> Self {
        Self {
            status: ThreadStatus::Completed,
            text,
            error: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            status: ThreadStatus::Cancelled,
            text: String::new(),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: ThreadStatus::Error,
            text: String::new(),
            error: Some(message),
        }
    }
}

fn control_to_finish(action: ControlAction) -> FinishState {
    match action {
        ControlAction::Abort { payload } | ControlAction::Fail { payload } => FinishState {
            status: ThreadStatus::Error,
            text: String::new(),
            error: payload
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        ControlAction::Suspend { .. } => FinishState {
            status: ThreadStatus::Paused,
            text: String::new(),
            error: None,
        },
        ControlAction::Escalate { payload } => FinishState {
            status: ThreadStatus::Error,
            text: String::new(),
            error: Some(
                payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("escalated")
                    .to_string(),
            ),
        },
        ControlAction::Retry { .. } | ControlAction::Continue | ControlAction::Skip => {
            FinishState {
                status: ThreadStatus::Error,
                text: String::new(),
                error: Some("non-terminating control action at finalize".to_string()),
            }
        }
    }
}

/// Strip the execution envelope (`chain`, `metadata`, `resolved_env_keys`)
/// so the model-visible output stays lean, unwrapping primary-tool
/// envelopes to the inner result.
pub fn clean_tool_result(result: Value) -> Value {
    fn strip(value: Value) -> Value {
        match value {
            Value::Object(mut map) => {
                map.remove("chain");
                map.remove("metadata");
                map.remove("resolved_env_keys");
                Value::Object(map)
            }
            other => other,
        }
    }

    let is_primary_envelope = result
        .get("item_id")
        .and_then(Value::as_str)
        .is_some_and(|id| id.starts_with("rye/primary-tools/"));
    if is_primary_envelope {
        if let Some(inner) = result.get("data").cloned() {
            return strip(inner);
        }
    }
    strip(result)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clean_strips_envelope_fields() {
        let raw = json!({
            "status": "success",
            "data": {"x": 1},
            "chain": [{"item_id": "a"}],
            "metadata": {"duration_ms": 4},
        });
        let clean = clean_tool_result(raw);
        assert_eq!(clean, json!({"status": "success", "data": {"x": 1}}));
    }

    #[test]
    fn clean_unwraps_primary_tool_envelope() {
        let raw = json!({
            "status": "success",
            "item_id": "rye/primary-tools/rye_execute",
            "data": {"result": 7, "chain": ["x"]},
        });
        let clean = clean_tool_result(raw);
        assert_eq!(clean, json!({"result": 7}));
    }

    #[test]
    fn control_actions_map_to_statuses() {
        let abort = control_to_finish(ControlAction::Abort {
            payload: json!({"reason": "spend limit"}),
        });
        assert_eq!(abort.status, ThreadStatus::Error);
        assert_eq!(abort.error.as_deref(), Some("spend limit"));

        let suspend = control_to_finish(ControlAction::Suspend { payload: json!({}) });
        assert_eq!(suspend.status, ThreadStatus::Paused);
    }
}
