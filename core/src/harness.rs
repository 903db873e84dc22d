//! Per-thread safety harness: limits, hooks, cancellation, permissions.
//!
//! NOT an execution engine. It checks limits, evaluates hook conditions,
//! and enforces directive permissions on tool calls. Capability attenuation
//! happens once at construction; the operative set is immutable afterward.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::capability;
use crate::capability::INTERNAL_TOOL_PREFIX;
use crate::dispatch::DispatchRequest;
use crate::dispatch::ToolDispatcher;
use crate::error::Result;
use crate::expr::condition_matches;
use crate::interpolate::interpolate_action;
use rye_protocol::ControlAction;
use rye_protocol::Cost;
use rye_protocol::Hook;
use rye_protocol::HookLayer;
use rye_protocol::HookPosition;
use rye_protocol::Limits;

/// A denied permission check, fed back to the model as a tool error.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeniedRecord {
    pub error: String,
    pub denied_action: String,
    pub denied_item_type: String,
    pub denied_item_id: String,
}

/// An exceeded limit, translated into a `limit` event.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LimitRecord {
    pub limit_code: String,
    pub current_value: f64,
    pub current_max: f64,
}

/// Context blocks collected from context-injection hooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookContext {
    pub before: String,
    pub after: String,
    pub before_raw: Vec<Value>,
    pub after_raw: Vec<Value>,
}

pub struct SafetyHarness {
    pub thread_id: String,
    pub directive_name: String,
    pub limits: Limits,
    hooks: Vec<Hook>,
    capabilities: Vec<String>,
    cancelled: AtomicBool,
}

impl SafetyHarness {
    /// Construct the harness, attenuating declared permissions against the
    /// parent's capability set. With nothing declared anywhere the harness
    /// is fail-closed.
    pub fn new(
        thread_id: impl Into<String>,
        directive_name: impl Into<String>,
        limits: Limits,
        hooks: Vec<Hook>,
        permissions: &[String],
        parent_capabilities: Option<&[String]>,
    ) -> Self {
        let child_caps: Vec<String> = permissions
            .iter()
            .map(|p| capability::normalize_cap(p))
            .collect();
        let parent_caps: Vec<String> = parent_capabilities
            .unwrap_or_default()
            .iter()
            .map(|c| capability::normalize_cap(c))
            .collect();
        let capabilities = capability::attenuate(&child_caps, &parent_caps);

        Self {
            thread_id: thread_id.into(),
            directive_name: directive_name.into(),
            limits,
            hooks,
            capabilities,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Restore a harness from persisted state (conversation resume).
    pub fn from_state(
        thread_id: impl Into<String>,
        directive_name: impl Into<String>,
        limits: Limits,
        hooks: Vec<Hook>,
        capabilities: Vec<String>,
        cancelled: bool,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            directive_name: directive_name.into(),
            limits,
            hooks,
            capabilities,
            cancelled: AtomicBool::new(cancelled),
        }
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    /// Check whether an action is permitted. Returns `None` when allowed.
    ///
    /// With no capabilities declared every action is denied, except tools
    /// under the internal prefix which the harness itself depends on.
    /// `search` carries no item id and is checked as `rye.search.<type>`.
    pub fn check_permission(
        &self,
        primary: &str,
        item_type: &str,
        item_id: &str,
    ) -> Option<DeniedRecord> {
        if !item_id.is_empty() && item_id.starts_with(INTERNAL_TOOL_PREFIX) {
            return None;
        }

        if self.capabilities.is_empty() {
            let target = if item_id.is_empty() { item_type } else { item_id };
            return Some(DeniedRecord {
                error: format!(
                    "Permission denied: no capabilities declared. Cannot {primary} {item_type} '{target}'"
                ),
                denied_action: primary.to_string(),
                denied_item_type: item_type.to_string(),
                denied_item_id: item_id.to_string(),
            });
        }

        let required = if item_id.is_empty() {
            capability::search_cap(item_type)
        } else {
            capability::item_id_to_cap(primary, item_type, item_id)
        };

        if capability::check_capability(&self.capabilities, &required) {
            return None;
        }

        Some(DeniedRecord {
            error: format!(
                "Permission denied: '{required}' not covered by capabilities {:?}",
                self.capabilities
            ),
            denied_action: primary.to_string(),
            denied_item_type: item_type.to_string(),
            denied_item_id: item_id.to_string(),
        })
    }

    /// Check all limits against the accumulator. The first exceeded limit
    /// wins, in declaration order: turns, tokens, spend, duration.
    pub fn check_limits(&self, cost: &Cost) -> Option<LimitRecord> {
        let checks: [(&str, f64, Option<f64>); 4] = [
            ("turns", cost.turns as f64, self.limits.turns.map(|v| v as f64)),
            (
                "tokens",
                cost.total_tokens() as f64,
                self.limits.tokens.map(|v| v as f64),
            ),
            ("spend", cost.spend, self.limits.spend),
            (
                "duration_seconds",
                cost.elapsed_seconds,
                self.limits.duration_seconds.map(|v| v as f64),
            ),
        ];
        for (code, current, maximum) in checks {
            if let Some(maximum) = maximum {
                if current >= maximum {
                    return Some(LimitRecord {
                        limit_code: format!("{code}_exceeded"),
                        current_value: current,
                        current_max: maximum,
                    });
                }
            }
        }
        None
    }

    /// All actions a hook fires: inline actions, or the referenced
    /// directive executed under this thread's attenuated capabilities.
    fn hook_actions(hook: &Hook) -> Vec<rye_protocol::HookAction> {
        let mut actions: Vec<rye_protocol::HookAction> =
            hook.all_actions().into_iter().cloned().collect();
        if actions.is_empty() {
            if let Some(directive) = &hook.directive {
                actions.push(rye_protocol::HookAction {
                    primary: "execute".to_string(),
                    item_type: "directive".to_string(),
                    item_id: directive.clone(),
                    params: Value::Null,
                });
            }
        }
        actions
    }

    /// Evaluate hooks for control-flow events (`error`, `limit`,
    /// `after_step`, custom events).
    ///
    /// Layer 1 and 2 hooks short-circuit on the first terminating control
    /// action; layer 3 (infra) hooks always run and never steer.
    pub async fn run_hooks(
        &self,
        event: &str,
        context: &Value,
        dispatcher: &dyn ToolDispatcher,
    ) -> Result<Option<ControlAction>> {
        let mut control: Option<ControlAction> = None;

        for hook in &self.hooks {
            if hook.event != event {
                continue;
            }
            if !condition_matches(hook.condition.as_deref(), context)? {
                continue;
            }

            for action in Self::hook_actions(hook) {
                let interpolated = interpolate_action(&action, context);
                let result = dispatcher
                    .dispatch(DispatchRequest {
                        primary: interpolated.primary.clone(),
                        item_type: interpolated.item_type.clone(),
                        item_id: interpolated.item_id.clone(),
                        params: interpolated.params.clone(),
                    })
                    .await;

                let value = match result {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(event, hook_item = %interpolated.item_id, "hook action failed: {e}");
                        continue;
                    }
                };

                if hook.layer == HookLayer::Infra {
                    continue;
                }
                if control.is_none() {
                    if let Some(action) = parse_control_action(&value) {
                        if action.is_terminating() {
                            debug!(event, ?action, "hook issued control action");
                            control = Some(action);
                        }
                    }
                }
            }

            // First terminating layer-1/2 action wins, but infra hooks for
            // this event must still run.
            if control.is_some() && hook.layer != HookLayer::Infra {
                let infra_remaining: Vec<&Hook> = self
                    .hooks
                    .iter()
                    .filter(|h| h.event == event && h.layer == HookLayer::Infra)
                    .collect();
                for infra in infra_remaining {
                    if !condition_matches(infra.condition.as_deref(), context)? {
                        continue;
                    }
                    for action in infra.all_actions() {
                        let interpolated = interpolate_action(action, context);
                        if let Err(e) = dispatcher
                            .dispatch(DispatchRequest {
                                primary: interpolated.primary.clone(),
                                item_type: interpolated.item_type.clone(),
                                item_id: interpolated.item_id.clone(),
                                params: interpolated.params.clone(),
                            })
                            .await
                        {
                            warn!(event, "infra hook failed: {e}");
                        }
                    }
                }
                break;
            }
        }

        Ok(control)
    }

    /// Context-injection variant used at `thread_started` and
    /// `thread_continued`: every matching hook runs (no short-circuit), and
    /// loaded content is collected into XML-wrapped blocks segregated by
    /// position.
    pub async fn run_hooks_context(
        &self,
        event: &str,
        context: &Value,
        dispatcher: &dyn ToolDispatcher,
    ) -> Result<HookContext> {
        let mut before_blocks: Vec<String> = Vec::new();
        let mut after_blocks: Vec<String> = Vec::new();
        let mut out = HookContext::default();

        for hook in &self.hooks {
            if hook.event != event {
                continue;
            }
            if !condition_matches(hook.condition.as_deref(), context)? {
                continue;
            }

            for action in Self::hook_actions(hook) {
                let interpolated = interpolate_action(&action, context);
                let result = dispatcher
                    .dispatch(DispatchRequest {
                        primary: interpolated.primary.clone(),
                        item_type: interpolated.item_type.clone(),
                        item_id: interpolated.item_id.clone(),
                        params: interpolated.params.clone(),
                    })
                    .await;

                let value = match result {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(event, hook_item = %interpolated.item_id, "context hook failed: {e}");
                        continue;
                    }
                };
                if value.get("status").and_then(Value::as_str) != Some("success") {
                    continue;
                }

                let content = extract_content(&value);
                if content.is_empty() {
                    continue;
                }
                let tag = if interpolated.item_type.is_empty() {
                    "context"
                } else {
                    &interpolated.item_type
                };
                let block = format!(
                    "<{tag} id=\"{}\">\n{}\n</{tag}>",
                    interpolated.item_id,
                    content.trim()
                );
                let raw = serde_json::json!({
                    "id": interpolated.item_id,
                    "content": content.trim(),
                });
                match hook.position {
                    HookPosition::After => {
                        after_blocks.push(block);
                        out.after_raw.push(raw);
                    }
                    HookPosition::Before => {
                        before_blocks.push(block);
                        out.before_raw.push(raw);
                    }
                }
            }
        }

        out.before = before_blocks.join("\n\n");
        out.after = after_blocks.join("\n\n");
        Ok(out)
    }

    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Interpret a hook action's result as a control action. Results that are
/// not control-shaped (or are plain successes) steer nothing.
fn parse_control_action(value: &Value) -> Option<ControlAction> {
    let data = value.get("data").unwrap_or(value);
    if data == &serde_json::json!({"success": true}) {
        return None;
    }
    serde_json::from_value(data.clone()).ok()
}

fn extract_content(value: &Value) -> String {
    let data = value.get("data").unwrap_or(value);
    for key in ["content", "body", "raw"] {
        if let Some(content) = data.get(key).and_then(Value::as_str) {
            if !content.is_empty() {
                return content.to_string();
            }
        }
    }
    // Loads return content at the top level (no data wrapper).
    for key in ["content", "body"] {
        if let Some(content) = value.get(key).and_then(Value::as_str) {
            if !content.is_empty() {
                return content.to_string();
            }
        }
    }
    String::new()
}
