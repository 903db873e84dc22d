use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

/// Which layer declared a hook. Layer 1 and 2 hooks participate in
/// control-flow short-circuiting; layer 3 hooks always run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum HookLayer {
    User,
    Builtin,
    Infra,
}

impl From<u8> for HookLayer {
    fn from(v: u8) -> Self {
        match v {
            2 => HookLayer::Builtin,
            3 => HookLayer::Infra,
            _ => HookLayer::User,
        }
    }
}

impl From<HookLayer> for u8 {
    fn from(layer: HookLayer) -> u8 {
        match layer {
            HookLayer::User => 1,
            HookLayer::Builtin => 2,
            HookLayer::Infra => 3,
        }
    }
}

/// Where a context-injection hook's content lands relative to the directive
/// prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HookPosition {
    #[default]
    Before,
    After,
}

/// A primary tool-call descriptor executed when a hook fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookAction {
    /// One of `execute`, `search`, `load`, `sign`.
    pub primary: String,
    pub item_type: String,
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Declarative listener bound to a thread event.
///
/// Exactly one of `action`, `actions`, or `directive` should be present; the
/// loader rejects hooks with none of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    /// Event selector: `thread_started`, `before_turn`, `after_step`,
    /// `limit`, `error`, `thread_completed`, `channel_turn`, or a custom
    /// event name.
    pub event: String,
    /// Optional condition over the event context, in the safe expression
    /// grammar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<HookAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<HookAction>,
    /// Another directive to run instead of inline actions. Runs under this
    /// directive's attenuated capabilities, never the parent's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directive: Option<String>,
    #[serde(default = "default_layer")]
    pub layer: HookLayer,
    #[serde(default)]
    pub position: HookPosition,
}

fn default_layer() -> HookLayer {
    HookLayer::User
}

impl Hook {
    /// All actions this hook carries, normalizing the single-action form.
    pub fn all_actions(&self) -> Vec<&HookAction> {
        if !self.actions.is_empty() {
            self.actions.iter().collect()
        } else {
            self.action.iter().collect()
        }
    }
}

/// Control action returned by a hook to steer the runner.
///
/// `Continue` and `Skip` carry no payload and do not terminate; the rest
/// carry whatever payload the runner translates into a terminal result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Retry {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    Fail {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    Abort {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    Suspend {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    Escalate {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    Continue,
    Skip,
}

impl ControlAction {
    /// Whether this action terminates hook evaluation and hands control
    /// back to the runner.
    pub fn is_terminating(&self) -> bool {
        !matches!(self, ControlAction::Continue | ControlAction::Skip)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn layer_round_trips_through_integers() {
        let hook: Hook = serde_json::from_value(serde_json::json!({
            "event": "limit",
            "layer": 3,
            "action": {
                "primary": "execute",
                "item_type": "tool",
                "item_id": "rye/agent/threads/internal/control",
            },
        }))
        .unwrap();
        assert_eq!(hook.layer, HookLayer::Infra);
        let json = serde_json::to_value(&hook).unwrap();
        assert_eq!(json["layer"], 3);
    }

    #[test]
    fn control_action_terminality() {
        assert!(
            ControlAction::Abort {
                payload: Value::Null
            }
            .is_terminating()
        );
        assert!(!ControlAction::Continue.is_terminating());
        assert!(!ControlAction::Skip.is_terminating());
    }

    #[test]
    fn single_action_normalizes() {
        let hook = Hook {
            event: "after_step".to_string(),
            condition: None,
            action: Some(HookAction {
                primary: "load".to_string(),
                item_type: "knowledge".to_string(),
                item_id: "rules".to_string(),
                params: Value::Null,
            }),
            actions: Vec::new(),
            directive: None,
            layer: HookLayer::User,
            position: HookPosition::Before,
        };
        assert_eq!(hook.all_actions().len(), 1);
    }
}
