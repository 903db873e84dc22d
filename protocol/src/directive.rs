use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

use crate::hook::Hook;
use crate::limits::Limits;

/// Model tier requested by a directive. A tier is resolved to a concrete
/// model id by provider configuration unless `id` pins one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelTier {
    Fast,
    #[default]
    Standard,
    Deep,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub tier: ModelTier,
    /// Explicit model id, overriding tier resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Provider hint (an item id under `.ai/tools/`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveInput {
    pub name: String,
    #[serde(default, rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveOutput {
    pub name: String,
    #[serde(default, rename = "type")]
    pub output_type: InputType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A risk the directive author explicitly acknowledged, with the reason the
/// risk is acceptable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcknowledgedRisk {
    pub risk: String,
    pub reason: String,
}

/// Knowledge-item wiring for context injection at thread start.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextSpec {
    /// Items concatenated into the system position.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<String>,
    /// Items injected before the directive prompt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    /// Items injected after the directive prompt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    /// Item ids whose default injection is suppressed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppress: Vec<String>,
}

/// A tool-call template extracted from the directive prose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub primary: String,
    pub item_type: String,
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// The parsed form of a directive file. This is the contract the external
/// markdown/XML parser must produce; the runtime consumes it serialized as
/// JSON under `.ai/directives/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    /// Unique within its space and category; must match the file stem.
    pub name: String,
    /// Semver.
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: ModelSpec,
    #[serde(default)]
    pub limits: Limits,
    /// Ordered capability strings. An empty list is fail-closed: every
    /// permission check on non-internal items denies.
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acknowledged_risks: Vec<AcknowledgedRisk>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<DirectiveInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<DirectiveOutput>,
    #[serde(default)]
    pub context: ContextSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionTemplate>,
    /// The interpolable free-form prompt.
    #[serde(default)]
    pub body: String,
}

impl Directive {
    /// Validate supplied inputs against declarations, applying defaults.
    /// Returns the resolved input map or the full list of field-level
    /// problems so callers can report them in one response.
    pub fn resolve_inputs(
        &self,
        supplied: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, Vec<String>> {
        let mut resolved = HashMap::new();
        let mut issues = Vec::new();
        for input in &self.inputs {
            match supplied.get(&input.name) {
                Some(value) => {
                    if !type_matches(input.input_type, value) {
                        issues.push(format!(
                            "input '{}' expects {}, got {}",
                            input.name,
                            input.input_type,
                            json_type_name(value)
                        ));
                    } else {
                        resolved.insert(input.name.clone(), value.clone());
                    }
                }
                None => match &input.default {
                    Some(default) => {
                        resolved.insert(input.name.clone(), default.clone());
                    }
                    None if input.required => {
                        issues.push(format!("missing required input '{}'", input.name));
                    }
                    None => {}
                },
            }
        }
        for name in supplied.keys() {
            if !self.inputs.iter().any(|i| &i.name == name) {
                issues.push(format!("unknown input '{name}'"));
            }
        }
        if issues.is_empty() {
            Ok(resolved)
        } else {
            Err(issues)
        }
    }
}

fn type_matches(expected: InputType, value: &Value) -> bool {
    match expected {
        InputType::String => value.is_string(),
        InputType::Number => value.is_number(),
        InputType::Boolean => value.is_boolean(),
        InputType::Object => value.is_object(),
        InputType::Array => value.is_array(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn directive_with_inputs() -> Directive {
        serde_json::from_value(json!({
            "name": "greet",
            "version": "1.0.0",
            "inputs": [
                {"name": "who", "type": "string", "required": true},
                {"name": "count", "type": "number", "default": 1},
            ],
            "body": "Say hi to {input:who}",
        }))
        .unwrap()
    }

    #[test]
    fn resolves_defaults_and_required() {
        let d = directive_with_inputs();
        let supplied = HashMap::from([("who".to_string(), json!("leo"))]);
        let resolved = d.resolve_inputs(&supplied).unwrap();
        assert_eq!(resolved["who"], json!("leo"));
        assert_eq!(resolved["count"], json!(1));
    }

    #[test]
    fn reports_all_issues_at_once() {
        let d = directive_with_inputs();
        let supplied = HashMap::from([
            ("count".to_string(), json!("three")),
            ("bogus".to_string(), json!(true)),
        ]);
        let issues = d.resolve_inputs(&supplied).unwrap_err();
        assert_eq!(issues.len(), 3);
    }

    #[test]
    fn lean_directive_parses_with_defaults() {
        let d: Directive = serde_json::from_value(json!({
            "name": "hello",
            "version": "0.1.0",
            "body": "Say hi",
        }))
        .unwrap();
        assert!(d.permissions.is_empty());
        assert!(d.limits.turns.is_none());
        assert_eq!(d.model.tier, ModelTier::Standard);
    }
}
