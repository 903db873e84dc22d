//! Template interpolation for hook actions and directive bodies.
//!
//! Two syntaxes:
//! - `${dotted.path}` resolved against a JSON context. When the entire
//!   template is a single `${...}` expression the raw resolved value keeps
//!   its type; mixed templates coalesce to strings.
//! - `{input:name}` / `{input:name?}` / `{input:name:default}` resolved from
//!   the context's `inputs` object.

use regex_lite::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::expr::resolve_path_str;
use rye_protocol::HookAction;

#[expect(clippy::expect_used)]
static INTERPOLATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid literal regex"));

#[expect(clippy::expect_used)]
static INPUT_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{input:(\w+)(\?|:[^}]*)?\}").expect("valid literal regex")
});

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Interpolate a string template against a context.
///
/// A template that is exactly one `${...}` expression returns the resolved
/// value with its original type (possibly null); anything else substitutes
/// into the string, rendering missing paths as empty.
pub fn interpolate_str(template: &str, context: &Value) -> Value {
    let trimmed = template.trim();
    if trimmed.starts_with("${")
        && trimmed.ends_with('}')
        && trimmed.matches("${").count() == 1
        && trimmed == template
    {
        let path = &trimmed[2..trimmed.len() - 1];
        return resolve_path_str(context, path);
    }

    let mut result = String::new();
    let mut last = 0;
    for caps in INTERPOLATION_RE.captures_iter(template) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        result.push_str(&template[last..whole.start()]);
        let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        result.push_str(&value_to_string(&resolve_path_str(context, path)));
        last = whole.end();
    }
    result.push_str(&template[last..]);

    let with_inputs = resolve_input_refs(&result, context);
    Value::String(with_inputs)
}

/// Resolve `{input:name}` refs against `context.inputs`. `?` renders
/// missing inputs empty; `:default` substitutes a literal; otherwise the
/// ref is left in place.
pub fn resolve_input_refs(text: &str, context: &Value) -> String {
    let inputs = match context.get("inputs") {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if !text.contains("{input:") {
        return text.to_string();
    }

    let mut result = String::new();
    let mut last = 0;
    for caps in INPUT_REF_RE.captures_iter(text) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        result.push_str(&text[last..whole.start()]);
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let modifier = caps.get(2).map(|m| m.as_str());
        match inputs.get(name) {
            Some(value) => result.push_str(&value_to_string(value)),
            None => match modifier {
                Some("?") => {}
                Some(m) if m.starts_with(':') => result.push_str(&m[1..]),
                _ => result.push_str(whole.as_str()),
            },
        }
        last = whole.end();
    }
    result.push_str(&text[last..]);
    result
}

/// Recursively interpolate a JSON value: strings are templated, containers
/// recurse, other leaves pass through.
pub fn interpolate_value(template: &Value, context: &Value) -> Value {
    match template {
        Value::String(s) => interpolate_str(s, context),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, context)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| interpolate_value(v, context)).collect(),
        ),
        other => other.clone(),
    }
}

/// Interpolate a hook action's interpolable fields (`item_id`, `params`),
/// preserving `primary` and `item_type`.
pub fn interpolate_action(action: &HookAction, context: &Value) -> HookAction {
    HookAction {
        primary: action.primary.clone(),
        item_type: action.item_type.clone(),
        item_id: value_to_string(&interpolate_str(&action.item_id, context)),
        params: interpolate_value(&action.params, context),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "event": {"code": "limit", "count": 3},
            "inputs": {"who": "leo", "env": "prod"},
        })
    }

    #[test]
    fn whole_expression_preserves_type() {
        let ctx = ctx();
        assert_eq!(interpolate_str("${event.count}", &ctx), json!(3));
        assert_eq!(interpolate_str("${event}", &ctx), json!({"code": "limit", "count": 3}));
        assert_eq!(interpolate_str("${missing.path}", &ctx), Value::Null);
    }

    #[test]
    fn mixed_templates_coalesce_to_string() {
        let ctx = ctx();
        assert_eq!(
            interpolate_str("count is ${event.count}!", &ctx),
            json!("count is 3!")
        );
        assert_eq!(
            interpolate_str("gone: ${missing.path}.", &ctx),
            json!("gone: .")
        );
    }

    #[test]
    fn input_refs_with_modifiers() {
        let ctx = ctx();
        assert_eq!(
            interpolate_str("deploy to {input:env}", &ctx),
            json!("deploy to prod")
        );
        assert_eq!(
            interpolate_str("x={input:absent?}", &ctx),
            json!("x=")
        );
        assert_eq!(
            interpolate_str("x={input:absent:fallback}", &ctx),
            json!("x=fallback")
        );
        assert_eq!(
            interpolate_str("x={input:absent}", &ctx),
            json!("x={input:absent}")
        );
    }

    #[test]
    fn actions_interpolate_params_only() {
        let ctx = ctx();
        let action = HookAction {
            primary: "execute".to_string(),
            item_type: "tool".to_string(),
            item_id: "rye/agent/${event.code}".to_string(),
            params: json!({"count": "${event.count}", "nested": {"who": "{input:who}"}}),
        };
        let out = interpolate_action(&action, &ctx);
        assert_eq!(out.item_id, "rye/agent/limit");
        assert_eq!(out.params, json!({"count": 3, "nested": {"who": "leo"}}));
        assert_eq!(out.primary, "execute");
    }
}
