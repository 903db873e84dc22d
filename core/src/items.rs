//! The four primary operations on items: execute, search, load, sign.
//!
//! `load` verifies the item's signature against the trust store before
//! returning content; `sign` validates, signs, and invalidates any lockfile
//! pinned against the old hash.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::config::DIRECTIVE_INSTRUCTION;
use crate::error::Result;
use crate::error::RyeErr;
use crate::expr::validate_expression;
use crate::interpolate::resolve_input_refs;
use crate::lockfile::LockfileResolver;
use crate::metadata::load_tool_metadata;
use crate::signing::ItemSigner;
use crate::signing::Keypair;
use crate::signing::verify_content;
use crate::spaces::ItemType;
use crate::spaces::SearchHit;
use crate::spaces::find_item;
use crate::spaces::search_items;
use crate::trust::TrustStore;
use rye_protocol::Directive;

/// Verify an item file's signature against the trust store. Integrity
/// failures halt the caller; they are never swallowed.
pub fn verify_item(config: &Config, item_type: ItemType, item_id: &str, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let store = TrustStore::new(config);
    let outcome = verify_content(&content, |fp| store.get_public_key(fp));
    if !outcome.valid {
        return Err(RyeErr::Integrity(format!(
            "{item_type} '{item_id}': {}",
            outcome.issues.join(", ")
        )));
    }
    Ok(())
}

/// Load an item, verifying integrity first. Returns the JSON the CLI and
/// hook context injection consume.
pub fn load_item(config: &Config, item_type: ItemType, item_id: &str) -> Result<Value> {
    let resolved = find_item(config, item_type, item_id).ok_or_else(|| RyeErr::ItemNotFound {
        item_type: item_type.to_string(),
        item_id: item_id.to_string(),
    })?;
    verify_item(config, item_type, item_id, &resolved.path)?;
    let content = std::fs::read_to_string(&resolved.path)?;

    Ok(serde_json::json!({
        "status": "success",
        "type": item_type,
        "item_id": item_id,
        "space": resolved.space.label(),
        "content": strip_signature_line(&content),
    }))
}

fn strip_signature_line(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.contains("rye:signed:"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Search one item type across the three tiers.
pub fn search(config: &Config, item_type: ItemType, query: &str) -> Vec<SearchHit> {
    search_items(config, item_type, query)
}

/// Load and validate a directive's parsed JSON model.
pub fn load_directive(config: &Config, item_id: &str) -> Result<Directive> {
    let resolved =
        find_item(config, ItemType::Directive, item_id).ok_or_else(|| RyeErr::ItemNotFound {
            item_type: "directive".to_string(),
            item_id: item_id.to_string(),
        })?;
    let raw = std::fs::read_to_string(&resolved.path)?;
    let value: Value = serde_json::from_str(&raw)?;
    let body = match value {
        Value::Object(mut map) => {
            map.remove("_signature");
            Value::Object(map)
        }
        other => other,
    };
    let directive: Directive = serde_json::from_value(body)?;

    let mut issues = Vec::new();
    let expected_name = item_id.rsplit('/').next().unwrap_or(item_id);
    if directive.name != expected_name {
        issues.push(format!(
            "directive name '{}' does not match file stem '{expected_name}'",
            directive.name
        ));
    }
    for permission in &directive.permissions {
        let cap = crate::capability::normalize_cap(permission);
        if crate::capability::parse_capability(&cap).is_none() {
            issues.push(format!("invalid capability '{permission}'"));
        }
    }
    for hook in &directive.hooks {
        if hook.event.is_empty() {
            issues.push("hook missing event selector".to_string());
        }
        if hook.action.is_none() && hook.actions.is_empty() && hook.directive.is_none() {
            issues.push(format!(
                "hook on '{}' has no action, actions, or directive",
                hook.event
            ));
        }
        if let Some(condition) = &hook.condition {
            if let Err(e) = validate_expression(condition) {
                issues.push(format!("hook condition on '{}': {e}", hook.event));
            }
        }
    }
    if semver::Version::parse(&directive.version).is_err() {
        issues.push(format!("invalid directive version '{}'", directive.version));
    }

    if !issues.is_empty() {
        return Err(RyeErr::Validation { issues });
    }
    Ok(directive)
}

/// Execute a directive in-thread: validate inputs, interpolate the body,
/// and return lean actionable content for the calling agent to follow.
pub fn execute_directive_inline(
    config: &Config,
    item_id: &str,
    parameters: &HashMap<String, Value>,
) -> Result<Value> {
    let directive = load_directive(config, item_id)?;
    let inputs = directive
        .resolve_inputs(parameters)
        .map_err(|issues| RyeErr::Validation { issues })?;

    let context = serde_json::json!({ "inputs": inputs });
    let body = resolve_input_refs(&directive.body, &context);

    let mut result = serde_json::json!({
        "status": "success",
        "type": "directive",
        "item_id": item_id,
        "instructions": DIRECTIVE_INSTRUCTION,
        "body": body,
    });
    if !directive.outputs.is_empty() {
        result["outputs"] = serde_json::to_value(&directive.outputs)?;
    }
    Ok(result)
}

/// Sign an item in place. Rewrites the signature line and, for tools,
/// deletes the lockfile pinned against the old hash.
pub fn sign_item(
    config: &Config,
    keypair: &Keypair,
    item_type: ItemType,
    item_id: &str,
) -> Result<Value> {
    let resolved = find_item(config, item_type, item_id).ok_or_else(|| RyeErr::ItemNotFound {
        item_type: item_type.to_string(),
        item_id: item_id.to_string(),
    })?;
    if !resolved.space.is_mutable() {
        return Err(RyeErr::Validation {
            issues: vec![format!(
                "cannot sign '{item_id}': the system tier is immutable"
            )],
        });
    }

    let store = TrustStore::new(config);
    store.ensure_self_trusted(keypair)?;

    let content = std::fs::read_to_string(&resolved.path)?;
    let signer = ItemSigner::new(keypair);
    let signed = signer.sign_content(&resolved.path, &content)?;
    std::fs::write(&resolved.path, &signed)?;

    // Signing changed the hash; any lockfile pinned against the old hash is
    // now stale.
    if item_type == ItemType::Tool {
        if let Ok((metadata, _)) = load_tool_metadata(&resolved.path) {
            let resolver = LockfileResolver::new(config);
            resolver.delete(item_id, &metadata.version)?;
        }
    }

    info!(item_id, %item_type, "item signed");
    Ok(serde_json::json!({
        "status": "success",
        "type": item_type,
        "item_id": item_id,
        "space": resolved.space.label(),
        "fingerprint": keypair.fingerprint(),
    }))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> (tempfile::TempDir, Config, Keypair) {
        let tmp = tempfile::tempdir().unwrap();
        let config =
            Config::with_spaces(Some(tmp.path().join("proj")), tmp.path().join("home")).unwrap();
        let keypair = Keypair::ensure(&config.keys_dir()).unwrap();
        (tmp, config, keypair)
    }

    fn write_item(config: &Config, rel: &str, content: &str) -> std::path::PathBuf {
        let path = config.project_ai_dir().unwrap().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn lean_directive_executes_inline() {
        let (_tmp, config, _keypair) = setup();
        write_item(
            &config,
            "directives/hello.json",
            &json!({"name": "hello", "version": "1.0.0", "body": "Say hi"}).to_string(),
        );
        let result = execute_directive_inline(&config, "hello", &HashMap::new()).unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["type"], "directive");
        assert_eq!(result["item_id"], "hello");
        assert_eq!(result["instructions"], DIRECTIVE_INSTRUCTION);
        assert_eq!(result["body"], "Say hi");
        assert!(result.get("data").is_none());
    }

    #[test]
    fn directive_with_inputs_interpolates_body() {
        let (_tmp, config, _keypair) = setup();
        write_item(
            &config,
            "directives/greet.json",
            &json!({
                "name": "greet",
                "version": "1.0.0",
                "inputs": [{"name": "who", "type": "string", "required": true}],
                "body": "Say hi to {input:who}",
            })
            .to_string(),
        );
        let params = HashMap::from([("who".to_string(), json!("leo"))]);
        let result = execute_directive_inline(&config, "greet", &params).unwrap();
        assert_eq!(result["body"], "Say hi to leo");

        let err = execute_directive_inline(&config, "greet", &HashMap::new()).unwrap_err();
        assert!(matches!(err, RyeErr::Validation { .. }));
    }

    #[test]
    fn bad_hook_condition_rejects_directive_at_load() {
        let (_tmp, config, _keypair) = setup();
        write_item(
            &config,
            "directives/hooked.json",
            &json!({
                "name": "hooked",
                "version": "1.0.0",
                "hooks": [{
                    "event": "limit",
                    "condition": "len(event) > 0",
                    "action": {"primary": "execute", "item_type": "tool", "item_id": "x"},
                }],
                "body": "b",
            })
            .to_string(),
        );
        let err = load_directive(&config, "hooked").unwrap_err();
        assert!(err.to_string().contains("hook condition"));
    }

    #[test]
    fn sign_then_load_round_trips_and_tamper_fails() {
        let (_tmp, config, keypair) = setup();
        let path = write_item(&config, "knowledge/notes.md", "# Notes\n\nImportant.\n");

        sign_item(&config, &keypair, ItemType::Knowledge, "notes").unwrap();
        let loaded = load_item(&config, ItemType::Knowledge, "notes").unwrap();
        assert!(
            loaded["content"]
                .as_str()
                .unwrap()
                .contains("Important.")
        );

        // Flip one byte of the body.
        let signed = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, signed.replace("Important", "Tampered")).unwrap();
        let err = load_item(&config, ItemType::Knowledge, "notes").unwrap_err();
        assert!(err.to_string().contains("Integrity check failed"));
    }

    #[test]
    fn unsigned_load_fails_closed() {
        let (_tmp, config, _keypair) = setup();
        write_item(&config, "knowledge/raw.md", "no signature\n");
        let err = load_item(&config, ItemType::Knowledge, "raw").unwrap_err();
        assert!(err.to_string().contains("unsigned"));
    }
}
