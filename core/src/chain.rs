//! Delegation-chain building and validation.
//!
//! Resolving an item id walks `executor_id` recursively under project →
//! user → system precedence until a primitive is reached, producing the
//! ordered chain `[tool, runtime, ..., primitive]`. Validation is applied
//! pairwise plus one global rule: a system tool may never delegate back to
//! a mutable space.

use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::error::RyeErr;
use crate::metadata::ChainElement;
use crate::metadata::load_tool_metadata;
use crate::spaces::ItemType;
use crate::spaces::find_item;

/// Hard ceiling on chain length; bounds pathological delegation loops.
pub const MAX_CHAIN_LINKS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainValidationResult {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub validated_pairs: usize,
}

impl ChainValidationResult {
    fn ok() -> Self {
        ChainValidationResult {
            valid: true,
            ..Default::default()
        }
    }

    fn fail(&mut self, issue: String) {
        self.issues.push(issue);
        self.valid = false;
    }
}

/// Build the delegation chain for a tool id. Errors on unknown ids, cycles,
/// chains longer than [`MAX_CHAIN_LINKS`], and non-primitive roots.
pub fn build_chain(config: &Config, item_id: &str) -> Result<Vec<ChainElement>> {
    let mut chain = Vec::new();
    let mut visited = std::collections::HashSet::new();
    let mut current = item_id.to_string();

    loop {
        if !visited.insert(current.clone()) {
            return Err(RyeErr::ChainValidation(format!(
                "circular executor chain at '{current}'"
            )));
        }
        if chain.len() >= MAX_CHAIN_LINKS {
            return Err(RyeErr::ChainValidation(format!(
                "executor chain exceeds {MAX_CHAIN_LINKS} links at '{current}'"
            )));
        }

        let resolved = find_item(config, ItemType::Tool, &current).ok_or_else(|| {
            RyeErr::ItemNotFound {
                item_type: "tool".to_string(),
                item_id: current.clone(),
            }
        })?;
        let (metadata, integrity_hash) = load_tool_metadata(&resolved.path)?;
        let next = metadata.executor_id.clone();
        chain.push(ChainElement {
            item_id: current.clone(),
            space: resolved.space,
            path: resolved.path,
            integrity_hash,
            metadata,
        });

        match next {
            Some(executor_id) => current = executor_id,
            None => break,
        }
    }

    debug!(
        item_id,
        links = chain.len(),
        "resolved executor chain"
    );
    Ok(chain)
}

/// Validate an entire chain. Chain order: `[tool, runtime, ..., primitive]`;
/// each `(chain[i], chain[i+1])` pair is a child delegating to its parent.
pub fn validate_chain(chain: &[ChainElement]) -> ChainValidationResult {
    let mut result = ChainValidationResult::ok();
    if chain.len() <= 1 {
        return result;
    }

    for pair in chain.windows(2) {
        let (child, parent) = (&pair[0], &pair[1]);
        validate_space(child, parent, &mut result);
        validate_io(child, parent, &mut result);
        validate_versions(child, parent, &mut result);
        result.validated_pairs += 1;
    }

    // A system tool delegating back to a mutable space is always invalid,
    // independent of pairwise precedence.
    for pair in chain.windows(2) {
        let (child, parent) = (&pair[0], &pair[1]);
        if !child.space.is_mutable() && parent.space.is_mutable() {
            result.fail(format!(
                "system tool '{}' cannot delegate to mutable {} tool '{}'",
                child.item_id,
                parent.space.label(),
                parent.item_id
            ));
        }
    }

    result
}

fn validate_space(child: &ChainElement, parent: &ChainElement, result: &mut ChainValidationResult) {
    if child.space.precedence() < parent.space.precedence() {
        result.fail(format!(
            "tool '{}' from {} space cannot depend on '{}' from {} space",
            child.item_id,
            child.space.label(),
            parent.item_id,
            parent.space.label()
        ));
    }
}

fn validate_io(child: &ChainElement, parent: &ChainElement, result: &mut ChainValidationResult) {
    let child_outputs: std::collections::HashSet<&String> =
        child.metadata.outputs.iter().collect();
    let parent_inputs: std::collections::HashSet<&String> =
        parent.metadata.inputs.iter().collect();

    // Missing declarations are silently compatible, modulo a warning.
    if child_outputs.is_empty() || parent_inputs.is_empty() {
        if child_outputs.is_empty() != parent_inputs.is_empty() {
            result.warnings.push(format!(
                "partial I/O declarations between '{}' and '{}'",
                child.item_id, parent.item_id
            ));
        }
        return;
    }

    let missing: Vec<&&String> = parent_inputs.difference(&child_outputs).collect();
    if !missing.is_empty() {
        let mut names: Vec<String> = missing.iter().map(|s| s.to_string()).collect();
        names.sort();
        result.fail(format!(
            "I/O mismatch: '{}' requires inputs {:?} not provided by '{}'",
            parent.item_id, names, child.item_id
        ));
    }
}

fn validate_versions(
    child: &ChainElement,
    parent: &ChainElement,
    result: &mut ChainValidationResult,
) {
    let Some(constraint) = parent.metadata.child_constraints.get(&child.item_id) else {
        return;
    };
    let Ok(child_version) = semver::Version::parse(&child.metadata.version) else {
        result.warnings.push(format!(
            "'{}' has unparseable version '{}' under constraints from '{}'",
            child.item_id, child.metadata.version, parent.item_id
        ));
        return;
    };

    if let Some(min) = &constraint.min_version {
        if let Ok(min) = semver::Version::parse(min) {
            if child_version < min {
                result.fail(format!(
                    "version constraint failed: '{}' {} < minimum {}",
                    child.item_id, child_version, min
                ));
            }
        }
    }
    if let Some(max) = &constraint.max_version {
        if let Ok(max) = semver::Version::parse(max) {
            if child_version > max {
                result.fail(format!(
                    "version constraint failed: '{}' {} > maximum {}",
                    child.item_id, child_version, max
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use crate::spaces::Space;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn write_tool(base: &Path, id: &str, body: &str) {
        let path = base.join(".ai/tools").join(format!("{id}.tool.toml"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn three_link_project(tmp: &Path) -> Config {
        let project = tmp.join("proj");
        write_tool(
            &project,
            "rye/file-system/fs_write",
            "version = \"1.0.0\"\ntool_type = \"python\"\nexecutor_id = \"rye/core/runtimes/python/function\"\noutputs = [\"json\"]\n",
        );
        write_tool(
            &project,
            "rye/core/runtimes/python/function",
            "version = \"1.1.0\"\ntool_type = \"runtime\"\nexecutor_id = \"rye/core/primitives/subprocess\"\ninputs = [\"json\"]\noutputs = [\"json\"]\n",
        );
        write_tool(
            &project,
            "rye/core/primitives/subprocess",
            "version = \"1.0.0\"\ntool_type = \"primitive\"\n[primitive]\nkind = \"subprocess\"\n",
        );
        Config::with_spaces(Some(project), tmp.join("home")).unwrap()
    }

    #[test]
    fn resolves_three_link_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let config = three_link_project(tmp.path());
        let chain = build_chain(&config, "rye/file-system/fs_write").unwrap();
        assert_eq!(chain.len(), 3);
        assert!(chain[2].is_primitive());
        let validation = validate_chain(&chain);
        assert!(validation.valid, "{:?}", validation.issues);
        assert_eq!(validation.validated_pairs, 2);
    }

    #[test]
    fn detects_cycles() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("proj");
        write_tool(
            &project,
            "a",
            "version = \"1.0.0\"\ntool_type = \"x\"\nexecutor_id = \"b\"\n",
        );
        write_tool(
            &project,
            "b",
            "version = \"1.0.0\"\ntool_type = \"x\"\nexecutor_id = \"a\"\n",
        );
        let config = Config::with_spaces(Some(project), tmp.path().join("home")).unwrap();
        let err = build_chain(&config, "a").unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn user_tool_cannot_delegate_to_project() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("proj");
        let user = tmp.path().join("home");
        write_tool(
            &user,
            "shared/helper",
            "version = \"1.0.0\"\ntool_type = \"x\"\nexecutor_id = \"proj-only/runtime\"\n",
        );
        write_tool(
            &project,
            "proj-only/runtime",
            "version = \"1.0.0\"\ntool_type = \"primitive\"\n",
        );
        let config = Config::with_spaces(Some(project), user).unwrap();
        let chain = build_chain(&config, "shared/helper").unwrap();
        let validation = validate_chain(&chain);
        assert!(!validation.valid);
        assert!(validation.issues[0].contains("cannot depend on"));
    }

    #[test]
    fn io_mismatch_fails_and_partial_warns() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("proj");
        write_tool(
            &project,
            "t",
            "version = \"1.0.0\"\ntool_type = \"x\"\nexecutor_id = \"r\"\noutputs = [\"text\"]\n",
        );
        write_tool(
            &project,
            "r",
            "version = \"1.0.0\"\ntool_type = \"primitive\"\ninputs = [\"json\"]\n",
        );
        let config = Config::with_spaces(Some(project), tmp.path().join("home")).unwrap();
        let chain = build_chain(&config, "t").unwrap();
        let validation = validate_chain(&chain);
        assert!(!validation.valid);
        assert!(validation.issues[0].contains("I/O mismatch"));
    }

    #[test]
    fn version_constraints_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("proj");
        write_tool(
            &project,
            "t",
            "version = \"0.9.0\"\ntool_type = \"x\"\nexecutor_id = \"r\"\n",
        );
        write_tool(
            &project,
            "r",
            "version = \"1.0.0\"\ntool_type = \"primitive\"\n[child_constraints.t]\nmin_version = \"1.0.0\"\n",
        );
        let config = Config::with_spaces(Some(project), tmp.path().join("home")).unwrap();
        let chain = build_chain(&config, "t").unwrap();
        let validation = validate_chain(&chain);
        assert!(!validation.valid);
        assert!(validation.issues[0].contains("minimum"));
    }

    #[test]
    fn project_shadows_user_per_element() {
        let tmp = tempfile::tempdir().unwrap();
        let config = three_link_project(tmp.path());
        let chain = build_chain(&config, "rye/file-system/fs_write").unwrap();
        assert!(chain.iter().all(|e| e.space == Space::Project));
    }
}
