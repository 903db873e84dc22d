//! Environment resolution for chain elements.
//!
//! Pure resolver, no side effects. Resolution order: process environment →
//! `.env` file (when enabled) → the element's static `env` vars → tool-level
//! overrides (highest priority).

use std::collections::HashMap;
use std::path::Path;

use crate::metadata::EnvConfig;

/// Resolve the environment for one chain element.
pub fn resolve_env(
    project_path: Option<&Path>,
    env_config: Option<&EnvConfig>,
    tool_env: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    let include_dotenv = env_config.map(|c| c.include_dotenv).unwrap_or(true);
    if include_dotenv {
        if let Some(project) = project_path {
            load_dotenv(&project.join(".env"), &mut env);
        }
    }

    if let Some(config) = env_config {
        for (key, value) in &config.env {
            env.insert(key.clone(), resolve_var_refs(value, &env));
        }
    }

    if let Some(overrides) = tool_env {
        for (key, value) in overrides {
            env.insert(key.clone(), value.clone());
        }
    }

    env
}

/// Parse a `.env` file: `KEY=value` lines, `#` comments, blank lines
/// skipped. Errors reading the file are ignored; the resolver stays pure.
fn load_dotenv(path: &Path, env: &mut HashMap<String, String>) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() && !key.starts_with("export ") {
                env.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references against an environment
/// map. Unknown vars without a default render empty.
pub fn resolve_var_refs(value: &str, env: &HashMap<String, String>) -> String {
    let mut result = String::new();
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };
        let expr = &after[..end];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name.trim(), default),
            None => (expr.trim(), ""),
        };
        match env.get(name) {
            Some(v) => result.push_str(v),
            None => result.push_str(default),
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dotenv_then_static_then_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(".env"),
            "# comment\nFROM_DOTENV=1\nSHARED=dotenv\n",
        )
        .unwrap();

        let env_config = EnvConfig {
            env: HashMap::from([
                ("SHARED".to_string(), "static".to_string()),
                ("DERIVED".to_string(), "${FROM_DOTENV:-0}x".to_string()),
            ]),
            include_dotenv: true,
        };
        let overrides = HashMap::from([("SHARED".to_string(), "override".to_string())]);

        let env = resolve_env(Some(tmp.path()), Some(&env_config), Some(&overrides));
        assert_eq!(env.get("FROM_DOTENV").map(String::as_str), Some("1"));
        assert_eq!(env.get("SHARED").map(String::as_str), Some("override"));
        assert_eq!(env.get("DERIVED").map(String::as_str), Some("1x"));
    }

    #[test]
    fn var_refs_with_defaults() {
        let env = HashMap::from([("HOME_DIR".to_string(), "/home/leo".to_string())]);
        assert_eq!(resolve_var_refs("${HOME_DIR}/x", &env), "/home/leo/x");
        assert_eq!(resolve_var_refs("${MISSING:-fallback}", &env), "fallback");
        assert_eq!(resolve_var_refs("${MISSING}", &env), "");
        assert_eq!(resolve_var_refs("no refs", &env), "no refs");
        assert_eq!(resolve_var_refs("${UNTERMINATED", &env), "${UNTERMINATED");
    }
}
