//! Tool metadata documents.
//!
//! Each tool under `{space}/.ai/tools/` is described by a sidecar TOML
//! document `{id}.tool.toml` carrying the delegation and compatibility
//! fields the resolver needs. External tool code is never loaded into the
//! host process; it is always reached through the subprocess primitive.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::RyeErr;
use crate::signing::sha256_hex;
use crate::spaces::Space;

/// The three built-in primitives, the only leaves of any execution chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Subprocess,
    Http,
    HttpStream,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VersionConstraint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

/// Static environment configuration a chain element contributes, resolved
/// by the environment resolver before dispatch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Load `.env` from the project root into the environment first.
    #[serde(default = "default_true")]
    pub include_dotenv: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolMetadata {
    pub version: String,
    pub tool_type: String,
    /// Delegation target; `None` for primitives.
    #[serde(default)]
    pub executor_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub child_constraints: HashMap<String, VersionConstraint>,
    /// Which built-in primitive a root element dispatches to.
    #[serde(default)]
    pub primitive: Option<PrimitiveKind>,
    /// Free-form configuration handed to the primitive (command template,
    /// URL, headers, ...).
    #[serde(default)]
    pub config: toml::Table,
    #[serde(default)]
    pub env_config: Option<EnvConfig>,
}

/// One resolved element of an execution chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainElement {
    pub item_id: String,
    pub space: Space,
    pub path: std::path::PathBuf,
    /// SHA-256 of the metadata document's canonical content (signature
    /// line stripped).
    pub integrity_hash: String,
    pub metadata: ToolMetadata,
}

impl ChainElement {
    pub fn is_primitive(&self) -> bool {
        self.metadata.executor_id.is_none()
    }

    /// Serializable summary used in execution results and dry runs.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "item_id": self.item_id,
            "version": self.metadata.version,
            "executor_id": self.metadata.executor_id,
            "space": self.space.label(),
            "integrity_hash": self.integrity_hash,
        })
    }
}

/// Load tool metadata from a file, stripping any signature line before
/// parsing and hashing. The integrity hash covers the canonical content so
/// re-signing changes it.
pub fn load_tool_metadata(path: &Path) -> Result<(ToolMetadata, String)> {
    let raw = std::fs::read_to_string(path)?;
    let body: String = raw
        .lines()
        .filter(|line| !line.contains("rye:signed:"))
        .collect::<Vec<_>>()
        .join("\n");
    let metadata: ToolMetadata = toml::from_str(&body).map_err(|e| {
        RyeErr::Validation {
            issues: vec![format!("invalid tool metadata {}: {e}", path.display())],
        }
    })?;
    let integrity_hash = sha256_hex(body.as_bytes());
    semver::Version::parse(&metadata.version).map_err(|e| RyeErr::Validation {
        issues: vec![format!(
            "invalid semver '{}' in {}: {e}",
            metadata.version,
            path.display()
        )],
    })?;
    Ok((metadata, integrity_hash))
}

/// Convert the TOML `config` table to JSON for templating.
pub fn config_to_json(config: &toml::Table) -> serde_json::Value {
    serde_json::to_value(config).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_full_document() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fs_write.tool.toml");
        std::fs::write(
            &path,
            r#"
version = "1.2.0"
tool_type = "python"
executor_id = "rye/core/runtimes/python/function"
category = "rye/file-system"
inputs = ["json"]
outputs = ["json"]

[child_constraints."rye/core/runtimes/python/function"]
min_version = "1.0.0"
"#,
        )
        .unwrap();
        let (meta, hash) = load_tool_metadata(&path).unwrap();
        assert_eq!(meta.version, "1.2.0");
        assert_eq!(
            meta.executor_id.as_deref(),
            Some("rye/core/runtimes/python/function")
        );
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn signature_line_does_not_affect_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let unsigned = tmp.path().join("a.tool.toml");
        let signed = tmp.path().join("b.tool.toml");
        let body = "version = \"1.0.0\"\ntool_type = \"primitive\"\n";
        std::fs::write(&unsigned, body).unwrap();
        std::fs::write(
            &signed,
            format!("# rye:signed:2026-01-01T00:00:00Z:{}:sig:fp\n{body}", "0".repeat(64)),
        )
        .unwrap();
        let (_, h1) = load_tool_metadata(&unsigned).unwrap();
        let (_, h2) = load_tool_metadata(&signed).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn bad_semver_is_a_validation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.tool.toml");
        std::fs::write(&path, "version = \"one\"\ntool_type = \"python\"\n").unwrap();
        assert!(matches!(
            load_tool_metadata(&path),
            Err(RyeErr::Validation { .. })
        ));
    }
}
