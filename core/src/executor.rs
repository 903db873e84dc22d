//! Primitive executor: routes a tool id through its delegation chain and
//! dispatches the root primitive.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::chain::build_chain;
use crate::chain::validate_chain;
use crate::config::Config;
use crate::env::resolve_env;
use crate::error::Result;
use crate::error::RyeErr;
use crate::lockfile::Lockfile;
use crate::lockfile::LockfileResolver;
use crate::metadata::ChainElement;
use crate::metadata::PrimitiveKind;
use crate::metadata::config_to_json;
use crate::primitives::HttpPrimitive;
use crate::primitives::ReturnSink;
use crate::primitives::StreamSink;
use crate::primitives::SubprocessPrimitive;
use crate::signing::Keypair;

/// Result envelope for a tool execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub chain: Vec<Value>,
    pub duration_ms: u64,
    pub metadata: Value,
}

impl ExecutionResult {
    pub fn to_json(&self, item_id: &str) -> Value {
        let mut out = serde_json::json!({
            "status": if self.success { "success" } else { "error" },
            "type": "tool",
            "item_id": item_id,
            "chain": self.chain,
            "metadata": self.metadata,
        });
        if let Some(data) = &self.data {
            out["data"] = data.clone();
        }
        if let Some(error) = &self.error {
            out["error"] = Value::String(error.clone());
        }
        out
    }
}

pub struct PrimitiveExecutor {
    config: Config,
    subprocess: Option<SubprocessPrimitive>,
    http: HttpPrimitive,
    keypair: Keypair,
}

impl PrimitiveExecutor {
    /// Build an executor for a project. The subprocess primitive is
    /// constructed lazily so HTTP-only deployments work without the
    /// `rye-proc` helper; subprocess dispatch without it still fails as a
    /// configuration error.
    pub fn new(config: Config, keypair: Keypair) -> Self {
        let subprocess = match SubprocessPrimitive::new() {
            Ok(primitive) => Some(primitive),
            Err(e) => {
                warn!("subprocess primitive unavailable: {e}");
                None
            }
        };
        Self {
            config,
            subprocess,
            http: HttpPrimitive::new(),
            keypair,
        }
    }

    pub fn with_subprocess(
        config: Config,
        keypair: Keypair,
        subprocess: SubprocessPrimitive,
    ) -> Self {
        Self {
            config,
            subprocess: Some(subprocess),
            http: HttpPrimitive::new(),
            keypair,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Validate a chain without executing. Returns the chain summaries and
    /// the number of validated pairs.
    pub fn dry_run(&self, item_id: &str) -> Result<(Vec<Value>, usize)> {
        let chain = build_chain(&self.config, item_id)?;
        let validation = validate_chain(&chain);
        if !validation.valid {
            return Err(RyeErr::ChainValidation(validation.issues.join("; ")));
        }
        Ok((
            chain.iter().map(ChainElement::summary).collect(),
            validation.validated_pairs,
        ))
    }

    /// Execute a tool: build and validate the chain, enforce the lockfile,
    /// resolve per-element environments, merge configuration leaf-down, and
    /// dispatch the root primitive.
    pub async fn execute(&self, item_id: &str, parameters: &Value) -> Result<ExecutionResult> {
        let started = Instant::now();

        let chain = build_chain(&self.config, item_id)?;
        let validation = validate_chain(&chain);
        for warning in &validation.warnings {
            warn!(item_id, "chain warning: {warning}");
        }
        if !validation.valid {
            return Err(RyeErr::ChainValidation(validation.issues.join("; ")));
        }

        self.enforce_lockfile(&chain)?;

        let root = chain.last().ok_or_else(|| RyeErr::ItemNotFound {
            item_type: "tool".to_string(),
            item_id: item_id.to_string(),
        })?;
        let kind = root.metadata.primitive.ok_or_else(|| {
            RyeErr::ChainValidation(format!(
                "chain root '{}' declares no primitive kind",
                root.item_id
            ))
        })?;

        // Merge configuration from the primitive down to the tool: nearer
        // elements override. Environments resolve per element, with each
        // element's resolved vars layered into the config env.
        let mut merged_config = Value::Object(serde_json::Map::new());
        let mut resolved_env: HashMap<String, String> = HashMap::new();
        let mut resolved_env_keys: Vec<String> = Vec::new();
        for element in chain.iter().rev() {
            merge_into(&mut merged_config, &config_to_json(&element.metadata.config));
            if element.metadata.env_config.is_some() {
                let env = resolve_env(
                    self.config.project_path.as_deref(),
                    element.metadata.env_config.as_ref(),
                    None,
                );
                for key in element
                    .metadata
                    .env_config
                    .as_ref()
                    .map(|c| c.env.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
                {
                    if let Some(value) = env.get(&key) {
                        resolved_env.insert(key.clone(), value.clone());
                        resolved_env_keys.push(key);
                    }
                }
            }
        }
        if !resolved_env.is_empty() {
            let env_obj: serde_json::Map<String, Value> = resolved_env
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            merge_into(
                &mut merged_config,
                &serde_json::json!({ "env": Value::Object(env_obj) }),
            );
        }

        debug!(item_id, primitive = ?kind, "dispatching chain root");
        let (success, data, error) = match kind {
            PrimitiveKind::Subprocess => {
                let subprocess = self.subprocess.as_ref().ok_or_else(|| {
                    RyeErr::Configuration(
                        "rye-proc binary not found on PATH. Ensure rye is installed correctly."
                            .into(),
                    )
                })?;
                let result = subprocess.execute(&merged_config, parameters).await;
                let success = result.success;
                let error = (!success).then(|| result.stderr.clone());
                let data = serde_json::json!({
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "return_code": result.return_code,
                    "duration_ms": result.duration_ms,
                });
                (success, Some(data), error)
            }
            PrimitiveKind::Http => {
                let result = self.http.execute(&merged_config, parameters).await;
                (result.success, Some(result.to_json()), result.error.clone())
            }
            PrimitiveKind::HttpStream => {
                let return_sink = ReturnSink::default();
                let sinks: Vec<&dyn StreamSink> = vec![&return_sink];
                let result = self
                    .http
                    .execute_stream(&merged_config, parameters, &sinks, Some(&return_sink))
                    .await;
                (result.success, Some(result.to_json()), result.error.clone())
            }
        };

        Ok(ExecutionResult {
            success,
            data,
            error,
            chain: chain.iter().map(ChainElement::summary).collect(),
            duration_ms: started.elapsed().as_millis() as u64,
            metadata: serde_json::json!({
                "resolved_env_keys": resolved_env_keys,
                "chain_links": chain.len(),
            }),
        })
    }

    /// Compare against the pinned lockfile when one exists; pin the chain
    /// otherwise. A hash mismatch is a hard failure.
    fn enforce_lockfile(&self, chain: &[ChainElement]) -> Result<()> {
        let Some(root) = chain.first() else {
            return Ok(());
        };
        let resolver = LockfileResolver::new(&self.config);
        match resolver.get(&root.item_id, &root.metadata.version) {
            Some(lockfile) => lockfile.verify_against(chain),
            None => {
                if let Some(lockfile) = Lockfile::from_chain(chain) {
                    resolver.save(&lockfile, &self.keypair)?;
                }
                Ok(())
            }
        }
    }
}

/// Recursive JSON merge: objects merge key-wise, everything else replaces.
fn merge_into(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match target_map.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target_slot, overlay) => {
            *target_slot = overlay.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::Path;

    fn write_tool(base: &Path, id: &str, body: &str) {
        let path = base.join(".ai/tools").join(format!("{id}.tool.toml"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn setup_http_tool(tmp: &Path, url: &str) -> (Config, Keypair) {
        let project = tmp.join("proj");
        write_tool(
            &project,
            "net/fetch",
            &format!(
                "version = \"1.0.0\"\ntool_type = \"http\"\nexecutor_id = \"rye/core/primitives/http\"\n[config]\nurl = \"{url}\"\n"
            ),
        );
        write_tool(
            &project,
            "rye/core/primitives/http",
            "version = \"1.0.0\"\ntool_type = \"primitive\"\n[primitive]\nkind = \"http\"\n[config]\ntimeout = 5\n",
        );
        let config = Config::with_spaces(Some(project), tmp.join("home")).unwrap();
        let keypair = Keypair::ensure(&config.keys_dir()).unwrap();
        (config, keypair)
    }

    #[test]
    fn merge_child_overrides_parent() {
        let mut base = json!({"timeout": 30, "headers": {"a": "1"}});
        merge_into(&mut base, &json!({"timeout": 5, "headers": {"b": "2"}}));
        assert_eq!(
            base,
            json!({"timeout": 5, "headers": {"a": "1", "b": "2"}})
        );
    }

    #[tokio::test]
    async fn executes_http_chain_end_to_end() {
        use wiremock::Mock;
        use wiremock::MockServer;
        use wiremock::ResponseTemplate;
        use wiremock::matchers::method;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (config, keypair) = setup_http_tool(tmp.path(), &server.uri());
        let executor = PrimitiveExecutor {
            config,
            subprocess: None,
            http: HttpPrimitive::new(),
            keypair,
        };

        let result = executor.execute("net/fetch", &json!({})).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.chain.len(), 2);
        let data = result.data.unwrap();
        assert_eq!(data["body"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn dry_run_reports_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, keypair) = setup_http_tool(tmp.path(), "http://localhost:1");
        let executor = PrimitiveExecutor {
            config,
            subprocess: None,
            http: HttpPrimitive::new(),
            keypair,
        };
        let (chain, pairs) = executor.dry_run("net/fetch").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(pairs, 1);
    }

    #[tokio::test]
    async fn lockfile_mismatch_is_hard_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, keypair) = setup_http_tool(tmp.path(), "http://localhost:1");
        let project = config.project_path.clone().unwrap();

        // First execution pins the chain.
        let executor = PrimitiveExecutor {
            config: config.clone(),
            subprocess: None,
            http: HttpPrimitive::new(),
            keypair,
        };
        let chain = build_chain(executor.config(), "net/fetch").unwrap();
        executor.enforce_lockfile(&chain).unwrap();

        // Tampering with the metadata afterwards must fail enforcement.
        write_tool(
            &project,
            "net/fetch",
            "version = \"1.0.0\"\ntool_type = \"http\"\nexecutor_id = \"rye/core/primitives/http\"\n[config]\nurl = \"http://evil\"\n",
        );
        let drifted = build_chain(executor.config(), "net/fetch").unwrap();
        let err = executor.enforce_lockfile(&drifted).unwrap_err();
        assert!(matches!(err, RyeErr::Integrity(_)));
    }
}
