//! Subprocess execution primitive.
//!
//! All process operations go through the external `rye-proc` helper binary
//! and its stdout-JSON interface. There are no POSIX fallbacks: the
//! helper's absence on PATH is a hard configuration error at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use std::time::Instant;

use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;
use crate::error::RyeErr;

/// Below this many configured variables the config env is merged over the
/// process environment; at or above it the config env is used as-is
/// (assumed fully resolved). Tunable; the threshold itself is a heuristic.
pub const ENV_MERGE_THRESHOLD: usize = 50;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Margin added around the helper process itself; rye-proc enforces the
/// tool timeout internally.
const WRAPPER_TIMEOUT_MARGIN_SECS: u64 = 10;

/// Only uppercase snake_case names are treated as env references, so
/// context interpolation templates like `${state.issues}` pass through.
#[expect(clippy::expect_used)]
static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*(?::-[^}]*)?)\}").expect("valid literal regex")
});

#[expect(clippy::expect_used)]
static PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("valid literal regex"));

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubprocessResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpawnResult {
    pub success: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KillResult {
    pub success: bool,
    #[serde(default)]
    pub pid: u32,
    /// "terminated", "killed", or "already_dead".
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusResult {
    pub pid: u32,
    pub alive: bool,
}

pub struct SubprocessPrimitive {
    rye_proc: PathBuf,
}

impl SubprocessPrimitive {
    /// Locate `rye-proc` on PATH. Its absence is fatal configuration.
    pub fn new() -> Result<Self> {
        let rye_proc = find_on_path("rye-proc").ok_or_else(|| {
            RyeErr::Configuration(
                "rye-proc binary not found on PATH. Ensure rye is installed correctly.".into(),
            )
        })?;
        Ok(Self { rye_proc })
    }

    /// Construct against an explicit helper path (tests).
    pub fn with_helper(rye_proc: PathBuf) -> Self {
        Self { rye_proc }
    }

    /// Execute a command via `rye-proc exec`.
    ///
    /// Two-stage templating on command/args/cwd/stdin: `${VAR:-default}`
    /// against the prepared environment first, then `{param}` against the
    /// runtime parameters.
    pub async fn execute(&self, config: &Value, params: &Value) -> SubprocessResult {
        let start = Instant::now();

        let command = config.get("command").and_then(Value::as_str);
        let args: Vec<String> = config
            .get("args")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let cwd = config.get("cwd").and_then(Value::as_str);
        let input_data = config.get("input_data").and_then(Value::as_str);
        let timeout_secs = config
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let config_env: HashMap<String, String> = config
            .get("env")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let process_env = prepare_env(&config_env);

        let template = |text: &str| -> String {
            let env_resolved = template_env_vars(text, &process_env);
            template_params(&env_resolved, params)
        };

        let Some(command) = command.map(|c| template(c)).filter(|c| !c.is_empty()) else {
            return SubprocessResult {
                success: false,
                stdout: String::new(),
                stderr: "No command specified".to_string(),
                return_code: -1,
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            };
        };
        let args: Vec<String> = args.iter().map(|a| template(a)).collect();
        let cwd = cwd.map(|c| template(c));
        let input_data = input_data.map(|s| template(s));

        let mut exec_args: Vec<String> =
            vec!["exec".to_string(), "--cmd".to_string(), command];
        for arg in &args {
            exec_args.push("--arg".to_string());
            exec_args.push(arg.clone());
        }
        if let Some(cwd) = &cwd {
            exec_args.push("--cwd".to_string());
            exec_args.push(cwd.clone());
        }
        if let Some(stdin) = &input_data {
            exec_args.push("--stdin".to_string());
            exec_args.push(stdin.clone());
        }
        exec_args.push("--timeout".to_string());
        exec_args.push(timeout_secs.to_string());
        for (key, value) in &process_env {
            exec_args.push("--env".to_string());
            exec_args.push(format!("{key}={value}"));
        }

        let wrapper_timeout =
            Duration::from_secs(timeout_secs + WRAPPER_TIMEOUT_MARGIN_SECS);
        match self.run_helper(&exec_args, wrapper_timeout).await {
            Ok(stdout) => match serde_json::from_str::<SubprocessResult>(stdout.trim()) {
                Ok(result) => result,
                Err(e) => SubprocessResult {
                    success: false,
                    stdout,
                    stderr: format!("rye-proc produced unparseable output: {e}"),
                    return_code: -1,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                },
            },
            Err(e) => SubprocessResult {
                success: false,
                stdout: String::new(),
                stderr: e.to_string(),
                return_code: -1,
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            },
        }
    }

    /// Detached launch with log redirection via `rye-proc spawn`.
    pub async fn spawn(
        &self,
        cmd: &str,
        args: &[String],
        log_path: Option<&str>,
        envs: Option<&HashMap<String, String>>,
    ) -> SpawnResult {
        let mut exec_args = vec!["spawn".to_string(), "--cmd".to_string(), cmd.to_string()];
        for arg in args {
            exec_args.push("--arg".to_string());
            exec_args.push(arg.clone());
        }
        if let Some(log) = log_path {
            exec_args.push("--log".to_string());
            exec_args.push(log.to_string());
        }
        if let Some(envs) = envs {
            for (k, v) in envs {
                exec_args.push("--env".to_string());
                exec_args.push(format!("{k}={v}"));
            }
        }
        match self.run_helper(&exec_args, Duration::from_secs(10)).await {
            Ok(stdout) => serde_json::from_str(stdout.trim()).unwrap_or(SpawnResult {
                success: false,
                pid: None,
                error: Some("rye-proc produced unparseable output".to_string()),
            }),
            Err(e) => SpawnResult {
                success: false,
                pid: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Graceful-then-forceful kill via `rye-proc kill`.
    pub async fn kill(&self, pid: u32, grace: f64) -> KillResult {
        let exec_args = vec![
            "kill".to_string(),
            "--pid".to_string(),
            pid.to_string(),
            "--grace".to_string(),
            grace.to_string(),
        ];
        let timeout = Duration::from_secs_f64(grace + 5.0);
        match self.run_helper(&exec_args, timeout).await {
            Ok(stdout) => {
                let mut result: KillResult =
                    serde_json::from_str(stdout.trim()).unwrap_or(KillResult {
                        success: false,
                        pid,
                        method: String::new(),
                        error: Some("rye-proc produced unparseable output".to_string()),
                    });
                result.pid = pid;
                result
            }
            Err(e) => KillResult {
                success: false,
                pid,
                method: String::new(),
                error: Some(e.to_string()),
            },
        }
    }

    /// Liveness check via `rye-proc status`.
    pub async fn status(&self, pid: u32) -> StatusResult {
        let exec_args = vec!["status".to_string(), "--pid".to_string(), pid.to_string()];
        match self.run_helper(&exec_args, Duration::from_secs(5)).await {
            Ok(stdout) => {
                serde_json::from_str(stdout.trim()).unwrap_or(StatusResult { pid, alive: false })
            }
            Err(_) => StatusResult { pid, alive: false },
        }
    }

    async fn run_helper(&self, args: &[String], timeout: Duration) -> Result<String> {
        debug!(helper = %self.rye_proc.display(), subcommand = ?args.first(), "invoking rye-proc");
        let mut child = Command::new(&self.rye_proc)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RyeErr::Io(std::io::Error::other(
                "stdout pipe was unexpectedly not available",
            ))
        })?;
        let mut reader = tokio::io::BufReader::new(stdout);
        let mut output = String::new();

        let read_all = async {
            use tokio::io::AsyncReadExt;
            reader.read_to_string(&mut output).await?;
            child.wait().await
        };

        match tokio::time::timeout(timeout, read_all).await {
            Ok(Ok(status)) => {
                if output.trim().is_empty() && !status.success() {
                    return Err(RyeErr::Configuration(format!(
                        "rye-proc exited with {status} and no output"
                    )));
                }
                Ok(output)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                child.start_kill()?;
                Err(RyeErr::Configuration(format!(
                    "rye-proc wrapper timed out after {} seconds",
                    timeout.as_secs()
                )))
            }
        }
    }
}

/// Stage 1: expand `${VAR:-default}` against the prepared environment.
fn template_env_vars(text: &str, env: &HashMap<String, String>) -> String {
    let mut result = String::new();
    let mut last = 0;
    for caps in ENV_VAR_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        result.push_str(&text[last..whole.start()]);
        let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, default),
            None => (expr, ""),
        };
        result.push_str(env.get(name).map(String::as_str).unwrap_or(default));
        last = whole.end();
    }
    result.push_str(&text[last..]);
    result
}

/// Stage 2: substitute `{param}` with runtime parameters. Missing params
/// are left unchanged.
fn template_params(text: &str, params: &Value) -> String {
    let mut result = String::new();
    let mut last = 0;
    for caps in PARAM_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        result.push_str(&text[last..whole.start()]);
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        match params.get(name) {
            Some(Value::String(s)) => result.push_str(s),
            Some(other) => result.push_str(&other.to_string()),
            None => result.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    result.push_str(&text[last..]);
    result
}

/// Env merge heuristic: below [`ENV_MERGE_THRESHOLD`] configured vars the
/// config env is layered over the process environment; at or above it the
/// config env is taken as-is.
fn prepare_env(config_env: &HashMap<String, String>) -> HashMap<String, String> {
    if config_env.len() < ENV_MERGE_THRESHOLD {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(config_env.clone());
        env
    } else {
        config_env.clone()
    }
}

fn find_on_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn env_templating_only_matches_uppercase() {
        let env = HashMap::from([("API_BASE".to_string(), "https://api".to_string())]);
        assert_eq!(
            template_env_vars("${API_BASE}/v1 and ${state.issues}", &env),
            "https://api/v1 and ${state.issues}"
        );
        assert_eq!(template_env_vars("${MISSING:-def}", &env), "def");
    }

    #[test]
    fn param_templating_leaves_missing_params() {
        let params = json!({"path": "/t/x", "count": 3});
        assert_eq!(
            template_params("write {path} {count} {absent}", &params),
            "write /t/x 3 {absent}"
        );
    }

    #[test]
    fn env_merge_heuristic_switches_at_threshold() {
        // SAFETY: test-only env mutation, single-threaded access.
        unsafe { std::env::set_var("SUBPROC_MERGE_PROBE", "from-process") };
        let small = HashMap::from([("A".to_string(), "1".to_string())]);
        let merged = prepare_env(&small);
        assert_eq!(
            merged.get("SUBPROC_MERGE_PROBE").map(String::as_str),
            Some("from-process")
        );

        let big: HashMap<String, String> = (0..ENV_MERGE_THRESHOLD)
            .map(|i| (format!("VAR_{i}"), "x".to_string()))
            .collect();
        let as_is = prepare_env(&big);
        assert!(!as_is.contains_key("SUBPROC_MERGE_PROBE"));
        assert_eq!(as_is.len(), ENV_MERGE_THRESHOLD);
    }

    #[tokio::test]
    async fn missing_command_fails_fast() {
        let primitive = SubprocessPrimitive::with_helper(PathBuf::from("/nonexistent/rye-proc"));
        let result = primitive.execute(&json!({}), &json!({})).await;
        assert!(!result.success);
        assert_eq!(result.stderr, "No command specified");
    }

    #[tokio::test]
    async fn helper_absence_surfaces_in_result() {
        let primitive = SubprocessPrimitive::with_helper(PathBuf::from("/nonexistent/rye-proc"));
        let result = primitive
            .execute(&json!({"command": "echo"}), &json!({}))
            .await;
        assert!(!result.success);
        assert_eq!(result.return_code, -1);
    }
}
