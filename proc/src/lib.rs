//! The process helper behind the subprocess primitive.
//!
//! Every operation prints one JSON report on stdout and exits 0 whenever a
//! report was produced; callers parse stdout rather than the exit status.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecReport {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpawnReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillReport {
    pub success: bool,
    pub pid: u32,
    /// "terminated", "killed", or "already_dead".
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub pid: u32,
    pub alive: bool,
}

/// Run a command with a timeout, capturing stdout/stderr. On expiry the
/// child is killed and the report says so.
pub async fn exec(
    cmd: &str,
    args: &[String],
    cwd: Option<&str>,
    stdin_data: Option<&str>,
    timeout_secs: u64,
    env: &HashMap<String, String>,
) -> ExecReport {
    let started = Instant::now();

    let mut command = Command::new(cmd);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    if stdin_data.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecReport {
                success: false,
                stdout: String::new(),
                stderr: format!("spawn failed: {e}"),
                return_code: 127,
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            };
        }
    };

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stdin.write_all(data.as_bytes()).await;
            drop(stdin);
        }
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let timeout = Duration::from_secs(timeout_secs.max(1));
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            return ExecReport {
                success: false,
                stdout: String::new(),
                stderr: format!("wait failed: {e}"),
                return_code: -1,
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            };
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
    let stderr_captured =
        String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    match status {
        Some(status) => {
            let return_code = status.code().unwrap_or(-1);
            ExecReport {
                success: return_code == 0,
                stdout,
                stderr: stderr_captured,
                return_code,
                duration_ms,
            }
        }
        None => ExecReport {
            success: false,
            stdout,
            stderr: format!("command timed out after {timeout_secs} seconds"),
            return_code: -1,
            duration_ms,
        },
    }
}

/// Detached launch with stdout/stderr redirected to a log file. The child
/// survives this process.
pub fn spawn_detached(
    cmd: &str,
    args: &[String],
    log_path: Option<&str>,
    env: &HashMap<String, String>,
) -> SpawnReport {
    let (stdout, stderr) = match log_path {
        Some(path) => {
            let file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => file,
                Err(e) => {
                    return SpawnReport {
                        success: false,
                        pid: None,
                        error: Some(format!("cannot open log file: {e}")),
                    };
                }
            };
            let clone = match file.try_clone() {
                Ok(clone) => clone,
                Err(e) => {
                    return SpawnReport {
                        success: false,
                        pid: None,
                        error: Some(format!("cannot clone log handle: {e}")),
                    };
                }
            };
            (Stdio::from(file), Stdio::from(clone))
        }
        None => (Stdio::null(), Stdio::null()),
    };

    let mut command = std::process::Command::new(cmd);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    for (key, value) in env {
        command.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session so the child is not torn down with this helper.
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    match command.spawn() {
        Ok(child) => SpawnReport {
            success: true,
            pid: Some(child.id()),
            error: None,
        },
        Err(e) => SpawnReport {
            success: false,
            pid: None,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(unix)]
fn signal(pid: u32, sig: i32) -> bool {
    unsafe { libc::kill(pid as i32, sig) == 0 }
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    signal(pid, 0)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Graceful-then-forceful kill: SIGTERM, wait up to `grace` seconds, then
/// SIGKILL.
#[cfg(unix)]
pub async fn kill(pid: u32, grace: f64) -> KillReport {
    if !is_alive(pid) {
        return KillReport {
            success: true,
            pid,
            method: "already_dead".to_string(),
            error: None,
        };
    }

    if !signal(pid, libc::SIGTERM) {
        return KillReport {
            success: false,
            pid,
            method: String::new(),
            error: Some("SIGTERM failed".to_string()),
        };
    }

    let deadline = Instant::now() + Duration::from_secs_f64(grace.max(0.0));
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return KillReport {
                success: true,
                pid,
                method: "terminated".to_string(),
                error: None,
            };
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if signal(pid, libc::SIGKILL) {
        KillReport {
            success: true,
            pid,
            method: "killed".to_string(),
            error: None,
        }
    } else if !is_alive(pid) {
        KillReport {
            success: true,
            pid,
            method: "terminated".to_string(),
            error: None,
        }
    } else {
        KillReport {
            success: false,
            pid,
            method: String::new(),
            error: Some("SIGKILL failed".to_string()),
        }
    }
}

#[cfg(not(unix))]
pub async fn kill(pid: u32, _grace: f64) -> KillReport {
    KillReport {
        success: false,
        pid,
        method: String::new(),
        error: Some("kill is not supported on this platform".to_string()),
    }
}

/// Parse repeated `--env KEY=VALUE` flags.
pub fn parse_env_pairs(pairs: &[String]) -> HashMap<String, String> {
    pairs
        .iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn exec_captures_output_and_exit_code() {
        let report = exec(
            "/bin/sh",
            &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            None,
            None,
            5,
            &HashMap::new(),
        )
        .await;
        assert!(!report.success);
        assert_eq!(report.return_code, 3);
        assert_eq!(report.stdout.trim(), "out");
        assert_eq!(report.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn exec_passes_stdin_and_env() {
        let report = exec(
            "/bin/sh",
            &["-c".to_string(), "cat; printf %s \"$PROBE\"".to_string()],
            None,
            Some("piped-in "),
            5,
            &HashMap::from([("PROBE".to_string(), "env-ok".to_string())]),
        )
        .await;
        assert!(report.success);
        assert_eq!(report.stdout, "piped-in env-ok");
    }

    #[tokio::test]
    async fn exec_times_out_and_kills() {
        let started = Instant::now();
        let report = exec(
            "/bin/sh",
            &["-c".to_string(), "sleep 30".to_string()],
            None,
            None,
            1,
            &HashMap::new(),
        )
        .await;
        assert!(!report.success);
        assert!(report.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_binary_reports_127() {
        let report = exec(
            "/nonexistent/binary",
            &[],
            None,
            None,
            5,
            &HashMap::new(),
        )
        .await;
        assert!(!report.success);
        assert_eq!(report.return_code, 127);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_then_status_then_kill() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("out.log");
        let report = spawn_detached(
            "/bin/sh",
            &["-c".to_string(), "sleep 30".to_string()],
            log.to_str(),
            &HashMap::new(),
        );
        assert!(report.success);
        let pid = report.pid.unwrap();
        assert!(is_alive(pid));

        let kill_report = kill(pid, 1.0).await;
        assert!(kill_report.success);
        assert!(["terminated", "killed"].contains(&kill_report.method.as_str()));

        let again = kill(pid, 0.5).await;
        assert_eq!(again.method, "already_dead");
    }

    #[test]
    fn env_pair_parsing_skips_malformed() {
        let env = parse_env_pairs(&[
            "A=1".to_string(),
            "B=x=y".to_string(),
            "malformed".to_string(),
        ]);
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("B").map(String::as_str), Some("x=y"));
    }
}
