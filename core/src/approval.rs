//! File-based human-in-the-loop approval flow.
//!
//! The filesystem is the message bus: requests and responses are atomic
//! JSON files under `{thread_dir}/approvals/`, and waiting is a 1-second
//! poll bounded by the request's timeout. No central broker.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::error::Result;
use crate::error::RyeErr;
use crate::state::write_json_atomic;
use rye_protocol::ApprovalRequest;
use rye_protocol::ApprovalResponse;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn approvals_dir(thread_dir: &Path) -> PathBuf {
    thread_dir.join("approvals")
}

fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Create an approval request file. Returns the request id for polling.
pub fn request_approval(
    thread_dir: &Path,
    thread_id: &str,
    prompt: &str,
    timeout_seconds: u64,
) -> Result<String> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let request_id = format!("approval-{timestamp}");

    let request = ApprovalRequest {
        id: request_id.clone(),
        prompt: prompt.to_string(),
        thread_id: thread_id.to_string(),
        created_at: now_iso(),
        timeout_seconds,
    };
    let path = approvals_dir(thread_dir).join(format!("{request_id}.request.json"));
    write_json_atomic(&path, &request)?;
    info!(%request_id, thread_id, "approval requested");
    Ok(request_id)
}

/// Non-blocking check for a response. `None` until an approver writes one.
pub fn poll_approval(thread_dir: &Path, request_id: &str) -> Result<Option<ApprovalResponse>> {
    let path = approvals_dir(thread_dir).join(format!("{request_id}.response.json"));
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut response: ApprovalResponse = serde_json::from_str(&raw).map_err(|e| {
        RyeErr::Validation {
            issues: vec![format!("malformed approval response {request_id}: {e}")],
        }
    })?;
    response.request_id = Some(request_id.to_string());
    Ok(Some(response))
}

/// Block until a response arrives or the timeout lapses. The timeout
/// defaults to the one recorded on the request file.
pub async fn wait_for_approval(
    thread_dir: &Path,
    request_id: &str,
    timeout_seconds: Option<u64>,
) -> Result<ApprovalResponse> {
    let request_path = approvals_dir(thread_dir).join(format!("{request_id}.request.json"));
    if !request_path.is_file() {
        return Err(RyeErr::ItemNotFound {
            item_type: "approval_request".to_string(),
            item_id: request_id.to_string(),
        });
    }

    let timeout = match timeout_seconds {
        Some(timeout) => timeout,
        None => {
            let raw = std::fs::read_to_string(&request_path)?;
            serde_json::from_str::<ApprovalRequest>(&raw)
                .map(|r| r.timeout_seconds)
                .unwrap_or(300)
        }
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(timeout);
    loop {
        if let Some(response) = poll_approval(thread_dir, request_id)? {
            return Ok(response);
        }
        if std::time::Instant::now() >= deadline {
            return Err(RyeErr::ApprovalTimeout(request_id.to_string()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Write a response file. Used by approvers and tests.
pub fn write_approval_response(
    thread_dir: &Path,
    request_id: &str,
    approved: bool,
    message: &str,
) -> Result<()> {
    let response = ApprovalResponse {
        approved,
        message: message.to_string(),
        request_id: Some(request_id.to_string()),
        responded_at: now_iso(),
    };
    let path = approvals_dir(thread_dir).join(format!("{request_id}.response.json"));
    write_json_atomic(&path, &response)?;
    info!(request_id, approved, "approval response written");
    Ok(())
}

/// Requests that have no matching response yet.
pub fn list_pending_approvals(thread_dir: &Path) -> Result<Vec<ApprovalRequest>> {
    let dir = approvals_dir(thread_dir);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut pending = Vec::new();
    for entry in std::fs::read_dir(&dir)?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(request_id) = name.strip_suffix(".request.json") else {
            continue;
        };
        if dir.join(format!("{request_id}.response.json")).is_file() {
            continue;
        }
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(request) = serde_json::from_str::<ApprovalRequest>(&raw) {
                pending.push(request);
            }
        }
    }
    pending.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(pending)
}
