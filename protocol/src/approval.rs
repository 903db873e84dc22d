use serde::Deserialize;
use serde::Serialize;

/// Body of `{request_id}.request.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub prompt: String,
    pub thread_id: String,
    pub created_at: String,
    pub timeout_seconds: u64,
}

/// Body of `{request_id}.response.json`, written by an approver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub responded_at: String,
}
