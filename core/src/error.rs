use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, RyeErr>;

#[derive(Error, Debug)]
pub enum RyeErr {
    /// Required helper binaries or configuration missing at startup. Fatal
    /// to the process.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Token missing, or expired with no refresh material.
    #[error("authentication required for {service}: {message}")]
    AuthenticationRequired { service: String, message: String },

    /// The OAuth2 refresh endpoint rejected the refresh.
    #[error("token refresh failed for {service}: {message}")]
    Refresh { service: String, message: String },

    /// Capability check failed. The runner synthesizes this into a tool
    /// result fed back to the model rather than raising.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A declared limit fired. Translated into a `limit` event; hooks
    /// decide control flow.
    #[error("limit exceeded: {limit_code} ({current_value} >= {current_max})")]
    LimitExceeded {
        limit_code: String,
        current_value: f64,
        current_max: f64,
    },

    /// Signature or hash mismatch. Halts the current operation; never
    /// caught silently.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("budget not registered for thread {0}")]
    BudgetNotRegistered(String),

    #[error(
        "insufficient budget on {parent_thread_id}: remaining {remaining:.4}, requested {requested:.4}"
    )]
    InsufficientBudget {
        parent_thread_id: String,
        remaining: f64,
        requested: f64,
    },

    #[error("budget overspend on {thread_id}: reserved {reserved:.4}, actual {actual:.4}")]
    BudgetOverspend {
        thread_id: String,
        reserved: f64,
        actual: f64,
    },

    #[error("budget ledger locked during {0}")]
    BudgetLedgerLocked(String),

    /// Malformed hook condition or template. Rejects the directive at load
    /// time.
    #[error("expression error: {0}")]
    Expression(String),

    /// Schema-driven field validation. Carries every field-level issue so
    /// they are reported in one response.
    #[error("validation failed: {}", issues.join("; "))]
    Validation { issues: Vec<String> },

    #[error("chain validation failed: {0}")]
    ChainValidation(String),

    #[error("item not found: {item_type} '{item_id}'")]
    ItemNotFound { item_type: String, item_id: String },

    /// The SSE stream disconnected or errored out after the HTTP handshake
    /// succeeded but before the terminal response. Retryable.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    /// Unexpected HTTP status from the provider, with the response body so
    /// callers see the exact server message.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry limit exceeded against the provider.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("cannot continue thread {thread_id}: {reason}")]
    InvalidContinuation { thread_id: String, reason: String },

    #[error("approval request {0} timed out")]
    ApprovalTimeout(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),

    #[error("{0}")]
    TomlDe(String),
}

impl From<toml::de::Error> for RyeErr {
    fn from(e: toml::de::Error) -> Self {
        RyeErr::TomlDe(e.to_string())
    }
}

impl RyeErr {
    /// Stable kind tag used by the error classifier and the CLI's JSON
    /// error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            RyeErr::Configuration(_) => "configuration_error",
            RyeErr::AuthenticationRequired { .. } => "authentication_required",
            RyeErr::Refresh { .. } => "refresh_error",
            RyeErr::PermissionDenied(_) => "permission_denied",
            RyeErr::LimitExceeded { .. } => "limit_exceeded",
            RyeErr::Integrity(_) => "integrity_error",
            RyeErr::BudgetNotRegistered(_) => "budget_not_registered",
            RyeErr::InsufficientBudget { .. } => "insufficient_budget",
            RyeErr::BudgetOverspend { .. } => "budget_overspend",
            RyeErr::BudgetLedgerLocked(_) => "budget_ledger_locked",
            RyeErr::Expression(_) => "expression_error",
            RyeErr::Validation { .. } => "validation_error",
            RyeErr::ChainValidation(_) => "chain_validation_error",
            RyeErr::ItemNotFound { .. } => "item_not_found",
            RyeErr::Stream(..) => "stream_error",
            RyeErr::UnexpectedStatus(..) => "unexpected_status",
            RyeErr::RetryLimit(_) => "retry_limit",
            RyeErr::ThreadNotFound(_) => "thread_not_found",
            RyeErr::InvalidContinuation { .. } => "invalid_continuation",
            RyeErr::ApprovalTimeout(_) => "approval_timeout",
            RyeErr::Channel(_) => "channel_error",
            RyeErr::Io(_) => "io_error",
            RyeErr::Reqwest(_) => "http_error",
            RyeErr::Json(_) => "json_error",
            RyeErr::Sqlite(_) => "sqlite_error",
            RyeErr::TokioJoin(_) => "join_error",
            RyeErr::TomlDe(_) => "toml_error",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn validation_error_reports_all_issues() {
        let err = RyeErr::Validation {
            issues: vec!["missing required input 'who'".into(), "unknown input 'x'".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("who"));
        assert!(msg.contains("unknown input 'x'"));
    }

    #[test]
    fn integrity_error_message_is_loud() {
        let err = RyeErr::Integrity("hash mismatch for knowledge 'notes'".into());
        assert!(err.to_string().contains("Integrity check failed"));
    }
}
