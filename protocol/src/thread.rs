use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::cost::Cost;
use crate::limits::Limits;
use crate::directive::ModelSpec;

/// Lifecycle state of a thread.
///
/// `continued` is terminal for the thread that was continued; the chain
/// pointers on [`ThreadMetadata`] link it to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThreadStatus {
    Created,
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
    Continued,
}

impl ThreadStatus {
    /// Terminal statuses release budget reservations and never transition
    /// again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ThreadStatus::Completed
                | ThreadStatus::Error
                | ThreadStatus::Cancelled
                | ThreadStatus::Continued
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThreadMode {
    #[default]
    Single,
    Conversation,
    Channel,
}

/// Which external event a paused thread is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Awaiting {
    User,
    Approval,
    Child,
}

/// Persistent per-thread record, serialized to
/// `{threads_dir}/{thread_id}/thread.json`.
///
/// The file carries a `_signature` field over the canonical JSON of the
/// remaining fields; signing and verification live in `rye-core`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub thread_id: String,
    pub directive: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    pub status: ThreadStatus,
    #[serde(default)]
    pub thread_mode: ThreadMode,
    pub model: ModelSpec,
    /// Tool schemas exposed to the model for this thread, keyed by the
    /// name the model sees.
    #[serde(default)]
    pub tool_defs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub turn_count: u64,
    #[serde(default)]
    pub cost: Cost,
    /// Host process id, for liveness checks against the registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Back pointer: the thread this one continues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_of: Option<String>,
    /// Forward pointer: the thread that continues this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_root_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<Awaiting>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "_signature")]
    pub signature: Option<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn status_terminality() {
        assert!(ThreadStatus::Completed.is_terminal());
        assert!(ThreadStatus::Continued.is_terminal());
        assert!(!ThreadStatus::Paused.is_terminal());
        assert!(!ThreadStatus::Running.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ThreadStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(ThreadStatus::Cancelled.to_string(), "cancelled");
    }
}
