use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

/// Transcript event vocabulary. One event per JSONL line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    ThreadStart,
    UserMessage,
    StepStart,
    /// The message list handed to the provider this turn.
    CognitionIn,
    /// The provider's reply, with usage.
    CognitionOut,
    AssistantText,
    AssistantReasoning,
    ToolCallStart,
    ToolCallResult,
    StepFinish,
    ThreadContinue,
    Checkpoint,
    ThreadComplete,
    ThreadPaused,
    ThreadError,
    ThreadCancelled,
}

/// One line of `transcript.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub thread_id: String,
    pub event_type: EventType,
    pub payload: Value,
}

/// Payload of a `checkpoint` event. `byte_offset` is the transcript length
/// before the checkpoint line is written; `hash` covers bytes
/// `[0, byte_offset)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub turn: u64,
    pub byte_offset: u64,
    /// SHA-256, 64 lowercase hex chars.
    pub hash: String,
    /// Ed25519 signature over the hash, base64url.
    pub sig: String,
    /// Signing key fingerprint, 16 lowercase hex chars.
    pub fp: String,
    /// ISO-8601 UTC seconds.
    pub ts: String,
}
