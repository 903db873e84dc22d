//! Shared data model for the rye thread runtime.
//!
//! Everything in this crate is plain serde-serializable state: the parsed
//! directive model the external markdown/XML parser must produce, thread
//! metadata and cost records, hook declarations, transcript events, channel
//! state, and the capability-token wire form. No I/O happens here; the
//! `rye-core` crate owns persistence and enforcement.

mod approval;
mod channel;
mod cost;
mod directive;
mod event;
mod hook;
mod limits;
mod thread;
mod token;

pub use approval::ApprovalRequest;
pub use approval::ApprovalResponse;
pub use channel::ChannelMember;
pub use channel::ChannelState;
pub use channel::TurnProtocol;
pub use cost::Cost;
pub use cost::TurnUsage;
pub use directive::AcknowledgedRisk;
pub use directive::ActionTemplate;
pub use directive::ContextSpec;
pub use directive::Directive;
pub use directive::DirectiveInput;
pub use directive::DirectiveOutput;
pub use directive::InputType;
pub use directive::ModelSpec;
pub use directive::ModelTier;
pub use event::CheckpointPayload;
pub use event::EventType;
pub use event::TranscriptEvent;
pub use hook::ControlAction;
pub use hook::Hook;
pub use hook::HookAction;
pub use hook::HookLayer;
pub use hook::HookPosition;
pub use limits::Limits;
pub use thread::Awaiting;
pub use thread::ThreadMetadata;
pub use thread::ThreadMode;
pub use thread::ThreadStatus;
pub use token::CapabilityToken;
pub use token::TokenDecodeError;
