//! Convenience re-exports for common `relay-rs` types.
//!
//! Meant to be glob-imported by frontends:
//!
//! ```ignore
//! use relay_rs::prelude::*;
//! ```
//!
//! This pulls in what most callers need: the [`OpenAiClient`], the
//! [`Orchestrator`] with its request and outcome types, configuration,
//! event handlers, and the [`Tool`] trait for registering custom tools.
//! Lower-level pieces (the run driver, the compactor, the governor) are
//! left out; import those from their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ErrorClass, MessageRole, RelayError, ThreadMessage, ToolDef, ToolError, json_schema_for,
};

// ── Remote service ──────────────────────────────────────────────────
pub use crate::api::{OpenAiClient, RetryConfig, RunService, RunStatus};

// ── Orchestration ───────────────────────────────────────────────────
pub use crate::agent::{
    CompositeEventHandler, Conversation, ConversationSummary, EventHandler, FnEventHandler,
    LoggingHandler, NoopHandler, Orchestrator, PromptOutcome, PromptReply, PromptRequest,
    RelayConfig, RunEvent, TokenLimits, TurnLog,
};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::spec::ToolSpec;
pub use crate::tools::{Tool, ToolContext, ToolFuture, ToolOutcome, parse_tool_args};
