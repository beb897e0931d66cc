//! Run orchestration engine for tool-using LLM conversations.
//!
//! `relay-rs` drives multi-step conversations against a remote, stateful
//! "assistants" style run service. A caller submits a prompt; the engine posts
//! it into a durable conversation, launches a run, services every tool call the
//! model issues, keeps token spend under a sliding per-minute budget, compacts
//! old history when the conversation grows too large, and returns the final
//! reply. The core abstraction is the [`Orchestrator`](agent::Orchestrator),
//! which owns all process-wide state.
//!
//! # Getting started
//!
//! ```ignore
//! use relay_rs::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RelayError> {
//!     let config = RelayConfig::from_env();
//!     let client = OpenAiClient::new(std::env::var("OPENAI_API_KEY").unwrap_or_default())?;
//!     let orchestrator = Orchestrator::builder(Arc::new(client), config)
//!         .with_event_handler(LoggingHandler)
//!         .build();
//!
//!     let outcome = orchestrator
//!         .handle_prompt(PromptRequest::new("List the files in src/"))
//!         .await;
//!     if let PromptOutcome::Completed(reply) = outcome {
//!         println!("{}", reply.result);
//!     }
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Turn lifecycle:** [`agent::orchestrator`] (prompt handling, retries,
//!   self-continuation), [`agent::run`] (the run state machine), and
//!   [`agent::lock`] (per-conversation serialization).
//! - **Budgeting:** [`context::governor`] for the sliding token window and
//!   the shrink cascade, [`context::compactor`] for summarizing old history,
//!   [`context::estimate`] for the swappable token estimator.
//! - **Tools:** [`tools::core`] for the [`Tool`](tools::Tool) trait and
//!   [`ToolRegistry`](tools::ToolRegistry), [`tools::dispatch`] for in-order
//!   batch execution, and the built-in handlers in [`tools::fs`],
//!   [`tools::exec`], [`tools::sidecar`] and [`tools::control`].
//! - **Background processes:** [`process::sidecar`].
//! - **Remote contract:** [`api::service::RunService`] and its HTTP
//!   implementation [`api::client::OpenAiClient`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Orchestrator, run driver, locks, conversation store, events, config |
//! | [`api`] | Remote run service trait, HTTP client, retry classification |
//! | [`context`] | Token estimation, sliding-window governor, history compaction |
//! | [`tools`] | Tool trait, registry, dispatcher, built-in handlers |
//! | [`process`] | Sidecar process manager |

pub mod agent;
pub mod api;
pub mod context;
pub mod error;
pub mod prelude;
pub mod process;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::{ErrorClass, RelayError, RemoteError, ToolError};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default base URL of the remote run service.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use relay_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct ShellArgs {
///     command: String,
///     #[serde(default)]
///     cwd: Option<String>,
/// }
///
/// let schema = json_schema_for::<ShellArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"command".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Roles ──────────────────────────────────────────────────────────

/// Role of a message in a conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

// ── Thread messages ────────────────────────────────────────────────

/// Text payload of a content segment. The remote service returns annotated
/// objects; locally edited messages may carry a bare string.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum TextValue {
    Plain(String),
    Annotated {
        value: String,
        #[serde(default)]
        annotations: Vec<serde_json::Value>,
    },
}

impl TextValue {
    pub fn as_str(&self) -> &str {
        match self {
            TextValue::Plain(s) => s,
            TextValue::Annotated { value, .. } => value,
        }
    }
}

/// One segment of a message's content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type", default = "text_part_type")]
    pub part_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextValue>,
}

fn text_part_type() -> String {
    "text".into()
}

impl ContentPart {
    /// A text segment in the annotated shape the remote service uses.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            part_type: text_part_type(),
            text: Some(TextValue::Annotated {
                value: value.into(),
                annotations: Vec::new(),
            }),
        }
    }
}

/// A persisted conversation message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ThreadMessage {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Unix epoch seconds.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ThreadMessage {
    pub fn new(id: impl Into<String>, role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: vec![ContentPart::text(text)],
            created_at: chrono::Utc::now().timestamp(),
            metadata: None,
        }
    }

    /// A locally synthesized assistant message, used when a run ends without
    /// producing a reply.
    pub fn synthetic(text: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self::new(
            format!("synthetic_{}", now.timestamp_millis()),
            MessageRole::Assistant,
            text,
        )
    }

    /// All text segments joined with newlines.
    pub fn text(&self) -> String {
        flatten_content(&self.content)
    }
}

/// Join every text segment with `\n`. Non-text segments are skipped.
pub fn flatten_content(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| p.text.as_ref().map(TextValue::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

// ── Chat completions ───────────────────────────────────────────────

/// A plain chat-completion message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Roles accepted by the chat-completion endpoint.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Chat completion request body.
#[derive(Serialize, Debug, Default, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Clean return type from [`RunService::chat`](api::service::RunService::chat).
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

/// Token usage statistics reported by the remote service.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}
