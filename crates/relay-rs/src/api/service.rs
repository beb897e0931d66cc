//! The remote conversation-service contract.
//!
//! [`RunService`] is everything the engine needs from the remote side:
//! threads, messages, runs, tool-output submission, assistant profiles, and a
//! plain chat-completion call. [`OpenAiClient`](super::client::OpenAiClient)
//! implements it over HTTP; tests use an in-memory fake.

use crate::error::RemoteError;
use crate::{ChatCompletion, ChatRequest, MessageRole, ThreadMessage, ToolCall, ToolDef, UsageInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Runs ───────────────────────────────────────────────────────────

/// Lifecycle state of a remote run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    #[serde(alias = "errored")]
    Failed,
    Cancelled,
    Expired,
    Incomplete,
}

impl RunStatus {
    /// No further transitions will happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::Expired
                | RunStatus::Incomplete
        )
    }

    /// The run still blocks new runs on its thread.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Still executing remotely, without needing anything from us.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_action: Option<RequiredAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

impl Run {
    /// Tool calls awaiting outputs. Empty unless the run requires action.
    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        match (&self.status, &self.required_action) {
            (RunStatus::RequiresAction, Some(action)) => &action.submit_tool_outputs.tool_calls,
            _ => &[],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RequiredAction {
    pub submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SubmitToolOutputs {
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Parameters for starting a run.
#[derive(Serialize, Clone, Debug)]
pub struct RunRequest {
    pub assistant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// One tool result submitted back to a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

// ── Threads, listing, assistants ───────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RemoteThread {
    pub id: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Cursor-paged list parameters.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    pub limit: u32,
    pub order: SortOrder,
    pub after: Option<String>,
}

impl ListQuery {
    pub fn asc(limit: u32) -> Self {
        Self {
            limit,
            order: SortOrder::Asc,
            after: None,
        }
    }

    pub fn desc(limit: u32) -> Self {
        Self {
            limit,
            order: SortOrder::Desc,
            after: None,
        }
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.after = cursor;
        self
    }
}

/// One page of a cursor-paged listing.
#[derive(Deserialize, Clone, Debug)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub last_id: Option<String>,
}

impl<T> Page<T> {
    /// The cursor for the next page, if there is one.
    pub fn next_cursor(&self) -> Option<String> {
        if self.has_more {
            self.last_id.clone()
        } else {
            None
        }
    }
}

/// Parameters for creating an assistant profile.
#[derive(Serialize, Clone, Debug)]
pub struct AssistantSpec {
    pub name: String,
    pub model: String,
    pub instructions: String,
    pub tools: Vec<ToolDef>,
}

// ── The contract ───────────────────────────────────────────────────

/// Operations the engine requires from the remote run service.
#[async_trait]
pub trait RunService: Send + Sync {
    async fn create_thread(&self) -> Result<RemoteThread, RemoteError>;

    async fn update_thread(
        &self,
        thread_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), RemoteError>;

    async fn delete_thread(&self, thread_id: &str) -> Result<(), RemoteError>;

    async fn list_messages(
        &self,
        thread_id: &str,
        query: &ListQuery,
    ) -> Result<Page<ThreadMessage>, RemoteError>;

    async fn create_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<ThreadMessage, RemoteError>;

    async fn update_message(
        &self,
        thread_id: &str,
        message_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), RemoteError>;

    async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<(), RemoteError>;

    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> Result<Run, RemoteError>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError>;

    async fn list_runs(&self, thread_id: &str, query: &ListQuery)
    -> Result<Page<Run>, RemoteError>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run, RemoteError>;

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<String, RemoteError>;

    async fn delete_assistant(&self, assistant_id: &str) -> Result<(), RemoteError>;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, RemoteError>;
}
