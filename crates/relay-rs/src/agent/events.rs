//! Lifecycle events, handlers, and the turn log.
//!
//! The orchestrator reports progress through [`RunEvent`] variants covering
//! a turn from its first attempt through tool execution, compaction, retries
//! and self-continuation. Callers implement [`EventHandler`] to observe them.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget turns |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//!
//! [`TurnLog`] is different: it is the caller-visible record of one turn
//! (tool calls, their results, and retries) returned with every outcome.

use crate::api::service::RunStatus;
use crate::context::compactor::CompactionOutcome;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum RunEvent<'a> {
    /// A turn attempt is starting.
    TurnStarted {
        conversation_id: &'a str,
        attempt: u32,
        max_attempts: u32,
    },
    /// A compaction pass ran before the turn.
    Compaction {
        conversation_id: &'a str,
        outcome: &'a CompactionOutcome,
    },
    RunCreated { run_id: &'a str },
    /// Polling observed a new status.
    RunStatusChanged { run_id: &'a str, status: RunStatus },
    /// The run asked for a batch of tool calls.
    ToolCallsReceived { run_id: &'a str, count: usize },
    ToolExecuting { name: &'a str, arguments: &'a str },
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
    },
    /// Tokens admitted by the governor and the conversation's new tally.
    TokensReserved { tokens: u64, tally: u64 },
    /// Outputs were re-summarized to fit the remaining budget.
    OutputsCompressed { count: usize },
    /// A turn attempt failed and will be retried.
    Retry { attempt: u32, error: &'a str },
    /// A tool scheduled a follow-up turn.
    SelfPrompt { depth: u32, prompt: &'a str },
    Cancelled { conversation_id: &'a str },
    Finished {
        conversation_id: &'a str,
        status: RunStatus,
    },
}

/// Observer for [`RunEvent`]s. The default implementation ignores them.
///
/// # Example
///
/// ```ignore
/// struct Counter(AtomicUsize);
///
/// impl EventHandler for Counter {
///     fn on_event(&self, event: &RunEvent<'_>) {
///         if let RunEvent::ToolResult { .. } = event {
///             self.0.fetch_add(1, Ordering::Relaxed);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &RunEvent<'_>) {
        let _ = event;
    }
}

pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&RunEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&RunEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&RunEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent<'_>) {
        (self.0)(event)
    }
}

/// Delegates every event to each inner handler in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(verbose, DebugHandler::new())
///     .with_opt(metrics.map(MetricsHandler::new));
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &RunEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs every event through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &RunEvent<'_>) {
        match event {
            RunEvent::TurnStarted {
                conversation_id,
                attempt,
                max_attempts,
            } => {
                info!("[{conversation_id}] attempt {attempt}/{max_attempts}");
            }
            RunEvent::Compaction {
                conversation_id,
                outcome,
            } => {
                if outcome.is_noop() {
                    debug!("[{conversation_id}] compaction (keep={}) was a no-op", outcome.keep);
                } else {
                    info!(
                        "[{conversation_id}] compacted {} messages (keep={}), tally {} -> {}",
                        outcome.removed, outcome.keep, outcome.tally_before, outcome.tally_after
                    );
                }
            }
            RunEvent::RunCreated { run_id } => {
                debug!("Run {run_id} created");
            }
            RunEvent::RunStatusChanged { run_id, status } => {
                debug!("Run {run_id} is {status}");
            }
            RunEvent::ToolCallsReceived { run_id, count } => {
                info!("Run {run_id} requested {count} tool call(s)");
            }
            RunEvent::ToolExecuting { name, .. } => {
                debug!("Executing tool: {name}");
            }
            RunEvent::ToolResult { name, result, .. } => {
                debug!("Tool {name} result: {} bytes", result.len());
            }
            RunEvent::TokensReserved { tokens, tally } => {
                debug!("Reserved {tokens} tokens, tally now {tally}");
            }
            RunEvent::OutputsCompressed { count } => {
                info!("Compressed {count} tool output(s) to fit the token budget");
            }
            RunEvent::Retry { attempt, error } => {
                warn!("Attempt {attempt} failed: {error}");
            }
            RunEvent::SelfPrompt { depth, prompt } => {
                let preview: String = prompt.chars().take(120).collect();
                info!("Self-prompt #{depth}: {preview}");
            }
            RunEvent::Cancelled { conversation_id } => {
                info!("[{conversation_id}] cancelled by user");
            }
            RunEvent::Finished {
                conversation_id,
                status,
            } => {
                info!("[{conversation_id}] turn finished ({status})");
            }
        }
    }
}

// ── Turn log ───────────────────────────────────────────────────────

/// One entry of the log returned with every prompt outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnLog {
    /// Arguments are the parsed JSON object, or the raw string if it did
    /// not parse.
    FunctionCall {
        name: String,
        arguments: serde_json::Value,
    },
    FunctionResult { name: String, result: String },
    Retry { attempt: u32, error: String },
}

impl TurnLog {
    pub fn call(name: impl Into<String>, raw_arguments: &str) -> Self {
        let arguments = serde_json::from_str(raw_arguments)
            .unwrap_or_else(|_| serde_json::Value::String(raw_arguments.to_string()));
        TurnLog::FunctionCall {
            name: name.into(),
            arguments,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, TurnLog::Retry { .. })
    }
}
