//! The orchestrator: one explicitly constructed owner of all process-wide
//! state.
//!
//! [`Orchestrator::handle_prompt`] is the whole turn lifecycle:
//!
//! 1. Resolve the conversation (a new remote thread when no id is given).
//! 2. Take the per-conversation lock and register a cancellation token.
//! 3. Make sure the assistant profile exists and drain stray runs.
//! 4. Up to `max_turn_attempts` times: compact if needed, post the prompt,
//!    drive the run, fetch the reply. Every failed attempt appends a `retry`
//!    entry to the turn log; cancellation ends the turn without one.
//! 5. Follow self-prompts requested by tools, then save the conversation.
//!
//! Everything ends in a [`PromptOutcome`]; no error escapes as a panic.

use crate::agent::assistant::AssistantProfile;
use crate::agent::config::RelayConfig;
use crate::agent::console::ConsoleBridge;
use crate::agent::events::{EventHandler, NoopHandler, RunEvent, TurnLog};
use crate::agent::lock::ThreadLocks;
use crate::agent::run::RunDriver;
use crate::agent::store::{Conversation, ConversationStore, ConversationSummary, validate_id};
use crate::api::retry::retry_remote;
use crate::api::service::{RunRequest, RunService, RunStatus};
use crate::context::compactor::Compactor;
use crate::context::estimate::TokenEstimator;
use crate::context::governor::TokenGovernor;
use crate::error::{ErrorClass, RelayError};
use crate::process::sidecar::SidecarManager;
use crate::tools::core::{Tool, ToolContext, ToolRegistry};
use crate::tools::{BuiltinDeps, builtin_registry};
use crate::{ContentPart, ThreadMessage};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Requests and outcomes ──────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PromptRequest {
    pub prompt: String,
    /// Local conversation id. `None` starts a new conversation.
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    /// Per-turn instructions overriding the configured system prompt.
    pub system_prompt: Option<String>,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptReply {
    pub logs: Vec<TurnLog>,
    /// The reply's text segments joined with newlines.
    pub result: String,
    pub local_id: String,
    pub thread_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub did_write_op: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PromptOutcome {
    Completed(PromptReply),
    Failed { message: String, logs: Vec<TurnLog> },
    Cancelled { logs: Vec<TurnLog> },
}

impl PromptOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PromptOutcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PromptOutcome::Cancelled { .. })
    }

    pub fn logs(&self) -> &[TurnLog] {
        match self {
            PromptOutcome::Completed(reply) => &reply.logs,
            PromptOutcome::Failed { logs, .. } | PromptOutcome::Cancelled { logs } => logs,
        }
    }

    pub fn reply(&self) -> Option<&PromptReply> {
        match self {
            PromptOutcome::Completed(reply) => Some(reply),
            _ => None,
        }
    }
}

/// What one successful attempt produced.
struct Turn {
    user: ThreadMessage,
    reply: ThreadMessage,
    did_write_op: bool,
    self_prompt: Option<String>,
}

// ── Builder ────────────────────────────────────────────────────────

pub struct OrchestratorBuilder {
    service: Arc<dyn RunService>,
    config: RelayConfig,
    events: Box<dyn EventHandler>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    tools: Vec<Box<dyn Tool>>,
    builtins: bool,
}

impl OrchestratorBuilder {
    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = Box::new(handler);
        self
    }

    /// Replace the default character-ratio token estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Register an extra tool. A tool with a built-in name replaces it.
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Box::new(tool));
        self
    }

    /// Start from an empty registry instead of the built-in tools.
    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let governor = Arc::new(match self.estimator {
            Some(estimator) => TokenGovernor::with_estimator(config.limits.clone(), estimator),
            None => TokenGovernor::new(config.limits.clone()),
        });
        let sidecars = Arc::new(SidecarManager::new(config.sidecar_buffer_cap));
        let console = Arc::new(ConsoleBridge::new());

        let mut registry = if self.builtins {
            builtin_registry(
                &config,
                BuiltinDeps {
                    service: Arc::clone(&self.service),
                    governor: Arc::clone(&governor),
                    sidecars: Arc::clone(&sidecars),
                    console: Arc::clone(&console),
                },
            )
        } else {
            ToolRegistry::new()
                .with_max_result_bytes(config.max_result_bytes)
                .with_timeout(config.tool_timeout)
        };
        for tool in self.tools {
            registry.register_boxed(tool);
        }

        let compactor = Compactor::new(
            Arc::clone(&self.service),
            Arc::clone(&governor),
            config.summary_model.clone(),
        )
        .with_retry(config.remote_retry.clone());
        let assistant = AssistantProfile::new(
            config.assistant_file(),
            config.assistant_name.clone(),
            config.base_model.clone(),
            config.system_prompt.clone(),
        );

        info!(
            "Orchestrator ready: model={}, {} tools, saved={}",
            config.base_model,
            registry.len(),
            config.saved_dir.display()
        );
        Orchestrator {
            store: ConversationStore::new(config.saved_dir.clone()),
            locks: ThreadLocks::new(config.lock_poll_interval),
            service: self.service,
            registry,
            governor,
            compactor,
            sidecars,
            console,
            assistant,
            events: self.events,
            cancellations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
        }
    }
}

// ── Orchestrator ───────────────────────────────────────────────────

pub struct Orchestrator {
    service: Arc<dyn RunService>,
    config: RelayConfig,
    registry: ToolRegistry,
    governor: Arc<TokenGovernor>,
    compactor: Compactor,
    store: ConversationStore,
    locks: ThreadLocks,
    sidecars: Arc<SidecarManager>,
    console: Arc<ConsoleBridge>,
    assistant: AssistantProfile,
    events: Box<dyn EventHandler>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    /// Parent of every turn's token.
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("governor", &self.governor)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(service: Arc<dyn RunService>, config: RelayConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            service,
            config,
            events: Box::new(NoopHandler),
            estimator: None,
            tools: Vec::new(),
            builtins: true,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn sidecars(&self) -> &Arc<SidecarManager> {
        &self.sidecars
    }

    /// Frontends subscribe here to answer `get_console_history`.
    pub fn console(&self) -> &Arc<ConsoleBridge> {
        &self.console
    }

    /// The conversation's current token tally.
    pub fn token_tally(&self, conversation_id: &str) -> u64 {
        self.governor.tally(conversation_id)
    }

    fn driver(&self) -> RunDriver<'_> {
        RunDriver::new(self.service.as_ref(), &self.registry, &self.governor)
            .with_compactor(&self.compactor)
            .with_event_handler(self.events.as_ref())
            .with_retry(self.config.remote_retry.clone())
            .with_poll_interval(self.config.run_poll_interval)
            .with_max_create_message_attempts(self.config.max_create_message_attempts)
    }

    // ── Prompt handling ────────────────────────────────────────────

    pub async fn handle_prompt(&self, request: PromptRequest) -> PromptOutcome {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return PromptOutcome::Failed {
                message: "Missing prompt".into(),
                logs: Vec::new(),
            };
        }
        if let Some(id) = &request.conversation_id
            && let Err(e) = validate_id(id)
        {
            return PromptOutcome::Failed {
                message: e.to_string(),
                logs: Vec::new(),
            };
        }

        let cancel = self.shutdown.child_token();
        let mut logs = Vec::new();
        match self.run_prompt(&request, prompt, &cancel, &mut logs).await {
            Ok(reply) => PromptOutcome::Completed(reply),
            Err(RelayError::Cancelled) => {
                info!("Turn cancelled");
                PromptOutcome::Cancelled { logs }
            }
            Err(e) => {
                warn!("Turn failed: {e}");
                PromptOutcome::Failed {
                    message: e.to_string(),
                    logs,
                }
            }
        }
    }

    async fn run_prompt(
        &self,
        request: &PromptRequest,
        prompt: &str,
        cancel: &CancellationToken,
        logs: &mut Vec<TurnLog>,
    ) -> Result<PromptReply, RelayError> {
        let (local_id, fresh) = match &request.conversation_id {
            Some(id) => (id.clone(), None),
            None => {
                let thread_id = self.create_thread(cancel).await?;
                let conv = Conversation {
                    thread_id: Some(thread_id.clone()),
                    title: Some(request.title.clone().unwrap_or_else(|| thread_id.clone())),
                    ..Default::default()
                };
                (thread_id, Some(conv))
            }
        };

        let _lock = self.locks.acquire(&local_id, cancel).await?;
        let _registration = CancelRegistration::new(&self.cancellations, &local_id, cancel);

        let mut conv = match fresh {
            Some(conv) => conv,
            None => self.store.load(&local_id).await?,
        };
        if conv.title.is_none() {
            conv.title = Some(request.title.clone().unwrap_or_else(|| local_id.clone()));
        }
        let thread_id = match &conv.thread_id {
            Some(id) => id.clone(),
            None => {
                let id = self.create_thread(cancel).await?;
                info!("[{local_id}] mapped to new thread {id}");
                conv.thread_id = Some(id.clone());
                id
            }
        };
        if self.governor.tally(&local_id) == 0
            && let Some(tally) = conv.token_tally
        {
            self.governor.set_tally(&local_id, tally);
        }

        let assistant_id = self
            .assistant
            .ensure(
                self.service.as_ref(),
                &self.registry.definitions(),
                &self.config.remote_retry,
                cancel,
            )
            .await?;
        let instructions = request
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.config.system_prompt.clone());
        let ctx = ToolContext::new(local_id.clone(), self.config.root_path.clone())
            .with_cancellation(cancel.clone());
        let driver = self.driver();
        self.drain_best_effort(&driver, &thread_id, cancel).await?;

        let max_attempts = self.config.max_turn_attempts.max(1);
        let mut attempt = 1;
        let turn = loop {
            self.events.on_event(&RunEvent::TurnStarted {
                conversation_id: &local_id,
                attempt,
                max_attempts,
            });
            match self
                .attempt(&thread_id, &assistant_id, &instructions, prompt, &ctx, logs)
                .await
            {
                Ok(turn) => break turn,
                Err(RelayError::Cancelled) => {
                    self.events.on_event(&RunEvent::Cancelled {
                        conversation_id: &local_id,
                    });
                    return Err(RelayError::Cancelled);
                }
                Err(e) if e.class() == ErrorClass::Terminal => return Err(e),
                Err(e) => {
                    let error = e.to_string();
                    logs.push(TurnLog::Retry {
                        attempt,
                        error: error.clone(),
                    });
                    self.events.on_event(&RunEvent::Retry {
                        attempt,
                        error: &error,
                    });
                    if attempt >= max_attempts {
                        return Err(e);
                    }
                    attempt += 1;
                    self.drain_best_effort(&driver, &thread_id, cancel).await?;
                }
            }
        };

        let mut did_write_op = turn.did_write_op;
        conv.messages.push(turn.user.clone());
        conv.messages.push(turn.reply.clone());
        let chained = self
            .follow_self_prompts(
                turn.self_prompt,
                &thread_id,
                &assistant_id,
                &instructions,
                &ctx,
                &mut conv,
                logs,
                &mut did_write_op,
            )
            .await;

        conv.token_tally = Some(self.governor.tally(&local_id));
        self.store.save(&local_id, &conv).await?;
        if let Err(e) = chained {
            self.events.on_event(&RunEvent::Cancelled {
                conversation_id: &local_id,
            });
            return Err(e);
        }

        Ok(PromptReply {
            logs: std::mem::take(logs),
            result: turn.reply.text(),
            local_id,
            thread_id,
            user_message_id: turn.user.id,
            assistant_message_id: turn.reply.id,
            did_write_op,
        })
    }

    /// One full attempt: compact, post, run, fetch the reply.
    async fn attempt(
        &self,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
        prompt: &str,
        ctx: &ToolContext,
        logs: &mut Vec<TurnLog>,
    ) -> Result<Turn, RelayError> {
        let cancel = &ctx.cancellation;
        let conversation_id = ctx.conversation_id.as_str();
        let extra = self.governor.estimate(prompt) + self.governor.limits().completion_buffer;
        let passes = self
            .governor
            .shrink_context_if_needed(conversation_id, thread_id, extra, &self.compactor, cancel)
            .await?;
        for outcome in passes.iter().filter(|o| !o.is_noop()) {
            self.events.on_event(&RunEvent::Compaction {
                conversation_id,
                outcome,
            });
        }

        let driver = self.driver();
        let user = driver.post_user_message(thread_id, prompt, cancel).await?;
        self.governor
            .add_tally(conversation_id, self.governor.estimate(prompt));

        let request = RunRequest {
            assistant_id: assistant_id.to_string(),
            instructions: Some(instructions.to_string()),
            tools: self.registry.definitions(),
            tool_choice: Some("auto".into()),
        };
        let run = driver.execute(thread_id, &request, ctx).await?;
        logs.extend(run.logs);

        let reply = driver.fetch_reply(thread_id, run.status, cancel).await?;
        self.events.on_event(&RunEvent::Finished {
            conversation_id,
            status: run.status,
        });
        if run.status != RunStatus::Completed {
            return Err(RelayError::RunFailed { status: run.status });
        }
        self.governor
            .add_tally(conversation_id, self.governor.estimate(&reply.text()));

        Ok(Turn {
            user,
            reply,
            did_write_op: run.did_write_op,
            self_prompt: run.self_prompt,
        })
    }

    /// Chain follow-up turns while tools keep requesting them. Failures end
    /// the chain quietly; only cancellation is returned.
    #[allow(clippy::too_many_arguments)]
    async fn follow_self_prompts(
        &self,
        mut next: Option<String>,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
        ctx: &ToolContext,
        conv: &mut Conversation,
        logs: &mut Vec<TurnLog>,
        did_write_op: &mut bool,
    ) -> Result<(), RelayError> {
        let mut depth = 0;
        while let Some(prompt) = next.take() {
            if depth >= self.config.max_self_prompts {
                warn!(
                    "[{}] self-prompt chain stopped at {depth} turns",
                    ctx.conversation_id
                );
                break;
            }
            depth += 1;
            self.events.on_event(&RunEvent::SelfPrompt {
                depth,
                prompt: &prompt,
            });
            match self
                .attempt(thread_id, assistant_id, instructions, &prompt, ctx, logs)
                .await
            {
                Ok(turn) => {
                    conv.messages.push(turn.user);
                    conv.messages.push(turn.reply);
                    *did_write_op |= turn.did_write_op;
                    next = turn.self_prompt;
                }
                Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
                Err(e) => {
                    warn!("[{}] self-prompt {depth} failed: {e}", ctx.conversation_id);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn create_thread(&self, cancel: &CancellationToken) -> Result<String, RelayError> {
        let thread = retry_remote(&self.config.remote_retry, cancel, "create thread", || {
            self.service.create_thread()
        })
        .await?;
        info!("Created thread {}", thread.id);
        Ok(thread.id)
    }

    async fn drain_best_effort(
        &self,
        driver: &RunDriver<'_>,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        match driver.drain_stray_runs(thread_id, cancel).await {
            Ok(_) => Ok(()),
            Err(RelayError::Cancelled) => Err(RelayError::Cancelled),
            Err(e) => {
                warn!("Could not drain runs on {thread_id}: {e}");
                Ok(())
            }
        }
    }

    /// Trip the running turn's cancellation token. `false` if no turn is
    /// running for the conversation.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let token = self
            .cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
            .cloned();
        match token {
            Some(token) => {
                info!("[{conversation_id}] cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ── Conversation management ────────────────────────────────────

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RelayError> {
        self.store.list().await
    }

    pub async fn conversation(&self, id: &str) -> Result<Conversation, RelayError> {
        if !self.store.exists(id).await {
            return Err(RelayError::NotFound(id.to_string()));
        }
        self.store.load(id).await
    }

    /// Set the local title and push it to the remote thread's metadata.
    pub async fn rename_conversation(&self, id: &str, title: &str) -> Result<(), RelayError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(RelayError::Validation("Missing title".into()));
        }
        let _lock = self.locks.acquire(id, &self.shutdown).await?;
        let mut conv = self.conversation(id).await?;
        conv.title = Some(title.to_string());
        if let Some(thread_id) = &conv.thread_id {
            let metadata = serde_json::json!({ "title": title });
            retry_remote(&self.config.remote_retry, &self.shutdown, "update thread", || {
                self.service.update_thread(thread_id, metadata.clone())
            })
            .await?;
        }
        self.store.save(id, &conv).await
    }

    /// Delete the remote thread (already gone is fine), then the local file.
    pub async fn delete_conversation(&self, id: &str) -> Result<(), RelayError> {
        let _lock = self.locks.acquire(id, &self.shutdown).await?;
        let conv = self.conversation(id).await?;
        if let Some(thread_id) = &conv.thread_id {
            let deleted = retry_remote(&self.config.remote_retry, &self.shutdown, "delete thread", || {
                self.service.delete_thread(thread_id)
            })
            .await;
            match deleted {
                Ok(()) => {}
                Err(RelayError::Remote(e)) if e.is_not_found() => {
                    debug!("Thread {thread_id} already deleted");
                }
                Err(e) => return Err(e),
            }
        }
        self.store.delete(id).await?;
        self.governor.forget(id);
        info!("[{id}] conversation deleted");
        Ok(())
    }

    /// Replace a message's content locally; metadata, if given, is pushed to
    /// the remote message (a failure there is only logged).
    pub async fn update_message(
        &self,
        id: &str,
        message_id: &str,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<ThreadMessage, RelayError> {
        let _lock = self.locks.acquire(id, &self.shutdown).await?;
        let mut conv = self.conversation(id).await?;
        let thread_id = conv
            .thread_id
            .clone()
            .ok_or_else(|| RelayError::NotMapped(id.to_string()))?;
        let message = conv
            .message_mut(message_id)
            .ok_or_else(|| RelayError::NotFound(format!("{id}/{message_id}")))?;
        message.content = vec![ContentPart::text(content)];
        if let Some(metadata) = &metadata {
            message.metadata = Some(metadata.clone());
        }
        let updated = message.clone();
        self.store.save(id, &conv).await?;

        if let Some(metadata) = metadata
            && let Err(e) = self
                .service
                .update_message(&thread_id, message_id, metadata)
                .await
        {
            warn!("Failed to update metadata of {message_id}: {e}");
        }
        Ok(updated)
    }

    /// Delete a message remotely and locally.
    pub async fn delete_message(&self, id: &str, message_id: &str) -> Result<(), RelayError> {
        let _lock = self.locks.acquire(id, &self.shutdown).await?;
        let mut conv = self.conversation(id).await?;
        let thread_id = conv
            .thread_id
            .clone()
            .ok_or_else(|| RelayError::NotMapped(id.to_string()))?;
        let deleted = retry_remote(&self.config.remote_retry, &self.shutdown, "delete message", || {
            self.service.delete_message(&thread_id, message_id)
        })
        .await;
        match deleted {
            Ok(()) => {}
            Err(RelayError::Remote(e)) if e.is_not_found() => {
                debug!("Message {message_id} already gone remotely");
            }
            Err(e) => return Err(e),
        }
        conv.messages.retain(|m| m.id != message_id);
        self.store.save(id, &conv).await
    }

    /// Cancel every running turn and terminate every sidecar.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown.cancel();
        self.sidecars.shutdown().await;
    }
}

/// Keeps a conversation's token in the cancellation registry for as long
/// as its turn runs.
struct CancelRegistration<'a> {
    map: &'a Mutex<HashMap<String, CancellationToken>>,
    id: String,
}

impl<'a> CancelRegistration<'a> {
    fn new(
        map: &'a Mutex<HashMap<String, CancellationToken>>,
        id: &str,
        token: &CancellationToken,
    ) -> Self {
        map.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), token.clone());
        Self {
            map,
            id: id.to_string(),
        }
    }
}

impl Drop for CancelRegistration<'_> {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
