//! Flow-control and model-facing helper tools.
//!
//! | Tool | Name | Purpose |
//! |------|------|---------|
//! | [`Wait`] | `wait` | Pause, capped, interruptible |
//! | [`RepromptSelf`] | `reprompt_self` | Schedule a follow-up turn |
//! | [`SmartChat`] | `smart_chat` | One-off completion on the smart model |
//! | [`GetConsoleHistory`] | `get_console_history` | Ask the frontend for its console log |

use crate::agent::console::ConsoleBridge;
use crate::api::retry::{RetryConfig, retry_remote};
use crate::api::service::RunService;
use crate::context::governor::TokenGovernor;
use crate::error::{RelayError, ToolError};
use crate::tools::core::{Tool, ToolContext, ToolFuture, ToolOutcome, parse_tool_args};
use crate::tools::spec::ToolSpec;
use crate::{ChatMessage, ChatRequest, ToolDef};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Default sampling temperature for `smart_chat`.
pub const DEFAULT_SMART_TEMPERATURE: f32 = 0.7;

#[derive(Deserialize, JsonSchema)]
pub struct WaitArgs {
    /// Seconds to wait. Capped by the server.
    pub seconds: f64,
}

#[derive(Deserialize, JsonSchema)]
pub struct RepromptSelfArgs {
    /// The prompt to run as the next user turn once this one finishes.
    pub new_prompt: String,
}

#[derive(Deserialize, JsonSchema)]
pub struct SmartChatArgs {
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature (default 0.7).
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Deserialize, JsonSchema)]
pub struct ConsoleHistoryArgs {}

// ── Wait ────────────────────────────────────────────────────────────

pub struct Wait {
    max: Duration,
}

impl Wait {
    pub fn new(max: Duration) -> Self {
        Self { max }
    }
}

impl Tool for Wait {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("wait")
            .purpose("Pause before the next step")
            .when_to_use("To give a sidecar or build time to make progress before checking it")
            .parameters_for::<WaitArgs>()
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: WaitArgs = parse_tool_args(arguments)?;
            if !args.seconds.is_finite() || args.seconds < 0.0 {
                return Err(ToolError::InvalidArguments(
                    "'seconds' must be a non-negative number".into(),
                ));
            }
            let wanted = Duration::from_secs_f64(args.seconds.min(self.max.as_secs_f64()));
            tokio::select! {
                _ = ctx.cancellation.cancelled() => Err(ToolError::Cancelled),
                _ = tokio::time::sleep(wanted) => {
                    Ok(ToolOutcome::text(format!("Waited {:.1} seconds", wanted.as_secs_f64())))
                }
            }
        })
    }
}

// ── RepromptSelf ────────────────────────────────────────────────────

pub struct RepromptSelf;

impl Tool for RepromptSelf {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("reprompt_self")
            .purpose("Schedule a follow-up prompt to yourself after this turn ends")
            .when_to_use(
                "When the task needs more steps than fit in one turn; describe \
                 exactly what to do next",
            )
            .when_not_to_use("When the task is complete")
            .parameters_for::<RepromptSelfArgs>()
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: RepromptSelfArgs = parse_tool_args(arguments)?;
            if args.new_prompt.trim().is_empty() {
                return Err(ToolError::InvalidArguments("'new_prompt' is empty".into()));
            }
            Ok(ToolOutcome::text("Scheduled self-prompt").with_self_prompt(args.new_prompt))
        })
    }
}

// ── SmartChat ───────────────────────────────────────────────────────

pub struct SmartChat {
    service: Arc<dyn RunService>,
    governor: Arc<TokenGovernor>,
    model: String,
    retry: RetryConfig,
}

impl SmartChat {
    pub fn new(
        service: Arc<dyn RunService>,
        governor: Arc<TokenGovernor>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            service,
            governor,
            model: model.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Tool for SmartChat {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("smart_chat")
            .purpose("Ask a stronger reasoning model a self-contained question")
            .when_to_use("For hard design or debugging questions that need careful reasoning")
            .when_not_to_use("For anything the project files can answer directly")
            .parameters_for::<SmartChatArgs>()
            .output_format("The model's reply as plain text")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: SmartChatArgs = parse_tool_args(arguments)?;
            if args.messages.is_empty() {
                return Err(ToolError::InvalidArguments("'messages' is empty".into()));
            }
            let input: u64 = args
                .messages
                .iter()
                .map(|m| self.governor.estimate(&m.content))
                .sum();
            let output = u64::from(args.max_tokens.unwrap_or(0));
            self.governor
                .reserve_or_cancel(input + output, &ctx.cancellation)
                .await
                .map_err(relay_to_tool)?;

            let request = ChatRequest {
                model: self.model.clone(),
                messages: args.messages,
                max_tokens: args.max_tokens,
                temperature: Some(args.temperature.unwrap_or(DEFAULT_SMART_TEMPERATURE)),
            };
            let completion = retry_remote(&self.retry, &ctx.cancellation, "smart_chat", || {
                self.service.chat(&request)
            })
            .await
            .map_err(relay_to_tool)?;
            Ok(ToolOutcome::text(completion.content.unwrap_or_default()))
        })
    }
}

fn relay_to_tool(e: RelayError) -> ToolError {
    match e {
        RelayError::Cancelled => ToolError::Cancelled,
        RelayError::Remote(r) => ToolError::Remote(r),
        other => ToolError::Failed(other.to_string()),
    }
}

// ── GetConsoleHistory ───────────────────────────────────────────────

pub struct GetConsoleHistory {
    bridge: Arc<ConsoleBridge>,
    timeout: Duration,
}

impl GetConsoleHistory {
    pub fn new(bridge: Arc<ConsoleBridge>, timeout: Duration) -> Self {
        Self { bridge, timeout }
    }
}

impl Tool for GetConsoleHistory {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("get_console_history")
            .purpose("Fetch the browser console log of the running app")
            .when_to_use("To diagnose frontend errors after a change")
            .parameters_for::<ConsoleHistoryArgs>()
            .output_format("JSON {id, history}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let _: ConsoleHistoryArgs = parse_tool_args(arguments)?;
            let (id, history) = self
                .bridge
                .request(&ctx.conversation_id, self.timeout, &ctx.cancellation)
                .await?;
            Ok(ToolOutcome::json(&serde_json::json!({
                "id": id,
                "history": history,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatRole;
    use crate::agent::config::TokenLimits;
    use crate::testing::MockRunService;

    fn ctx() -> ToolContext {
        ToolContext::new("conv", "/tmp")
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_capped() {
        let tool = Wait::new(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        let out = tool.execute(r#"{"seconds":600}"#, &ctx()).await.unwrap();
        assert_eq!(out.result, "Waited 5.0 seconds");
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(tool.execute(r#"{"seconds":-1}"#, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn wait_stops_on_cancel() {
        let ctx = ctx();
        ctx.cancellation.cancel();
        let err = Wait::new(Duration::from_secs(60))
            .execute(r#"{"seconds":30}"#, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn reprompt_schedules_follow_up() {
        let out = RepromptSelf
            .execute(r#"{"new_prompt":"now write the tests"}"#, &ctx())
            .await
            .unwrap();
        assert_eq!(out.result, "Scheduled self-prompt");
        assert_eq!(out.self_prompt.as_deref(), Some("now write the tests"));
        assert!(RepromptSelf.execute(r#"{"new_prompt":"  "}"#, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn smart_chat_uses_smart_model_and_default_temperature() {
        let service = Arc::new(MockRunService::new().with_chat_reply("use a trie"));
        let governor = Arc::new(TokenGovernor::new(TokenLimits::from_limit(200_000)));
        let tool = SmartChat::new(service.clone(), governor, "o4-mini");
        let out = tool
            .execute(
                r#"{"messages":[{"role":"user","content":"how to store prefixes?"}]}"#,
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out.result, "use a trie");

        let requests = service.chat_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "o4-mini");
        assert_eq!(requests[0].temperature, Some(DEFAULT_SMART_TEMPERATURE));
        assert_eq!(requests[0].messages[0].role, ChatRole::User);
    }

    #[tokio::test]
    async fn console_history_round_trip() {
        let bridge = Arc::new(ConsoleBridge::new());
        let mut rx = bridge.subscribe();
        let responder = Arc::clone(&bridge);
        tokio::spawn(async move {
            if let Ok(req) = rx.recv().await {
                assert_eq!(req.conversation_id, "conv");
                responder.fulfil(&req.id, serde_json::json!(["TypeError: x is undefined"]));
            }
        });
        let out = GetConsoleHistory::new(bridge, Duration::from_secs(5))
            .execute("{}", &ctx())
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out.result).unwrap();
        assert_eq!(v["history"][0], "TypeError: x is undefined");
        assert!(v["id"].is_string());
    }
}
