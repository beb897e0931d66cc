//! In-order execution of one batch of tool calls.
//!
//! Calls run strictly one after another, never in parallel. A failing or
//! panicking handler produces an `Error: ...` result and the batch goes on;
//! only cancellation stops it. After every result its estimated token cost
//! is reserved through the [`TokenGovernor`] and added to the conversation's
//! tally before the next call starts.

use crate::ToolCall;
use crate::agent::events::{EventHandler, RunEvent, TurnLog};
use crate::context::governor::TokenGovernor;
use crate::error::{RelayError, ToolError};
use crate::tools::core::{ToolContext, ToolOutcome, ToolRegistry};
use crate::tools::spec::summary_prompt_of;

/// A tool result waiting to be submitted back to the run.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOutput {
    pub tool_call_id: String,
    pub name: String,
    pub output: String,
    /// The call's `summary_prompt`, used if the output must be compressed.
    pub summary_prompt: String,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// `function_call` / `function_result` pairs in call order.
    pub logs: Vec<TurnLog>,
    pub outputs: Vec<PendingOutput>,
    /// Any call in the batch mutated persistent state.
    pub did_write_op: bool,
    /// The last follow-up prompt a tool requested.
    pub self_prompt: Option<String>,
}

pub struct Dispatcher<'a> {
    registry: &'a ToolRegistry,
    governor: &'a TokenGovernor,
    events: &'a dyn EventHandler,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        governor: &'a TokenGovernor,
        events: &'a dyn EventHandler,
    ) -> Self {
        Self {
            registry,
            governor,
            events,
        }
    }

    /// Run every call in order. Returns [`RelayError::Cancelled`] as soon as
    /// the context's token fires, checked before and after each call.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
    ) -> Result<DispatchReport, RelayError> {
        let mut report = DispatchReport::default();
        for call in calls {
            if ctx.cancellation.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let name = call.function.name.as_str();
            let arguments = call.function.arguments.as_str();
            self.events
                .on_event(&RunEvent::ToolExecuting { name, arguments });
            report.logs.push(TurnLog::call(name, arguments));

            let outcome = match self.registry.execute(name, arguments, ctx).await {
                Ok(outcome) => outcome,
                Err(ToolError::Cancelled) => return Err(RelayError::Cancelled),
                Err(e) => ToolOutcome::text(format!("Error: {e}")),
            };
            if ctx.cancellation.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            self.events.on_event(&RunEvent::ToolResult {
                name,
                call_id: &call.id,
                result: &outcome.result,
            });
            report.logs.push(TurnLog::FunctionResult {
                name: name.to_string(),
                result: outcome.result.clone(),
            });

            let cost = self.governor.estimate(&outcome.result);
            let tokens = self
                .governor
                .reserve_or_cancel(cost, &ctx.cancellation)
                .await?;
            let tally = self.governor.add_tally(&ctx.conversation_id, cost);
            self.events
                .on_event(&RunEvent::TokensReserved { tokens, tally });

            report.did_write_op |= outcome.did_write_op;
            if outcome.self_prompt.is_some() {
                report.self_prompt = outcome.self_prompt;
            }
            report.outputs.push(PendingOutput {
                tool_call_id: call.id.clone(),
                name: name.to_string(),
                output: outcome.result,
                summary_prompt: summary_prompt_of(arguments),
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::agent::config::TokenLimits;
    use crate::agent::events::NoopHandler;
    use crate::tools::core::{Tool, ToolFuture};
    use crate::tools::spec::ToolSpec;
    use std::sync::Mutex;

    /// Records call order; `write` flags a mutation, `fail` errors.
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Tool for Recorder {
        fn definition(&self) -> ToolDef {
            ToolSpec::builder("recorder").purpose("Record calls").to_tool_def()
        }

        fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async move {
                let v: serde_json::Value = serde_json::from_str(arguments).unwrap_or_default();
                let tag = v["tag"].as_str().unwrap_or_default().to_string();
                if let Ok(mut seen) = self.seen.lock() {
                    seen.push(tag.clone());
                }
                match tag.as_str() {
                    "fail" => Err(ToolError::Failed("handler blew up".into())),
                    "write" => Ok(ToolOutcome::write("wrote")),
                    "again" => Ok(ToolOutcome::text("ok").with_self_prompt("keep going")),
                    _ => Ok(ToolOutcome::text(format!("did {tag}"))),
                }
            })
        }
    }

    fn call(id: &str, tag: &str) -> ToolCall {
        ToolCall::function(
            id,
            "recorder",
            format!(r#"{{"tag":"{tag}","summary_prompt":"keep {tag}"}}"#),
        )
    }

    fn setup() -> (ToolRegistry, TokenGovernor) {
        let registry = ToolRegistry::new().with(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        (registry, TokenGovernor::new(TokenLimits::from_limit(200_000)))
    }

    #[tokio::test]
    async fn runs_calls_in_order_and_logs_pairs() {
        let (registry, governor) = setup();
        let dispatcher = Dispatcher::new(&registry, &governor, &NoopHandler);
        let calls = [call("c1", "a"), call("c2", "b"), call("c3", "c")];
        let report = dispatcher
            .dispatch(&calls, &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();

        assert_eq!(report.logs.len(), 6);
        let kinds: Vec<&str> = report
            .logs
            .iter()
            .map(|l| match l {
                TurnLog::FunctionCall { .. } => "call",
                TurnLog::FunctionResult { .. } => "result",
                TurnLog::Retry { .. } => "retry",
            })
            .collect();
        assert_eq!(kinds, ["call", "result", "call", "result", "call", "result"]);
        let ids: Vec<&str> = report.outputs.iter().map(|o| o.tool_call_id.as_str()).collect();
        assert_eq!(ids, ["c1", "c2", "c3"]);
        assert_eq!(report.outputs[1].output, "did b");
        assert_eq!(report.outputs[1].summary_prompt, "keep b");
        assert!(!report.did_write_op);
        assert!(governor.tally("conv") > 0);
    }

    #[tokio::test]
    async fn handler_errors_do_not_abort_the_batch() {
        let (registry, governor) = setup();
        let dispatcher = Dispatcher::new(&registry, &governor, &NoopHandler);
        let calls = [call("c1", "fail"), call("c2", "write"), call("c3", "again")];
        let report = dispatcher
            .dispatch(&calls, &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();

        assert_eq!(report.outputs.len(), 3);
        assert_eq!(report.outputs[0].output, "Error: handler blew up");
        assert!(report.did_write_op);
        assert_eq!(report.self_prompt.as_deref(), Some("keep going"));
    }

    #[tokio::test]
    async fn unknown_tools_become_error_results() {
        let (registry, governor) = setup();
        let dispatcher = Dispatcher::new(&registry, &governor, &NoopHandler);
        let calls = [ToolCall::function("c1", "missing", r#"{"summary_prompt":"x"}"#)];
        let report = dispatcher
            .dispatch(&calls, &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();
        assert_eq!(report.outputs[0].output, "Error: unknown tool 'missing'");
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_call() {
        let (registry, governor) = setup();
        let dispatcher = Dispatcher::new(&registry, &governor, &NoopHandler);
        let ctx = ToolContext::new("conv", "/tmp");
        ctx.cancellation.cancel();
        let result = dispatcher.dispatch(&[call("c1", "a")], &ctx).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert_eq!(governor.tally("conv"), 0);
    }
}
