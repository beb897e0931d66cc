//! The run state machine.
//!
//! [`RunDriver::execute`] starts a run and polls it to a terminal status.
//! Each `requires_action` batch is dispatched once (call ids already handled
//! on this run are skipped if a poll race reports them again), its outputs
//! are compressed if they do not fit the remaining budget, and the batch is
//! submitted. Cancellation is checked before and after every poll and around
//! dispatch; when it fires the remote run is cancelled too.
//!
//! The driver also owns the message-side helpers that depend on run state:
//! posting a user message or starting a run past a stray active run,
//! draining such runs, and
//! fetching the reply once a run ends.

use crate::agent::events::{EventHandler, NoopHandler, RunEvent, TurnLog};
use crate::api::retry::{RemoteErrorClass, RetryConfig, retry_remote};
use crate::api::service::{ListQuery, Run, RunRequest, RunService, RunStatus, ToolOutput};
use crate::context::compactor::Compactor;
use crate::context::governor::TokenGovernor;
use crate::error::RelayError;
use crate::tools::core::{ToolContext, ToolRegistry};
use crate::tools::dispatch::{Dispatcher, PendingOutput};
use crate::{MessageRole, ThreadMessage};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Messages fetched when looking for the reply.
const REPLY_WINDOW: u32 = 20;

/// Runs listed per page when draining stray runs.
const RUN_LIST_LIMIT: u32 = 50;

/// How long a stray run may keep going before it is cancelled.
const STRAY_RUN_GRACE: Duration = Duration::from_secs(30);

/// What a finished run produced.
#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub logs: Vec<TurnLog>,
    pub did_write_op: bool,
    pub self_prompt: Option<String>,
}

pub struct RunDriver<'a> {
    service: &'a dyn RunService,
    registry: &'a ToolRegistry,
    governor: &'a TokenGovernor,
    compactor: Option<&'a Compactor>,
    events: &'a dyn EventHandler,
    retry: RetryConfig,
    poll_interval: Duration,
    max_create_message_attempts: u32,
}

impl<'a> RunDriver<'a> {
    pub fn new(
        service: &'a dyn RunService,
        registry: &'a ToolRegistry,
        governor: &'a TokenGovernor,
    ) -> Self {
        Self {
            service,
            registry,
            governor,
            compactor: None,
            events: &NoopHandler,
            retry: RetryConfig::default(),
            poll_interval: Duration::from_millis(500),
            max_create_message_attempts: 3,
        }
    }

    /// Compress oversized tool outputs with this compactor's summary model.
    /// Without one, outputs are submitted as they are.
    pub fn with_compactor(mut self, compactor: &'a Compactor) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn with_event_handler(mut self, events: &'a dyn EventHandler) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_create_message_attempts(mut self, attempts: u32) -> Self {
        self.max_create_message_attempts = attempts.max(1);
        self
    }

    // ── Run loop ───────────────────────────────────────────────────

    /// Start a run on `thread_id` and drive it to a terminal status.
    pub async fn execute(
        &self,
        thread_id: &str,
        request: &RunRequest,
        ctx: &ToolContext,
    ) -> Result<RunResult, RelayError> {
        let cancel = &ctx.cancellation;
        let limits = self.governor.limits();
        let headroom = self.governor.tally(&ctx.conversation_id) + limits.completion_buffer;
        let tokens = self.governor.reserve_or_cancel(headroom, cancel).await?;
        self.events.on_event(&RunEvent::TokensReserved {
            tokens,
            tally: self.governor.tally(&ctx.conversation_id),
        });

        let mut run = self.start_run(thread_id, request, cancel).await?;
        info!("[{}] run {} created on {thread_id}", ctx.conversation_id, run.id);
        self.events.on_event(&RunEvent::RunCreated { run_id: &run.id });

        let mut result = RunResult {
            run_id: run.id.clone(),
            status: run.status,
            logs: Vec::new(),
            did_write_op: false,
            self_prompt: None,
        };
        let mut handled: HashSet<String> = HashSet::new();
        let mut last_status = None;

        loop {
            if cancel.is_cancelled() {
                return Err(self.abort(thread_id, &run.id).await);
            }
            if run.status.is_terminal() {
                break;
            }

            if run.status == RunStatus::RequiresAction {
                let fresh: Vec<_> = run
                    .pending_tool_calls()
                    .iter()
                    .filter(|c| !handled.contains(&c.id))
                    .cloned()
                    .collect();
                if !fresh.is_empty() {
                    self.events.on_event(&RunEvent::ToolCallsReceived {
                        run_id: &run.id,
                        count: fresh.len(),
                    });
                    handled.extend(fresh.iter().map(|c| c.id.clone()));

                    let dispatcher = Dispatcher::new(self.registry, self.governor, self.events);
                    let report = match dispatcher.dispatch(&fresh, ctx).await {
                        Ok(report) => report,
                        Err(RelayError::Cancelled) => {
                            return Err(self.abort(thread_id, &run.id).await);
                        }
                        Err(e) => return Err(e),
                    };
                    result.logs.extend(report.logs);
                    result.did_write_op |= report.did_write_op;
                    if report.self_prompt.is_some() {
                        result.self_prompt = report.self_prompt;
                    }

                    let outputs = match self.fit_outputs(report.outputs, ctx).await {
                        Ok(outputs) => outputs,
                        Err(RelayError::Cancelled) => {
                            return Err(self.abort(thread_id, &run.id).await);
                        }
                        Err(e) => return Err(e),
                    };
                    let submitted = retry_remote(&self.retry, cancel, "submit tool outputs", || {
                        self.service.submit_tool_outputs(thread_id, &run.id, &outputs)
                    })
                    .await;
                    match submitted {
                        Ok(next) => run = next,
                        Err(RelayError::Cancelled) => {
                            return Err(self.abort(thread_id, &run.id).await);
                        }
                        Err(e) => return Err(e),
                    }
                    continue;
                }
                debug!("Run {} re-reported calls already handled", run.id);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(self.abort(thread_id, &run.id).await),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let polled = retry_remote(&self.retry, cancel, "retrieve run", || {
                self.service.retrieve_run(thread_id, &run.id)
            })
            .await;
            run = match polled {
                Ok(run) => run,
                Err(RelayError::Cancelled) => return Err(self.abort(thread_id, &run.id).await),
                Err(e) => return Err(e),
            };
            if last_status != Some(run.status) {
                last_status = Some(run.status);
                self.events.on_event(&RunEvent::RunStatusChanged {
                    run_id: &run.id,
                    status: run.status,
                });
            }
        }

        if let Some(usage) = &run.usage {
            debug!("Run {} usage: {usage:?}", run.id);
        }
        result.status = run.status;
        Ok(result)
    }

    /// Submit outputs as they are when the tally still leaves room for the
    /// completion; otherwise compress each one with its own summary prompt.
    async fn fit_outputs(
        &self,
        outputs: Vec<PendingOutput>,
        ctx: &ToolContext,
    ) -> Result<Vec<ToolOutput>, RelayError> {
        let limits = self.governor.limits();
        let tally = self.governor.tally(&ctx.conversation_id);
        let fits = tally + limits.completion_buffer <= limits.hard_cap;
        let Some(compactor) = self.compactor.filter(|_| !fits) else {
            return Ok(outputs
                .into_iter()
                .map(|o| ToolOutput {
                    tool_call_id: o.tool_call_id,
                    output: o.output,
                })
                .collect());
        };

        warn!(
            "[{}] tool outputs push tally to {tally} (cap {}); compressing {}",
            ctx.conversation_id,
            limits.hard_cap,
            outputs.len()
        );
        let count = outputs.len();
        let mut compressed = Vec::with_capacity(count);
        for o in outputs {
            let summary = compactor
                .summarize_output(&o.output, &o.summary_prompt, &ctx.cancellation)
                .await?;
            let before = self.governor.estimate(&o.output);
            let after = self.governor.estimate(&summary);
            let tally = self.governor.tally(&ctx.conversation_id);
            self.governor
                .set_tally(&ctx.conversation_id, tally.saturating_sub(before) + after);
            compressed.push(ToolOutput {
                tool_call_id: o.tool_call_id,
                output: summary,
            });
        }
        self.events.on_event(&RunEvent::OutputsCompressed { count });
        Ok(compressed)
    }

    /// Best-effort remote cancel; always yields [`RelayError::Cancelled`].
    async fn abort(&self, thread_id: &str, run_id: &str) -> RelayError {
        info!("Cancelling run {run_id} on {thread_id}");
        if let Err(e) = self.service.cancel_run(thread_id, run_id).await {
            debug!("cancel_run {run_id}: {e}");
        }
        RelayError::Cancelled
    }

    // ── Thread helpers ─────────────────────────────────────────────

    /// Let active runs on the thread finish for a short grace period, then
    /// cancel whatever is still active. Runs waiting on tool outputs are
    /// cancelled straight away; their calls belong to an abandoned turn.
    pub async fn drain_stray_runs(
        &self,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, RelayError> {
        let mut active = Vec::new();
        let mut cursor = None;
        loop {
            let query = ListQuery::desc(RUN_LIST_LIMIT).after(cursor);
            let page = retry_remote(&self.retry, cancel, "list runs", || {
                self.service.list_runs(thread_id, &query)
            })
            .await?;
            cursor = page.next_cursor();
            active.extend(page.data.into_iter().filter(|r| r.status.is_active()));
            if cursor.is_none() {
                break;
            }
        }

        let mut drained = 0;
        for run in active {
            drained += 1;
            let status = if run.status.is_pending() {
                self.wait_for_stray(thread_id, &run, cancel).await?
            } else {
                run.status
            };
            if status.is_active() {
                warn!("Cancelling stray run {} ({status}) on {thread_id}", run.id);
                match self.service.cancel_run(thread_id, &run.id).await {
                    Ok(_) => {}
                    Err(e) => debug!("cancel_run {}: {e}", run.id),
                }
            }
        }
        if drained > 0 {
            info!("Drained {drained} stray run(s) on {thread_id}");
        }
        Ok(drained)
    }

    async fn wait_for_stray(
        &self,
        thread_id: &str,
        run: &Run,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, RelayError> {
        let deadline = tokio::time::Instant::now() + STRAY_RUN_GRACE;
        let mut status = run.status;
        while status.is_pending() && tokio::time::Instant::now() < deadline {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            status = retry_remote(&self.retry, cancel, "retrieve run", || {
                self.service.retrieve_run(thread_id, &run.id)
            })
            .await?
            .status;
        }
        Ok(status)
    }

    /// Create the run. An "already has an active run" conflict drains the
    /// thread and tries again, up to the configured attempts.
    async fn start_run(
        &self,
        thread_id: &str,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<Run, RelayError> {
        let mut attempt = 1;
        loop {
            let created = retry_remote(&self.retry, cancel, "create run", || {
                self.service.create_run(thread_id, request)
            })
            .await;
            match created {
                Err(RelayError::Remote(e))
                    if e.class() == RemoteErrorClass::ActiveRun
                        && attempt < self.max_create_message_attempts =>
                {
                    warn!("{thread_id} has an active run; draining before starting a run (attempt {attempt})");
                    attempt += 1;
                    self.drain_stray_runs(thread_id, cancel).await?;
                }
                other => return other,
            }
        }
    }

    /// Post a user message. An "already has an active run" conflict drains
    /// the thread and tries again, up to the configured attempts.
    pub async fn post_user_message(
        &self,
        thread_id: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<ThreadMessage, RelayError> {
        let mut attempt = 1;
        loop {
            let posted = retry_remote(&self.retry, cancel, "create message", || {
                self.service
                    .create_message(thread_id, MessageRole::User, text)
            })
            .await;
            match posted {
                Err(RelayError::Remote(e))
                    if e.class() == RemoteErrorClass::ActiveRun
                        && attempt < self.max_create_message_attempts =>
                {
                    warn!("{thread_id} has an active run; draining before posting (attempt {attempt})");
                    attempt += 1;
                    self.drain_stray_runs(thread_id, cancel).await?;
                }
                other => return other,
            }
        }
    }

    /// The newest assistant message once a run has ended, or a synthetic
    /// error reply when the run did not complete or left no message.
    pub async fn fetch_reply(
        &self,
        thread_id: &str,
        status: RunStatus,
        cancel: &CancellationToken,
    ) -> Result<ThreadMessage, RelayError> {
        let query = ListQuery::desc(REPLY_WINDOW);
        let page = retry_remote(&self.retry, cancel, "list messages", || {
            self.service.list_messages(thread_id, &query)
        })
        .await?;
        let reply = page
            .data
            .into_iter()
            .find(|m| m.role == MessageRole::Assistant);
        match reply {
            Some(msg) if status == RunStatus::Completed => Ok(msg),
            _ => {
                warn!("No completed assistant reply on {thread_id} (run status {status})");
                Ok(ThreadMessage::synthetic(format!("Error: run status {status}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::agent::config::TokenLimits;
    use crate::error::RemoteError;
    use crate::testing::{MockRunService, Step};
    use crate::tools::control::RepromptSelf;
    use crate::tools::core::{Tool, ToolFuture, ToolOutcome};
    use crate::tools::spec::ToolSpec;
    use crate::{ToolDef, ToolError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    impl Tool for Echo {
        fn definition(&self) -> ToolDef {
            ToolSpec::builder("echo").purpose("Echo arguments").to_tool_def()
        }

        fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async move { Ok(ToolOutcome::text(format!("echo {arguments}"))) })
        }
    }

    /// Cancels the turn from inside a tool.
    struct Tripwire;

    impl Tool for Tripwire {
        fn definition(&self) -> ToolDef {
            ToolSpec::builder("tripwire").purpose("Cancel the turn").to_tool_def()
        }

        fn execute<'a>(&'a self, _arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async move {
                ctx.cancellation.cancel();
                Err(ToolError::Cancelled)
            })
        }
    }

    /// Counts its executions.
    struct Counter(Arc<AtomicUsize>);

    impl Tool for Counter {
        fn definition(&self) -> ToolDef {
            ToolSpec::builder("count").purpose("Count calls").to_tool_def()
        }

        fn execute<'a>(&'a self, _arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async move {
                let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(ToolOutcome::text(n.to_string()))
            })
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall::function(id, name, r#"{"summary_prompt":"keep it"}"#)
    }

    fn request() -> RunRequest {
        RunRequest {
            assistant_id: "asst_1".into(),
            instructions: None,
            tools: Vec::new(),
            tool_choice: Some("auto".into()),
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new()
            .with(Echo)
            .with(Tripwire)
            .with(RepromptSelf)
    }

    fn governor() -> TokenGovernor {
        TokenGovernor::new(TokenLimits::from_limit(10_000_000))
    }

    async fn thread(service: &MockRunService) -> String {
        service.create_thread().await.unwrap().id
    }

    #[tokio::test(start_paused = true)]
    async fn services_tool_calls_and_completes() {
        let service = MockRunService::new().with_run(vec![
            Step::ToolCalls(vec![call("c1", "echo"), call("c2", "echo")]),
            Step::Reply("done".into()),
        ]);
        let thread_id = thread(&service).await;
        let (registry, governor) = (registry(), governor());
        let driver = RunDriver::new(&service, &registry, &governor);

        let result = driver
            .execute(&thread_id, &request(), &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.logs.len(), 4);
        let submissions = service.submissions();
        assert_eq!(submissions.len(), 1);
        let ids: Vec<&str> = submissions[0].1.iter().map(|o| o.tool_call_id.as_str()).collect();
        assert_eq!(ids, ["c1", "c2"]);

        let reply = driver
            .fetch_reply(&thread_id, result.status, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.text(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_yields_synthetic_reply() {
        let service =
            MockRunService::new().with_run(vec![Step::Status(RunStatus::Failed)]);
        let thread_id = thread(&service).await;
        let (registry, governor) = (registry(), governor());
        let driver = RunDriver::new(&service, &registry, &governor);

        let result = driver
            .execute(&thread_id, &request(), &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        let reply = driver
            .fetch_reply(&thread_id, result.status, &CancellationToken::new())
            .await
            .unwrap();
        assert!(reply.id.starts_with("synthetic_"));
        assert_eq!(reply.text(), "Error: run status failed");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_dispatch_cancels_the_remote_run() {
        let service = MockRunService::new().with_run(vec![Step::ToolCalls(vec![
            call("c1", "echo"),
            call("c2", "tripwire"),
            call("c3", "echo"),
        ])]);
        let thread_id = thread(&service).await;
        let (registry, governor) = (registry(), governor());
        let driver = RunDriver::new(&service, &registry, &governor);

        let err = driver
            .execute(&thread_id, &request(), &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(service.cancelled_runs().len(), 1);
        assert!(service.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_polling() {
        let service = MockRunService::new().with_run(vec![Step::Hang]);
        let thread_id = thread(&service).await;
        let (registry, governor) = (registry(), governor());
        let driver = RunDriver::new(&service, &registry, &governor);
        let ctx = ToolContext::new("conv", "/tmp");
        let trip = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trip.cancel();
        });

        let err = driver.execute(&thread_id, &request(), &ctx).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(service.cancelled_runs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn self_prompt_is_reported() {
        let service = MockRunService::new().with_run(vec![
            Step::ToolCalls(vec![ToolCall::function(
                "c1",
                "reprompt_self",
                r#"{"new_prompt":"continue","summary_prompt":"x"}"#,
            )]),
            Step::Reply("ok".into()),
        ]);
        let thread_id = thread(&service).await;
        let (registry, governor) = (registry(), governor());
        let result = RunDriver::new(&service, &registry, &governor)
            .execute(&thread_id, &request(), &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();
        assert_eq!(result.self_prompt.as_deref(), Some("continue"));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_outputs_are_compressed() {
        let service = Arc::new(
            MockRunService::new()
                .with_chat_reply("short")
                .with_run(vec![Step::ToolCalls(vec![call("c1", "echo")])]),
        );
        let thread_id = thread(&service).await;
        let registry = registry();
        let governor = Arc::new(governor());
        // Already past the cap before the batch lands.
        governor.set_tally("conv", governor.limits().hard_cap);
        let compactor = Compactor::new(service.clone(), Arc::clone(&governor), "summary-model");

        RunDriver::new(service.as_ref(), &registry, &governor)
            .with_compactor(&compactor)
            .execute(&thread_id, &request(), &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();

        let submissions = service.submissions();
        assert_eq!(submissions[0].1[0].output, "short");
        let chats = service.chat_requests();
        assert_eq!(chats.len(), 1);
        assert!(chats[0].messages.iter().any(|m| m.content.contains("keep it")));
    }

    #[tokio::test(start_paused = true)]
    async fn posting_past_a_stray_run_drains_it() {
        let service = MockRunService::new();
        let thread_id = thread(&service).await;
        let stray = service.seed_active_run(&thread_id);
        let (registry, governor) = (registry(), governor());
        let driver = RunDriver::new(&service, &registry, &governor);

        let msg = driver
            .post_user_message(&thread_id, "hello", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(msg.text(), "hello");
        assert_eq!(service.conflicts(), 1);
        assert_eq!(service.cancelled_runs(), vec![stray]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_drained() {
        let service = MockRunService::new();
        let thread_id = thread(&service).await;
        service.fail_next(
            "create_message",
            RemoteError::Http {
                status: 401,
                body: "bad key".into(),
            },
        );
        let (registry, governor) = (registry(), governor());
        let err = RunDriver::new(&service, &registry, &governor)
            .post_user_message(&thread_id, "hello", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Remote(_)));
        assert!(service.cancelled_runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rereported_calls_are_not_run_twice() {
        let service = MockRunService::new().with_run(vec![
            Step::ToolCalls(vec![call("c1", "count")]),
            Step::Repeat,
            Step::Reply("done".into()),
        ]);
        let thread_id = thread(&service).await;
        let count = Arc::new(AtomicUsize::new(0));
        let registry = registry().with(Counter(Arc::clone(&count)));
        let governor = governor();

        let result = RunDriver::new(&service, &registry, &governor)
            .execute(&thread_id, &request(), &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let submissions = service.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].1[0].tool_call_id, "c1");
    }

    #[tokio::test(start_paused = true)]
    async fn create_run_conflict_is_drained_and_retried() {
        let service = MockRunService::new().with_run(vec![Step::Reply("done".into())]);
        let thread_id = thread(&service).await;
        service.fail_next(
            "create_run",
            RemoteError::Http {
                status: 400,
                body: format!("Thread {thread_id} already has an active run."),
            },
        );
        let (registry, governor) = (registry(), governor());

        let result = RunDriver::new(&service, &registry, &governor)
            .execute(&thread_id, &request(), &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(service.runs_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_past_a_stray_run_cancels_it() {
        let service = MockRunService::new().with_run(vec![Step::Reply("done".into())]);
        let thread_id = thread(&service).await;
        let stray = service.seed_run(&thread_id, RunStatus::RequiresAction, Vec::new());
        let (registry, governor) = (registry(), governor());

        let result = RunDriver::new(&service, &registry, &governor)
            .execute(&thread_id, &request(), &ToolContext::new("conv", "/tmp"))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(service.conflicts(), 1);
        assert_eq!(service.cancelled_runs(), vec![stray]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_pages_past_the_first_listing() {
        let service = MockRunService::new();
        let thread_id = thread(&service).await;
        let stray = service.seed_run(&thread_id, RunStatus::RequiresAction, Vec::new());
        for _ in 0..60 {
            service.seed_run(&thread_id, RunStatus::Completed, Vec::new());
        }
        let (registry, governor) = (registry(), governor());

        let drained = RunDriver::new(&service, &registry, &governor)
            .drain_stray_runs(&thread_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(drained, 1);
        assert_eq!(service.cancelled_runs(), vec![stray]);
    }
}
