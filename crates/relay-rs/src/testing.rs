//! In-memory scripted [`RunService`] for tests.
//!
//! Threads and messages behave like the remote service. Runs follow a
//! script: every `retrieve_run` consumes one [`Step`], except that a run
//! waiting on tool outputs stays in `requires_action` until they are
//! submitted. Posting a message or starting a run on a thread that already
//! has an active run fails with the service's 400 conflict.

use crate::api::service::{
    AssistantSpec, ListQuery, Page, RemoteThread, RequiredAction, Run, RunRequest, RunService,
    RunStatus, SortOrder, SubmitToolOutputs, ToolOutput,
};
use crate::error::RemoteError;
use crate::{ChatCompletion, ChatRequest, MessageRole, ThreadMessage, ToolCall};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// What the next poll of a run reports.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Report this status.
    Status(RunStatus),
    /// Ask for these tool calls.
    ToolCalls(Vec<ToolCall>),
    /// Post an assistant message and complete.
    Reply(String),
    /// Stay in progress forever.
    Hang,
    /// Report the previous tool-call batch again.
    Repeat,
}

#[derive(Debug)]
struct MockRun {
    thread_id: String,
    status: RunStatus,
    pending: Vec<ToolCall>,
    last_calls: Vec<ToolCall>,
    steps: VecDeque<Step>,
    created_seq: u64,
}

#[derive(Debug, Default)]
struct MockThread {
    messages: Vec<ThreadMessage>,
    metadata: serde_json::Value,
}

#[derive(Debug, Default)]
struct State {
    seq: u64,
    threads: HashMap<String, MockThread>,
    runs: HashMap<String, MockRun>,
    scripts: VecDeque<Vec<Step>>,
    failures: HashMap<&'static str, VecDeque<RemoteError>>,
    chat_reply: String,
    chat_requests: Vec<ChatRequest>,
    run_requests: Vec<RunRequest>,
    submissions: Vec<(String, Vec<ToolOutput>)>,
    cancelled: Vec<String>,
    conflicts: usize,
    assistants: Vec<AssistantSpec>,
    deleted_assistants: Vec<String>,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}_{}", self.seq)
    }

    fn has_active_run(&self, thread_id: &str) -> bool {
        self.runs
            .values()
            .any(|r| r.thread_id == thread_id && r.status.is_active())
    }

    fn thread(&mut self, thread_id: &str) -> Result<&mut MockThread, RemoteError> {
        self.threads.get_mut(thread_id).ok_or_else(|| not_found("thread", thread_id))
    }
}

fn not_found(kind: &str, id: &str) -> RemoteError {
    RemoteError::Http {
        status: 404,
        body: format!("No {kind} found with id '{id}'."),
    }
}

fn active_run_conflict(thread_id: &str) -> RemoteError {
    RemoteError::Http {
        status: 400,
        body: format!("Thread {thread_id} already has an active run."),
    }
}

pub(crate) struct MockRunService {
    state: Mutex<State>,
}

impl MockRunService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                chat_reply: "summary".into(),
                ..Default::default()
            }),
        }
    }

    pub fn with_chat_reply(self, reply: &str) -> Self {
        self.lock().chat_reply = reply.to_string();
        self
    }

    /// Queue the script for the next run created.
    pub fn with_run(self, steps: Vec<Step>) -> Self {
        self.push_run(steps);
        self
    }

    pub fn push_run(&self, steps: Vec<Step>) {
        self.lock().scripts.push_back(steps);
    }

    /// Make the next call to `op` fail with `error`.
    pub fn fail_next(&self, op: &'static str, error: RemoteError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    pub fn seed_message(&self, thread_id: &str, role: MessageRole, text: &str) -> String {
        let mut state = self.lock();
        let id = state.next("msg");
        let mut msg = ThreadMessage::new(id.clone(), role, text);
        msg.created_at = state.seq as i64;
        state
            .threads
            .entry(thread_id.to_string())
            .or_default()
            .messages
            .push(msg);
        id
    }

    pub fn thread_messages(&self, thread_id: &str) -> Vec<ThreadMessage> {
        self.lock()
            .threads
            .get(thread_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    pub fn thread_exists(&self, thread_id: &str) -> bool {
        self.lock().threads.contains_key(thread_id)
    }

    pub fn thread_metadata(&self, thread_id: &str) -> serde_json::Value {
        self.lock()
            .threads
            .get(thread_id)
            .map(|t| t.metadata.clone())
            .unwrap_or_default()
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.lock().chat_requests.clone()
    }

    pub fn run_requests(&self) -> Vec<RunRequest> {
        self.lock().run_requests.clone()
    }

    pub fn submissions(&self) -> Vec<(String, Vec<ToolOutput>)> {
        self.lock().submissions.clone()
    }

    pub fn cancelled_runs(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    /// Number of 400 "active run" conflicts handed out.
    pub fn conflicts(&self) -> usize {
        self.lock().conflicts
    }

    pub fn runs_created(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn assistants_created(&self) -> Vec<AssistantSpec> {
        self.lock().assistants.clone()
    }

    pub fn deleted_assistants(&self) -> Vec<String> {
        self.lock().deleted_assistants.clone()
    }

    /// Start a run directly, bypassing the conflict check.
    pub fn seed_active_run(&self, thread_id: &str) -> String {
        self.seed_run(thread_id, RunStatus::InProgress, vec![Step::Hang])
    }

    /// Insert a run in `status` without a script or conflict check.
    pub fn seed_run(&self, thread_id: &str, status: RunStatus, steps: Vec<Step>) -> String {
        let mut state = self.lock();
        let id = state.next("run");
        let seq = state.seq;
        state.runs.insert(
            id.clone(),
            MockRun {
                thread_id: thread_id.to_string(),
                status,
                pending: Vec::new(),
                last_calls: Vec::new(),
                steps: steps.into(),
                created_seq: seq,
            },
        );
        id
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn injected(&self, op: &'static str) -> Result<(), RemoteError> {
        match self.lock().failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn snapshot(id: &str, run: &MockRun) -> Run {
    let required_action = (run.status == RunStatus::RequiresAction).then(|| RequiredAction {
        submit_tool_outputs: SubmitToolOutputs {
            tool_calls: run.pending.clone(),
        },
    });
    Run {
        id: id.to_string(),
        status: run.status,
        required_action,
        last_error: None,
        usage: None,
    }
}

#[async_trait]
impl RunService for MockRunService {
    async fn create_thread(&self) -> Result<RemoteThread, RemoteError> {
        self.injected("create_thread")?;
        let mut state = self.lock();
        let id = state.next("thread");
        state.threads.insert(id.clone(), MockThread::default());
        Ok(RemoteThread { id })
    }

    async fn update_thread(
        &self,
        thread_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), RemoteError> {
        self.injected("update_thread")?;
        self.lock().thread(thread_id)?.metadata = metadata;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), RemoteError> {
        self.injected("delete_thread")?;
        self.lock()
            .threads
            .remove(thread_id)
            .map(|_| ())
            .ok_or_else(|| not_found("thread", thread_id))
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        query: &ListQuery,
    ) -> Result<Page<ThreadMessage>, RemoteError> {
        self.injected("list_messages")?;
        let mut state = self.lock();
        let mut all = state.thread(thread_id)?.messages.clone();
        if query.order == SortOrder::Desc {
            all.reverse();
        }
        if let Some(after) = &query.after
            && let Some(pos) = all.iter().position(|m| &m.id == after)
        {
            all.drain(..=pos);
        }
        let limit = query.limit.max(1) as usize;
        let has_more = all.len() > limit;
        all.truncate(limit);
        let last_id = all.last().map(|m| m.id.clone());
        Ok(Page {
            data: all,
            has_more,
            last_id,
        })
    }

    async fn create_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<ThreadMessage, RemoteError> {
        self.injected("create_message")?;
        let mut state = self.lock();
        if !state.threads.contains_key(thread_id) {
            return Err(not_found("thread", thread_id));
        }
        if role == MessageRole::User && state.has_active_run(thread_id) {
            state.conflicts += 1;
            return Err(active_run_conflict(thread_id));
        }
        let id = state.next("msg");
        let mut msg = ThreadMessage::new(id, role, text);
        msg.created_at = state.seq as i64;
        state.thread(thread_id)?.messages.push(msg.clone());
        Ok(msg)
    }

    async fn update_message(
        &self,
        thread_id: &str,
        message_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), RemoteError> {
        self.injected("update_message")?;
        let mut state = self.lock();
        let msg = state
            .thread(thread_id)?
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| not_found("message", message_id))?;
        msg.metadata = Some(metadata);
        Ok(())
    }

    async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<(), RemoteError> {
        self.injected("delete_message")?;
        let mut state = self.lock();
        let thread = state.thread(thread_id)?;
        let before = thread.messages.len();
        thread.messages.retain(|m| m.id != message_id);
        if thread.messages.len() == before {
            return Err(not_found("message", message_id));
        }
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> Result<Run, RemoteError> {
        self.injected("create_run")?;
        let mut state = self.lock();
        if !state.threads.contains_key(thread_id) {
            return Err(not_found("thread", thread_id));
        }
        if state.has_active_run(thread_id) {
            state.conflicts += 1;
            return Err(active_run_conflict(thread_id));
        }
        state.run_requests.push(request.clone());
        let steps = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| vec![Step::Reply("ok".into())]);
        let id = state.next("run");
        let run = MockRun {
            thread_id: thread_id.to_string(),
            status: RunStatus::Queued,
            pending: Vec::new(),
            last_calls: Vec::new(),
            steps: steps.into(),
            created_seq: state.seq,
        };
        let snap = snapshot(&id, &run);
        state.runs.insert(id, run);
        Ok(snap)
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError> {
        self.injected("retrieve_run")?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let run = state
            .runs
            .get_mut(run_id)
            .filter(|r| r.thread_id == thread_id)
            .ok_or_else(|| not_found("run", run_id))?;
        if run.status.is_terminal() || run.status == RunStatus::RequiresAction {
            return Ok(snapshot(run_id, run));
        }
        match run.steps.pop_front() {
            Some(Step::Status(s)) => run.status = s,
            Some(Step::ToolCalls(calls)) => {
                run.status = RunStatus::RequiresAction;
                run.last_calls = calls.clone();
                run.pending = calls;
            }
            Some(Step::Repeat) => {
                let mut snap = snapshot(run_id, run);
                snap.status = RunStatus::RequiresAction;
                snap.required_action = Some(RequiredAction {
                    submit_tool_outputs: SubmitToolOutputs {
                        tool_calls: run.last_calls.clone(),
                    },
                });
                return Ok(snap);
            }
            Some(Step::Reply(text)) => {
                run.status = RunStatus::Completed;
                state.seq += 1;
                let mut msg = ThreadMessage::new(
                    format!("msg_{}", state.seq),
                    MessageRole::Assistant,
                    text,
                );
                msg.created_at = state.seq as i64;
                if let Some(thread) = state.threads.get_mut(thread_id) {
                    thread.messages.push(msg);
                }
            }
            Some(Step::Hang) => {
                run.status = RunStatus::InProgress;
                run.steps.push_front(Step::Hang);
            }
            None => run.status = RunStatus::Completed,
        }
        let run = state
            .runs
            .get(run_id)
            .ok_or_else(|| not_found("run", run_id))?;
        Ok(snapshot(run_id, run))
    }

    async fn list_runs(&self, thread_id: &str, query: &ListQuery) -> Result<Page<Run>, RemoteError> {
        self.injected("list_runs")?;
        let state = self.lock();
        let mut runs: Vec<(&String, &MockRun)> = state
            .runs
            .iter()
            .filter(|(_, r)| r.thread_id == thread_id)
            .collect();
        runs.sort_by_key(|(_, r)| std::cmp::Reverse(r.created_seq));
        if query.order == SortOrder::Asc {
            runs.reverse();
        }
        if let Some(after) = &query.after
            && let Some(pos) = runs.iter().position(|(id, _)| id.as_str() == after.as_str())
        {
            runs.drain(..=pos);
        }
        let limit = query.limit.max(1) as usize;
        let has_more = runs.len() > limit;
        let data: Vec<Run> = runs
            .into_iter()
            .take(limit)
            .map(|(id, r)| snapshot(id, r))
            .collect();
        Ok(Page {
            last_id: data.last().map(|r| r.id.clone()),
            data,
            has_more,
        })
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError> {
        self.injected("cancel_run")?;
        let mut state = self.lock();
        state.cancelled.push(run_id.to_string());
        let run = state
            .runs
            .get_mut(run_id)
            .filter(|r| r.thread_id == thread_id)
            .ok_or_else(|| not_found("run", run_id))?;
        if run.status.is_terminal() {
            return Err(RemoteError::Http {
                status: 400,
                body: format!("Cannot cancel run with status '{}'.", run.status),
            });
        }
        run.status = RunStatus::Cancelled;
        run.pending.clear();
        Ok(snapshot(run_id, run))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run, RemoteError> {
        self.injected("submit_tool_outputs")?;
        let mut state = self.lock();
        state
            .submissions
            .push((run_id.to_string(), outputs.to_vec()));
        let run = state
            .runs
            .get_mut(run_id)
            .filter(|r| r.thread_id == thread_id)
            .ok_or_else(|| not_found("run", run_id))?;
        if run.status != RunStatus::RequiresAction {
            return Err(RemoteError::Http {
                status: 400,
                body: format!("Run {run_id} is not waiting for tool outputs."),
            });
        }
        run.status = RunStatus::InProgress;
        run.pending.clear();
        Ok(snapshot(run_id, run))
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<String, RemoteError> {
        self.injected("create_assistant")?;
        let mut state = self.lock();
        state.assistants.push(spec.clone());
        Ok(state.next("asst"))
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<(), RemoteError> {
        self.injected("delete_assistant")?;
        self.lock()
            .deleted_assistants
            .push(assistant_id.to_string());
        Ok(())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, RemoteError> {
        self.injected("chat")?;
        let mut state = self.lock();
        state.chat_requests.push(request.clone());
        Ok(ChatCompletion {
            content: Some(state.chat_reply.clone()),
            usage: None,
            finish_reason: Some("stop".into()),
        })
    }
}
