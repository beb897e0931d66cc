//! HTTP implementation of [`RunService`] for assistants-style APIs.

use crate::api::service::{
    AssistantSpec, ListQuery, Page, RemoteThread, Run, RunRequest, RunService, ToolOutput,
};
use crate::error::RemoteError;
use crate::{
    ChatCompletion, ChatRequest, DEFAULT_BASE_URL, MessageRole, ThreadMessage, UsageInfo,
};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default minimum spacing between two remote calls.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);

// ── Pacer ──────────────────────────────────────────────────────────

/// Enforces a minimum interval between consecutive calls, process-wide for
/// one client. Callers queue on the mutex, so calls are also serialized.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ── Raw response shapes ────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawAssistant {
    id: String,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the threads / runs / assistants endpoints.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    pacer: Pacer,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .user_agent("relay-rs/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            pacer: Pacer::new(DEFAULT_MIN_INTERVAL),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.pacer = Pacer::new(interval);
        self
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, RemoteError> {
        self.pacer.wait().await;

        let url = format!("{}{path}", self.base_url);
        debug!("API call: {method} {path}");
        if let Some(ref b) = body {
            trace!("Request payload: {b}");
        }
        let start = Instant::now();

        let mut req = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2");
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| RemoteError::Transport(format!("failed to read response: {e}")))?;

        debug!(
            "API response: {method} {path} HTTP {} in {:.1}s ({} bytes)",
            status.as_u16(),
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(RemoteError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        self.request(Method::GET, path, None).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, RemoteError> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.request::<serde_json::Value>(Method::DELETE, path, None)
            .await
            .map(|_| ())
    }
}

fn list_path(base: &str, query: &ListQuery) -> String {
    let mut path = format!("{base}?limit={}&order={}", query.limit, query.order.as_str());
    if let Some(ref after) = query.after {
        path.push_str(&format!("&after={after}"));
    }
    path
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Threads only accept user and assistant messages. Other roles are posted
/// as assistant messages tagged with their original role.
fn wire_message(role: MessageRole, text: &str) -> serde_json::Value {
    match role {
        MessageRole::User => serde_json::json!({ "role": "user", "content": text }),
        other => serde_json::json!({
            "role": "assistant",
            "content": text,
            "metadata": { "role": other.to_string() },
        }),
    }
}

#[async_trait]
impl RunService for OpenAiClient {
    async fn create_thread(&self) -> Result<RemoteThread, RemoteError> {
        self.post("/threads", serde_json::json!({})).await
    }

    async fn update_thread(
        &self,
        thread_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), RemoteError> {
        self.post::<serde_json::Value>(
            &format!("/threads/{thread_id}"),
            serde_json::json!({ "metadata": metadata }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), RemoteError> {
        self.delete(&format!("/threads/{thread_id}")).await
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        query: &ListQuery,
    ) -> Result<Page<ThreadMessage>, RemoteError> {
        self.get(&list_path(&format!("/threads/{thread_id}/messages"), query))
            .await
    }

    async fn create_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<ThreadMessage, RemoteError> {
        let mut msg: ThreadMessage = self
            .post(
                &format!("/threads/{thread_id}/messages"),
                wire_message(role, text),
            )
            .await?;
        msg.role = role;
        Ok(msg)
    }

    async fn update_message(
        &self,
        thread_id: &str,
        message_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), RemoteError> {
        self.post::<serde_json::Value>(
            &format!("/threads/{thread_id}/messages/{message_id}"),
            serde_json::json!({ "metadata": metadata }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<(), RemoteError> {
        self.delete(&format!("/threads/{thread_id}/messages/{message_id}"))
            .await
    }

    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> Result<Run, RemoteError> {
        self.post(&format!("/threads/{thread_id}/runs"), to_json(request)?)
            .await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError> {
        self.get(&format!("/threads/{thread_id}/runs/{run_id}")).await
    }

    async fn list_runs(
        &self,
        thread_id: &str,
        query: &ListQuery,
    ) -> Result<Page<Run>, RemoteError> {
        self.get(&list_path(&format!("/threads/{thread_id}/runs"), query))
            .await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError> {
        self.post(
            &format!("/threads/{thread_id}/runs/{run_id}/cancel"),
            serde_json::json!({}),
        )
        .await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run, RemoteError> {
        self.post(
            &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            serde_json::json!({ "tool_outputs": to_json(&outputs)? }),
        )
        .await
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<String, RemoteError> {
        let created: RawAssistant = self.post("/assistants", to_json(spec)?).await?;
        Ok(created.id)
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<(), RemoteError> {
        self.delete(&format!("/assistants/{assistant_id}")).await
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, RemoteError> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={:?}",
            request.model,
            request.messages.len(),
            request.max_tokens
        );
        let parsed: RawChatResponse = self.post("/chat/completions", to_json(request)?).await?;

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let choice = parsed.choices.into_iter().next();
        Ok(match choice {
            Some(c) => ChatCompletion {
                content: c.message.content,
                usage: parsed.usage,
                finish_reason: c.finish_reason,
            },
            None => ChatCompletion {
                content: None,
                usage: parsed.usage,
                finish_reason: None,
            },
        })
    }
}
