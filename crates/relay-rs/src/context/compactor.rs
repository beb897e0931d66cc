//! History compaction.
//!
//! [`Compactor::compact`] fetches the whole remote thread oldest first, keeps
//! the last `keep` messages verbatim, and replaces everything before them with
//! one system message holding a summary from the cheaper summary model. The
//! live tail is never reordered or edited. The conversation's tally is then
//! recomputed as `tokens(summary) + sum(tokens(tail))`.
//!
//! The same summary model also compresses individual tool outputs that do
//! not fit the remaining budget ([`Compactor::summarize_output`]).

use crate::api::retry::{RetryConfig, retry_remote};
use crate::api::service::{ListQuery, RunService};
use crate::context::governor::TokenGovernor;
use crate::context::summarizer::{
    build_output_summary_request, build_summarization_request, summary_message_text,
};
use crate::error::RelayError;
use crate::tools::core::truncate_result;
use crate::{ChatMessage, ChatRequest, MessageRole, ThreadMessage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Page size used when walking a thread's history.
const HISTORY_PAGE: u32 = 100;

/// Result of one compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Live tail size requested.
    pub keep: usize,
    /// Messages deleted from the remote thread.
    pub removed: usize,
    pub tally_before: u64,
    pub tally_after: u64,
}

impl CompactionOutcome {
    fn noop(keep: usize, tally: u64) -> Self {
        Self {
            keep,
            removed: 0,
            tally_before: tally,
            tally_after: tally,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.removed == 0
    }
}

pub struct Compactor {
    service: Arc<dyn RunService>,
    governor: Arc<TokenGovernor>,
    summary_model: String,
    retry: RetryConfig,
    max_input_chars: usize,
}

impl Compactor {
    pub fn new(
        service: Arc<dyn RunService>,
        governor: Arc<TokenGovernor>,
        summary_model: impl Into<String>,
    ) -> Self {
        // Roughly half the hard cap worth of characters.
        let max_input_chars = (governor.limits().hard_cap as usize).saturating_mul(2).max(1_000);
        Self {
            service,
            governor,
            summary_model: summary_model.into(),
            retry: RetryConfig::default(),
            max_input_chars,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_input_chars(mut self, chars: usize) -> Self {
        self.max_input_chars = chars;
        self
    }

    /// Collapse everything but the last `keep` messages into one summary.
    pub async fn compact(
        &self,
        conversation_id: &str,
        thread_id: &str,
        keep: usize,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome, RelayError> {
        let tally_before = self.governor.tally(conversation_id);
        let messages = self.fetch_history(thread_id, cancel).await?;
        if messages.len() <= keep {
            debug!("Compaction skipped: {} messages, keep={keep}", messages.len());
            return Ok(CompactionOutcome::noop(keep, tally_before));
        }

        let (head, tail) = messages.split_at(messages.len() - keep);
        let span: Vec<ThreadMessage> = head
            .iter()
            .filter(|m| m.role != MessageRole::Tool)
            .cloned()
            .collect();
        if span.is_empty() {
            debug!("Compaction skipped: nothing summarizable before the live tail");
            return Ok(CompactionOutcome::noop(keep, tally_before));
        }

        let (system, user) = build_summarization_request(&span, self.max_input_chars);
        let summary = self
            .complete(vec![ChatMessage::system(system), ChatMessage::user(user)], cancel)
            .await?;
        let Some(summary) = summary else {
            warn!("Summary model returned no text; leaving history as is");
            return Ok(CompactionOutcome::noop(keep, tally_before));
        };

        for msg in head {
            let result = retry_remote(&self.retry, cancel, "delete message", || {
                self.service.delete_message(thread_id, &msg.id)
            })
            .await;
            match result {
                Ok(()) => {}
                Err(RelayError::Remote(e)) if e.is_not_found() => {
                    debug!("Message {} already gone", msg.id);
                }
                Err(e) => return Err(e),
            }
        }

        let summary_text = summary_message_text(&summary);
        retry_remote(&self.retry, cancel, "post summary", || {
            self.service
                .create_message(thread_id, MessageRole::System, &summary_text)
        })
        .await?;

        let estimator = self.governor.estimator();
        let tally_after = estimator.estimate(&summary_text) + estimator.estimate_messages(tail);
        self.governor.set_tally(conversation_id, tally_after);

        info!(
            "Compacted {} messages of thread {thread_id} (keep={keep}), tally {tally_before} -> {tally_after}",
            head.len()
        );
        Ok(CompactionOutcome {
            keep,
            removed: head.len(),
            tally_before,
            tally_after,
        })
    }

    /// Compress one tool output with the call's own `summary_prompt`. Falls
    /// back to hard truncation when the model returns nothing.
    pub async fn summarize_output(
        &self,
        output: &str,
        summary_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RelayError> {
        let messages = build_output_summary_request(output, summary_prompt, self.max_input_chars);
        match self.complete(messages, cancel).await? {
            Some(summary) => Ok(summary),
            None => {
                warn!("Output summary came back empty; truncating instead");
                Ok(truncate_result(output.to_string(), self.max_input_chars))
            }
        }
    }

    /// One budgeted call to the summary model.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, RelayError> {
        let max_tokens = self.governor.limits().summary_max_tokens;
        let input: u64 = messages
            .iter()
            .map(|m| self.governor.estimate(&m.content))
            .sum();
        self.governor
            .reserve_or_cancel(input + u64::from(max_tokens), cancel)
            .await?;

        let request = ChatRequest {
            model: self.summary_model.clone(),
            messages,
            max_tokens: Some(max_tokens),
            temperature: None,
        };
        let completion = retry_remote(&self.retry, cancel, "summarize", || {
            self.service.chat(&request)
        })
        .await?;
        Ok(completion
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()))
    }

    async fn fetch_history(
        &self,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ThreadMessage>, RelayError> {
        let mut messages = Vec::new();
        let mut cursor = None;
        loop {
            let query = ListQuery::asc(HISTORY_PAGE).after(cursor);
            let page = retry_remote(&self.retry, cancel, "list messages", || {
                self.service.list_messages(thread_id, &query)
            })
            .await?;
            cursor = page.next_cursor();
            messages.extend(page.data);
            if cursor.is_none() {
                return Ok(messages);
            }
        }
    }
}
