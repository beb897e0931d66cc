//! Prompt construction for history compaction and tool-output compression.
//!
//! Both are one-shot calls to the cheaper summary model. The builders here
//! return `(system, user)` pairs and bound the input so the request itself
//! can never blow the budget it is meant to protect.

use crate::{ChatMessage, MessageRole, ThreadMessage};

/// System prompt for collapsing old conversation history.
pub const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What was accomplished (files created, modified or removed)
- Commands that were run and their notable results
- Decisions made and approaches that failed
- File paths, identifiers and error messages mentioned
- What the user asked for that is still outstanding

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- The summary replaces the messages entirely, so it must stand on its own.";

/// Prefix of the system message that replaces compacted history.
pub const SUMMARY_MESSAGE_PREFIX: &str = "Summary of earlier conversation:\n";

/// Fallback instruction when a tool call carried no usable `summary_prompt`.
pub const DEFAULT_OUTPUT_SUMMARY_PROMPT: &str =
    "Summarize this tool output, keeping any paths, identifiers, numbers and errors.";

/// Marker inserted where input was dropped to fit the request bound.
pub const ELIDED_MARKER: &str = "[... earlier content elided ...]\n";

/// Build the `(system, user)` pair that summarizes a span of messages.
/// At most `max_input_chars` of the transcript are kept, newest last.
pub fn build_summarization_request(
    span: &[ThreadMessage],
    max_input_chars: usize,
) -> (String, String) {
    let mut content = String::new();
    for msg in span {
        let text = msg.text();
        let text = if text.is_empty() {
            "[no content]".to_string()
        } else {
            text
        };
        content.push_str(&format!("[{}]: {text}\n\n", msg.role));
    }
    (
        SUMMARIZATION_PROMPT.to_string(),
        keep_tail(&content, max_input_chars),
    )
}

/// Build the chat messages that compress one oversized tool output using
/// the call's own `summary_prompt`.
pub fn build_output_summary_request(
    output: &str,
    summary_prompt: &str,
    max_input_chars: usize,
) -> Vec<ChatMessage> {
    let instruction = if summary_prompt.trim().is_empty() {
        DEFAULT_OUTPUT_SUMMARY_PROMPT
    } else {
        summary_prompt
    };
    vec![
        ChatMessage::system(format!(
            "You compress tool output for another model. {instruction}"
        )),
        ChatMessage::user(keep_tail(output, max_input_chars)),
    ]
}

/// The text of the message that replaces compacted history.
pub fn summary_message_text(summary: &str) -> String {
    format!("{SUMMARY_MESSAGE_PREFIX}{summary}")
}

/// Whether a message is a compaction summary written by this crate.
pub fn is_summary_message(msg: &ThreadMessage) -> bool {
    msg.role == MessageRole::System && msg.text().starts_with(SUMMARY_MESSAGE_PREFIX)
}

/// Keep the last `max_chars` characters, marking the cut.
fn keep_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("{ELIDED_MARKER}{tail}")
}
