//! Token estimation.
//!
//! Exact tokenization is model specific, so the governor and compactor work
//! from estimates produced by a [`TokenEstimator`]. The default
//! [`HeuristicEstimator`] computes `ceil(chars / 4.1) + 10` and inflates the
//! result by 15%. Its accuracy on code-heavy or non-English text is unknown;
//! swap in a tokenizer-backed estimator where that matters.

use crate::ThreadMessage;

/// Default characters per token.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.1;

/// Fixed per-text overhead, covering role and framing tokens.
pub const DEFAULT_TOKEN_PAD: u64 = 10;

/// Safety inflation applied after the pad.
pub const DEFAULT_INFLATION: f64 = 1.15;

/// Produces an approximate token count for a piece of text.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;

    /// Sum of the estimates of each message's flattened text.
    fn estimate_messages(&self, messages: &[ThreadMessage]) -> u64 {
        messages.iter().map(|m| self.estimate(&m.text())).sum()
    }
}

/// Character-ratio heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicEstimator {
    pub chars_per_token: f64,
    pub pad: u64,
    pub inflation: f64,
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            pad: DEFAULT_TOKEN_PAD,
            inflation: DEFAULT_INFLATION,
        }
    }
}

impl HeuristicEstimator {
    pub fn with_chars_per_token(mut self, cpt: f64) -> Self {
        if cpt > 0.0 {
            self.chars_per_token = cpt;
        }
        self
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count() as f64;
        let base = (chars / self.chars_per_token).ceil() as u64 + self.pad;
        (base as f64 * self.inflation).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;

    #[test]
    fn empty_text_costs_the_pad() {
        let est = HeuristicEstimator::default();
        // ceil(10 * 1.15) = 12
        assert_eq!(est.estimate(""), 12);
    }

    #[test]
    fn known_values() {
        let est = HeuristicEstimator::default();
        // 20 chars -> 5 + 10 = 15 -> ceil(17.25) = 18
        assert_eq!(est.estimate(&"a".repeat(20)), 18);
        // 50 chars -> 13 + 10 = 23 -> ceil(26.45) = 27
        assert_eq!(est.estimate(&"a".repeat(50)), 27);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let est = HeuristicEstimator::default();
        assert_eq!(est.estimate("ééééé"), est.estimate("eeeee"));
    }

    #[test]
    fn message_estimates_sum() {
        let est = HeuristicEstimator::default();
        let msgs = vec![
            ThreadMessage::new("a", MessageRole::User, "hello"),
            ThreadMessage::new("b", MessageRole::Assistant, "world"),
        ];
        assert_eq!(est.estimate_messages(&msgs), 2 * est.estimate("hello"));
    }

    #[test]
    fn invalid_ratio_is_ignored() {
        let est = HeuristicEstimator::default().with_chars_per_token(0.0);
        assert_eq!(est.chars_per_token, DEFAULT_CHARS_PER_TOKEN);
    }
}
