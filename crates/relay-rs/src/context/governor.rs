//! Sliding-window token governor.
//!
//! Every remote call that spends tokens first takes a reservation through
//! [`TokenGovernor::reserve`]. Reservations live in one process-wide window
//! (one account-level rate limit shared by all conversations); a reservation
//! that would push the window past the per-minute limit waits until the oldest
//! entry ages out.
//!
//! The governor also owns the per-conversation token tallies and the
//! shrink cascade that calls the [`Compactor`] with a decreasing live tail
//! (10, 5, 2) until the projected tally fits the hard cap.

use crate::agent::config::TokenLimits;
use crate::context::compactor::{CompactionOutcome, Compactor};
use crate::context::estimate::{HeuristicEstimator, TokenEstimator};
use crate::error::RelayError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct Reservation {
    at: Instant,
    tokens: u64,
}

pub struct TokenGovernor {
    limits: TokenLimits,
    estimator: Arc<dyn TokenEstimator>,
    window: Mutex<VecDeque<Reservation>>,
    tallies: std::sync::Mutex<HashMap<String, u64>>,
}

impl std::fmt::Debug for TokenGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGovernor")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl TokenGovernor {
    pub fn new(limits: TokenLimits) -> Self {
        Self::with_estimator(limits, Arc::new(HeuristicEstimator::default()))
    }

    pub fn with_estimator(limits: TokenLimits, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            limits,
            estimator,
            window: Mutex::new(VecDeque::new()),
            tallies: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &TokenLimits {
        &self.limits
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn estimate(&self, text: &str) -> u64 {
        self.estimator.estimate(text)
    }

    // ── Sliding window ─────────────────────────────────────────────

    /// The reservation actually taken for an estimate: inflated by the
    /// safety multiplier and capped at the per-minute limit.
    pub fn reservation_for(&self, estimated: u64) -> u64 {
        let want = (estimated as f64 * self.limits.safety_multiplier).ceil() as u64;
        want.min(self.limits.per_minute)
    }

    /// Wait until the reservation fits the window, then record it.
    /// Returns the admitted token count.
    pub async fn reserve(&self, estimated: u64) -> u64 {
        let want = self.reservation_for(estimated);
        loop {
            let wake_at = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                prune(&mut window, now, self.limits.window);
                let used: u64 = window.iter().map(|r| r.tokens).sum();
                if used + want <= self.limits.per_minute {
                    window.push_back(Reservation { at: now, tokens: want });
                    debug!(
                        "Reserved {want} tokens ({} / {} in window)",
                        used + want,
                        self.limits.per_minute
                    );
                    return want;
                }
                match window.front() {
                    Some(oldest) => oldest.at + self.limits.window,
                    None => now,
                }
            };
            info!(
                "Token window full, waiting {:.1}s for {want} tokens",
                wake_at
                    .saturating_duration_since(Instant::now())
                    .as_secs_f64()
            );
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// [`reserve`](Self::reserve) that gives up when `cancel` fires.
    pub async fn reserve_or_cancel(
        &self,
        estimated: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, RelayError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            admitted = self.reserve(estimated) => Ok(admitted),
        }
    }

    /// Tokens admitted within the trailing window.
    pub async fn window_total(&self) -> u64 {
        let mut window = self.window.lock().await;
        prune(&mut window, Instant::now(), self.limits.window);
        window.iter().map(|r| r.tokens).sum()
    }

    // ── Tallies ────────────────────────────────────────────────────

    pub fn tally(&self, conversation_id: &str) -> u64 {
        self.lock_tallies()
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_tally(&self, conversation_id: &str, tokens: u64) {
        self.lock_tallies()
            .insert(conversation_id.to_string(), tokens);
    }

    /// Add to a tally and return the new value.
    pub fn add_tally(&self, conversation_id: &str, tokens: u64) -> u64 {
        let mut tallies = self.lock_tallies();
        let entry = tallies.entry(conversation_id.to_string()).or_insert(0);
        *entry = entry.saturating_add(tokens);
        *entry
    }

    pub fn forget(&self, conversation_id: &str) {
        self.lock_tallies().remove(conversation_id);
    }

    fn lock_tallies(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        // A poisoned map still holds valid counts.
        self.tallies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ── Shrink policy ──────────────────────────────────────────────

    /// Whether a conversation at `tally` needs compaction before spending
    /// `extra` more tokens with a live tail of `keep` messages.
    pub fn needs_compaction(&self, tally: u64, extra: u64, keep: usize) -> bool {
        tally + extra > self.limits.hard_cap
            || (keep == self.limits.keep_live && tally > self.limits.prune_at)
    }

    /// Live-tail sizes tried in order: 10, 5, 2 with the default limits.
    pub fn shrink_cascade(&self) -> [usize; 3] {
        let keep = self.limits.keep_live.max(1);
        [keep, (keep / 2).max(1), (keep / 5).max(1)]
    }

    /// Compact the conversation with a shrinking live tail until the
    /// projected tally fits the hard cap. Returns the outcome of every
    /// compaction pass that ran.
    pub async fn shrink_context_if_needed(
        &self,
        conversation_id: &str,
        thread_id: &str,
        extra: u64,
        compactor: &Compactor,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompactionOutcome>, RelayError> {
        let mut passes = Vec::new();
        if !self.needs_compaction(self.tally(conversation_id), extra, self.limits.keep_live) {
            return Ok(passes);
        }
        for keep in self.shrink_cascade() {
            let outcome = compactor
                .compact(conversation_id, thread_id, keep, cancel)
                .await?;
            passes.push(outcome);
            let tally = self.tally(conversation_id);
            if tally + extra <= self.limits.hard_cap {
                break;
            }
            debug!(
                "Tally {tally} + {extra} still above hard cap {} after keep={keep}",
                self.limits.hard_cap
            );
        }
        Ok(passes)
    }
}

fn prune(window: &mut VecDeque<Reservation>, now: Instant, span: std::time::Duration) {
    while let Some(front) = window.front() {
        if now.saturating_duration_since(front.at) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}
