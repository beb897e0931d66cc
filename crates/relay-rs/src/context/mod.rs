//! Token budgeting and history compaction.
//!
//! 1. **[`estimate`]**: [`TokenEstimator`] and the default character-ratio
//!    [`HeuristicEstimator`].
//!
//! 2. **[`governor`]**: [`TokenGovernor`], the process-wide sliding 60-second
//!    reservation window, the per-conversation tallies, and the 10 → 5 → 2
//!    shrink cascade.
//!
//! 3. **[`compactor`]**: [`Compactor`] replaces old thread history with one
//!    summary message and compresses oversized tool outputs.
//!
//! 4. **[`summarizer`]**: prompt builders for both summary calls.

pub mod compactor;
pub mod estimate;
pub mod governor;
pub mod summarizer;

// Re-export commonly used items at the module level.
pub use compactor::{CompactionOutcome, Compactor};
pub use estimate::{HeuristicEstimator, TokenEstimator};
pub use governor::TokenGovernor;
