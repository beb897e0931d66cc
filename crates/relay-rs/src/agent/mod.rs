//! Turn runtime: the [`Orchestrator`] and its supporting modules.
//!
//! - [`orchestrator`]: [`Orchestrator`], the owner of all process-wide
//!   state, and [`PromptRequest`] / [`PromptOutcome`]. Start here.
//! - [`run`]: [`RunDriver`](run::RunDriver), the state machine behind one
//!   remote run.
//! - [`lock`]: per-conversation mutual exclusion.
//! - [`store`]: local conversation files.
//! - [`assistant`]: the cached remote assistant profile.
//! - [`console`]: request/response bridge for console history.
//! - [`config`]: [`RelayConfig`] and the token constants.
//! - [`events`]: [`EventHandler`] and [`RunEvent`] for observing turns, plus
//!   the [`TurnLog`] entries returned to callers.

pub mod assistant;
pub mod config;
pub mod console;
pub mod events;
pub mod lock;
pub mod orchestrator;
pub mod run;
pub mod store;

// Re-export commonly used items at the module level.
pub use config::{RelayConfig, TokenLimits};
pub use console::ConsoleBridge;
pub use events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler, RunEvent,
    TurnLog,
};
pub use lock::{ThreadLockGuard, ThreadLocks};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, PromptOutcome, PromptReply, PromptRequest};
pub use store::{Conversation, ConversationStore, ConversationSummary};
