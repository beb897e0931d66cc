//! Remote API layer: the run-service contract, its HTTP client, and retry.
//!
//! - [`service`]: [`RunService`] trait plus the wire types for runs, threads,
//!   paging and assistant profiles.
//! - [`client`]: [`OpenAiClient`], the HTTP implementation, with a pacer that
//!   keeps a minimum interval between calls.
//! - [`retry`]: backoff configuration and the closed
//!   [`RemoteErrorClass`] classification.

pub mod client;
pub mod retry;
pub mod service;

// Re-export commonly used items at the module level.
pub use client::OpenAiClient;
pub use retry::{RemoteErrorClass, RetryConfig, classify, retry_remote};
pub use service::{
    AssistantSpec, ListQuery, Page, RemoteThread, Run, RunRequest, RunService, RunStatus,
    SortOrder, ToolOutput,
};
