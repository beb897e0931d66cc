//! Tools the model can call, and how they are run.
//!
//! Every capability (reading files, running commands, steering sidecars) is
//! a [`Tool`] implementor keyed by [`ToolKind`] in a [`ToolRegistry`]. The
//! [`Dispatcher`](dispatch::Dispatcher) runs one batch of calls in order and
//! charges each result to the token governor.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`ToolRegistry`], [`ToolContext`] with path
//!   sandboxing, validation and truncation helpers.
//! - [`spec`]: [`ToolSpec`](spec::ToolSpec) builder; every schema it builds
//!   requires `summary_prompt`.
//! - [`dispatch`]: in-order batch execution.
//! - [`fs`], [`exec`], [`sidecar`], [`control`]: the built-in handlers.
//!   Register all of them with [`builtin_registry`].

pub mod control;
pub mod core;
pub mod dispatch;
pub mod exec;
pub mod fs;
pub mod sidecar;
pub mod spec;

pub use core::{
    DEFAULT_MAX_RESULT_BYTES, Tool, ToolContext, ToolFuture, ToolKind, ToolOutcome, ToolRegistry,
    parse_tool_args, truncate_result, validate_tool_arguments,
};
pub use dispatch::{DispatchReport, Dispatcher, PendingOutput};

use crate::agent::config::RelayConfig;
use crate::agent::console::ConsoleBridge;
use crate::api::service::RunService;
use crate::context::governor::TokenGovernor;
use crate::process::sidecar::SidecarManager;
use std::sync::Arc;

/// Shared state the built-in handlers need.
#[derive(Clone)]
pub struct BuiltinDeps {
    pub service: Arc<dyn RunService>,
    pub governor: Arc<TokenGovernor>,
    pub sidecars: Arc<SidecarManager>,
    pub console: Arc<ConsoleBridge>,
}

/// Registry with every built-in tool, configured from `config`.
/// `reset_project` is only registered when a template directory is set.
pub fn builtin_registry(config: &RelayConfig, deps: BuiltinDeps) -> ToolRegistry {
    let mut registry = ToolRegistry::new()
        .with_max_result_bytes(config.max_result_bytes)
        .with_timeout(config.tool_timeout)
        .with(fs::ReadFile)
        .with(fs::WriteFile)
        .with(fs::CopyFile)
        .with(fs::MoveFile)
        .with(fs::RenameFile)
        .with(fs::FetchFile::new())
        .with(fs::ListDirectory)
        .with(fs::RemoveDirectory)
        .with(fs::SearchReplace)
        .with(exec::RunShell::new().blocked_commands(config.shell_blocked_commands.clone()))
        .with(exec::RunPython::new(config.python_interpreter.clone()))
        .with(sidecar::CreateSidecar::new(Arc::clone(&deps.sidecars)))
        .with(sidecar::GetSidecarOutput::new(Arc::clone(&deps.sidecars)))
        .with(sidecar::TerminateSidecar::new(deps.sidecars))
        .with(control::Wait::new(config.max_wait))
        .with(control::RepromptSelf)
        .with(
            control::SmartChat::new(deps.service, deps.governor, config.smart_model.clone())
                .with_retry(config.remote_retry.clone()),
        )
        .with(control::GetConsoleHistory::new(
            deps.console,
            config.console_timeout,
        ));
    if let Some(template) = &config.template_dir {
        registry.register(fs::ResetProject::new(template.clone()));
    }
    registry
}
