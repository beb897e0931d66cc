//! Sidecar controls exposed to the model. Each tool wraps the shared
//! [`SidecarManager`] owned by the orchestrator.

use crate::ToolDef;
use crate::error::ToolError;
use crate::process::sidecar::{SidecarManager, SidecarSpec};
use crate::tools::core::{Tool, ToolContext, ToolFuture, ToolOutcome, parse_tool_args};
use crate::tools::spec::ToolSpec;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Deserialize, JsonSchema)]
pub struct CreateSidecarArgs {
    /// Program to launch (e.g. 'npm', 'node').
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the project root (default: root).
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Deserialize, JsonSchema)]
pub struct SidecarIdArgs {
    /// Id returned by create_sidecar.
    pub id: u64,
}

#[derive(Deserialize, JsonSchema)]
pub struct TerminateSidecarArgs {
    /// Sidecar to stop. Omit to stop every sidecar.
    #[serde(default)]
    pub id: Option<u64>,
}

pub struct CreateSidecar {
    manager: Arc<SidecarManager>,
}

impl CreateSidecar {
    pub fn new(manager: Arc<SidecarManager>) -> Self {
        Self { manager }
    }
}

impl Tool for CreateSidecar {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("create_sidecar")
            .purpose("Start a long-running background process and capture its output")
            .when_to_use("For dev servers, watchers and anything that does not exit on its own")
            .when_not_to_use("For commands that finish quickly, use run_shell instead")
            .parameters_for::<CreateSidecarArgs>()
            .example(
                "create_sidecar(command='npm', args=['run', 'dev'])",
                "{\"id\": 1, \"command\": \"npm run dev\"}",
            )
            .output_format("JSON {id, command}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: CreateSidecarArgs = parse_tool_args(arguments)?;
            let cwd = ctx.sanitize_path(&[args.cwd.as_deref().unwrap_or(".")])?;
            let mut spec = SidecarSpec::new(args.command, cwd).with_args(args.args);
            spec.env = args.env;
            let shown = format!("{} {}", spec.command, spec.args.join(" "));
            let id = self
                .manager
                .create(spec)
                .map_err(|e| ToolError::Command(format!("failed to start sidecar: {e}")))?;
            Ok(ToolOutcome::write(
                serde_json::json!({ "id": id, "command": shown.trim_end() }).to_string(),
            ))
        })
    }
}

pub struct GetSidecarOutput {
    manager: Arc<SidecarManager>,
}

impl GetSidecarOutput {
    pub fn new(manager: Arc<SidecarManager>) -> Self {
        Self { manager }
    }
}

impl Tool for GetSidecarOutput {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("get_sidecar_output")
            .purpose("Read the captured stdout and stderr of a sidecar")
            .when_to_use("To check a dev server for errors or readiness")
            .parameters_for::<SidecarIdArgs>()
            .output_format(
                "JSON {status: found, id, running, stdout, stderr, exit_code, ...} \
                 or {status: not_found, id}",
            )
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: SidecarIdArgs = parse_tool_args(arguments)?;
            let output = self.manager.output(args.id);
            let json = serde_json::to_string(&output)
                .map_err(|e| ToolError::Failed(format!("encoding sidecar output: {e}")))?;
            Ok(ToolOutcome::text(json))
        })
    }
}

pub struct TerminateSidecar {
    manager: Arc<SidecarManager>,
}

impl TerminateSidecar {
    pub fn new(manager: Arc<SidecarManager>) -> Self {
        Self { manager }
    }
}

impl Tool for TerminateSidecar {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("terminate_sidecar")
            .purpose("Stop one sidecar, or all of them when no id is given")
            .parameters_for::<TerminateSidecarArgs>()
            .output_format("JSON {terminated: [ids actually signaled]}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: TerminateSidecarArgs = parse_tool_args(arguments)?;
            let terminated = self.manager.terminate(args.id);
            Ok(ToolOutcome::write(
                serde_json::json!({ "terminated": terminated }).to_string(),
            ))
        })
    }
}
