//! Command execution tools.
//!
//! | Tool | Name | Purpose |
//! |------|------|---------|
//! | [`RunShell`] | `run_shell` | `sh -c` in the project root |
//! | [`RunPython`] | `run_python` | Inline code or a script file |
//!
//! Both return `{stdout, stderr, code}` as JSON with trimmed streams. Child
//! processes are killed when the call is dropped (timeout or cancellation).
//!
//! ```ignore
//! let registry = ToolRegistry::new()
//!     .with(RunShell::new().block_command("shutdown"))
//!     .with(RunPython::new("python3"));
//! ```

use crate::ToolDef;
use crate::error::ToolError;
use crate::tools::core::{Tool, ToolContext, ToolFuture, ToolOutcome, parse_tool_args};
use crate::tools::spec::ToolSpec;
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Substrings that reject a shell command outright (matched lowercased).
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &["rm -rf /", "mkfs", "> /dev/"];

#[derive(Deserialize, JsonSchema)]
pub struct RunShellArgs {
    /// Shell command to execute (e.g. 'npm test', 'ls -la src').
    pub command: String,
}

#[derive(Deserialize, JsonSchema)]
pub struct RunPythonArgs {
    /// Inline Python source to run with `-c`.
    #[serde(default)]
    pub code: Option<String>,
    /// Path of a script relative to the project root.
    #[serde(default)]
    pub script: Option<String>,
    /// Extra arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

// ── RunShell ────────────────────────────────────────────────────────

pub struct RunShell {
    blocked_commands: Vec<String>,
}

impl Default for RunShell {
    fn default() -> Self {
        Self::new()
    }
}

impl RunShell {
    pub fn new() -> Self {
        Self {
            blocked_commands: DEFAULT_BLOCKED_COMMANDS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Add a blocked pattern (lowercased substring match).
    pub fn block_command(mut self, pattern: impl Into<String>) -> Self {
        self.blocked_commands.push(pattern.into().to_lowercase());
        self
    }

    /// Replace the entire blocked list.
    pub fn blocked_commands(mut self, patterns: Vec<String>) -> Self {
        self.blocked_commands = patterns.into_iter().map(|p| p.to_lowercase()).collect();
        self
    }

    fn is_blocked(&self, command: &str) -> bool {
        let lower = command.to_lowercase();
        self.blocked_commands.iter().any(|pat| lower.contains(pat.as_str()))
    }
}

impl Tool for RunShell {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("run_shell")
            .purpose("Run a shell command in the project root")
            .when_to_use(
                "For builds, tests, package installs, git and anything the file \
                 tools do not cover",
            )
            .when_not_to_use(
                "For long-running servers or watchers, use create_sidecar so the \
                 turn is not blocked",
            )
            .parameters_for::<RunShellArgs>()
            .example(
                "run_shell(command='node --version')",
                "{\"stdout\": \"v20.11.0\", \"stderr\": \"\", \"code\": 0}",
            )
            .output_format("JSON {stdout, stderr, code}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: RunShellArgs = parse_tool_args(arguments)?;
            if self.is_blocked(&args.command) {
                return Err(ToolError::Command(
                    "potentially destructive command blocked".into(),
                ));
            }
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&args.command);
            run_captured(cmd, &ctx.root_path).await
        })
    }
}

// ── RunPython ───────────────────────────────────────────────────────

pub struct RunPython {
    interpreter: String,
}

impl RunPython {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Tool for RunPython {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("run_python")
            .purpose("Run Python code, either inline or from a script in the project")
            .when_to_use("For data processing or calculations easier to express in Python")
            .when_not_to_use("For plain shell pipelines, use run_shell instead")
            .parameters_for::<RunPythonArgs>()
            .output_format("JSON {stdout, stderr, code}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: RunPythonArgs = parse_tool_args(arguments)?;
            let mut cmd = Command::new(&self.interpreter);
            match (args.code, args.script) {
                (Some(code), None) => {
                    cmd.arg("-c").arg(code);
                }
                (None, Some(script)) => {
                    cmd.arg(ctx.sanitize_path(&[script.as_str()])?);
                }
                _ => {
                    return Err(ToolError::InvalidArguments(
                        "provide exactly one of 'code' or 'script'".into(),
                    ));
                }
            }
            cmd.args(&args.args);
            run_captured(cmd, &ctx.root_path).await
        })
    }
}

// ── Shared ──────────────────────────────────────────────────────────

/// Run to completion in `cwd` and report trimmed output plus exit code.
/// A non-zero exit is a normal result, not an error.
async fn run_captured(mut cmd: Command, cwd: &Path) -> Result<ToolOutcome, ToolError> {
    let output = cmd
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ToolError::Command(format!("failed to start command: {e}")))?;
    let code = output.status.code();
    debug!("command exited with {:?}", code);
    let body = serde_json::json!({
        "stdout": String::from_utf8_lossy(&output.stdout).trim(),
        "stderr": String::from_utf8_lossy(&output.stderr).trim(),
        "code": code,
    });
    Ok(ToolOutcome::write(body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(out: &ToolOutcome) -> serde_json::Value {
        serde_json::from_str(&out.result).unwrap()
    }

    #[tokio::test]
    async fn shell_reports_streams_and_code() {
        let dir = TempDir::new().unwrap();
        let ctx = ToolContext::new("conv", dir.path());
        let out = RunShell::new()
            .execute(r#"{"command":"echo hi; echo oops >&2; exit 3"}"#, &ctx)
            .await
            .unwrap();
        let v = parse(&out);
        assert_eq!(v["stdout"], "hi");
        assert_eq!(v["stderr"], "oops");
        assert_eq!(v["code"], 3);
    }

    #[tokio::test]
    async fn shell_runs_in_project_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let ctx = ToolContext::new("conv", dir.path());
        let out = RunShell::new().execute(r#"{"command":"ls"}"#, &ctx).await.unwrap();
        assert_eq!(parse(&out)["stdout"], "marker.txt");
    }

    #[tokio::test]
    async fn shell_blocks_destructive_patterns() {
        let ctx = ToolContext::new("conv", "/tmp");
        let tool = RunShell::new().block_command("Shutdown");
        for command in ["rm -rf /", "MKFS.ext4 /dev/sda", "shutdown now"] {
            let args = serde_json::json!({ "command": command }).to_string();
            let err = tool.execute(&args, &ctx).await.unwrap_err();
            assert!(err.to_string().contains("blocked"), "{command}");
        }
    }

    #[tokio::test]
    async fn python_requires_exactly_one_source() {
        let ctx = ToolContext::new("conv", "/tmp");
        let tool = RunPython::new("python3");
        let err = tool.execute("{}", &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        let err = tool
            .execute(r#"{"code":"print(1)","script":"a.py"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn python_script_path_is_sandboxed() {
        let ctx = ToolContext::new("conv", "/tmp/project");
        let err = RunPython::new("python3")
            .execute(r#"{"script":"../../etc/x.py"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathEscapesRoot(_)));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_command_error() {
        let ctx = ToolContext::new("conv", "/tmp");
        let err = RunPython::new("definitely-not-a-python-binary")
            .execute(r#"{"code":"print(1)"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Command(_)));
    }
}
