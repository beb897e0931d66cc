//! Tool abstraction and registry.
//!
//! The [`Tool`] trait defines what every handler provides: a definition
//! (name, description, JSON schema) and an async `execute` that receives the
//! raw JSON arguments plus a [`ToolContext`]. Tools are keyed in the
//! [`ToolRegistry`] by [`ToolKind`], a closed capability enum with a
//! `Custom` variant for extensions. The registry validates arguments against
//! the declared schema, applies the timeout, catches panics and truncates
//! oversized results.

use crate::ToolDef;
use crate::error::ToolError;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolOutcome, ToolError>> + Send + 'a>>;

// ── Outcome ────────────────────────────────────────────────────────

/// What a handler produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutcome {
    pub result: String,
    /// The call changed persistent state (files, processes).
    pub did_write_op: bool,
    /// Follow-up prompt for the self-continuation loop.
    pub self_prompt: Option<String>,
}

impl ToolOutcome {
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            ..Default::default()
        }
    }

    /// A result from a call that mutated state.
    pub fn write(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            did_write_op: true,
            self_prompt: None,
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::text(value.to_string())
    }

    pub fn with_self_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.self_prompt = Some(prompt.into());
        self
    }
}

// ── Kinds ──────────────────────────────────────────────────────────

/// Capability key of a registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    CopyFile,
    MoveFile,
    RenameFile,
    FetchFile,
    ListDirectory,
    RemoveDirectory,
    ResetProject,
    SearchReplace,
    RunShell,
    RunPython,
    CreateSidecar,
    GetSidecarOutput,
    TerminateSidecar,
    Wait,
    RepromptSelf,
    SmartChat,
    GetConsoleHistory,
    /// Anything registered outside the built-in set.
    Custom(String),
}

impl ToolKind {
    pub const BUILTIN: &'static [ToolKind] = &[
        ToolKind::ReadFile,
        ToolKind::WriteFile,
        ToolKind::CopyFile,
        ToolKind::MoveFile,
        ToolKind::RenameFile,
        ToolKind::FetchFile,
        ToolKind::ListDirectory,
        ToolKind::RemoveDirectory,
        ToolKind::ResetProject,
        ToolKind::SearchReplace,
        ToolKind::RunShell,
        ToolKind::RunPython,
        ToolKind::CreateSidecar,
        ToolKind::GetSidecarOutput,
        ToolKind::TerminateSidecar,
        ToolKind::Wait,
        ToolKind::RepromptSelf,
        ToolKind::SmartChat,
        ToolKind::GetConsoleHistory,
    ];

    pub fn name(&self) -> &str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::CopyFile => "copy_file",
            ToolKind::MoveFile => "move_file",
            ToolKind::RenameFile => "rename_file",
            ToolKind::FetchFile => "fetch_file",
            ToolKind::ListDirectory => "list_directory",
            ToolKind::RemoveDirectory => "remove_directory",
            ToolKind::ResetProject => "reset_project",
            ToolKind::SearchReplace => "search_replace",
            ToolKind::RunShell => "run_shell",
            ToolKind::RunPython => "run_python",
            ToolKind::CreateSidecar => "create_sidecar",
            ToolKind::GetSidecarOutput => "get_sidecar_output",
            ToolKind::TerminateSidecar => "terminate_sidecar",
            ToolKind::Wait => "wait",
            ToolKind::RepromptSelf => "reprompt_self",
            ToolKind::SmartChat => "smart_chat",
            ToolKind::GetConsoleHistory => "get_console_history",
            ToolKind::Custom(name) => name,
        }
    }

    /// Built-in kind for a name, `Custom` otherwise.
    pub fn from_name(name: &str) -> Self {
        Self::BUILTIN
            .iter()
            .find(|k| k.name() == name)
            .cloned()
            .unwrap_or_else(|| ToolKind::Custom(name.to_string()))
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Context ────────────────────────────────────────────────────────

/// Per-call context handed to every handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    /// Every filesystem path is confined under this root.
    pub root_path: PathBuf,
    /// Tripped when the turn is cancelled.
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(conversation_id: impl Into<String>, root_path: impl Into<PathBuf>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            root_path: root_path.into(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Join `segments` under the root, resolving `.` and `..` lexically.
    /// A leading separator is read as relative to the root. Any path that
    /// would climb above the root is rejected.
    pub fn sanitize_path(&self, segments: &[&str]) -> Result<PathBuf, ToolError> {
        let mut out = self.root_path.clone();
        let mut depth = 0usize;
        for segment in segments {
            for component in Path::new(segment).components() {
                match component {
                    Component::Normal(part) => {
                        out.push(part);
                        depth += 1;
                    }
                    Component::ParentDir => {
                        if depth == 0 {
                            return Err(ToolError::PathEscapesRoot(segments.join("/")));
                        }
                        out.pop();
                        depth -= 1;
                    }
                    Component::CurDir | Component::RootDir => {}
                    Component::Prefix(_) => {
                        return Err(ToolError::PathEscapesRoot(segments.join("/")));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Render a sanitized path relative to the root for result messages.
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_path)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A handler the model can invoke via function calling.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl Tool for Echo {
///     fn definition(&self) -> ToolDef {
///         ToolSpec::builder("echo").purpose("Echo the input").to_tool_def()
///     }
///
///     fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
///         Box::pin(async move { Ok(ToolOutcome::text(arguments)) })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The definition sent to the model.
    fn definition(&self) -> ToolDef;

    /// Run the handler. Failures are returned as [`ToolError`]; the
    /// dispatcher turns them into `Error: ...` result text.
    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a>;

    fn name(&self) -> String {
        self.definition().function.name
    }

    fn kind(&self) -> ToolKind {
        ToolKind::from_name(&self.name())
    }
}

// ── Registry ───────────────────────────────────────────────────────

pub struct ToolRegistry {
    tools: HashMap<ToolKind, Box<dyn Tool>>,
    /// Registration order, used for definition export.
    order: Vec<ToolKind>,
    max_result_bytes: usize,
    validate_args: bool,
    timeout: Option<Duration>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field(
                "tools",
                &self.order.iter().map(ToolKind::name).collect::<Vec<_>>(),
            )
            .field("max_result_bytes", &self.max_result_bytes)
            .finish()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// An empty registry with argument validation on and no timeout.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: true,
            timeout: None,
        }
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// `None` disables timeouts.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a tool, replacing any tool of the same kind.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_boxed(Box::new(tool));
    }

    pub fn register_boxed(&mut self, tool: Box<dyn Tool>) {
        let kind = tool.kind();
        if self.tools.insert(kind.clone(), tool).is_none() {
            self.order.push(kind);
        }
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.order
            .iter()
            .filter_map(|k| self.tools.get(k))
            .map(|t| t.definition())
            .collect()
    }

    pub fn contains(&self, kind: &ToolKind) -> bool {
        self.tools.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate, run and truncate one call.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &str,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        let kind = ToolKind::from_name(name);
        let tool = self
            .tools
            .get(&kind)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        if self.validate_args
            && let Some(error) = validate_tool_arguments(tool.as_ref(), arguments)
        {
            return Err(ToolError::InvalidArguments(error));
        }

        log_tool_call(name, arguments);
        let start = std::time::Instant::now();

        let run = AssertUnwindSafe(tool.execute(arguments, ctx)).catch_unwind();
        let guarded = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(r) => r,
                    Err(_) => {
                        info!(
                            "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                            start.elapsed().as_secs_f64(),
                            limit.as_secs_f64(),
                        );
                        Ok(Err(ToolError::TimedOut {
                            name: name.to_string(),
                            secs: limit.as_secs(),
                        }))
                    }
                },
                None => run.await,
            }
        };
        let outcome = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(ToolError::Cancelled),
            r = guarded => r,
        };

        let mut outcome = match outcome {
            Ok(result) => result?,
            Err(panic) => {
                return Err(ToolError::Failed(format!(
                    "tool '{name}' panicked: {}",
                    panic_message(panic.as_ref())
                )));
            }
        };

        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes)",
            start.elapsed().as_secs_f64() * 1000.0,
            outcome.result.len()
        );
        trace!(
            "Tool {name} result preview: {}",
            outcome.result.chars().take(300).collect::<String>()
        );
        outcome.result = truncate_result(outcome.result, self.max_result_bytes);
        Ok(outcome)
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate arguments against the tool's declared JSON Schema. Returns a
/// message the model can act on, or `None` when valid.
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &str) -> Option<String> {
    let args_value: serde_json::Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            return Some(format!(
                "invalid JSON arguments for tool '{}': {e}. \
                 Please provide valid JSON matching the tool's parameter schema.",
                tool.name()
            ));
        }
    };

    let schema = tool.definition().function.parameters;
    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(_) => return None,
    };

    let errors: Vec<String> = validator
        .iter_errors(&args_value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "argument validation failed for tool '{}':\n{}\n\
             Please fix the arguments and try again.",
            tool.name(),
            errors.join("\n")
        ))
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate to at most `max` bytes on a char boundary, appending a notice.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let cut = s.floor_char_boundary(max);
    let kept = s.get(..cut).unwrap_or_default();
    format!("{kept}...\n[truncated: {} bytes total]", s.len())
}

/// Parse raw JSON arguments into a typed struct.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, ToolError> {
    serde_json::from_str(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::spec::ToolSpec;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        text: String,
    }

    struct EchoTool;

    impl Tool for EchoTool {
        fn definition(&self) -> ToolDef {
            ToolSpec::builder("echo")
                .purpose("Echo the input")
                .parameters_for::<EchoArgs>()
                .to_tool_def()
        }

        fn execute<'a>(&'a self, arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async move {
                let args: EchoArgs = parse_tool_args(arguments)?;
                Ok(ToolOutcome::text(args.text))
            })
        }
    }

    struct PanicTool;

    impl Tool for PanicTool {
        fn definition(&self) -> ToolDef {
            ToolSpec::builder("explode").purpose("Panic").to_tool_def()
        }

        fn execute<'a>(&'a self, _arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async move {
                let text: Option<String> = None;
                Ok(ToolOutcome::text(text.unwrap_or_else(|| panic!("boom"))))
            })
        }
    }

    struct SlowTool;

    impl Tool for SlowTool {
        fn definition(&self) -> ToolDef {
            ToolSpec::builder("slow").purpose("Sleep").to_tool_def()
        }

        fn execute<'a>(&'a self, _arguments: &'a str, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ToolOutcome::text("done"))
            })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("conv", "/srv/project")
    }

    #[test]
    fn kinds_round_trip_through_names() {
        for kind in ToolKind::BUILTIN {
            assert_eq!(&ToolKind::from_name(kind.name()), kind);
        }
        assert_eq!(
            ToolKind::from_name("deploy"),
            ToolKind::Custom("deploy".into())
        );
        assert_eq!(EchoTool.kind(), ToolKind::Custom("echo".into()));
    }

    #[test]
    fn sanitize_confines_paths_to_root() {
        let ctx = ctx();
        assert_eq!(
            ctx.sanitize_path(&["src", "main.js"]).unwrap(),
            PathBuf::from("/srv/project/src/main.js")
        );
        assert_eq!(
            ctx.sanitize_path(&["src/../lib", "./a.js"]).unwrap(),
            PathBuf::from("/srv/project/lib/a.js")
        );
        assert_eq!(
            ctx.sanitize_path(&["/etc", "hosts"]).unwrap(),
            PathBuf::from("/srv/project/etc/hosts")
        );
        assert_eq!(ctx.sanitize_path(&[]).unwrap(), PathBuf::from("/srv/project"));
        assert!(matches!(
            ctx.sanitize_path(&["..", "secrets"]),
            Err(ToolError::PathEscapesRoot(_))
        ));
        assert!(matches!(
            ctx.sanitize_path(&["src", "../../etc/passwd"]),
            Err(ToolError::PathEscapesRoot(_))
        ));
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = ToolRegistry::new()
            .with(EchoTool)
            .with(PanicTool)
            .with_if(false, SlowTool);
        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|d| d.function.name)
            .collect();
        assert_eq!(names, ["echo", "explode"]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn executes_known_tool() {
        let registry = ToolRegistry::new().with(EchoTool);
        let out = registry
            .execute("echo", r#"{"text":"hi","summary_prompt":"x"}"#, &ctx())
            .await
            .unwrap();
        assert_eq!(out.result, "hi");
        assert!(!out.did_write_op);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", "{}", &ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown tool 'nope'");
    }

    #[tokio::test]
    async fn missing_summary_prompt_fails_validation() {
        let registry = ToolRegistry::new().with(EchoTool);
        let err = registry
            .execute("echo", r#"{"text":"hi"}"#, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(ref m) if m.contains("summary_prompt")));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let registry = ToolRegistry::new().with(PanicTool);
        let err = registry
            .execute("explode", r#"{"summary_prompt":"x"}"#, &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked: boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported() {
        let registry = ToolRegistry::new()
            .with(SlowTool)
            .with_timeout(Some(Duration::from_secs(5)));
        let err = registry
            .execute("slow", r#"{"summary_prompt":"x"}"#, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { secs: 5, .. }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_running_tool() {
        let registry = ToolRegistry::new().with(SlowTool);
        let ctx = ctx();
        ctx.cancellation.cancel();
        let err = registry
            .execute("slow", r#"{"summary_prompt":"x"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = truncate_result(s, 5);
        assert!(out.starts_with("éé..."));
        assert!(out.contains("[truncated: 20 bytes total]"));
        assert_eq!(truncate_result("short".into(), 100), "short");
    }
}
