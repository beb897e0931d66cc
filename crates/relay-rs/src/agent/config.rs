//! Configuration for the [`Orchestrator`](super::orchestrator::Orchestrator).
//!
//! Every knob has a default; [`RelayConfig::from_env`] layers the usual
//! environment variables on top, and the `with_*` builder methods override
//! individual settings.
//!
//! ```ignore
//! let config = RelayConfig::from_env()
//!     .with_root_path("/srv/project")
//!     .with_max_self_prompts(5)
//!     .with_sidecar_buffer_cap(None);
//! ```
//!
//! Token thresholds derive from the base model's per-minute limit:
//! `prune_at = round(limit * 1.2 / 3)` and `hard_cap = round(limit * 2 / 3)`.

use crate::api::retry::RetryConfig;
use crate::tools::exec::DEFAULT_BLOCKED_COMMANDS;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Defaults ───────────────────────────────────────────────────────

/// Per-minute token limits of known models.
pub const MODEL_LIMITS: &[(&str, u64)] = &[
    ("gpt-4.1", 30_000),
    ("gpt-4.1-mini", 200_000),
    ("o4-mini", 200_000),
];

/// Per-minute limit for models missing from [`MODEL_LIMITS`].
pub const FALLBACK_TOKEN_LIMIT: u64 = 30_000;

pub const DEFAULT_BASE_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_SUMMARY_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_SMART_MODEL: &str = "o4-mini";

/// Messages kept verbatim at the end of the thread during compaction.
pub const KEEP_N_LIVE: usize = 10;
/// Reservations are inflated by this factor.
pub const RUN_SAFE_MULT: f64 = 1.25;
/// Headroom left for the model's reply.
pub const COMPLETION_BUFFER: u64 = 10_000;
/// Max tokens for a summarization response.
pub const SUMMARY_LIMIT: u32 = 5_120;

/// Default bound on each sidecar output stream.
pub const DEFAULT_SIDECAR_BUFFER_CAP: usize = 1024 * 1024;

pub const DEFAULT_ASSISTANT_NAME: &str = "Server Assistant";

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a server-side development assistant working inside a project directory.

Use the declared tools to inspect and modify project files, run shell commands \
and scripts, manage long-running background processes, and read the front-end \
console. Re-read files between edits so you never overwrite concurrent changes. \
Every tool call must include a `summary_prompt` describing how to condense its \
result if the output turns out to be too large.

Only when the user explicitly asks you to keep working on your own, end your \
tool chain with `reprompt_self` and supply the next prompt.";

/// Per-minute limit for a model name.
pub fn token_limit_for_model(model: &str) -> u64 {
    MODEL_LIMITS
        .iter()
        .find(|(name, _)| *name == model)
        .map_or(FALLBACK_TOKEN_LIMIT, |(_, limit)| *limit)
}

// ── Token limits ───────────────────────────────────────────────────

/// Budget thresholds shared by the governor and the compactor.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLimits {
    /// Admitted tokens allowed per sliding window.
    pub per_minute: u64,
    /// Soft compaction threshold for the conversation tally.
    pub prune_at: u64,
    /// Hard ceiling for tally plus pending headroom.
    pub hard_cap: u64,
    /// Default number of live tail messages.
    pub keep_live: usize,
    pub safety_multiplier: f64,
    pub completion_buffer: u64,
    pub summary_max_tokens: u32,
    /// Length of the sliding reservation window.
    pub window: Duration,
}

impl TokenLimits {
    pub fn from_limit(per_minute: u64) -> Self {
        Self {
            per_minute,
            prune_at: (per_minute as f64 * 1.2 / 3.0).round() as u64,
            hard_cap: (per_minute as f64 * 2.0 / 3.0).round() as u64,
            keep_live: KEEP_N_LIVE,
            safety_multiplier: RUN_SAFE_MULT,
            completion_buffer: COMPLETION_BUFFER,
            summary_max_tokens: SUMMARY_LIMIT,
            window: Duration::from_secs(60),
        }
    }

    pub fn for_model(model: &str) -> Self {
        Self::from_limit(token_limit_for_model(model))
    }
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self::for_model(DEFAULT_BASE_MODEL)
    }
}

// ── RelayConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Model the assistant profile runs on.
    pub base_model: String,
    /// Cheaper model used for summaries.
    pub summary_model: String,
    /// Model behind the `smart_chat` tool.
    pub smart_model: String,
    pub limits: TokenLimits,
    /// Directory holding conversation files and the assistant cache.
    pub saved_dir: PathBuf,
    /// Root every tool path is confined to.
    pub root_path: PathBuf,
    /// Source for `reset_project`. The tool is only registered when set.
    pub template_dir: Option<PathBuf>,
    pub system_prompt: String,
    pub assistant_name: String,
    pub run_poll_interval: Duration,
    pub lock_poll_interval: Duration,
    /// Full turn attempts before giving up.
    pub max_turn_attempts: u32,
    /// Backoff for rate limits and transient failures within one attempt.
    pub remote_retry: RetryConfig,
    /// Attempts at posting a message or starting a run when the thread has
    /// an active run.
    pub max_create_message_attempts: u32,
    /// Upper bound on chained self-continuation turns.
    pub max_self_prompts: u32,
    /// `None` disables tool timeouts.
    pub tool_timeout: Option<Duration>,
    pub max_result_bytes: usize,
    /// `None` keeps sidecar output unbounded.
    pub sidecar_buffer_cap: Option<usize>,
    pub shell_blocked_commands: Vec<String>,
    pub python_interpreter: String,
    pub console_timeout: Duration,
    /// Cap on the `wait` tool.
    pub max_wait: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let root_path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            base_model: DEFAULT_BASE_MODEL.into(),
            summary_model: DEFAULT_SUMMARY_MODEL.into(),
            smart_model: DEFAULT_SMART_MODEL.into(),
            limits: TokenLimits::for_model(DEFAULT_BASE_MODEL),
            saved_dir: root_path.join("gpt_dev").join("saved"),
            root_path,
            template_dir: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            assistant_name: DEFAULT_ASSISTANT_NAME.into(),
            run_poll_interval: Duration::from_millis(500),
            lock_poll_interval: Duration::from_millis(100),
            max_turn_attempts: 3,
            remote_retry: RetryConfig::with_retries(4),
            max_create_message_attempts: 3,
            max_self_prompts: 10,
            tool_timeout: Some(Duration::from_secs(120)),
            max_result_bytes: crate::tools::core::DEFAULT_MAX_RESULT_BYTES,
            sidecar_buffer_cap: Some(DEFAULT_SIDECAR_BUFFER_CAP),
            shell_blocked_commands: DEFAULT_BLOCKED_COMMANDS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            python_interpreter: "python3".into(),
            console_timeout: Duration::from_secs(30),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    /// Defaults overlaid with `GPT_MODEL`, `SUMMARY_MODEL`, `SMART_MODEL`,
    /// `SAVED_DIR` and `TEMPLATE_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(model) = std::env::var("GPT_MODEL") {
            config = config.with_base_model(model);
        }
        if let Ok(model) = std::env::var("SUMMARY_MODEL") {
            config.summary_model = model;
        }
        if let Ok(model) = std::env::var("SMART_MODEL") {
            config.smart_model = model;
        }
        if let Ok(dir) = std::env::var("SAVED_DIR") {
            config.saved_dir = PathBuf::from(dir);
        }
        config.template_dir = match std::env::var("TEMPLATE_DIR") {
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(_) => {
                let fallback = config.root_path.join("gpt_dev").join("default");
                fallback.is_dir().then_some(fallback)
            }
        };
        config
    }

    /// Set the base model and re-derive the token limits from it.
    pub fn with_base_model(mut self, model: impl Into<String>) -> Self {
        self.base_model = model.into();
        self.limits = TokenLimits::for_model(&self.base_model);
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = model.into();
        self
    }

    pub fn with_smart_model(mut self, model: impl Into<String>) -> Self {
        self.smart_model = model.into();
        self
    }

    pub fn with_limits(mut self, limits: TokenLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_saved_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.saved_dir = dir.into();
        self
    }

    pub fn with_root_path(mut self, root: impl AsRef<Path>) -> Self {
        self.root_path = root.as_ref().to_path_buf();
        self
    }

    pub fn with_template_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.template_dir = dir;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Set both the run poll interval and the lock poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.run_poll_interval = interval;
        self.lock_poll_interval = interval;
        self
    }

    pub fn with_max_turn_attempts(mut self, attempts: u32) -> Self {
        self.max_turn_attempts = attempts.max(1);
        self
    }

    pub fn with_remote_retry(mut self, retry: RetryConfig) -> Self {
        self.remote_retry = retry;
        self
    }

    pub fn with_max_self_prompts(mut self, max: u32) -> Self {
        self.max_self_prompts = max;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_sidecar_buffer_cap(mut self, cap: Option<usize>) -> Self {
        self.sidecar_buffer_cap = cap;
        self
    }

    pub fn with_python_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.python_interpreter = interpreter.into();
        self
    }

    pub fn with_console_timeout(mut self, timeout: Duration) -> Self {
        self.console_timeout = timeout;
        self
    }

    /// Path of the cached assistant profile.
    pub fn assistant_file(&self) -> PathBuf {
        self.saved_dir.join("assistant.json")
    }
}
