//! Drive conversations from the command line.
//!
//! Reads the API key from the `OPENAI_API_KEY` environment variable. Model
//! and directory defaults come from `GPT_MODEL`, `SUMMARY_MODEL`,
//! `SMART_MODEL`, `SAVED_DIR` and `TEMPLATE_DIR`; flags override them.
//!
//! # Examples
//!
//! ```sh
//! # Start a new conversation
//! relay prompt "Scaffold an express server in server/"
//!
//! # Continue one, reading the prompt from stdin
//! cat task.md | relay prompt --conversation thread_abc --stdin
//!
//! # Manage saved conversations
//! relay threads
//! relay show thread_abc
//! relay rename thread_abc "Express server"
//! relay delete thread_abc
//! ```
//!
//! Ctrl-C cancels the running turn and terminates its sidecars.

use clap::{Parser, Subcommand};
use relay_rs::agent::events::{CompositeEventHandler, EventHandler, LoggingHandler, RunEvent};
use relay_rs::agent::{Orchestrator, PromptOutcome, PromptRequest, RelayConfig};
use relay_rs::api::OpenAiClient;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "relay", about = "Run tool-using conversations against a remote run service")]
struct Cli {
    /// Model the assistant runs on
    #[arg(long, global = true)]
    model: Option<String>,

    /// Directory holding conversation files
    #[arg(long, global = true)]
    saved_dir: Option<PathBuf>,

    /// Project root every tool path is confined to (default: cwd)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Template directory for `reset_project`
    #[arg(long, global = true)]
    template_dir: Option<PathBuf>,

    /// Also log every lifecycle event
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a prompt and print the reply
    Prompt {
        /// Prompt text
        text: Option<String>,

        /// Read the prompt from stdin
        #[arg(long)]
        stdin: bool,

        /// Local conversation id to continue
        #[arg(long, short)]
        conversation: Option<String>,

        /// Title for a new conversation
        #[arg(long)]
        title: Option<String>,

        /// Instructions for this turn only
        #[arg(long)]
        system: Option<String>,

        /// Print the whole outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// List saved conversations
    Threads,
    /// Print a saved conversation
    Show { id: String },
    /// Rename a conversation
    Rename { id: String, title: String },
    /// Delete a conversation and its remote thread
    Delete { id: String },
    /// Replace the text of one message
    EditMessage {
        id: String,
        message_id: String,
        content: String,
    },
    /// Delete one message
    DeleteMessage { id: String, message_id: String },
}

/// Prints tool calls and retries to stderr.
struct CliEventHandler;

impl EventHandler for CliEventHandler {
    fn on_event(&self, event: &RunEvent<'_>) {
        match event {
            RunEvent::TurnStarted {
                attempt,
                max_attempts,
                ..
            } if *attempt > 1 => {
                eprintln!("  [attempt {attempt}/{max_attempts}]");
            }
            RunEvent::ToolExecuting { name, .. } => {
                eprintln!("  [tool_call] {name}");
            }
            RunEvent::Retry { attempt, error } => {
                eprintln!("  [retry {attempt}] {error}");
            }
            RunEvent::SelfPrompt { depth, .. } => {
                eprintln!("  [self_prompt {depth}]");
            }
            _ => {}
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn build_config(cli: &Cli) -> RelayConfig {
    let mut config = RelayConfig::from_env();
    if let Some(model) = &cli.model {
        config = config.with_base_model(model.clone());
    }
    if let Some(dir) = &cli.saved_dir {
        config = config.with_saved_dir(dir.clone());
    }
    if let Some(root) = &cli.root {
        config = config.with_root_path(root);
    }
    if let Some(dir) = &cli.template_dir {
        config = config.with_template_dir(Some(dir.clone()));
    }
    config
}

fn read_prompt(text: Option<&str>, stdin: bool) -> Result<String, String> {
    let mut prompt = text.unwrap_or_default().to_string();
    if stdin {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("failed to read stdin: {e}"))?;
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str(&buf);
    }
    Ok(prompt)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to format output: {e}"))
}

async fn run(cli: Cli) -> Result<String, String> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| "OPENAI_API_KEY environment variable is not set".to_string())?;
    let client = OpenAiClient::new(api_key).map_err(|e| e.to_string())?;
    let config = build_config(&cli);

    let handler = CompositeEventHandler::new()
        .with(CliEventHandler)
        .with_if(cli.verbose, LoggingHandler);
    let orchestrator = Orchestrator::builder(Arc::new(client), config)
        .with_event_handler(handler)
        .build();

    let result = match cli.command {
        Command::Prompt {
            text,
            stdin,
            conversation,
            title,
            system,
            json,
        } => {
            let mut request = PromptRequest::new(read_prompt(text.as_deref(), stdin)?);
            request.conversation_id = conversation;
            request.title = title;
            request.system_prompt = system;

            let turn = orchestrator.handle_prompt(request);
            tokio::pin!(turn);
            let finished = tokio::select! {
                outcome = &mut turn => Some(outcome),
                _ = tokio::signal::ctrl_c() => None,
            };
            let outcome = match finished {
                Some(outcome) => outcome,
                None => {
                    eprintln!("  Cancelling...");
                    orchestrator.shutdown().await;
                    turn.await
                }
            };

            if json {
                to_json(&outcome)
            } else {
                match outcome {
                    PromptOutcome::Completed(reply) => {
                        eprintln!("  [conversation {}]", reply.local_id);
                        Ok(format!("{}\n", reply.result))
                    }
                    PromptOutcome::Failed { message, .. } => Err(message),
                    PromptOutcome::Cancelled { .. } => Err("cancelled".into()),
                }
            }
        }
        Command::Threads => {
            let list = orchestrator
                .list_conversations()
                .await
                .map_err(|e| e.to_string())?;
            Ok(list
                .iter()
                .map(|c| format!("{}\t{}\t{} messages\n", c.id, c.title, c.message_count))
                .collect())
        }
        Command::Show { id } => {
            let conv = orchestrator.conversation(&id).await.map_err(|e| e.to_string())?;
            to_json(&conv)
        }
        Command::Rename { id, title } => orchestrator
            .rename_conversation(&id, &title)
            .await
            .map(|()| String::new())
            .map_err(|e| e.to_string()),
        Command::Delete { id } => orchestrator
            .delete_conversation(&id)
            .await
            .map(|()| String::new())
            .map_err(|e| e.to_string()),
        Command::EditMessage {
            id,
            message_id,
            content,
        } => {
            let message = orchestrator
                .update_message(&id, &message_id, &content, None)
                .await
                .map_err(|e| e.to_string())?;
            to_json(&message)
        }
        Command::DeleteMessage { id, message_id } => orchestrator
            .delete_message(&id, &message_id)
            .await
            .map(|()| String::new())
            .map_err(|e| e.to_string()),
    };

    orchestrator.shutdown().await;
    result
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
