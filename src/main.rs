use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use secrecy::SecretString;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use parley_core::backend::{GenerationParams, ModelBackend};
use parley_core::sink::{SpeechUnit, UtteranceConsumer};
use parley_core::tools::{SourceId, ToolError, ToolHandler, ToolMetadata};
use parley_engine::{ConversationBuilder, ConversationEvent, DriverConfig, LocalToolExecutor};
use parley_llm::{EchoBackend, OpenAiBackend, OpenAiConfig};
use parley_settings::{BackendKind, BackendSettings, ParleySettings};
use parley_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Talk to a streaming model from the terminal. Each line is one turn;
/// `/flush` cancels the reply in progress, `/log <module> <level>` changes
/// verbosity and `/quit` exits.
#[derive(Parser, Debug)]
#[command(name = "parley", version)]
struct Cli {
    /// Settings file to use instead of `$PARLEY_HOME/settings.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend override: `openai` or `echo`.
    #[arg(long)]
    backend: Option<BackendKind>,

    #[arg(long)]
    model: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

/// One line of terminal input.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Skip,
    Quit,
    Flush,
    Tools,
    Log { module: &'a str, level: &'a str },
    Say(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    match line {
        "" => Command::Skip,
        "/quit" => Command::Quit,
        "/flush" => Command::Flush,
        "/tools" => Command::Tools,
        _ => match line.strip_prefix("/log ").map(|rest| rest.split_whitespace().collect::<Vec<_>>()) {
            Some(args) if args.len() == 2 => Command::Log {
                module: args[0],
                level: args[1],
            },
            _ => Command::Say(line),
        },
    }
}

/// Prints each speech unit as soon as it is complete.
struct Console;

#[async_trait]
impl UtteranceConsumer for Console {
    async fn speak(&self, unit: SpeechUnit) {
        use std::io::Write;

        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{}", unit.text);
        if unit.end_of_segment {
            let _ = writeln!(out);
        }
        let _ = out.flush();
    }
}

/// Tools served in-process under the `builtin` source.
struct Builtins;

#[async_trait]
impl ToolHandler for Builtins {
    async fn call(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        match name {
            "current_time" => {
                let utc = arguments
                    .get("utc")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(if utc {
                    chrono::Utc::now().to_rfc3339()
                } else {
                    chrono::Local::now().to_rfc3339()
                })
            }
            other => Err(ToolError::ExecutionFailed(format!("no builtin named '{other}'"))),
        }
    }
}

fn build_backend(settings: &BackendSettings) -> Result<Arc<dyn ModelBackend>> {
    match settings.kind {
        BackendKind::Echo => Ok(Arc::new(EchoBackend::default())),
        BackendKind::OpenAi => {
            let mut config = OpenAiConfig::new(&settings.base_url, &settings.model);
            config.connect_timeout = Duration::from_millis(settings.connect_timeout_ms);
            config.idle_timeout = Duration::from_millis(settings.idle_timeout_ms);
            match std::env::var(&settings.api_key_env) {
                Ok(key) if !key.is_empty() => config = config.with_api_key(SecretString::from(key)),
                _ => tracing::warn!(var = %settings.api_key_env, "API key not set, sending unauthenticated requests"),
            }
            let backend = OpenAiBackend::new(config).context("building OpenAI backend")?;
            Ok(Arc::new(backend))
        }
    }
}

fn driver_config(settings: &ParleySettings) -> DriverConfig {
    DriverConfig {
        parameters: GenerationParams {
            temperature: settings.generation.temperature,
            max_tokens: settings.generation.max_tokens,
        },
        instructions: settings.generation.instructions.clone(),
        request_timeout: settings.turn.request_timeout_ms.map(Duration::from_millis),
        tool_timeout: Duration::from_millis(settings.turn.tool_timeout_ms),
        max_tool_rounds: settings.turn.max_tool_rounds,
    }
}

async fn report_events(mut events: broadcast::Receiver<ConversationEvent>) {
    loop {
        match events.recv().await {
            Ok(ConversationEvent::TurnFailed { turn_id, message, retryable, .. }) => {
                let hint = if retryable { ", try again" } else { "" };
                eprintln!("\n[{turn_id} failed: {message}{hint}]");
            }
            Ok(ConversationEvent::ToolInvoked { tool_name, .. }) => {
                eprintln!("[calling {tool_name}]");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => parley_settings::load_settings_from_path(path),
        None => parley_settings::load_settings(),
    }
    .context("loading settings")?;
    if let Some(kind) = cli.backend {
        settings.backend.kind = kind;
    }
    if let Some(model) = cli.model {
        settings.backend.model = model;
    }

    let telemetry = TelemetryConfig::from_strings(
        &settings.logging.level,
        settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        settings.logging.json || cli.json_logs,
    )?;
    let telemetry = init_telemetry(telemetry)?;

    let backend = build_backend(&settings.backend)?;
    tracing::info!(backend = backend.name(), model = %settings.backend.model, "starting parley");

    let builtin = SourceId::new("builtin");
    let executor = Arc::new(LocalToolExecutor::new());
    executor.add_handler(builtin.clone(), Arc::new(Builtins));

    let conversation = ConversationBuilder::with_consumer(backend, Arc::new(Console))
        .executor(executor)
        .config(driver_config(&settings))
        .event_buffer(settings.turn.event_buffer)
        .start();
    conversation.register_tool(
        ToolMetadata::new("current_time", "Current date and time as RFC 3339")
            .with_parameter("utc", "boolean", "Return UTC instead of local time", false),
        builtin,
    );
    tokio::spawn(report_events(conversation.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Command::Skip => continue,
                    Command::Quit => break,
                    Command::Flush => {
                        let report = conversation.flush().await;
                        eprintln!("[flushed: {} dropped, cancelled={}]", report.drained, report.cancelled);
                    }
                    Command::Tools => {
                        let sources = conversation.tool_sources();
                        for tool in conversation.tools() {
                            let source = sources.get(&tool.name).map(|s| s.as_str()).unwrap_or("?");
                            eprintln!("{} [{source}]: {}", tool.name, tool.description);
                        }
                    }
                    Command::Log { module, level } => {
                        match parse_level(level).and_then(|level| telemetry.set_module_level(module, level)) {
                            Ok(()) => eprintln!("[{module} logging at {level}]"),
                            Err(e) => eprintln!("[{e}]"),
                        }
                    }
                    Command::Say(text) => {
                        conversation.enqueue(text)?;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let context = conversation.shutdown().await;
    tracing::info!(messages = context.len(), "conversation closed");
    Ok(())
}
