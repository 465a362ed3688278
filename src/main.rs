mod client;
mod config;
mod console;
mod dispatch;
mod error;
mod protocol;
mod stream;
mod ui;
mod ui_state;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::ChatClient;
use config::{ClientConfig, Settings};
use protocol::ConversationId;
use std::path::Path;
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "simplechat", version, about = "Terminal client for a SimpleChat server")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat (default).
    Chat,
    /// Send one message and print the reply.
    Send {
        message: String,
        /// Conversation to post into. A new one is created when omitted.
        #[arg(long, short)]
        conversation: Option<ConversationId>,
    },
    /// List conversations, most recent first.
    List,
    /// Create an empty conversation and print its id.
    New,
    /// Print the messages of a conversation.
    History { id: ConversationId },
    /// Delete a conversation and its messages.
    Delete { id: ConversationId },
}

// Console output would corrupt the inline terminal UI, so the UI logs to a file instead.
fn init_tracing(settings: &Settings, is_tui: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    if !is_tui {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
        return Ok(None);
    }

    let appender = match &settings.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .context("--log-file must name a file")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            tracing_appender::rolling::never(dir, name)
        }
        None => {
            let dir = config::default_log_dir();
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            tracing_appender::rolling::daily(dir, "simplechat.log")
        }
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false),
        )
        .init();

    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Chat);
    let is_tui = matches!(command, Command::Chat);

    // Must outlive main so buffered log lines are flushed on exit.
    let _log_guard = init_tracing(&cli.settings, is_tui)?;

    let config = ClientConfig::try_from(&cli.settings)?;
    let client = ChatClient::new(config)?;
    let use_stream = !cli.settings.no_stream;

    match command {
        Command::Chat => {
            // The UI loop polls the terminal synchronously; keep it off the async workers.
            tokio::task::block_in_place(|| ui::run_tui(client, use_stream))?;
        }
        Command::Send {
            message,
            conversation,
        } => return console::send(&client, conversation, &message, use_stream).await,
        Command::List => console::list(&client).await?,
        Command::New => console::create(&client).await?,
        Command::History { id } => console::history(&client, id).await?,
        Command::Delete { id } => console::delete(&client, id).await?,
    }

    Ok(ExitCode::SUCCESS)
}
