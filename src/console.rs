use crate::client::ChatClient;
use crate::dispatch::{ReplyView, SendOutcome};
use crate::protocol::{ConversationId, Message, Role};
use crate::ui::format_time;
use anyhow::{Context, bail};
use crossterm::cursor::{MoveToColumn, MoveUp};
use crossterm::queue;
use crossterm::terminal::{self, Clear, ClearType};
use std::io::{self, IsTerminal, Write};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a [`ConsoleView`] writes and how it can take text back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMode {
    /// Interactive terminal `width` columns wide: text streams immediately and a discarded
    /// reply is erased with cursor movement.
    Terminal { width: u16 },
    /// Pipe or file: the reply is held back until it concludes, so a discarded reply never
    /// reaches the output.
    Plain,
}

impl ConsoleMode {
    pub fn detect() -> Self {
        if !io::stdout().is_terminal() {
            return ConsoleMode::Plain;
        }
        let width = terminal::size().map(|(cols, _)| cols).unwrap_or(80);
        ConsoleMode::Terminal { width }
    }
}

/// Prints a reply to a writer as it streams in.
pub struct ConsoleView<W: Write> {
    out: W,
    mode: ConsoleMode,
    /// Everything rendered for the open reply, including the speaker prefix.
    reply: String,
    open: bool,
    errors: Vec<String>,
}

impl<W: Write> ConsoleView<W> {
    pub fn new(out: W, mode: ConsoleMode) -> Self {
        Self {
            out,
            mode,
            reply: String::new(),
            open: false,
            errors: Vec::new(),
        }
    }

    fn write(&mut self, text: &str) {
        // A closed stdout is not worth aborting the reply for.
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }

    fn render(&mut self, text: &str) {
        self.reply.push_str(text);
        if matches!(self.mode, ConsoleMode::Terminal { .. }) {
            self.write(text);
        }
    }

    fn erase_reply(&mut self, width: u16) -> io::Result<()> {
        let rows = rows_of(&self.reply, width);
        queue!(self.out, MoveToColumn(0))?;
        if rows > 1 {
            queue!(self.out, MoveUp(rows - 1))?;
        }
        queue!(self.out, Clear(ClearType::FromCursorDown))?;
        self.out.flush()
    }
}

/// Terminal rows `text` occupies once wrapped at `width` columns.
fn rows_of(text: &str, width: u16) -> u16 {
    let width = width.max(1) as usize;
    text.split('\n')
        .map(|line| line.chars().count().max(1).div_ceil(width))
        .sum::<usize>()
        .min(u16::MAX as usize) as u16
}

impl<W: Write> ReplyView for ConsoleView<W> {
    fn open_reply(&mut self) {
        self.open = true;
        self.reply.clear();
        self.render("AI: ");
    }

    fn append_reply(&mut self, text: &str) {
        self.render(text);
    }

    fn scroll_to_bottom(&mut self) {}

    fn complete_reply(&mut self, message: &Message) {
        let stamp = format!("\n    [{}]", format_time(message.created_at));
        self.render(&stamp);
    }

    fn discard_reply(&mut self) {
        if let ConsoleMode::Terminal { width } = self.mode {
            if let Err(err) = self.erase_reply(width) {
                debug!(error = %err, "could not erase partial reply");
            }
        }
        self.reply.clear();
        self.open = false;
    }

    fn show_error(&mut self, text: &str) {
        self.errors.push(text.to_string());
        eprintln!("error: {}", text);
    }

    fn restore_input(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let reply = std::mem::take(&mut self.reply);
        match self.mode {
            ConsoleMode::Terminal { .. } => self.write("\n"),
            ConsoleMode::Plain => self.write(&format!("{}\n", reply)),
        }
    }
}

pub async fn send(
    client: &ChatClient,
    conversation: Option<ConversationId>,
    message: &str,
    use_stream: bool,
) -> anyhow::Result<ExitCode> {
    let message = message.trim();
    if message.is_empty() {
        bail!("message is empty");
    }

    let conversation_id = match conversation {
        Some(id) => id,
        None => {
            let id = client
                .create_conversation()
                .await
                .context("Could not create a conversation")?;
            eprintln!("started conversation #{}", id);
            id
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling reply");
            on_interrupt.cancel();
        }
    });

    let view = ConsoleView::new(io::stdout(), ConsoleMode::detect());
    let outcome = if use_stream {
        client
            .send_streaming(conversation_id, message, view, &cancel)
            .await
    } else {
        client
            .send_blocking(conversation_id, message, view, &cancel)
            .await
    };
    interrupt.abort();

    Ok(match outcome {
        SendOutcome::Completed(message) => {
            debug!(message_id = ?message.id, "reply stored");
            ExitCode::SUCCESS
        }
        SendOutcome::Ended { text } => {
            info!(chars = text.chars().count(), "reply ended without completion");
            ExitCode::SUCCESS
        }
        SendOutcome::Cancelled => ExitCode::from(130),
        SendOutcome::Failed(err) => {
            warn!(error = %err, conversation_id, "send failed");
            ExitCode::FAILURE
        }
    })
}

pub async fn list(client: &ChatClient) -> anyhow::Result<()> {
    let conversations = client.list_conversations().await?;
    if conversations.is_empty() {
        println!("No conversations yet");
        return Ok(());
    }
    for conversation in conversations {
        println!(
            "#{:<5} {:<40} {:>4} messages  {}",
            conversation.id,
            conversation.title,
            conversation.message_count,
            format_time(conversation.last_message_time)
        );
    }
    Ok(())
}

pub async fn create(client: &ChatClient) -> anyhow::Result<()> {
    let id = client.create_conversation().await?;
    println!("{}", id);
    Ok(())
}

pub async fn history(client: &ChatClient, id: ConversationId) -> anyhow::Result<()> {
    let detail = client
        .fetch_messages(id)
        .await
        .with_context(|| format!("Could not open conversation #{}", id))?;
    println!("── {} (#{}) ──", detail.conversation.title, detail.conversation.id);
    for message in &detail.messages {
        let speaker = match message.role {
            Role::User => "You",
            Role::Assistant => "AI",
        };
        println!("{} [{}]", speaker, format_time(message.created_at));
        for line in message.content.lines() {
            println!("  {}", line);
        }
    }
    Ok(())
}

pub async fn delete(client: &ChatClient, id: ConversationId) -> anyhow::Result<()> {
    client.delete_conversation(id).await?;
    println!("Deleted conversation #{}", id);
    Ok(())
}
