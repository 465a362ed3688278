use crate::client::ChatClient;
use crate::dispatch::{ReplyView, SendOutcome};
use crate::error::{ChatError, TransportErrorKind};
use crate::protocol::{ConversationDetail, ConversationId, ConversationSummary, Message, Role};
use crate::ui_state::{InputControls, SUBMIT_IDLE_LABEL, UiState};
use chrono::{Local, NaiveDateTime, TimeZone};
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;

const INPUT_HEIGHT: u16 = 6;
const LIVE_HEIGHT: u16 = 8;
const WELCOME: &str =
    "Welcome to SimpleChat. Type a message to start, or use /new, /list, /open <id>, /delete <id>, /quit.";

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
pub enum ChatMessage {
    User(Message),
    Assistant {
        content: String,
        created_at: Option<NaiveDateTime>,
    },
    Info(String),
    Error(String),
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

impl ChatMessage {
    fn from_message(message: &Message) -> Self {
        match message.role {
            Role::User => ChatMessage::User(message.clone()),
            Role::Assistant => ChatMessage::Assistant {
                content: message.content.clone(),
                created_at: Some(message.created_at),
            },
        }
    }

    fn line_specs(&self) -> Vec<LineSpec> {
        match self {
            ChatMessage::User(message) => message_lines(
                "You",
                &message.content,
                Some(message.created_at),
                Color::Blue,
            ),
            ChatMessage::Assistant {
                content,
                created_at,
            } => message_lines("AI", content, *created_at, Color::Yellow),
            ChatMessage::Info(msg) => vec![LineSpec::new(
                format!("ℹ {}", msg),
                Style::default()
                    .fg(Color::Gray)
                    .add_modifier(Modifier::ITALIC),
            )],
            ChatMessage::Error(msg) => vec![LineSpec::new(
                format!("✗ {}", msg),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            )],
        }
    }

    fn to_text(&self) -> Text<'static> {
        let lines = self
            .line_specs()
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>();
        Text::from(lines)
    }

    fn rendered_height(&self, width: u16) -> u16 {
        self.line_specs()
            .iter()
            .map(|spec| wrapped_height(&spec.text, width))
            .sum::<usize>() as u16
    }
}

fn message_lines(
    speaker: &str,
    content: &str,
    created_at: Option<NaiveDateTime>,
    color: Color,
) -> Vec<LineSpec> {
    let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(color);
    let header = match created_at {
        Some(ts) => format!("{}  {}", speaker, format_time(ts)),
        None => speaker.to_string(),
    };
    let mut lines = vec![LineSpec::new(header, header_style)];
    for line in content.lines() {
        lines.push(LineSpec::new(format!("  {}", line), body_style));
    }
    lines
}

fn wrapped_height(line: &str, width: u16) -> usize {
    let width = width.max(1) as usize;
    let len = line.chars().count().max(1);
    len.div_ceil(width)
}

/// Formats a server timestamp (naive UTC) for display in local time.
pub fn format_time(created_at: NaiveDateTime) -> String {
    let local = Local.from_utc_datetime(&created_at).naive_local();
    format_time_relative(local, Local::now().naive_local())
}

fn format_time_relative(local: NaiveDateTime, now: NaiveDateTime) -> String {
    let date = local.date();
    if date == now.date() {
        local.format("%H:%M").to_string()
    } else if now.date().pred_opt() == Some(date) {
        local.format("Yesterday %H:%M").to_string()
    } else {
        local.format("%b %-d %H:%M").to_string()
    }
}

/// Messages from background tasks to the UI loop.
#[derive(Debug)]
pub enum UiEvent {
    Reply(ReplyEvent),
    Conversations(Vec<ConversationSummary>),
    ConversationOpened(ConversationDetail),
    ConversationSelected(ConversationId),
    ConversationDeleted(ConversationId),
    Info(String),
    Error(String),
}

#[derive(Debug)]
pub enum ReplyEvent {
    Opened,
    Chunk(String),
    Scroll,
    Completed(Message),
    Discarded,
    Error(String),
    Restore,
}

/// Forwards reply rendering from the send task to the UI loop, which owns the transcript.
struct ChannelView {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelView {
    fn emit(&self, event: ReplyEvent) {
        if self.tx.send(UiEvent::Reply(event)).is_err() {
            debug!("ui loop gone; dropping reply event");
        }
    }
}

impl ReplyView for ChannelView {
    fn open_reply(&mut self) {
        self.emit(ReplyEvent::Opened);
    }

    fn append_reply(&mut self, text: &str) {
        self.emit(ReplyEvent::Chunk(text.to_string()));
    }

    fn scroll_to_bottom(&mut self) {
        self.emit(ReplyEvent::Scroll);
    }

    fn complete_reply(&mut self, message: &Message) {
        self.emit(ReplyEvent::Completed(message.clone()));
    }

    fn discard_reply(&mut self) {
        self.emit(ReplyEvent::Discarded);
    }

    fn show_error(&mut self, text: &str) {
        self.emit(ReplyEvent::Error(text.to_string()));
    }

    fn restore_input(&mut self) {
        self.emit(ReplyEvent::Restore);
    }
}

/// Whether the server may have stored the message, making the conversation list stale.
fn refreshes_conversations(outcome: &SendOutcome) -> bool {
    match outcome {
        SendOutcome::Completed(_) | SendOutcome::Ended { .. } => true,
        SendOutcome::Cancelled => false,
        SendOutcome::Failed(ChatError::Transport {
            kind: TransportErrorKind::Connect,
            ..
        }) => false,
        SendOutcome::Failed(ChatError::Status { .. }) => false,
        SendOutcome::Failed(_) => true,
    }
}

/// A loaded history is applied only if it is the latest one asked for and no send has since
/// picked a conversation of its own.
fn accepts_loaded_conversation(
    opening: Option<ConversationId>,
    sending: bool,
    loaded: ConversationId,
) -> bool {
    opening == Some(loaded) && !sending
}

fn confirms(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlashCommand {
    New,
    List,
    Open(ConversationId),
    Delete(ConversationId),
    Quit,
    Invalid(String),
}

fn parse_command(input: &str) -> Option<SlashCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();

    let with_id = |build: fn(ConversationId) -> SlashCommand| match arg.map(|raw| raw.parse::<ConversationId>()) {
        Some(Ok(id)) => build(id),
        _ => SlashCommand::Invalid(format!("usage: /{} <conversation id>", name)),
    };

    Some(match name {
        "new" => SlashCommand::New,
        "list" => SlashCommand::List,
        "open" => with_id(SlashCommand::Open),
        "delete" => with_id(SlashCommand::Delete),
        "quit" | "exit" => SlashCommand::Quit,
        other => SlashCommand::Invalid(format!("unknown command /{}", other)),
    })
}

struct InputBuffer {
    lines: Vec<String>,
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn line_len(&self, y: usize) -> usize {
        self.lines[y].chars().count()
    }

    // Cursor positions count chars; this maps one to a byte offset in the current line.
    fn byte_index(&self, x: usize) -> usize {
        let line = &self.lines[self.cursor_y];
        line.char_indices()
            .nth(x)
            .map(|(idx, _)| idx)
            .unwrap_or(line.len())
    }

    fn insert_char(&mut self, c: char) {
        let idx = self.byte_index(self.cursor_x);
        self.lines[self.cursor_y].insert(idx, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            let idx = self.byte_index(self.cursor_x - 1);
            self.lines[self.cursor_y].remove(idx);
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            let prev_line = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
            self.lines[self.cursor_y].push_str(&prev_line);
        }
    }

    fn new_line(&mut self) {
        let idx = self.byte_index(self.cursor_x);
        let remaining = self.lines[self.cursor_y].split_off(idx);
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len(self.cursor_y) {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_home(&mut self) {
        self.cursor_x = 0;
    }

    fn move_end(&mut self) {
        self.cursor_x = self.line_len(self.cursor_y);
    }

    fn to_string(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self, enabled: bool) -> Text<'static> {
        if self.is_empty() {
            let hint = if enabled {
                "Type your message here..."
            } else {
                "Waiting for the reply..."
            };
            return Text::from(Span::styled(hint, Style::default().fg(Color::DarkGray)));
        }
        let style = if enabled {
            Style::default()
        } else {
            Style::default().fg(Color::DarkGray)
        };
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::styled(l.clone(), style))
                .collect::<Vec<_>>(),
        )
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The composer box: the input control plus its submit label.
struct Composer {
    buffer: InputBuffer,
    enabled: bool,
    focused: bool,
    submit_enabled: bool,
    submit_label: String,
}

impl Composer {
    fn new() -> Self {
        Self {
            buffer: InputBuffer::new(),
            enabled: true,
            focused: true,
            submit_enabled: true,
            submit_label: SUBMIT_IDLE_LABEL.to_string(),
        }
    }
}

impl InputControls for Composer {
    fn set_input_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.focused = false;
        }
    }

    fn focus_input(&mut self) {
        self.focused = true;
    }

    fn set_submit(&mut self, enabled: bool, label: &str) {
        self.submit_enabled = enabled;
        self.submit_label = label.to_string();
    }
}

/// The assistant entry currently being streamed.
#[derive(Debug, Default)]
struct LiveReply {
    text: String,
    follow_tail: bool,
}

pub struct App {
    messages: Vec<ChatMessage>,
    ui: UiState<Composer>,
    live: Option<LiveReply>,
    should_quit: bool,
    sender: mpsc::UnboundedSender<UiEvent>,
    receiver: mpsc::UnboundedReceiver<UiEvent>,
    client: ChatClient,
    use_stream: bool,
    current: Option<ConversationId>,
    current_title: Option<String>,
    conversations: Vec<ConversationSummary>,
    print_list_on_load: bool,
    /// Conversation whose history was last requested; a late load for any other id is stale.
    opening: Option<ConversationId>,
    pending_delete: Option<ConversationId>,
    cancel: Option<CancellationToken>,
}

impl App {
    pub fn new(client: ChatClient, use_stream: bool) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            messages: Vec::new(),
            ui: UiState::new(Composer::new()),
            live: None,
            should_quit: false,
            sender,
            receiver,
            client,
            use_stream,
            current: None,
            current_title: None,
            conversations: Vec::new(),
            print_list_on_load: false,
            opening: None,
            pending_delete: None,
            cancel: None,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let [live_area, input_area] =
            Layout::vertical([Constraint::Min(0), Constraint::Length(INPUT_HEIGHT)]).areas(f.area());

        self.draw_live(f, live_area);

        let composer = self.ui.controls();
        let conversation = self.current_title.as_deref().unwrap_or("New conversation");
        let action = if self.ui.is_sending() {
            "Esc to cancel"
        } else {
            "Esc to quit"
        };
        let title = format!(
            " {} · Enter to {} · {} ",
            conversation, composer.submit_label, action
        );
        let border = if composer.submit_enabled {
            Color::DarkGray
        } else {
            Color::Yellow
        };

        let input_paragraph = Paragraph::new(composer.buffer.render(composer.enabled))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(border)),
            )
            .wrap(Wrap { trim: false });

        f.render_widget(input_paragraph, input_area);

        if composer.enabled && composer.focused {
            let cursor_x = (composer.buffer.cursor_x + 1) as u16;
            let cursor_y = composer.buffer.cursor_y as u16;
            let x = (input_area.x + cursor_x).min(input_area.x + input_area.width - 2);
            let y = (input_area.y + 1 + cursor_y).min(input_area.y + input_area.height - 2);
            f.set_cursor_position((x, y));
        }
    }

    fn draw_live(&mut self, f: &mut Frame, area: ratatui::layout::Rect) {
        let Some(live) = self.live.as_mut() else {
            return;
        };

        let header_style = Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD);
        let body_style = Style::default().fg(Color::Yellow);
        let mut lines = vec![Line::from(Span::styled("AI", header_style))];
        let mut body: Vec<String> = live.text.lines().map(|l| format!("  {}", l)).collect();
        if live.text.ends_with('\n') || body.is_empty() {
            body.push("  ".to_string());
        }
        if let Some(last) = body.last_mut() {
            last.push('▌');
        }
        lines.extend(body.into_iter().map(|l| Line::from(Span::styled(l, body_style))));

        let height: usize = lines
            .iter()
            .map(|line| wrapped_height(&line.to_string(), area.width))
            .sum();
        let offset = if live.follow_tail {
            height.saturating_sub(area.height as usize) as u16
        } else {
            0
        };

        let paragraph = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .scroll((offset, 0));
        f.render_widget(paragraph, area);
    }

    fn append_message(&mut self, terminal: &mut TuiTerminal, message: ChatMessage) -> anyhow::Result<()> {
        let width = terminal.size()?.width;
        let height = message.rendered_height(width).saturating_add(1);
        let mut text = message.to_text();
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        self.messages.push(message);
        Ok(())
    }

    fn apply_reply(&mut self, terminal: &mut TuiTerminal, event: ReplyEvent) -> anyhow::Result<()> {
        match event {
            ReplyEvent::Opened => self.live = Some(LiveReply::default()),
            ReplyEvent::Chunk(text) => {
                if let Some(live) = self.live.as_mut() {
                    live.text.push_str(&text);
                }
            }
            ReplyEvent::Scroll => {
                if let Some(live) = self.live.as_mut() {
                    live.follow_tail = true;
                }
            }
            ReplyEvent::Completed(message) => {
                let live = self.live.take().unwrap_or_default();
                let content = if live.text.is_empty() {
                    message.content
                } else {
                    live.text
                };
                self.append_message(
                    terminal,
                    ChatMessage::Assistant {
                        content,
                        created_at: Some(message.created_at),
                    },
                )?;
            }
            ReplyEvent::Discarded => self.live = None,
            ReplyEvent::Error(text) => self.append_message(terminal, ChatMessage::Error(text))?,
            ReplyEvent::Restore => {
                // A stream that ended without `ai_complete` leaves its text in place, unstamped.
                if let Some(live) = self.live.take() {
                    if !live.text.is_empty() {
                        self.append_message(
                            terminal,
                            ChatMessage::Assistant {
                                content: live.text,
                                created_at: None,
                            },
                        )?;
                    }
                }
                self.cancel = None;
                self.ui.restore();
            }
        }
        Ok(())
    }

    fn apply_event(&mut self, terminal: &mut TuiTerminal, event: UiEvent) -> anyhow::Result<()> {
        match event {
            UiEvent::Reply(reply) => self.apply_reply(terminal, reply)?,
            UiEvent::Conversations(conversations) => {
                self.conversations = conversations;
                if let Some(id) = self.current {
                    if let Some(summary) = self.conversations.iter().find(|c| c.id == id) {
                        self.current_title = Some(summary.title.clone());
                    }
                }
                if self.print_list_on_load {
                    self.print_list_on_load = false;
                    self.print_conversations(terminal)?;
                }
                if self.current.is_none() && self.opening.is_none() && !self.ui.is_sending() {
                    if let Some(id) = self.conversations.first().map(|c| c.id) {
                        self.open_conversation(id);
                    }
                }
            }
            UiEvent::ConversationOpened(detail) => {
                let id = detail.conversation.id;
                if !accepts_loaded_conversation(self.opening, self.ui.is_sending(), id) {
                    debug!(conversation_id = id, "ignoring stale conversation load");
                    return Ok(());
                }
                self.opening = None;
                self.current = Some(detail.conversation.id);
                self.current_title = Some(detail.conversation.title.clone());
                self.append_message(
                    terminal,
                    ChatMessage::Info(format!(
                        "── {} (#{}) ──",
                        detail.conversation.title, detail.conversation.id
                    )),
                )?;
                for message in &detail.messages {
                    self.append_message(terminal, ChatMessage::from_message(message))?;
                }
            }
            UiEvent::ConversationSelected(id) => {
                self.opening = None;
                self.current = Some(id);
                self.current_title = None;
            }
            UiEvent::ConversationDeleted(id) => {
                self.append_message(terminal, ChatMessage::Info(format!("Deleted conversation #{}", id)))?;
                if self.current == Some(id) {
                    self.current = None;
                    self.current_title = None;
                    self.append_message(terminal, ChatMessage::Info(WELCOME.to_string()))?;
                }
                self.load_conversations();
            }
            UiEvent::Info(text) => self.append_message(terminal, ChatMessage::Info(text))?,
            UiEvent::Error(text) => self.append_message(terminal, ChatMessage::Error(text))?,
        }
        Ok(())
    }

    fn print_conversations(&mut self, terminal: &mut TuiTerminal) -> anyhow::Result<()> {
        if self.conversations.is_empty() {
            return self.append_message(terminal, ChatMessage::Info("No conversations yet".to_string()));
        }
        let listing = self
            .conversations
            .iter()
            .map(|c| {
                let marker = if Some(c.id) == self.current { "*" } else { " " };
                format!(
                    "{} #{:<4} {}  ({} messages, {})",
                    marker,
                    c.id,
                    c.title,
                    c.message_count,
                    format_time(c.last_message_time)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.append_message(
            terminal,
            ChatMessage::Assistant {
                content: listing,
                created_at: None,
            },
        )
    }

    fn load_conversations(&self) {
        let client = self.client.clone();
        let tx = self.sender.clone();
        tokio::spawn(async move {
            let event = match client.list_conversations().await {
                Ok(list) => UiEvent::Conversations(list),
                Err(err) => {
                    warn!(error = %err, "failed to load conversations");
                    UiEvent::Error(format!("Could not load conversations: {}", err.user_message()))
                }
            };
            let _ = tx.send(event);
        });
    }

    fn open_conversation(&mut self, id: ConversationId) {
        self.opening = Some(id);
        let client = self.client.clone();
        let tx = self.sender.clone();
        tokio::spawn(async move {
            let event = match client.fetch_messages(id).await {
                Ok(detail) => UiEvent::ConversationOpened(detail),
                Err(err) => {
                    warn!(conversation_id = id, error = %err, "failed to load messages");
                    UiEvent::Error(format!("Could not open conversation #{}", id))
                }
            };
            let _ = tx.send(event);
        });
    }

    fn new_conversation(&self) {
        let client = self.client.clone();
        let tx = self.sender.clone();
        tokio::spawn(async move {
            match client.create_conversation().await {
                Ok(id) => {
                    let _ = tx.send(UiEvent::ConversationSelected(id));
                    let _ = tx.send(UiEvent::Info(format!("Started conversation #{}", id)));
                    if let Ok(list) = client.list_conversations().await {
                        let _ = tx.send(UiEvent::Conversations(list));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to create conversation");
                    let _ = tx.send(UiEvent::Error("Could not create a conversation".to_string()));
                }
            }
        });
    }

    fn delete_conversation(&self, id: ConversationId) {
        let client = self.client.clone();
        let tx = self.sender.clone();
        tokio::spawn(async move {
            let event = match client.delete_conversation(id).await {
                Ok(()) => UiEvent::ConversationDeleted(id),
                Err(err) => {
                    warn!(conversation_id = id, error = %err, "failed to delete conversation");
                    UiEvent::Error(format!("Could not delete conversation: {}", err.user_message()))
                }
            };
            let _ = tx.send(event);
        });
    }

    fn run_command(&mut self, terminal: &mut TuiTerminal, command: SlashCommand) -> anyhow::Result<()> {
        self.ui.controls_mut().buffer.clear();
        match command {
            SlashCommand::New => self.new_conversation(),
            SlashCommand::List => {
                self.print_list_on_load = true;
                self.load_conversations();
            }
            SlashCommand::Open(id) => self.open_conversation(id),
            SlashCommand::Delete(id) => {
                self.pending_delete = Some(id);
                self.append_message(
                    terminal,
                    ChatMessage::Info(format!(
                        "Delete conversation #{} and all its messages? Type y to confirm.",
                        id
                    )),
                )?;
            }
            SlashCommand::Quit => self.should_quit = true,
            SlashCommand::Invalid(reason) => self.append_message(terminal, ChatMessage::Error(reason))?,
        }
        Ok(())
    }

    fn submit(&mut self, terminal: &mut TuiTerminal) -> anyhow::Result<()> {
        if self.ui.is_sending() {
            return self.append_message(terminal, ChatMessage::Info(ChatError::SendInFlight.to_string()));
        }

        let text = self.ui.controls().buffer.to_string();
        if let Some(id) = self.pending_delete.take() {
            self.ui.controls_mut().buffer.clear();
            if confirms(&text) {
                self.delete_conversation(id);
                return Ok(());
            }
            return self.append_message(terminal, ChatMessage::Info(format!("Kept conversation #{}", id)));
        }
        if text.trim().is_empty() {
            return Ok(());
        }
        if let Some(command) = parse_command(&text) {
            return self.run_command(terminal, command);
        }

        self.start_send(terminal, text.trim().to_string())
    }

    fn start_send(&mut self, terminal: &mut TuiTerminal, text: String) -> anyhow::Result<()> {
        if let Err(err) = self.ui.begin() {
            return self.append_message(terminal, ChatMessage::Info(err.to_string()));
        }
        self.ui.controls_mut().buffer.clear();
        self.append_message(terminal, ChatMessage::User(Message::provisional_user(text.clone())))?;

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let client = self.client.clone();
        let tx = self.sender.clone();
        let current = self.current;
        let use_stream = self.use_stream;
        tokio::spawn(async move {
            let conversation_id = match current {
                Some(id) => id,
                None => match client.create_conversation().await {
                    Ok(id) => {
                        let _ = tx.send(UiEvent::ConversationSelected(id));
                        id
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to create conversation before sending");
                        let _ = tx.send(UiEvent::Error("Could not create a conversation".to_string()));
                        let _ = tx.send(UiEvent::Reply(ReplyEvent::Restore));
                        return;
                    }
                },
            };

            let view = ChannelView { tx: tx.clone() };
            let outcome = if use_stream {
                client.send_streaming(conversation_id, &text, view, &cancel).await
            } else {
                client.send_blocking(conversation_id, &text, view, &cancel).await
            };
            info!(conversation_id, success = outcome.is_success(), "send finished");

            // The server titles a conversation from its first message, so refresh the list.
            if refreshes_conversations(&outcome) {
                if let Ok(list) = client.list_conversations().await {
                    let _ = tx.send(UiEvent::Conversations(list));
                }
            }
        });

        Ok(())
    }

    fn edit_input(&mut self, code: KeyCode) {
        let composer = self.ui.controls_mut();
        if !composer.enabled {
            return;
        }
        let buffer = &mut composer.buffer;
        match code {
            KeyCode::Enter => buffer.new_line(),
            KeyCode::Char(c) => buffer.insert_char(c),
            KeyCode::Backspace => buffer.delete_char(),
            KeyCode::Left => buffer.move_left(),
            KeyCode::Right => buffer.move_right(),
            KeyCode::Up => buffer.move_up(),
            KeyCode::Down => buffer.move_down(),
            KeyCode::Home => buffer.move_home(),
            KeyCode::End => buffer.move_end(),
            _ => {}
        }
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> anyhow::Result<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            self.apply_event(terminal, event)?;
        }

        if self.should_quit {
            return Ok(false);
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    self.should_quit = true;
                    return Ok(false);
                }

                match key.code {
                    KeyCode::Esc => {
                        if let Some(cancel) = &self.cancel {
                            info!("cancelling in-flight reply");
                            cancel.cancel();
                        } else {
                            self.should_quit = true;
                            return Ok(false);
                        }
                    }
                    KeyCode::Enter if !key.modifiers.contains(KeyModifiers::SHIFT) => {
                        self.submit(terminal)?;
                    }
                    code => self.edit_input(code),
                }
            }
        }

        Ok(!self.should_quit)
    }
}

pub fn run_tui(client: ChatClient, use_stream: bool) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(INPUT_HEIGHT + LIVE_HEIGHT),
        },
    )?;

    info!(server = client.base_url(), streaming = use_stream, "starting chat ui");
    let mut app = App::new(client, use_stream);

    let _guard = TerminalGuard::new();

    app.append_message(&mut terminal, ChatMessage::Info(WELCOME.to_string()))?;
    app.load_conversations();
    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    if let Some(cancel) = app.cancel.take() {
        cancel.cancel();
    }

    disable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.flush()?;

    Ok(())
}
