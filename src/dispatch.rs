use crate::error::ChatError;
use crate::protocol::{Message, StreamEvent};
use tracing::{debug, info, warn};

/// Rendering surface for the single reply being streamed.
pub trait ReplyView {
    /// Shows an empty assistant entry with a typing indicator.
    fn open_reply(&mut self);
    fn append_reply(&mut self, text: &str);
    fn scroll_to_bottom(&mut self);
    /// Removes the typing indicator and stamps the entry with the server's timestamp.
    fn complete_reply(&mut self, message: &Message);
    /// Removes the in-progress entry entirely.
    fn discard_reply(&mut self);
    fn show_error(&mut self, text: &str);
    /// Hands interactivity back to the user; see [`crate::ui_state::UiState::restore`].
    fn restore_input(&mut self);
}

impl<T: ReplyView + ?Sized> ReplyView for &mut T {
    fn open_reply(&mut self) {
        (**self).open_reply()
    }

    fn append_reply(&mut self, text: &str) {
        (**self).append_reply(text)
    }

    fn scroll_to_bottom(&mut self) {
        (**self).scroll_to_bottom()
    }

    fn complete_reply(&mut self, message: &Message) {
        (**self).complete_reply(message)
    }

    fn discard_reply(&mut self) {
        (**self).discard_reply()
    }

    fn show_error(&mut self, text: &str) {
        (**self).show_error(text)
    }

    fn restore_input(&mut self) {
        (**self).restore_input()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Idle,
    Open,
    Concluded,
}

/// How a send operation ended.
#[derive(Debug)]
pub enum SendOutcome {
    /// `ai_complete` arrived with the stored assistant message.
    Completed(Message),
    /// The stream ended (`[DONE]` or end of body) without an `ai_complete` event.
    Ended { text: String },
    Failed(ChatError),
    Cancelled,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Completed(_) | SendOutcome::Ended { .. })
    }
}

/// Applies stream events to the reply view and finalizes the session exactly once.
pub struct ReplyDispatcher<V> {
    view: V,
    state: ReplyState,
    text: String,
    outcome: Option<SendOutcome>,
}

impl<V: ReplyView> ReplyDispatcher<V> {
    pub fn new(view: V) -> Self {
        Self {
            view,
            state: ReplyState::Idle,
            text: String::new(),
            outcome: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_concluded(&self) -> bool {
        self.state == ReplyState::Concluded
    }

    /// Reply text accumulated from `ai_chunk` events so far.
    #[cfg(test)]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn open(&mut self) {
        if self.state != ReplyState::Idle {
            return;
        }
        self.state = ReplyState::Open;
        self.view.open_reply();
        self.view.scroll_to_bottom();
    }

    pub fn handle(&mut self, event: StreamEvent) {
        if self.state != ReplyState::Open {
            debug!(state = ?self.state, ?event, "ignoring event outside an open reply");
            return;
        }

        match event {
            StreamEvent::UserMessage { .. } => debug!("server stored the user message"),
            StreamEvent::AiStart {} => debug!("assistant reply started"),
            StreamEvent::AiChunk { content } => {
                if content.is_empty() {
                    return;
                }
                self.text.push_str(&content);
                self.view.append_reply(&content);
                self.view.scroll_to_bottom();
            }
            StreamEvent::AiComplete { message } => {
                info!(
                    message_id = ?message.id,
                    chars = self.text.chars().count(),
                    "assistant reply complete"
                );
                self.view.complete_reply(&message);
                self.conclude(SendOutcome::Completed(message));
            }
            StreamEvent::Error { error } => {
                warn!(%error, "server reported an error mid-stream");
                self.fail(ChatError::Stream(error));
            }
        }
    }

    /// The transport has no more data. Concludes an open reply without synthesizing a message.
    pub fn end_of_stream(&mut self) {
        if self.is_concluded() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        self.conclude(SendOutcome::Ended { text });
    }

    /// Drops the in-progress reply and surfaces `error`. A no-op once concluded.
    pub fn fail(&mut self, error: ChatError) {
        if self.is_concluded() {
            debug!(%error, "reply already concluded; ignoring failure");
            return;
        }
        self.view.discard_reply();
        self.view.show_error(&error.user_message());
        let outcome = match error {
            ChatError::Cancelled => SendOutcome::Cancelled,
            other => SendOutcome::Failed(other),
        };
        self.conclude(outcome);
    }

    fn conclude(&mut self, outcome: SendOutcome) {
        if self.is_concluded() {
            return;
        }
        self.state = ReplyState::Concluded;
        self.outcome = Some(outcome);
        self.view.restore_input();
    }

    /// Concludes the session if nothing else has, then returns its outcome.
    pub fn finish(mut self) -> SendOutcome {
        self.end_of_stream();
        self.outcome.unwrap_or(SendOutcome::Ended { text: self.text })
    }
}
