use crate::error::{ChatError, ChatResult};

pub const SUBMIT_IDLE_LABEL: &str = "Send";
pub const SUBMIT_BUSY_LABEL: &str = "Sending...";

/// The input widgets whose interactivity follows the send lifecycle.
pub trait InputControls {
    fn set_input_enabled(&mut self, enabled: bool);
    fn focus_input(&mut self);
    fn set_submit(&mut self, enabled: bool, label: &str);
}

/// Owns the "send in flight" flag together with the controls it gates.
///
/// Only [`UiState::begin`] and [`UiState::restore`] change the flag, so every conclusion path
/// can call `restore` without coordinating with the others.
#[derive(Debug)]
pub struct UiState<C> {
    sending: bool,
    controls: C,
}

impl<C: InputControls> UiState<C> {
    pub fn new(controls: C) -> Self {
        Self {
            sending: false,
            controls,
        }
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// Marks a send as started. Rejects, rather than queues, a second concurrent send.
    pub fn begin(&mut self) -> ChatResult<()> {
        if self.sending {
            return Err(ChatError::SendInFlight);
        }
        self.sending = true;
        self.controls.set_input_enabled(false);
        self.controls.set_submit(false, SUBMIT_BUSY_LABEL);
        Ok(())
    }

    pub fn restore(&mut self) {
        self.sending = false;
        self.controls.set_input_enabled(true);
        self.controls.focus_input();
        self.controls.set_submit(true, SUBMIT_IDLE_LABEL);
    }

    pub fn controls(&self) -> &C {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut C {
        &mut self.controls
    }
}
