use reqwest::StatusCode;
use thiserror::Error;

/// Broad category of a network-level failure, used to pick the message shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

impl TransportErrorKind {
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if err.is_connect() {
            return Self::Connect;
        }
        Self::from_message(&err.to_string())
    }

    /// Last-resort fallback for failures that carry no structured signal.
    /// Only consulted after the typed checks in [`TransportErrorKind::classify`].
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("connection refused") || lower.contains("dns error") {
            Self::Connect
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("A reply is still being received")]
    SendInFlight,

    #[error("Server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Error text carried by an `error` stream event.
    #[error("{0}")]
    Stream(String),

    #[error("{0}")]
    Api(String),

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Reply cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ChatError::Api(format!("Malformed response: {}", err));
        }
        ChatError::Transport {
            kind: TransportErrorKind::classify(&err),
            message: err.to_string(),
        }
    }
}

impl ChatError {
    /// Text shown to the user when a send fails with this error.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Stream(text) | ChatError::Api(text) if !text.trim().is_empty() => {
                text.clone()
            }
            ChatError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            } => "Request timed out, please retry later".to_string(),
            ChatError::Transport {
                kind: TransportErrorKind::Connect,
                ..
            } => "Could not reach the server, check your connection".to_string(),
            ChatError::SendInFlight | ChatError::Cancelled => self.to_string(),
            _ => "Failed to send message, please retry".to_string(),
        }
    }
}
