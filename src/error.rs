use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Non-2xx response or a network failure before or during the request.
    #[error("transport error{}: {}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default(), .message)]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("malformed stream record: {0}")]
    Decode(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("failed to persist message: {0}")]
    Persistence(String),

    #[error("a request is already in flight for this conversation")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        ChatError::Transport { status, message: message.into() }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ChatError::Transport { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Decode(err.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
