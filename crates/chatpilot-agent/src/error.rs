//! Error types for chatpilot-agent

use std::time::Duration;
use thiserror::Error;

/// Result type alias using chatpilot-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a conversation
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model backend
    #[error(transparent)]
    Ai(#[from] chatpilot_ai::Error),

    /// The model answered, but not with a usable action
    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    /// A single model call exceeded its time budget
    #[error("Model request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Every generation attempt failed
    #[error("Model call failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// No new message appeared on the surface within the staleness window
    #[error("No new message after {waited:?} ({polls} polls)")]
    PollingTimeout { waited: Duration, polls: u64 },

    /// The chat surface failed an action
    #[error("Surface error: {0}")]
    Surface(String),

    /// Transcript persistence failed
    #[error("Transcript I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transcript serialization failed
    #[error("Transcript JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Conversation ids double as file names and must stay simple
    #[error("Invalid conversation id: {0:?}")]
    InvalidConversationId(String),

    /// The run was cancelled
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Create a surface error from anything displayable
    pub fn surface(message: impl std::fmt::Display) -> Self {
        Error::Surface(message.to_string())
    }

    /// Check if this error came from cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
