//! chatpilot-agent: Conversation-turn controller
//!
//! This crate provides the loop that delivers an action into a chat surface, waits for
//! a genuinely new reply, asks the model for the next action, and records every turn
//! in an append-only transcript.

pub mod controller;
pub mod detector;
pub mod error;
pub mod events;
pub mod generator;
pub mod history;
pub mod message;
pub mod surface;
pub mod transcript;

#[cfg(test)]
mod testing;

pub use controller::{ControllerConfig, RunParams, RunReport, RunSummary, TurnController};
pub use detector::{ChangeDetector, Detection, DetectorConfig};
pub use error::{Error, Result};
pub use events::{TurnEvent, TurnState};
pub use generator::{GeneratorConfig, ResponseGenerator, RetryConfig};
pub use history::{ConversationHistory, HistoryEntry, Role};
pub use message::{InboundMessage, Observation, OutboundAction, Profile};
pub use surface::{ChatSurface, SessionDriver};
pub use transcript::{FileTranscriptStore, MemoryTranscriptStore, TranscriptEntry, TranscriptStore};
