//! Seams to the chat page: what the controller reads and writes, and who opens it

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Observation, Profile};

/// A page-like handle onto one chat site session.
///
/// Implementations own all knowledge of how elements are located. A read that finds
/// nothing should return an empty [`Observation`] rather than an error.
#[async_trait]
pub trait ChatSurface: Send {
    /// Read the counterpart's public profile
    async fn fetch_profile(&mut self, counterpart_id: &str) -> Result<Profile>;

    /// Navigate to a conversation and wait until it accepts input
    async fn open_conversation(&mut self, conversation_id: &str) -> Result<()>;

    /// Read the latest message currently displayed
    async fn read_latest(&mut self) -> Result<Observation>;

    /// Type a message and submit it
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Trigger the special (non-text) send
    async fn send_special(&mut self) -> Result<()>;

    /// Release the underlying session
    async fn close(&mut self) -> Result<()>;
}

/// Owns browser lifecycle and login; hands out a ready surface per run
#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ChatSurface>>;
}
