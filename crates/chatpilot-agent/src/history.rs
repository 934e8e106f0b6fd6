//! Conversation history: the running exchange fed back to the model on every call.

use serde::{Deserialize, Serialize};

/// Who produced a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The chat partner (input to the model)
    User,
    /// The simulated user (output of the model)
    Model,
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Append-only history for one conversation.
///
/// Owned by whoever drives the conversation and lent to the generator by `&mut`,
/// so two conversations never share entries.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    entries: Vec<HistoryEntry>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// History whose first entry is the opening message we send
    pub fn seeded(opening: impl Into<String>) -> Self {
        let mut history = Self::new();
        history.push_model(opening);
        history
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content.into());
    }

    pub fn push_model(&mut self, content: impl Into<String>) {
        self.push(Role::Model, content.into());
    }

    fn push(&mut self, role: Role, content: String) {
        if self.entries.last().is_some_and(|last| last.role == role) {
            tracing::debug!(?role, "consecutive history entries with the same role");
        }
        self.entries.push(HistoryEntry { role, content });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Serialize for inclusion in a prompt
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "[]".to_string())
    }
}
