//! Values exchanged with the chat surface and the model

use serde::{Deserialize, Serialize};

/// History placeholder recorded for a special (non-text) send
pub const SPECIAL_SEND_PLACEHOLDER: &str = "Sent star";

/// Raw read of the "latest displayed message" area, before change detection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub text: Option<String>,
    pub displayed_timestamp: Option<String>,
    pub image_url: Option<String>,
}

impl Observation {
    /// A text message with its displayed time
    pub fn text(text: impl Into<String>, displayed_timestamp: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            displayed_timestamp: Some(displayed_timestamp.into()),
            image_url: None,
        }
    }

    /// Attach an image URL
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }
}

/// A message accepted as new by the change detector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: Option<String>,
    pub displayed_timestamp: Option<String>,
    /// True only when `image_url` differs from the previously accepted message
    pub has_image: bool,
    /// Image URL observed with this message
    pub image_url: Option<String>,
}

impl InboundMessage {
    /// Message text, empty if none
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// The image URL, if this message reports a new image
    pub fn reported_image(&self) -> Option<&str> {
        if self.has_image {
            self.image_url.as_deref()
        } else {
            None
        }
    }
}

/// The next thing to do on the surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundAction {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub send_special: bool,
}

impl OutboundAction {
    /// Type and submit a text message
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            send_special: false,
        }
    }

    /// Trigger the special send instead of typing
    pub fn special() -> Self {
        Self {
            text: None,
            send_special: true,
        }
    }

    /// What the conversation history records for this action
    pub fn history_content(&self) -> String {
        if self.send_special {
            SPECIAL_SEND_PLACEHOLDER.to_string()
        } else {
            self.text.clone().unwrap_or_default()
        }
    }

    /// Text that is actually typed; `None` for a special send
    pub fn delivered_text(&self) -> Option<&str> {
        if self.send_special {
            None
        } else {
            self.text.as_deref()
        }
    }

    /// JSON schema the model's answer must satisfy
    pub fn response_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Message to send. Ignored when sendSpecial is true."
                },
                "sendSpecial": {
                    "type": "boolean",
                    "description": "Send the special gesture instead of a text message."
                }
            },
            "required": ["text", "sendSpecial"]
        })
    }
}

/// Public profile of a chat participant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub age: String,
    pub bio: String,
}

impl Profile {
    pub fn new(name: impl Into<String>, age: impl Into<String>, bio: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            age: age.into(),
            bio: bio.into(),
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.age)
    }
}
