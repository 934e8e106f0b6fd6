//! Shared utilities

use chatpilot_agent::{InboundMessage, OutboundAction};

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on Unicode char boundaries, not bytes.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Console line for an action we delivered
pub fn describe_action(action: &OutboundAction) -> String {
    match action.delivered_text() {
        Some(text) => format!("🤖: {}", text),
        None => "🤖: ⭐".to_string(),
    }
}

/// Console line for a message we received
pub fn describe_message(message: &InboundMessage) -> String {
    if message.has_image {
        format!("👩: {} (PHOTO 📸)", message.text())
    } else {
        format!("👩: {}", message.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hello...");
        assert_eq!(truncate_chars("привет", 3), "при...");
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe_action(&OutboundAction::text("hey")), "🤖: hey");
        assert_eq!(describe_action(&OutboundAction::special()), "🤖: ⭐");

        let message = InboundMessage {
            text: Some("look".into()),
            has_image: true,
            image_url: Some("https://cdn/a.png".into()),
            ..Default::default()
        };
        assert_eq!(describe_message(&message), "👩: look (PHOTO 📸)");
    }
}
