//! Wire types shared by the client trait and its implementations

use serde::{Deserialize, Serialize};

/// The bot account a credential resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
}

impl Identity {
    /// Public deep link users can follow to reach this bot.
    pub fn link(&self) -> Option<String> {
        self.username
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| format!("https://t.me/{u}"))
    }
}

/// One inbound event from `getUpdates`.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<InboundMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<Sender>,
    #[serde(default)]
    pub text: Option<String>,
}

impl InboundMessage {
    /// The bot command at the start of the text, without the `@botname` suffix.
    pub fn command(&self) -> Option<&str> {
        let text = self.text.as_deref()?.trim_start();
        let word = text.strip_prefix('/')?.split_whitespace().next()?;
        Some(word.split('@').next().unwrap_or(word))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            message_id: 1,
            chat: Chat { id: 10 },
            from: None,
            text: Some(text.to_string()),
        }
    }

    #[test]
    fn link_uses_username() {
        let identity = Identity {
            id: 1,
            username: Some("mirror_bot".into()),
            first_name: "Mirror".into(),
        };
        assert_eq!(identity.link().as_deref(), Some("https://t.me/mirror_bot"));
    }

    #[test]
    fn link_absent_without_username() {
        let identity = Identity {
            id: 1,
            username: Some(String::new()),
            first_name: "Mirror".into(),
        };
        assert!(identity.link().is_none());
    }

    #[test]
    fn command_strips_bot_suffix_and_arguments() {
        assert_eq!(message("/start").command(), Some("start"));
        assert_eq!(message("/start@mirror_bot ref42").command(), Some("start"));
        assert_eq!(message("hello").command(), None);
    }

    #[test]
    fn update_deserializes_without_message() {
        let update: Update = serde_json::from_str(r#"{"update_id": 7}"#).unwrap();
        assert_eq!(update.update_id, 7);
        assert!(update.message.is_none());
    }
}
