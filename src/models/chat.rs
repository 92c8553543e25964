use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatKind {
    Say {
        message: String,
        #[serde(default = "default_channel")]
        channel: String,
        #[serde(default)]
        bot: bool,
    },
    Mute {
        moderator: String,
        timespec: String,
        #[serde(default)]
        shadow: bool,
    },
    Unmute {
        moderator: String,
        #[serde(default)]
        shadow: bool,
    },
    Info {
        message: String,
    },
    Error {
        message: String,
    },
}

fn default_channel() -> String {
    "english".to_string()
}

impl ChatKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChatKind::Say { .. } => "say",
            ChatKind::Mute { .. } => "mute",
            ChatKind::Unmute { .. } => "unmute",
            ChatKind::Info { .. } => "info",
            ChatKind::Error { .. } => "error",
        }
    }

    /// Text payload used for natural equality: the message, or the moderator
    /// for moderation events.
    pub fn payload(&self) -> &str {
        match self {
            ChatKind::Say { message, .. }
            | ChatKind::Info { message }
            | ChatKind::Error { message } => message,
            ChatKind::Mute { moderator, .. } | ChatKind::Unmute { moderator, .. } => moderator,
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            ChatKind::Say { .. } | ChatKind::Mute { .. } | ChatKind::Unmute { .. }
        )
    }
}

/// One entry of the chat log. For mute/unmute `username` is the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub username: String,
    pub created: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ChatKind,
}

impl ChatEvent {
    pub fn say(username: impl Into<String>, message: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            created,
            kind: ChatKind::Say {
                message: message.into(),
                channel: default_channel(),
                bot: false,
            },
        }
    }

    /// Identity, payload, type and timestamp. Channel and bot flag do not take
    /// part: the server history omits them for older messages.
    pub fn same_event(&self, other: &ChatEvent) -> bool {
        self.created == other.created
            && self.username == other.username
            && self.kind.label() == other.kind.label()
            && self.kind.payload() == other.kind.payload()
    }
}
