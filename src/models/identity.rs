use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Internal identifier for a display name seen in the game or chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Identity {
    pub id: i64,
    pub username: String,
}

/// Names the game server never hands out; rejected before touching the store.
pub fn is_valid_username(username: &str) -> bool {
    let trimmed = username.trim();
    !trimmed.is_empty()
        && trimmed.len() <= 50
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}
