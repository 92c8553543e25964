use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ==================== BLOCK ====================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Block {
    pub height: i64,
    pub hash: String,
    pub confirmed: DateTime<Utc>,
    pub notified: DateTime<Utc>,
}
