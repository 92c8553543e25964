use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::Database;
use crate::error::Result;

/// Block persistence used by the tracker.
#[async_trait::async_trait]
pub trait BlockArchive: Send + Sync {
    async fn put_block(&self, height: i64, hash: &str) -> Result<bool>;
    async fn latest_height(&self) -> Result<Option<i64>>;
    async fn put_block_notification(&self, username: &str, channel: &str) -> Result<bool>;
    async fn clear_block_notifications(&self) -> Result<()>;
    async fn block_notifications(&self) -> Result<HashMap<String, Vec<String>>>;
}

#[async_trait::async_trait]
impl BlockArchive for Database {
    async fn put_block(&self, height: i64, hash: &str) -> Result<bool> {
        Database::put_block(self, height, hash).await
    }

    async fn latest_height(&self) -> Result<Option<i64>> {
        Ok(self.latest_block().await?.map(|block| block.height))
    }

    async fn put_block_notification(&self, username: &str, channel: &str) -> Result<bool> {
        Database::put_block_notification(self, username, channel).await
    }

    async fn clear_block_notifications(&self) -> Result<()> {
        Database::clear_block_notifications(self).await
    }

    async fn block_notifications(&self) -> Result<HashMap<String, Vec<String>>> {
        Database::block_notifications(self).await
    }
}

/// A new chain tip together with everyone who asked to hear about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockMined {
    pub height: i64,
    pub hash: String,
    pub seen: DateTime<Utc>,
    /// Waiting identities per chat channel.
    pub notify: HashMap<String, Vec<String>>,
}

impl BlockMined {
    /// Chat line for one channel, e.g. `@alice, @bob: Block #100 mined.`
    pub fn announcement(&self, channel: &str) -> Option<String> {
        let users = self.notify.get(channel).filter(|users| !users.is_empty())?;
        let mentions = users
            .iter()
            .map(|user| format!("@{user}"))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("{}: Block #{} mined.", mentions, self.height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    Waiting,
    AlreadyWaiting,
}

#[derive(Debug, Default)]
struct TrackerState {
    height: Option<i64>,
    waiting: HashMap<String, Vec<String>>,
}

/// Follows the chain tip and the list of identities waiting for the next block.
pub struct BlockTracker {
    archive: Arc<dyn BlockArchive>,
    state: Mutex<TrackerState>,
}

impl BlockTracker {
    pub fn new(archive: Arc<dyn BlockArchive>) -> Self {
        Self {
            archive,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Restores the tip and the waiting list from the archive.
    pub async fn load(&self) -> Result<()> {
        let height = self.archive.latest_height().await?;
        let waiting = self.archive.block_notifications().await?;
        let mut state = self.state.lock().await;
        state.height = height;
        state.waiting = waiting;
        tracing::info!(
            "Block tracker at height {:?} with {} waiting",
            state.height,
            state.waiting.values().map(Vec::len).sum::<usize>()
        );
        Ok(())
    }

    pub async fn height(&self) -> Option<i64> {
        self.state.lock().await.height
    }

    /// Records the block. Returns the announcement payload when it advances the
    /// tip; stale or repeated blocks yield `None`.
    pub async fn on_block(&self, height: i64, hash: &str) -> Result<Option<BlockMined>> {
        if !self.archive.put_block(height, hash).await? {
            tracing::debug!("Block {} seen before", height);
        }

        let mut state = self.state.lock().await;
        if state.height.is_some_and(|current| height <= current) {
            return Ok(None);
        }
        state.height = Some(height);

        let notify = std::mem::take(&mut state.waiting);
        if !notify.is_empty() {
            self.archive.clear_block_notifications().await?;
        }
        tracing::info!("Block #{} mined", height);

        Ok(Some(BlockMined {
            height,
            hash: hash.to_string(),
            seen: Utc::now(),
            notify,
        }))
    }

    pub async fn subscribe(&self, username: &str, channel: &str) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        let waiting = state.waiting.entry(channel.to_string()).or_default();
        if waiting.iter().any(|user| user == username) {
            return Ok(Subscription::AlreadyWaiting);
        }
        self.archive.put_block_notification(username, channel).await?;
        waiting.push(username.to_string());
        Ok(Subscription::Waiting)
    }
}
