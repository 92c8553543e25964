use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::constants::NOTIFICATION_CHANNEL_CAPACITY;
use crate::db::Database;
use crate::error::Result;
use crate::models::{ChatEvent, ChatKind, RoundRecord};

/// Entry of a bounded, key-ordered history log.
pub trait HistoryRecord: Clone + Debug + Send + Sync + 'static {
    type Key: Ord + Clone + Debug + Send + Sync;

    fn key(&self) -> Self::Key;

    /// Natural equality used to deduplicate during a merge.
    fn same_record(&self, other: &Self) -> bool;
}

impl HistoryRecord for RoundRecord {
    type Key = i64;

    fn key(&self) -> i64 {
        self.id
    }

    fn same_record(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl HistoryRecord for ChatEvent {
    type Key = DateTime<Utc>;

    fn key(&self) -> DateTime<Utc> {
        self.created
    }

    fn same_record(&self, other: &Self) -> bool {
        self.same_event(other)
    }
}

/// Durable destination for history records.
#[async_trait::async_trait]
pub trait RecordSink<R>: Send + Sync {
    async fn persist(&self, record: &R) -> Result<()>;
}

#[async_trait::async_trait]
impl RecordSink<RoundRecord> for Database {
    async fn persist(&self, record: &RoundRecord) -> Result<()> {
        self.put_round(record).await
    }
}

#[async_trait::async_trait]
impl RecordSink<ChatEvent> for Database {
    async fn persist(&self, record: &ChatEvent) -> Result<()> {
        self.put_chat_event(record).await
    }
}

/// Sending half of a store's persistence queue. Enqueueing never blocks.
#[derive(Debug)]
pub struct PersistQueue<R> {
    tx: mpsc::UnboundedSender<R>,
}

impl<R> PersistQueue<R> {
    fn push(&self, record: R) {
        if self.tx.send(record).is_err() {
            tracing::warn!("Persistence writer stopped; dropping record");
        }
    }
}

/// Spawns the writer task draining a store's queue in order. The task ends
/// once every `PersistQueue` is dropped and the backlog is written.
pub fn spawn_writer<R>(
    name: &'static str,
    sink: Arc<dyn RecordSink<R>>,
) -> (PersistQueue<R>, JoinHandle<()>)
where
    R: HistoryRecord,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<R>();
    let handle = tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(record) = rx.recv().await {
            match sink.persist(&record).await {
                Ok(()) => written += 1,
                Err(err) => tracing::error!(
                    "[{}] Failed to persist {:?}: {}",
                    name,
                    record.key(),
                    err
                ),
            }
        }
        tracing::info!("[{}] Persistence writer drained ({} records written)", name, written);
    });
    (PersistQueue { tx }, handle)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub kept: usize,
    pub imported: usize,
    pub duplicates: usize,
    pub collisions: usize,
    pub skipped: usize,
    pub evicted: usize,
}

/// Bounded log ordered by `HistoryRecord::key`.
pub struct HistoryStore<R: HistoryRecord> {
    name: &'static str,
    window: usize,
    records: VecDeque<R>,
    /// Greatest key ever evicted. Older authoritative records were already
    /// held once and are not imported again.
    watermark: Option<R::Key>,
    writer: Option<PersistQueue<R>>,
    added: broadcast::Sender<R>,
}

pub type SharedStore<R> = Arc<RwLock<HistoryStore<R>>>;

impl<R: HistoryRecord> HistoryStore<R> {
    pub fn new(name: &'static str, window: usize, writer: Option<PersistQueue<R>>) -> Self {
        let (added, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            name,
            window: window.max(1),
            records: VecDeque::new(),
            watermark: None,
            writer,
            added,
        }
    }

    pub fn shared(self) -> SharedStore<R> {
        Arc::new(RwLock::new(self))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> Vec<R> {
        self.records.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&R> {
        self.records.back()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<R> {
        self.added.subscribe()
    }

    /// Drops the persistence queue so the writer can drain and exit.
    pub fn close_writer(&mut self) {
        self.writer = None;
    }

    /// Loads records that already live in the store without persisting or
    /// announcing them.
    pub fn seed(&mut self, mut records: Vec<R>) {
        records.sort_by_key(|r| r.key());
        self.records = records.into();
        self.evict();
        tracing::debug!("[{}] Seeded {} records", self.name, self.records.len());
    }

    fn persist(&self, record: &R) {
        if let Some(writer) = &self.writer {
            writer.push(record.clone());
        }
    }

    fn notify(&self, record: &R) {
        // No receivers is fine.
        let _ = self.added.send(record.clone());
    }

    fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.records.len() > self.window {
            if let Some(oldest) = self.records.pop_front() {
                let key = oldest.key();
                if self.watermark.as_ref().map_or(true, |mark| key > *mark) {
                    self.watermark = Some(key);
                }
                evicted += 1;
            }
        }
        evicted
    }

    /// Persists and buffers a new record, then announces it.
    pub fn append(&mut self, record: R) {
        let key = record.key();
        let position = self.records.partition_point(|r| r.key() <= key);
        let duplicate = self
            .records
            .range(..position)
            .rev()
            .take_while(|r| r.key() == key)
            .any(|r| r.same_record(&record));
        if duplicate {
            tracing::debug!("[{}] Ignoring duplicate append {:?}", self.name, key);
            return;
        }

        self.persist(&record);
        self.records.insert(position, record.clone());
        self.evict();
        self.notify(&record);
    }

    /// Reconciles the buffer with a freshly fetched authoritative snapshot.
    ///
    /// Local-only entries are kept. Authoritative-only entries are persisted,
    /// inserted and announced. Entries present on both sides are kept once.
    /// When keys collide but contents differ both survive.
    pub fn merge(&mut self, mut authoritative: Vec<R>) -> MergeReport {
        let mut report = MergeReport::default();
        authoritative.sort_by_key(|r| r.key());

        let before = authoritative.len();
        if let Some(mark) = &self.watermark {
            authoritative.retain(|r| r.key() > *mark);
        }
        report.skipped = before - authoritative.len();

        let mut local = std::mem::take(&mut self.records).into_iter().peekable();
        let mut remote = authoritative.into_iter().peekable();
        let mut merged = VecDeque::with_capacity(local.len() + remote.len());
        let mut imported = Vec::new();

        loop {
            let order = match (local.peek(), remote.peek()) {
                (None, None) => break,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(l), Some(r)) => l.key().cmp(&r.key()),
            };

            match order {
                std::cmp::Ordering::Less => {
                    if let Some(record) = local.next() {
                        report.kept += 1;
                        merged.push_back(record);
                    }
                }
                std::cmp::Ordering::Greater => {
                    if let Some(record) = remote.next() {
                        report.imported += 1;
                        imported.push(record.clone());
                        merged.push_back(record);
                    }
                }
                std::cmp::Ordering::Equal => {
                    // Resolve the whole run of equal keys on both sides.
                    let Some(first) = local.peek() else { break };
                    let key = first.key();
                    let mut locals = Vec::new();
                    while let Some(record) = local.next_if(|r| r.key() == key) {
                        locals.push(record);
                    }
                    let mut remotes = Vec::new();
                    while let Some(record) = remote.next_if(|r| r.key() == key) {
                        remotes.push(record);
                    }

                    report.kept += locals.len();
                    let mut collided = false;
                    for record in remotes {
                        if locals.iter().any(|l| l.same_record(&record)) {
                            report.duplicates += 1;
                        } else {
                            collided = true;
                            report.collisions += 1;
                            imported.push(record.clone());
                            report.imported += 1;
                            locals.push(record);
                        }
                    }
                    if collided {
                        tracing::warn!(
                            "[{}] Key collision at {:?} with differing content; keeping all entries",
                            self.name,
                            key
                        );
                    }
                    merged.extend(locals);
                }
            }
        }

        self.records = merged;
        report.evicted = self.evict();

        for record in &imported {
            self.persist(record);
            self.notify(record);
        }

        tracing::info!(
            "[{}] Merged snapshot: kept={} imported={} duplicates={} collisions={} skipped={} evicted={}",
            self.name,
            report.kept,
            report.imported,
            report.duplicates,
            report.collisions,
            report.skipped,
            report.evicted
        );
        report
    }
}

impl HistoryStore<ChatEvent> {
    /// Say-messages posted under exactly `username` at or after `after`.
    pub fn messages_from(&self, username: &str, after: DateTime<Utc>) -> Vec<ChatEvent> {
        self.records
            .iter()
            .filter(|event| {
                event.created >= after
                    && event.username == username
                    && matches!(event.kind, ChatKind::Say { .. })
            })
            .cloned()
            .collect()
    }
}
