pub mod backfill;
pub mod block_tracker;
pub mod history_store;
pub mod session_driver;

pub use backfill::{Backfiller, BackfillSettings, WebRoundSource};
pub use block_tracker::{BlockMined, BlockTracker};
pub use history_store::{HistoryStore, SharedStore};
pub use session_driver::{SessionDriver, SessionHandle};

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    crypto::fairness::FairnessVerifier,
    db::Database,
    game::GameSession,
    models::{ChatEvent, RoundRecord},
    transport::{EventSource, IntentSink},
};
use history_store::{spawn_writer, RecordSink};

/// Round and chat history buffers plus the tasks persisting them.
pub struct Stores {
    pub rounds: SharedStore<RoundRecord>,
    pub chat: SharedStore<ChatEvent>,
    writers: Vec<JoinHandle<()>>,
}

impl Stores {
    /// Closes both persistence queues and waits for the backlog to drain.
    pub async fn shutdown(self) {
        self.rounds.write().await.close_writer();
        self.chat.write().await.close_writer();
        for writer in self.writers {
            if let Err(e) = writer.await {
                tracing::error!("Persistence writer panicked: {}", e);
            }
        }
        tracing::info!("History writers drained");
    }
}

/// Seeds the history stores from the database and starts their writers.
pub async fn start_history_stores(db: &Database, config: &Config) -> anyhow::Result<Stores> {
    let mut writers = Vec::new();
    let (round_queue, chat_queue) = if config.write_to_db {
        let sink: Arc<dyn RecordSink<RoundRecord>> = Arc::new(db.clone());
        let (round_queue, handle) = spawn_writer("rounds", sink);
        writers.push(handle);

        let sink: Arc<dyn RecordSink<ChatEvent>> = Arc::new(db.clone());
        let (chat_queue, handle) = spawn_writer("chat", sink);
        writers.push(handle);

        (Some(round_queue), Some(chat_queue))
    } else {
        tracing::warn!("WRITE_TO_DB is off; history will not be persisted");
        (None, None)
    };

    let mut rounds = HistoryStore::new("rounds", config.game_history, round_queue);
    let mut chat = HistoryStore::new("chat", config.chat_history, chat_queue);
    rounds.seed(db.last_rounds(config.game_history as i64).await?);
    chat.seed(db.last_chat(config.chat_history as i64).await?);
    tracing::info!(
        "Loaded {} rounds and {} chat events from the database",
        rounds.len(),
        chat.len()
    );

    Ok(Stores {
        rounds: rounds.shared(),
        chat: chat.shared(),
        writers,
    })
}

/// Builds the session driver with its optional backfill and block tracking,
/// and runs it on its own task.
pub async fn start_background_services(
    db: Database,
    config: Config,
    stores: &Stores,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(SessionHandle, JoinHandle<()>)> {
    tracing::info!("Starting background services...");

    let session = GameSession::new(
        FairnessVerifier::new(config.public_seed.clone()),
        config.tick_window,
    );
    let (mut driver, handle) = SessionDriver::new(
        session,
        stores.rounds.clone(),
        stores.chat.clone(),
        IntentSink::stdout(),
    );

    if config.backfill_enabled {
        let source = Arc::new(WebRoundSource::new(&config.web_server_url)?);
        let backfiller = Backfiller::new(
            source,
            Arc::new(db.clone()),
            BackfillSettings::from_config(&config),
        );
        driver = driver.with_backfill(Arc::new(backfiller));
    } else {
        tracing::warn!("Backfill disabled via BACKFILL_ENABLED");
    }

    let tracker = BlockTracker::new(Arc::new(db.clone()));
    tracker.load().await?;
    driver = driver.with_block_tracker(Arc::new(tracker));

    let source = EventSource::open(&config.event_source).await?;
    tracing::info!("Reading game frames from {}", config.event_source);

    let task = tokio::spawn(async move {
        if let Err(e) = driver.run(source, shutdown).await {
            tracing::error!("Session driver stopped: {}", e);
        }
    });

    tracing::info!("All background services started successfully");
    Ok((handle, task))
}
