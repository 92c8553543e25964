use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::constants::{COMMAND_CHANNEL_CAPACITY, NOTIFICATION_CHANNEL_CAPACITY};
use crate::error::{AppError, Result, SessionError};
use crate::game::{GameSession, SessionEvent, SessionSnapshot};
use crate::models::{ChatEvent, RoundRecord, RoundState};
use crate::services::backfill::Backfiller;
use crate::services::block_tracker::{BlockMined, BlockTracker, Subscription};
use crate::services::history_store::SharedStore;
use crate::transport::{EventSource, FeedEvent, IntentSink};

/// Local requests handled between two feed frames.
#[derive(Debug)]
pub enum SessionCommand {
    Bet {
        amount: i64,
        auto_cashout: Option<i64>,
        reply: oneshot::Sender<Result<()>>,
    },
    Cashout {
        reply: oneshot::Sender<Result<()>>,
    },
    WatchBlock {
        username: String,
        channel: String,
        reply: oneshot::Sender<Result<Subscription>>,
    },
}

/// Cloneable front of a running driver.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    blocks: broadcast::Sender<BlockMined>,
}

impl SessionHandle {
    /// Latest published snapshot, with `elapsed` brought up to date while the
    /// round is running.
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.snapshot.borrow().clone();
        if snapshot.state == Some(RoundState::InProgress) {
            if let Some(start) = snapshot.start_time {
                snapshot.elapsed = Some((Utc::now() - start).num_milliseconds());
            }
        }
        snapshot
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockMined> {
        self.blocks.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::DriverStopped)?;
        response.await.map_err(|_| SessionError::DriverStopped)?
    }

    pub async fn place_bet(&self, amount: i64, auto_cashout: Option<i64>) -> Result<()> {
        self.request(|reply| SessionCommand::Bet {
            amount,
            auto_cashout,
            reply,
        })
        .await
    }

    pub async fn cash_out(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Cashout { reply }).await
    }

    pub async fn watch_block(&self, username: &str, channel: &str) -> Result<Subscription> {
        let username = username.to_string();
        let channel = channel.to_string();
        self.request(|reply| SessionCommand::WatchBlock {
            username,
            channel,
            reply,
        })
        .await
    }
}

/// Owns the session and applies feed frames one at a time.
pub struct SessionDriver<W> {
    session: GameSession,
    rounds: SharedStore<RoundRecord>,
    chat: SharedStore<ChatEvent>,
    backfill: Option<Arc<Backfiller>>,
    block_tracker: Option<Arc<BlockTracker>>,
    sink: IntentSink<W>,
    commands: mpsc::Receiver<SessionCommand>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    blocks: broadcast::Sender<BlockMined>,
}

impl<W: AsyncWrite + Unpin> SessionDriver<W> {
    pub fn new(
        session: GameSession,
        rounds: SharedStore<RoundRecord>,
        chat: SharedStore<ChatEvent>,
        sink: IntentSink<W>,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot(Utc::now()));
        let (events, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (blocks, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let handle = SessionHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            events: events.clone(),
            blocks: blocks.clone(),
        };
        let driver = Self {
            session,
            rounds,
            chat,
            backfill: None,
            block_tracker: None,
            sink,
            commands: command_rx,
            snapshot: snapshot_tx,
            events,
            blocks,
        };
        (driver, handle)
    }

    pub fn with_backfill(mut self, backfill: Arc<Backfiller>) -> Self {
        self.backfill = Some(backfill);
        self
    }

    pub fn with_block_tracker(mut self, tracker: Arc<BlockTracker>) -> Self {
        self.block_tracker = Some(tracker);
        self
    }

    /// Runs until the source is exhausted or `shutdown` flips to true.
    pub async fn run<R>(
        mut self,
        mut source: EventSource<R>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        tracing::info!("Session driver started");
        loop {
            tokio::select! {
                next = source.next_event() => match next? {
                    Some(event) => self.handle_feed(event).await,
                    None => {
                        tracing::info!("Event source exhausted");
                        break;
                    }
                },
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Session driver shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.session.snapshot(Utc::now()));
    }

    fn broadcast(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn handle_feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Game(event) => {
                let name = event.name();
                match self.session.apply(event, Utc::now()) {
                    Ok(events) => {
                        for event in events {
                            self.route(event).await;
                        }
                    }
                    Err(e) => tracing::warn!("Rejected {}: {}", name, e),
                }
                self.publish_snapshot();
            }
            FeedEvent::Chat(message) => {
                tracing::trace!("Chat from {}", message.username);
                self.chat.write().await.append(message);
            }
            FeedEvent::ChatHistory(history) => {
                let report = self.chat.write().await.merge(history);
                tracing::debug!("Chat history merged: {:?}", report);
            }
            FeedEvent::Block { height, hash, .. } => self.spawn_block(height, hash),
            FeedEvent::Connected => tracing::info!("Connected to game server"),
            FeedEvent::Disconnected => {
                tracing::warn!("Disconnected from game server; waiting for a fresh snapshot")
            }
        }
    }

    async fn route(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Joined {
                round_id,
                state,
                history,
                chat,
            } => {
                let report = self.rounds.write().await.merge(history);
                tracing::info!("Round history merged on join: {:?}", report);
                if !chat.is_empty() {
                    let report = self.chat.write().await.merge(chat);
                    tracing::debug!("Chat merged on join: {:?}", report);
                }
                self.spawn_backfill(round_id);
                self.broadcast(SessionEvent::Joined {
                    round_id,
                    state,
                    history: Vec::new(),
                    chat: Vec::new(),
                });
            }
            event => {
                if let SessionEvent::RoundEnded { record, .. } = &event {
                    self.rounds.write().await.append(record.clone());
                }
                self.broadcast(event);
            }
        }
    }

    fn spawn_backfill(&self, round_id: i64) {
        let Some(backfill) = self.backfill.clone() else {
            return;
        };
        if backfill.is_running() {
            tracing::debug!("Backfill in flight; not starting another");
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = backfill.run(round_id).await {
                tracing::error!("Backfill before round {} failed: {}", round_id, e);
            }
        });
    }

    fn spawn_block(&self, height: i64, hash: String) {
        let Some(tracker) = self.block_tracker.clone() else {
            tracing::trace!("Block {} ignored, tracking disabled", height);
            return;
        };
        let blocks = self.blocks.clone();
        tokio::spawn(async move {
            match tracker.on_block(height, &hash).await {
                Ok(Some(mined)) => {
                    let _ = blocks.send(mined);
                }
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to record block {}: {}", height, e),
            }
        });
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Bet {
                amount,
                auto_cashout,
                reply,
            } => {
                let result = match self.session.place_bet(amount, auto_cashout) {
                    Ok(intent) => self.sink.send(&intent).await,
                    Err(e) => Err(e.into()),
                };
                self.publish_snapshot();
                let _ = reply.send(result);
            }
            SessionCommand::Cashout { reply } => {
                let result = match self.session.cash_out() {
                    Ok(intent) => self.sink.send(&intent).await,
                    Err(e) => Err(e.into()),
                };
                self.publish_snapshot();
                let _ = reply.send(result);
            }
            SessionCommand::WatchBlock {
                username,
                channel,
                reply,
            } => {
                let Some(tracker) = self.block_tracker.clone() else {
                    let _ = reply.send(Err(AppError::BadRequest(
                        "block tracking is disabled".to_string(),
                    )));
                    return;
                };
                tokio::spawn(async move {
                    let _ = reply.send(tracker.subscribe(&username, &channel).await);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_PUBLIC_SEED;
    use crate::crypto::fairness::FairnessVerifier;
    use crate::models::ObserverState;
    use crate::services::history_store::HistoryStore;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    const JOIN_IN_PROGRESS: &str = r#"{"event":"join","data":{"state":"IN_PROGRESS","game_id":10,"last_hash":"prev","created":"2026-01-01T00:00:00Z","elapsed":1000,"player_info":{"amy":{"bet":100}},"table_history":[{"game_id":8,"game_crash":120,"created":"2025-12-31T23:58:00Z","hash":"s8"},{"game_id":9,"game_crash":130,"created":"2025-12-31T23:59:00Z","hash":"s9"}]}}"#;
    const JOIN_STARTING_AS_STEVE: &str = r#"{"event":"join","data":{"state":"STARTING","game_id":11,"last_hash":"prev","created":"2026-01-01T00:00:00Z","elapsed":-2000,"username":"steve","balance_satoshis":10000}}"#;

    fn stores() -> (SharedStore<RoundRecord>, SharedStore<ChatEvent>) {
        (
            HistoryStore::new("rounds", 10, None).shared(),
            HistoryStore::new("chat", 10, None).shared(),
        )
    }

    fn session() -> GameSession {
        GameSession::new(FairnessVerifier::new(DEFAULT_PUBLIC_SEED), 10)
    }

    #[tokio::test]
    async fn recorded_feed_fills_round_and_chat_stores() {
        let feed = [
            JOIN_IN_PROGRESS,
            r#"{"event":"tick","data":[1500,{"amy":140}]}"#,
            r#"{"event":"game_crash","data":{"game_crash":199,"hash":"s10","bonuses":{}}}"#,
            r#"{"event":"msg","data":{"type":"say","username":"amy","message":"gg","date":"2026-01-01T00:00:10Z"}}"#,
        ]
        .join("\n");
        let (rounds, chat) = stores();
        let (driver, handle) = SessionDriver::new(
            session(),
            rounds.clone(),
            chat.clone(),
            IntentSink::new(Vec::new()),
        );
        let mut events = handle.subscribe_events();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        driver
            .run(EventSource::new(BufReader::new(feed.as_bytes())), shutdown_rx)
            .await
            .unwrap();

        let ids: Vec<i64> = rounds.read().await.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
        assert_eq!(rounds.read().await.records()[2].players["amy"].stopped_at, Some(140));
        assert_eq!(chat.read().await.len(), 1);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.round_id, Some(10));
        assert_eq!(snapshot.state, Some(RoundState::Ended));
        assert_eq!(snapshot.outcome, Some(199));

        let first = events.recv().await.unwrap();
        assert!(matches!(first, SessionEvent::Joined { round_id: 10, .. }));
        let mut saw_end = false;
        while let Ok(event) = events.try_recv() {
            saw_end |= matches!(event, SessionEvent::RoundEnded { .. });
        }
        assert!(saw_end);
    }

    #[tokio::test]
    async fn bad_frames_do_not_stop_the_driver() {
        let mut feed = b"{\"event\":\"connect\"}\n{\"event\":\"msg\",\"data\":{\"type\":\"say\",\"username\":\"amy\",\"message\":\"".to_vec();
        feed.extend_from_slice(&[0xff, 0xfe]);
        feed.extend_from_slice(b"\"}}\n");
        for line in [
            JOIN_IN_PROGRESS,
            r#"{"event":"tick","data":[9000000000000000000,{}]}"#,
            r#"{"event":"game_starting","data":{"game_id":11,"time_till_start":9223372036854775807}}"#,
            r#"{"event":"game_crash","data":{"game_crash":199,"hash":"s10","bonuses":{}}}"#,
        ] {
            feed.extend_from_slice(line.as_bytes());
            feed.push(b'\n');
        }
        let (rounds, chat) = stores();
        let (driver, handle) =
            SessionDriver::new(session(), rounds.clone(), chat, IntentSink::new(Vec::new()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        driver
            .run(EventSource::new(BufReader::new(feed.as_slice())), shutdown_rx)
            .await
            .unwrap();

        let snapshot = handle.snapshot();
        assert!(snapshot.joined);
        assert_eq!(snapshot.round_id, Some(10));
        assert_eq!(snapshot.state, Some(RoundState::Ended));
        let ids: Vec<i64> = rounds.read().await.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn commands_write_intents_and_update_snapshot() {
        let (mut feed_tx, feed_rx) = duplex(4096);
        let (sink_tx, sink_rx) = duplex(4096);
        let (rounds, chat) = stores();
        let (driver, handle) =
            SessionDriver::new(session(), rounds, chat, IntentSink::new(sink_tx));
        let mut events = handle.subscribe_events();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(driver.run(EventSource::new(BufReader::new(feed_rx)), shutdown_rx));

        assert!(matches!(
            handle.place_bet(100, None).await,
            Err(AppError::Session(SessionError::NotJoined))
        ));

        feed_tx
            .write_all(format!("{JOIN_STARTING_AS_STEVE}\n").as_bytes())
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Joined { round_id: 11, .. }
        ));

        handle.place_bet(100, Some(200)).await.unwrap();
        assert_eq!(
            handle.snapshot().observer_state,
            Some(ObserverState::Placing)
        );
        assert!(matches!(
            handle.place_bet(100, None).await,
            Err(AppError::Session(SessionError::InvalidObserverAction { .. }))
        ));

        let mut intents = BufReader::new(sink_rx).lines();
        assert_eq!(
            intents.next_line().await.unwrap().unwrap(),
            r#"{"event":"place_bet","data":{"amount":100,"auto_cashout":200}}"#
        );

        assert!(matches!(
            handle.watch_block("steve", "english").await,
            Err(AppError::BadRequest(_))
        ));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(matches!(
            handle.cash_out().await,
            Err(AppError::Session(SessionError::DriverStopped))
        ));
    }
}
