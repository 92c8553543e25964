use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::crypto::fairness::{ChainLink, Verification};
use crate::game::tick_estimator::TickPrediction;
use crate::models::{ChatEvent, RoundRecord, RoundState, TickSample, Wager};

/// Round phase as delivered by a join snapshot. An ended round always carries
/// its crash point.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinPhase {
    Starting,
    InProgress,
    Ended { crash_point: i64, forced: bool },
}

impl JoinPhase {
    pub fn state(&self) -> RoundState {
        match self {
            JoinPhase::Starting => RoundState::Starting,
            JoinPhase::InProgress => RoundState::InProgress,
            JoinPhase::Ended { .. } => RoundState::Ended,
        }
    }
}

/// Authoritative state received on every (re)connect.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSnapshot {
    pub round_id: i64,
    pub phase: JoinPhase,
    /// Latest revealed secret: the current round's secret once ended, the
    /// previous round's otherwise.
    pub last_hash: Option<String>,
    pub players: BTreeMap<String, Wager>,
    pub created: DateTime<Utc>,
    /// Milliseconds since start; negative while starting.
    pub elapsed: i64,
    pub username: Option<String>,
    pub balance: Option<i64>,
    pub history: Vec<RoundRecord>,
    pub chat: Vec<ChatEvent>,
}

/// Parsed game-feed events, applied in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    Join(Box<JoinSnapshot>),
    RoundStarting {
        round_id: i64,
        time_till_start: i64,
        commitment: Option<String>,
    },
    RoundStarted {
        bets: BTreeMap<String, i64>,
    },
    Tick {
        elapsed: i64,
        cashouts: BTreeMap<String, i64>,
    },
    RoundEnded {
        secret: String,
        outcome: i64,
        bonuses: BTreeMap<String, i64>,
        forced: bool,
    },
    Bet {
        identity: String,
    },
    Bets {
        identities: Vec<String>,
    },
    CashedOut {
        identity: String,
        stopped_at: i64,
    },
}

impl GameEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::Join(_) => "join",
            GameEvent::RoundStarting { .. } => "game_starting",
            GameEvent::RoundStarted { .. } => "game_started",
            GameEvent::Tick { .. } => "tick",
            GameEvent::RoundEnded { .. } => "game_crash",
            GameEvent::Bet { .. } => "player_bet",
            GameEvent::Bets { .. } => "bets",
            GameEvent::CashedOut { .. } => "cashed_out",
        }
    }
}

/// Requests the session wants sent to the game server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundIntent {
    PlaceBet {
        amount: i64,
        auto_cashout: Option<i64>,
    },
    CashOut,
}

/// Higher-level notifications emitted after an event has been applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Joined {
        round_id: i64,
        state: RoundState,
        #[serde(skip)]
        history: Vec<RoundRecord>,
        #[serde(skip)]
        chat: Vec<ChatEvent>,
    },
    RoundStarting {
        round_id: i64,
        secret_hash: Option<String>,
        chain: ChainLink,
        start_time: DateTime<Utc>,
    },
    RoundStarted {
        round_id: i64,
        bets: BTreeMap<String, i64>,
    },
    Tick {
        sample: TickSample,
        next: TickPrediction,
    },
    Bet {
        identity: String,
        observer: bool,
    },
    CashedOut {
        identity: String,
        stopped_at: i64,
        observer: bool,
    },
    RoundEnded {
        record: RoundRecord,
        verification: Verification,
    },
    ObserverLost {
        round_id: i64,
    },
}
