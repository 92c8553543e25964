use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::crypto::fairness::Verdict;
use crate::error::SessionError;

// ==================== ROUND STATE ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundState {
    Starting,
    InProgress,
    Ended,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoundState::Starting => "STARTING",
            RoundState::InProgress => "IN_PROGRESS",
            RoundState::Ended => "ENDED",
        };
        f.write_str(label)
    }
}

/// The observer's own wager lifecycle.
///
/// `Placing` and `CashingOut` are optimistic: the intent went out but the
/// server has not confirmed it yet. A `Placing` bet may lose the race against
/// the round start, in which case the observer falls back to `Watching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObserverState {
    #[serde(rename = "WATCHING")]
    Watching,
    #[serde(rename = "PLACING")]
    Placing,
    #[serde(rename = "PLACED")]
    Placed,
    #[serde(rename = "PLAYING")]
    Playing,
    #[serde(rename = "CASHINGOUT")]
    CashingOut,
    #[serde(rename = "CASHEDOUT")]
    CashedOut,
    #[serde(rename = "CRASHED")]
    Crashed,
}

// ==================== WAGER ====================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wager {
    pub identity: String,
    /// Minor units. Unknown until the round-started bet list arrives.
    pub bet: Option<i64>,
    /// x100 multiplier; written at most once per round.
    pub stopped_at: Option<i64>,
    pub bonus: Option<i64>,
    pub joined_at: Option<DateTime<Utc>>,
}

impl Wager {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            bet: None,
            stopped_at: None,
            bonus: None,
            joined_at: None,
        }
    }

    pub fn with_bet(identity: impl Into<String>, bet: i64) -> Self {
        Self {
            bet: Some(bet),
            ..Self::new(identity)
        }
    }

    pub fn record_cash_out(&mut self, stopped_at: i64) -> Result<(), SessionError> {
        if let Some(previous) = self.stopped_at {
            return Err(SessionError::AlreadyCashedOut {
                identity: self.identity.clone(),
                stopped_at: previous,
            });
        }
        self.stopped_at = Some(stopped_at);
        Ok(())
    }

    /// Payout in minor units, rounded to the nearest unit.
    pub fn cash_out_amount(&self) -> Option<i64> {
        let (bet, stopped_at) = (self.bet?, self.stopped_at?);
        let raw = i128::from(bet) * i128::from(stopped_at);
        i64::try_from((raw + 50).div_euclid(100)).ok()
    }
}

// ==================== ROUND ====================

/// The round currently being played. `secret` and `outcome` are only ever set
/// together with the transition to `Ended`, through [`Round::finish`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Round {
    pub id: i64,
    pub secret_hash: Option<String>,
    pub created: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub forced: bool,
    pub players: BTreeMap<String, Wager>,
    state: RoundState,
    secret: Option<String>,
    outcome: Option<i64>,
}

impl Round {
    pub fn starting(
        id: i64,
        secret_hash: Option<String>,
        created: DateTime<Utc>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            secret_hash,
            created,
            start_time,
            forced: false,
            players: BTreeMap::new(),
            state: RoundState::Starting,
            secret: None,
            outcome: None,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub fn outcome(&self) -> Option<i64> {
        self.outcome
    }

    pub fn is_ended(&self) -> bool {
        self.state == RoundState::Ended
    }

    pub fn begin(&mut self, at: DateTime<Utc>) -> Result<(), SessionError> {
        if self.state != RoundState::Starting {
            return Err(SessionError::InvalidRoundState {
                event: "round started",
                state: self.state.to_string(),
            });
        }
        self.state = RoundState::InProgress;
        self.start_time = at;
        Ok(())
    }

    pub fn finish(
        &mut self,
        secret: String,
        outcome: i64,
        forced: bool,
    ) -> Result<(), SessionError> {
        if self.state == RoundState::Ended {
            return Err(SessionError::InvalidRoundState {
                event: "round ended",
                state: self.state.to_string(),
            });
        }
        self.state = RoundState::Ended;
        self.secret = Some(secret);
        self.outcome = Some(outcome);
        self.forced = forced;
        Ok(())
    }

    /// Upsert a wager. A cash-out already recorded for the identity survives.
    pub fn upsert_wager(&mut self, identity: &str, bet: Option<i64>, joined_at: DateTime<Utc>) {
        let wager = self
            .players
            .entry(identity.to_string())
            .or_insert_with(|| Wager::new(identity));
        if bet.is_some() {
            wager.bet = bet;
        }
        wager.joined_at.get_or_insert(joined_at);
    }
}

// ==================== ROUND RECORD ====================

/// Finalized round as kept in the rolling history and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub id: i64,
    pub crash_point: i64,
    pub secret: String,
    pub created: DateTime<Utc>,
    pub started: DateTime<Utc>,
    pub forced: bool,
    pub players: BTreeMap<String, Wager>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<Verdict>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundTotals {
    pub wagered: i64,
    pub cashed_out: i64,
    pub bonused: i64,
    pub participants: i64,
}

impl RoundRecord {
    pub fn from_round(round: &Round, verified: Option<Verdict>) -> Option<Self> {
        Some(Self {
            id: round.id,
            crash_point: round.outcome()?,
            secret: round.secret()?.to_string(),
            created: round.created,
            started: round.start_time,
            forced: round.forced,
            players: round.players.clone(),
            verified,
        })
    }

    pub fn totals(&self) -> RoundTotals {
        self.players
            .values()
            .fold(RoundTotals::default(), |mut acc, wager| {
                acc.wagered += wager.bet.unwrap_or(0);
                acc.cashed_out += wager.cash_out_amount().unwrap_or(0);
                acc.bonused += wager.bonus.unwrap_or(0);
                acc.participants += 1;
                acc
            })
    }
}

// ==================== TICK ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSample {
    /// Server-declared milliseconds since round start.
    pub elapsed: i64,
    /// Local microseconds since the round was seen starting.
    pub micro: i64,
    /// x100 multiplier at `elapsed`.
    pub growth: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn stopped_at_is_written_once() {
        let mut wager = Wager::with_bet("Steve", 500);
        wager.record_cash_out(150).unwrap();
        let err = wager.record_cash_out(200).unwrap_err();
        assert_eq!(
            err,
            SessionError::AlreadyCashedOut {
                identity: "Steve".to_string(),
                stopped_at: 150
            }
        );
        assert_eq!(wager.stopped_at, Some(150));
    }

    #[test]
    fn cash_out_amount_rounds_to_nearest_unit() {
        let mut wager = Wager::with_bet("Shiba", 21_600);
        wager.record_cash_out(103).unwrap();
        assert_eq!(wager.cash_out_amount(), Some(22_248));

        let mut odd = Wager::with_bet("odd", 3);
        odd.record_cash_out(150).unwrap();
        assert_eq!(odd.cash_out_amount(), Some(5));
    }

    #[test]
    fn outcome_only_exists_once_ended() {
        let mut round = Round::starting(7, None, ts(0), ts(5));
        assert_eq!(round.outcome(), None);
        round.begin(ts(5)).unwrap();
        assert_eq!(round.outcome(), None);
        assert_eq!(round.secret(), None);

        round.finish("abc".to_string(), 250, false).unwrap();
        assert_eq!(round.state(), RoundState::Ended);
        assert_eq!(round.outcome(), Some(250));
        assert!(round.finish("def".to_string(), 1, false).is_err());
        assert_eq!(round.secret(), Some("abc"));
    }

    #[test]
    fn begin_requires_starting() {
        let mut round = Round::starting(1, None, ts(0), ts(0));
        round.begin(ts(1)).unwrap();
        assert!(round.begin(ts(2)).is_err());
    }

    #[test]
    fn upsert_keeps_existing_cash_out() {
        let mut round = Round::starting(1, None, ts(0), ts(0));
        round.upsert_wager("Steve", Some(100), ts(1));
        round
            .players
            .get_mut("Steve")
            .unwrap()
            .record_cash_out(200)
            .unwrap();
        round.upsert_wager("Steve", None, ts(3));

        let wager = &round.players["Steve"];
        assert_eq!(wager.bet, Some(100));
        assert_eq!(wager.stopped_at, Some(200));
        assert_eq!(wager.joined_at, Some(ts(1)));
    }

    #[test]
    fn record_totals_sum_players() {
        let mut round = Round::starting(3, None, ts(0), ts(5));
        round.upsert_wager("a", Some(100), ts(1));
        round.upsert_wager("b", Some(200), ts(1));
        round.players.get_mut("a").unwrap().record_cash_out(200).unwrap();
        round.players.get_mut("b").unwrap().bonus = Some(7);
        round.begin(ts(5)).unwrap();
        round.finish("s".to_string(), 300, false).unwrap();

        let record = RoundRecord::from_round(&round, None).unwrap();
        assert_eq!(
            record.totals(),
            RoundTotals {
                wagered: 300,
                cashed_out: 200,
                bonused: 7,
                participants: 2
            }
        );
    }

    #[test]
    fn record_requires_ended_round() {
        let round = Round::starting(3, None, ts(0), ts(5));
        assert!(RoundRecord::from_round(&round, None).is_none());
    }
}
