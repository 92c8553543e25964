use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::crypto::fairness::{check_chain_link, classify, ChainLink, FairnessVerifier, Verification};
use crate::error::SessionError;
use crate::game::events::{GameEvent, JoinPhase, JoinSnapshot, OutboundIntent, SessionEvent};
use crate::game::tick_estimator::{TickEstimator, TickPrediction};
use crate::models::{ObserverState, Round, RoundRecord, RoundState, TickSample, Wager};
use crate::utils::{format_factor, growth};

/// Read-only view of the session handed to outbound consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub joined: bool,
    pub round_id: Option<i64>,
    pub state: Option<RoundState>,
    pub elapsed: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub secret_hash: Option<String>,
    pub players: BTreeMap<String, Wager>,
    pub observer: Option<String>,
    pub observer_state: Option<ObserverState>,
    pub balance: Option<i64>,
    pub outcome: Option<i64>,
    pub secret: Option<String>,
    pub forced: bool,
    pub verification: Option<Verification>,
    pub next_tick: Option<TickPrediction>,
}

/// Round and observer state machine. Every event is applied to completion or
/// rejected without touching state.
pub struct GameSession {
    verifier: FairnessVerifier,
    round: Option<Round>,
    observer: Option<String>,
    observer_state: ObserverState,
    balance: Option<i64>,
    previous_secret: Option<String>,
    verification: Option<Verification>,
    /// Local clock reading when the round was seen starting; `micro` is
    /// measured from here.
    anchor: Option<DateTime<Utc>>,
    ticks: TickEstimator,
}

// Internal helper that converts a signed duration to microseconds.
fn micros_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX)
}

// Internal helper that offsets `now` by a wire-supplied millisecond count.
fn offset_millis(now: DateTime<Utc>, millis: i64) -> Result<DateTime<Utc>, SessionError> {
    Duration::try_milliseconds(millis)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| SessionError::InvalidPayload(format!("{millis}ms offset is out of range")))
}

// Internal helper for timestamps the server reports as "elapsed ago".
fn millis_ago(now: DateTime<Utc>, elapsed: i64) -> Result<DateTime<Utc>, SessionError> {
    let back = elapsed
        .checked_neg()
        .ok_or_else(|| SessionError::InvalidPayload(format!("elapsed {elapsed} is out of range")))?;
    offset_millis(now, back)
}

impl GameSession {
    pub fn new(verifier: FairnessVerifier, tick_window: usize) -> Self {
        Self {
            verifier,
            round: None,
            observer: None,
            observer_state: ObserverState::Watching,
            balance: None,
            previous_secret: None,
            verification: None,
            anchor: None,
            ticks: TickEstimator::new(tick_window),
        }
    }

    pub fn verifier(&self) -> &FairnessVerifier {
        &self.verifier
    }

    pub fn round(&self) -> Option<&Round> {
        self.round.as_ref()
    }

    pub fn observer_state(&self) -> ObserverState {
        self.observer_state
    }

    pub fn balance(&self) -> Option<i64> {
        self.balance
    }

    fn is_observer(&self, identity: &str) -> bool {
        self.observer.as_deref() == Some(identity)
    }

    fn round_mut(&mut self) -> Result<&mut Round, SessionError> {
        self.round.as_mut().ok_or(SessionError::NotJoined)
    }

    fn require_state(
        &self,
        event: &'static str,
        allowed: &[RoundState],
    ) -> Result<&Round, SessionError> {
        let round = self.round.as_ref().ok_or(SessionError::NotJoined)?;
        if allowed.contains(&round.state()) {
            Ok(round)
        } else {
            Err(SessionError::InvalidRoundState {
                event,
                state: round.state().to_string(),
            })
        }
    }

    fn set_observer_state(&mut self, next: ObserverState) {
        if self.observer_state != next {
            tracing::debug!("Observer state: {:?} -> {:?}", self.observer_state, next);
            self.observer_state = next;
        }
    }

    pub fn apply(
        &mut self,
        event: GameEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        match event {
            GameEvent::Join(snapshot) => self.on_join(*snapshot, now).map(|e| vec![e]),
            GameEvent::RoundStarting {
                round_id,
                time_till_start,
                commitment,
            } => self
                .on_round_starting(round_id, time_till_start, commitment, now)
                .map(|e| vec![e]),
            GameEvent::RoundStarted { bets } => self.on_round_started(bets, now).map(|e| vec![e]),
            GameEvent::Tick { elapsed, cashouts } => self.on_tick(elapsed, cashouts, now),
            GameEvent::RoundEnded {
                secret,
                outcome,
                bonuses,
                forced,
            } => self.on_round_ended(secret, outcome, bonuses, forced),
            GameEvent::Bet { identity } => self.on_bet(identity, now).map(|e| vec![e]),
            GameEvent::Bets { identities } => {
                self.require_state("bet", &[RoundState::Starting, RoundState::InProgress])?;
                identities
                    .into_iter()
                    .map(|identity| self.on_bet(identity, now))
                    .collect()
            }
            GameEvent::CashedOut {
                identity,
                stopped_at,
            } => self.on_cashed_out(identity, stopped_at).map(|e| vec![e]),
        }
    }

    fn on_join(
        &mut self,
        snapshot: JoinSnapshot,
        now: DateTime<Utc>,
    ) -> Result<SessionEvent, SessionError> {
        let JoinSnapshot {
            round_id,
            phase,
            last_hash,
            mut players,
            created,
            elapsed,
            username,
            balance,
            history,
            chat,
        } = snapshot;

        let start_time = match phase {
            JoinPhase::Ended { .. } => created,
            _ => millis_ago(now, elapsed)?,
        };
        let secret_hash = match phase {
            JoinPhase::Ended { .. } => None,
            _ => last_hash.clone(),
        };

        for wager in players.values_mut() {
            wager.joined_at.get_or_insert(created);
        }
        let mut round = Round::starting(round_id, secret_hash, created, start_time);
        round.players = players;

        self.verification = None;
        if phase != JoinPhase::Starting {
            // A fresh Starting round always accepts begin.
            let _ = round.begin(start_time);
        }
        if let JoinPhase::Ended { crash_point, forced } = &phase {
            if let Some(secret) = last_hash.clone() {
                let verification = self.verifier.verify(&secret, *crash_point as f64, None);
                let _ = round.finish(secret, *crash_point, *forced);
                self.verification = Some(verification);
            }
        }

        self.observer_state = match username.as_deref().and_then(|u| round.players.get(u)) {
            None => ObserverState::Watching,
            Some(wager) if wager.stopped_at.is_some() => ObserverState::CashedOut,
            Some(_) if round.is_ended() => ObserverState::Crashed,
            // Bet accepted before the round began; RoundStarted promotes it to PLAYING.
            Some(_) if round.state() == RoundState::Starting => ObserverState::Placed,
            Some(_) => ObserverState::Playing,
        };

        tracing::info!(
            "Joined round #{} ({}) as {} with {} players, observer {:?}",
            round_id,
            phase.state(),
            username.as_deref().unwrap_or("<anonymous>"),
            round.players.len(),
            self.observer_state
        );

        let history = history
            .into_iter()
            .map(|mut record| {
                let computed = self.verifier.crash_point(&record.secret);
                record.verified = Some(classify(computed, record.crash_point as f64));
                record
            })
            .collect();

        let state = round.state();
        self.anchor = Some(start_time);
        self.ticks.reset();
        self.previous_secret = last_hash;
        self.observer = username;
        self.balance = balance;
        self.round = Some(round);

        Ok(SessionEvent::Joined {
            round_id,
            state,
            history,
            chat,
        })
    }

    fn on_round_starting(
        &mut self,
        round_id: i64,
        time_till_start: i64,
        commitment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SessionEvent, SessionError> {
        let start_time = offset_millis(now, time_till_start)?;
        let chain = match commitment.as_deref() {
            Some(hash) => check_chain_link(self.previous_secret.as_deref(), hash),
            None => ChainLink::Unknown,
        };
        if chain == ChainLink::Broken {
            tracing::error!(
                "Round #{} commitment {:?} does not match previous secret {:?}",
                round_id,
                commitment,
                self.previous_secret
            );
        }

        let secret_hash = commitment.or_else(|| self.previous_secret.clone());
        self.round = Some(Round::starting(
            round_id,
            secret_hash.clone(),
            now,
            start_time,
        ));
        self.verification = None;
        self.anchor = None;
        self.ticks.reset();

        if self.observer_state != ObserverState::Placing {
            self.set_observer_state(ObserverState::Watching);
        }
        tracing::debug!("Round #{} starting in {}ms", round_id, time_till_start);

        Ok(SessionEvent::RoundStarting {
            round_id,
            secret_hash,
            chain,
            start_time,
        })
    }

    fn on_round_started(
        &mut self,
        bets: BTreeMap<String, i64>,
        now: DateTime<Utc>,
    ) -> Result<SessionEvent, SessionError> {
        self.require_state("round started", &[RoundState::Starting])?;
        let observer = self.observer.clone();
        let round = self.round_mut()?;
        round.begin(now)?;
        for (identity, bet) in &bets {
            round.upsert_wager(identity, Some(*bet), now);
        }
        let round_id = round.id;

        let observer_bet = observer.as_deref().and_then(|name| bets.get(name).copied());
        if let (Some(bet), Some(balance)) = (observer_bet, self.balance.as_mut()) {
            *balance -= bet;
        }

        match (self.observer_state, observer_bet) {
            (ObserverState::Placed, _) | (ObserverState::Placing, Some(_)) => {
                self.set_observer_state(ObserverState::Playing)
            }
            (ObserverState::Placing, None) => {
                tracing::info!("Bet did not make it into round #{}", round_id);
                self.set_observer_state(ObserverState::Watching)
            }
            _ => {}
        }

        self.anchor = Some(now);
        self.ticks.reset();
        tracing::debug!("Round #{} started with {} bets", round_id, bets.len());
        Ok(SessionEvent::RoundStarted { round_id, bets })
    }

    fn on_tick(
        &mut self,
        elapsed: i64,
        cashouts: BTreeMap<String, i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        self.require_state("tick", &[RoundState::InProgress])?;
        let corrected = millis_ago(now, elapsed)?;

        let mut events = Vec::with_capacity(cashouts.len() + 1);
        for (identity, stopped_at) in cashouts {
            match self.on_cashed_out(identity, stopped_at) {
                Ok(event) => events.push(event),
                Err(err) => tracing::warn!("Ignoring inline cashout: {}", err),
            }
        }

        let round = self.round_mut()?;
        if corrected < round.start_time {
            round.start_time = corrected;
        }
        let anchor = *self.anchor.get_or_insert(corrected);

        let sample = TickSample {
            elapsed,
            micro: micros_between(anchor, now),
            growth: growth(elapsed),
        };
        self.ticks.record(sample);
        tracing::trace!("Tick {}x elapsed {}", format_factor(sample.growth), elapsed);

        events.push(SessionEvent::Tick {
            sample,
            next: self.ticks.predict_next(),
        });
        Ok(events)
    }

    fn on_bet(&mut self, identity: String, now: DateTime<Utc>) -> Result<SessionEvent, SessionError> {
        self.require_state("bet", &[RoundState::Starting, RoundState::InProgress])?;
        self.round_mut()?.upsert_wager(&identity, None, now);

        let observer = self.is_observer(&identity);
        if observer {
            self.set_observer_state(ObserverState::Placed);
        } else {
            tracing::trace!("Player bet: {}", identity);
        }
        Ok(SessionEvent::Bet { identity, observer })
    }

    fn on_cashed_out(
        &mut self,
        identity: String,
        stopped_at: i64,
    ) -> Result<SessionEvent, SessionError> {
        let round = self.round_mut()?;
        let wager = round
            .players
            .get_mut(&identity)
            .ok_or_else(|| SessionError::UnknownWager(identity.clone()))?;
        wager.record_cash_out(stopped_at)?;
        let payout = wager.cash_out_amount();

        let observer = self.is_observer(&identity);
        if observer {
            if let (Some(balance), Some(payout)) = (self.balance.as_mut(), payout) {
                *balance += payout;
            }
            tracing::info!("Cashed out @{}x", format_factor(stopped_at));
            self.set_observer_state(ObserverState::CashedOut);
        }
        Ok(SessionEvent::CashedOut {
            identity,
            stopped_at,
            observer,
        })
    }

    fn on_round_ended(
        &mut self,
        secret: String,
        outcome: i64,
        bonuses: BTreeMap<String, i64>,
        forced: bool,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        self.require_state("round ended", &[RoundState::InProgress])?;
        let verification = {
            let round = self.round.as_ref().ok_or(SessionError::NotJoined)?;
            self.verifier
                .verify(&secret, outcome as f64, round.secret_hash.as_deref())
        };

        let round = self.round_mut()?;
        for (identity, bonus) in bonuses {
            match round.players.get_mut(&identity) {
                Some(wager) => wager.bonus = Some(bonus),
                None => tracing::warn!("Bonus for {} who did not play round #{}", identity, round.id),
            }
        }
        round.finish(secret.clone(), outcome, forced)?;
        let round_id = round.id;
        let record = RoundRecord::from_round(round, Some(verification.verdict))
            .ok_or(SessionError::NotJoined)?;

        if verification.is_fair() {
            tracing::info!("Round #{} crashed @{}x", round_id, format_factor(outcome));
        } else {
            tracing::error!(
                "Round #{} hash failure: declared {} computed {} commitment {:?}",
                round_id,
                format_factor(outcome),
                format_factor(verification.computed),
                verification.commitment
            );
        }

        self.previous_secret = Some(secret);
        self.verification = Some(verification.clone());

        let mut events = vec![SessionEvent::RoundEnded {
            record,
            verification,
        }];
        if matches!(
            self.observer_state,
            ObserverState::Playing | ObserverState::CashingOut
        ) {
            self.set_observer_state(ObserverState::Crashed);
            events.push(SessionEvent::ObserverLost { round_id });
        }
        Ok(events)
    }

    /// Local bet intent. Only valid while watching.
    pub fn place_bet(
        &mut self,
        amount: i64,
        auto_cashout: Option<i64>,
    ) -> Result<OutboundIntent, SessionError> {
        if self.round.is_none() || self.observer.is_none() {
            return Err(SessionError::NotJoined);
        }
        if amount <= 0 {
            return Err(SessionError::InvalidAmount);
        }
        if self.observer_state != ObserverState::Watching {
            return Err(SessionError::InvalidObserverAction {
                action: "bet",
                state: self.observer_state,
            });
        }
        tracing::debug!("Bet: {} @{:?}", amount, auto_cashout);
        self.set_observer_state(ObserverState::Placing);
        Ok(OutboundIntent::PlaceBet {
            amount,
            auto_cashout,
        })
    }

    pub fn cash_out(&mut self) -> Result<OutboundIntent, SessionError> {
        if self.round.is_none() || self.observer.is_none() {
            return Err(SessionError::NotJoined);
        }
        match self.observer_state {
            ObserverState::Playing | ObserverState::Placing | ObserverState::Placed => {
                self.set_observer_state(ObserverState::CashingOut);
                Ok(OutboundIntent::CashOut)
            }
            state => Err(SessionError::InvalidObserverAction {
                action: "cash out",
                state,
            }),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let Some(round) = self.round.as_ref() else {
            return SessionSnapshot::default();
        };
        SessionSnapshot {
            joined: true,
            round_id: Some(round.id),
            state: Some(round.state()),
            elapsed: Some((now - round.start_time).num_milliseconds()),
            start_time: Some(round.start_time),
            secret_hash: round.secret_hash.clone(),
            players: round.players.clone(),
            observer: self.observer.clone(),
            observer_state: Some(self.observer_state),
            balance: self.balance,
            outcome: round.outcome(),
            secret: round.secret().map(str::to_string),
            forced: round.forced,
            verification: self.verification.clone(),
            next_tick: (round.state() == RoundState::InProgress && self.ticks.len() > 0)
                .then(|| self.ticks.predict_next()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_PUBLIC_SEED;
    use crate::crypto::fairness::{CommitmentCheck, Verdict};
    use crate::crypto::hash::sha256_hex;

    const SECRET_400: &str = "5feceb66ffc86f38d952786c6d696c79c2dbc239dd4e91b46729d73a27fb57e9";

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_422_000_000_000 + ms).unwrap()
    }

    fn new_session() -> GameSession {
        GameSession::new(FairnessVerifier::new(DEFAULT_PUBLIC_SEED), 10)
    }

    fn join(phase: JoinPhase, players: &[(&str, Option<i64>, Option<i64>)]) -> GameEvent {
        GameEvent::Join(Box::new(JoinSnapshot {
            round_id: 100,
            phase,
            last_hash: Some("0".repeat(64)),
            players: players
                .iter()
                .map(|(name, bet, stopped_at)| {
                    let mut wager = Wager::new(*name);
                    wager.bet = *bet;
                    wager.stopped_at = *stopped_at;
                    (name.to_string(), wager)
                })
                .collect(),
            created: ts(0),
            elapsed: 1_000,
            username: Some("Shiba".to_string()),
            balance: Some(10_000),
            history: Vec::new(),
            chat: Vec::new(),
        }))
    }

    fn joined_watching() -> GameSession {
        let mut session = new_session();
        session.apply(join(JoinPhase::InProgress, &[]), ts(6_000)).unwrap();
        session
    }

    fn starting(session: &mut GameSession, round_id: i64, at: i64, commitment: Option<&str>) {
        session
            .apply(
                GameEvent::RoundStarting {
                    round_id,
                    time_till_start: 5_000,
                    commitment: commitment.map(str::to_string),
                },
                ts(at),
            )
            .unwrap();
    }

    fn started(session: &mut GameSession, bets: &[(&str, i64)], at: i64) -> Vec<SessionEvent> {
        session
            .apply(
                GameEvent::RoundStarted {
                    bets: bets.iter().map(|(n, b)| (n.to_string(), *b)).collect(),
                },
                ts(at),
            )
            .unwrap()
    }

    fn ended(session: &mut GameSession, secret: &str, outcome: i64) -> Vec<SessionEvent> {
        session
            .apply(
                GameEvent::RoundEnded {
                    secret: secret.to_string(),
                    outcome,
                    bonuses: BTreeMap::new(),
                    forced: false,
                },
                ts(30_000),
            )
            .unwrap()
    }

    #[test]
    fn join_derives_observer_state() {
        let cases = [
            (JoinPhase::InProgress, vec![], ObserverState::Watching),
            (
                JoinPhase::InProgress,
                vec![("Shiba", Some(100), Some(150))],
                ObserverState::CashedOut,
            ),
            (
                JoinPhase::Ended {
                    crash_point: 400,
                    forced: false,
                },
                vec![("Shiba", Some(100), None)],
                ObserverState::Crashed,
            ),
            (
                JoinPhase::InProgress,
                vec![("Shiba", Some(100), None)],
                ObserverState::Playing,
            ),
            (
                JoinPhase::Starting,
                vec![("Shiba", None, None)],
                ObserverState::Placed,
            ),
        ];
        for (phase, players, expected) in cases {
            let mut session = new_session();
            session.apply(join(phase, &players), ts(6_000)).unwrap();
            assert_eq!(session.observer_state(), expected);
        }
    }

    #[test]
    fn join_in_progress_backdates_start_time() {
        let session = joined_watching();
        let round = session.round().unwrap();
        assert_eq!(round.state(), RoundState::InProgress);
        assert_eq!(round.start_time, ts(5_000));
        assert_eq!(round.secret_hash.as_deref(), Some("0".repeat(64).as_str()));
    }

    #[test]
    fn ended_join_carries_outcome_and_verification() {
        let mut session = new_session();
        let mut event = join(
            JoinPhase::Ended {
                crash_point: 400,
                forced: false,
            },
            &[],
        );
        if let GameEvent::Join(snapshot) = &mut event {
            snapshot.last_hash = Some(SECRET_400.to_string());
        }
        session.apply(event, ts(6_000)).unwrap();

        let snapshot = session.snapshot(ts(7_000));
        assert_eq!(snapshot.outcome, Some(400));
        assert_eq!(snapshot.secret.as_deref(), Some(SECRET_400));
        let verification = snapshot.verification.unwrap();
        assert_eq!(verification.verdict, Verdict::Ok);
        assert_eq!(verification.commitment, CommitmentCheck::Unknown);
    }

    #[test]
    fn join_verifies_history() {
        let mut session = new_session();
        let mut event = join(JoinPhase::InProgress, &[]);
        if let GameEvent::Join(snapshot) = &mut event {
            snapshot.history = vec![RoundRecord {
                id: 99,
                crash_point: 401,
                secret: SECRET_400.to_string(),
                created: ts(0),
                started: ts(5_000),
                forced: false,
                players: BTreeMap::new(),
                verified: None,
            }];
        }
        let events = session.apply(event, ts(6_000)).unwrap();
        match &events[0] {
            SessionEvent::Joined { history, .. } => {
                assert_eq!(history[0].verified, Some(Verdict::Scam))
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn lost_race_returns_to_watching() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);

        assert_eq!(
            session.place_bet(500, None).unwrap(),
            OutboundIntent::PlaceBet {
                amount: 500,
                auto_cashout: None
            }
        );
        assert_eq!(session.observer_state(), ObserverState::Placing);

        started(&mut session, &[("Steve", 100)], 15_000);
        assert_eq!(session.observer_state(), ObserverState::Watching);
        assert_eq!(session.balance(), Some(10_000));
    }

    #[test]
    fn confirmed_bet_plays_and_debits_balance() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        session.place_bet(500, Some(200)).unwrap();
        session
            .apply(
                GameEvent::Bet {
                    identity: "Shiba".to_string(),
                },
                ts(11_000),
            )
            .unwrap();
        assert_eq!(session.observer_state(), ObserverState::Placed);

        started(&mut session, &[("Shiba", 500)], 15_000);
        assert_eq!(session.observer_state(), ObserverState::Playing);
        assert_eq!(session.balance(), Some(9_500));

        session
            .apply(
                GameEvent::CashedOut {
                    identity: "Shiba".to_string(),
                    stopped_at: 250,
                },
                ts(20_000),
            )
            .unwrap();
        assert_eq!(session.observer_state(), ObserverState::CashedOut);
        assert_eq!(session.balance(), Some(9_500 + 1_250));
    }

    #[test]
    fn round_starting_keeps_pending_bet() {
        let mut session = joined_watching();
        session.place_bet(100, None).unwrap();
        starting(&mut session, 101, 10_000, None);
        assert_eq!(session.observer_state(), ObserverState::Placing);
    }

    #[test]
    fn round_starting_resets_settled_observer() {
        let mut session = new_session();
        session
            .apply(
                join(JoinPhase::InProgress, &[("Shiba", Some(100), Some(150))]),
                ts(6_000),
            )
            .unwrap();
        starting(&mut session, 101, 10_000, None);
        assert_eq!(session.observer_state(), ObserverState::Watching);
    }

    #[test]
    fn rejected_intents_leave_state_unchanged() {
        let mut session = joined_watching();
        let err = session.cash_out().unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidObserverAction {
                action: "cash out",
                state: ObserverState::Watching
            }
        );
        assert_eq!(session.observer_state(), ObserverState::Watching);
        assert_eq!(session.place_bet(0, None), Err(SessionError::InvalidAmount));

        session.place_bet(100, None).unwrap();
        assert!(session.place_bet(100, None).is_err());
        assert_eq!(session.observer_state(), ObserverState::Placing);
        assert_eq!(session.cash_out(), Ok(OutboundIntent::CashOut));
        assert_eq!(session.observer_state(), ObserverState::CashingOut);
    }

    #[test]
    fn intents_require_join() {
        let mut session = new_session();
        assert_eq!(session.place_bet(100, None), Err(SessionError::NotJoined));
        assert_eq!(session.cash_out(), Err(SessionError::NotJoined));
    }

    #[test]
    fn second_cash_out_is_rejected() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        started(&mut session, &[("Steve", 100)], 15_000);
        let cash_out = |stopped_at| GameEvent::CashedOut {
            identity: "Steve".to_string(),
            stopped_at,
        };
        session.apply(cash_out(150), ts(16_000)).unwrap();
        let err = session.apply(cash_out(300), ts(17_000)).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyCashedOut { stopped_at: 150, .. }));
        assert_eq!(
            session.round().unwrap().players["Steve"].stopped_at,
            Some(150)
        );
    }

    #[test]
    fn cash_out_for_unknown_identity_is_rejected() {
        let mut session = joined_watching();
        let err = session
            .apply(
                GameEvent::CashedOut {
                    identity: "ghost".to_string(),
                    stopped_at: 150,
                },
                ts(7_000),
            )
            .unwrap_err();
        assert_eq!(err, SessionError::UnknownWager("ghost".to_string()));
    }

    #[test]
    fn out_of_range_offsets_are_rejected_without_state_change() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        started(&mut session, &[("Steve", 100)], 15_000);
        let before = session.snapshot(ts(16_000));

        let err = session
            .apply(
                GameEvent::Tick {
                    elapsed: 9_000_000_000_000_000_000,
                    cashouts: BTreeMap::from([("Steve".to_string(), 120)]),
                },
                ts(16_000),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload(_)));
        assert_eq!(session.snapshot(ts(16_000)), before);

        let err = session
            .apply(
                GameEvent::Tick {
                    elapsed: i64::MIN,
                    cashouts: BTreeMap::new(),
                },
                ts(16_000),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload(_)));

        let err = session
            .apply(
                GameEvent::RoundStarting {
                    round_id: 102,
                    time_till_start: i64::MAX,
                    commitment: None,
                },
                ts(17_000),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload(_)));
        assert_eq!(session.round().unwrap().id, 101);

        let mut event = join(JoinPhase::InProgress, &[]);
        if let GameEvent::Join(snapshot) = &mut event {
            snapshot.round_id = 103;
            snapshot.elapsed = 9_000_000_000_000_000_000;
        }
        assert!(matches!(
            session.apply(event, ts(18_000)),
            Err(SessionError::InvalidPayload(_))
        ));
        assert_eq!(session.round().unwrap().id, 101);

        // The round keeps running afterwards.
        let events = ended(&mut session, SECRET_400, 400);
        assert!(matches!(events[0], SessionEvent::RoundEnded { .. }));
    }

    #[test]
    fn tick_requires_running_round() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        let err = session
            .apply(
                GameEvent::Tick {
                    elapsed: 100,
                    cashouts: BTreeMap::new(),
                },
                ts(10_100),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidRoundState { event: "tick", .. }));
    }

    #[test]
    fn ticks_apply_inline_cashouts_and_feed_estimator() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        started(&mut session, &[("Steve", 100)], 15_000);

        let mut cashouts = BTreeMap::new();
        cashouts.insert("Steve".to_string(), 110);
        let events = session
            .apply(
                GameEvent::Tick {
                    elapsed: 150,
                    cashouts,
                },
                ts(15_150),
            )
            .unwrap();
        assert!(matches!(events[0], SessionEvent::CashedOut { stopped_at: 110, .. }));
        match &events[1] {
            SessionEvent::Tick { sample, .. } => {
                assert_eq!(sample.elapsed, 150);
                assert_eq!(sample.micro, 150_000);
                assert_eq!(sample.growth, growth(150));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Tick arriving late pulls start time back.
        session
            .apply(
                GameEvent::Tick {
                    elapsed: 300,
                    cashouts: BTreeMap::new(),
                },
                ts(15_250),
            )
            .unwrap();
        assert_eq!(session.round().unwrap().start_time, ts(14_950));
        assert!(session.snapshot(ts(15_300)).next_tick.is_some());
    }

    #[test]
    fn round_end_verifies_and_marks_loss() {
        let mut session = joined_watching();
        let commitment = sha256_hex(SECRET_400);
        starting(&mut session, 101, 10_000, Some(&commitment));
        session.place_bet(100, None).unwrap();
        session
            .apply(
                GameEvent::Bet {
                    identity: "Shiba".to_string(),
                },
                ts(11_000),
            )
            .unwrap();
        started(&mut session, &[("Shiba", 100)], 15_000);

        let events = ended(&mut session, SECRET_400, 400);
        match &events[0] {
            SessionEvent::RoundEnded {
                record,
                verification,
            } => {
                assert_eq!(record.id, 101);
                assert_eq!(record.crash_point, 400);
                assert_eq!(record.verified, Some(Verdict::Ok));
                assert_eq!(verification.commitment, CommitmentCheck::Verified);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(events[1], SessionEvent::ObserverLost { round_id: 101 });
        assert_eq!(session.observer_state(), ObserverState::Crashed);
        assert_eq!(session.round().unwrap().outcome(), Some(400));
    }

    #[test]
    fn tampered_outcome_is_reported_not_thrown() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        started(&mut session, &[], 15_000);
        let events = ended(&mut session, SECRET_400, 1_000);
        match &events[0] {
            SessionEvent::RoundEnded { verification, .. } => {
                assert_eq!(verification.verdict, Verdict::Scam)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!session.snapshot(ts(31_000)).verification.unwrap().is_fair());
    }

    #[test]
    fn chain_link_checks_next_commitment() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        started(&mut session, &[], 15_000);
        ended(&mut session, SECRET_400, 400);

        let linked = session
            .apply(
                GameEvent::RoundStarting {
                    round_id: 102,
                    time_till_start: 5_000,
                    commitment: Some(SECRET_400.to_string()),
                },
                ts(31_000),
            )
            .unwrap();
        assert!(matches!(
            linked[0],
            SessionEvent::RoundStarting {
                chain: ChainLink::Linked,
                ..
            }
        ));

        let mut fresh = new_session();
        let events = fresh
            .apply(
                GameEvent::RoundStarting {
                    round_id: 1,
                    time_till_start: 5_000,
                    commitment: Some(SECRET_400.to_string()),
                },
                ts(0),
            )
            .unwrap();
        assert!(matches!(
            events[0],
            SessionEvent::RoundStarting {
                chain: ChainLink::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn tampered_chain_is_reported() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        started(&mut session, &[], 15_000);
        ended(&mut session, SECRET_400, 400);
        let events = session
            .apply(
                GameEvent::RoundStarting {
                    round_id: 102,
                    time_till_start: 5_000,
                    commitment: Some("f".repeat(64)),
                },
                ts(31_000),
            )
            .unwrap();
        assert!(matches!(
            events[0],
            SessionEvent::RoundStarting {
                chain: ChainLink::Broken,
                ..
            }
        ));
    }

    #[test]
    fn round_end_requires_running_round() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        let err = session
            .apply(
                GameEvent::RoundEnded {
                    secret: SECRET_400.to_string(),
                    outcome: 400,
                    bonuses: BTreeMap::new(),
                    forced: false,
                },
                ts(12_000),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidRoundState { .. }));
        assert_eq!(session.round().unwrap().outcome(), None);
    }

    #[test]
    fn bets_batch_expands_to_individual_bets() {
        let mut session = joined_watching();
        starting(&mut session, 101, 10_000, None);
        let events = session
            .apply(
                GameEvent::Bets {
                    identities: vec!["a".to_string(), "Shiba".to_string()],
                },
                ts(11_000),
            )
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(session.round().unwrap().players.len(), 2);
        assert_eq!(session.observer_state(), ObserverState::Placed);
    }

    #[test]
    fn events_before_join_are_rejected() {
        let mut session = new_session();
        let err = session
            .apply(
                GameEvent::Bet {
                    identity: "a".to_string(),
                },
                ts(0),
            )
            .unwrap_err();
        assert_eq!(err, SessionError::NotJoined);
        assert_eq!(session.snapshot(ts(0)), SessionSnapshot::default());
    }
}
