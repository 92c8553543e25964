pub mod health;
pub mod history;
pub mod session;

use crate::config::Config;
use crate::db::Database;
use crate::models::{ChatEvent, RoundRecord};
use crate::services::{SessionHandle, SharedStore};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub session: SessionHandle,
    pub rounds: SharedStore<RoundRecord>,
    pub chat: SharedStore<ChatEvent>,
}

/// Clamps a requested page size to `1..=max`, defaulting to `max`.
pub(crate) fn page_size(requested: Option<usize>, max: usize) -> usize {
    requested.unwrap_or(max).clamp(1, max.max(1))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::test_config;
    use crate::constants::DEFAULT_PUBLIC_SEED;
    use crate::crypto::fairness::FairnessVerifier;
    use crate::game::GameSession;
    use crate::services::{HistoryStore, SessionDriver};
    use crate::transport::IntentSink;

    /// State backed by in-memory stores and a driver that is never run.
    pub fn app_state() -> AppState {
        let config = test_config("postgres://localhost:1/crash");
        let rounds = HistoryStore::new("rounds", config.game_history, None).shared();
        let chat = HistoryStore::new("chat", config.chat_history, None).shared();
        let (_driver, session) = SessionDriver::new(
            GameSession::new(FairnessVerifier::new(DEFAULT_PUBLIC_SEED), config.tick_window),
            rounds.clone(),
            chat.clone(),
            IntentSink::new(Vec::new()),
        );
        AppState {
            db: Database::lazy(&config),
            config,
            session,
            rounds,
            chat,
        }
    }
}
