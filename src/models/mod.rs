// src/models/mod.rs
pub mod block;
pub mod chat;
pub mod game;
pub mod identity;
pub mod response;

pub use block::Block;
pub use chat::{ChatEvent, ChatKind};
pub use game::{ObserverState, Round, RoundRecord, RoundState, RoundTotals, TickSample, Wager};
pub use identity::Identity;
pub use response::ApiResponse;
