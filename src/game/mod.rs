pub mod events;
pub mod session;
pub mod tick_estimator;

pub use events::{GameEvent, JoinPhase, JoinSnapshot, OutboundIntent, SessionEvent};
pub use session::{GameSession, SessionSnapshot};
