//! Host-authoritative game sessions over peer data channels

mod coordinator;
mod event;
mod handle;
mod message;
mod rules;
mod state;

pub use coordinator::SessionCoordinator;
pub use event::{SessionError, SessionEvent};
pub use handle::{SessionCommand, SessionHandle};
pub use message::{ActionRequest, DataMessage};
pub use rules::{GameRules, TurnPolicy};
pub use state::{ApplyOutcome, SessionState, StateKind, StateView};
