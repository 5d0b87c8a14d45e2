//! Conversation sessions: data model, state controller, persistence glue.

pub mod controller;
pub mod debounce;
pub mod memory_box;
pub mod types;

pub use controller::{ACTIVE_SESSION_KEY, EditOutcome, SessionController};
pub use types::{
    Message, MessageId, Role, Session, SessionId, SessionSettings, SessionSummary,
};
