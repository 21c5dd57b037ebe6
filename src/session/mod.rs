//! # Session Domain
//!
//! In-memory session lifecycle and listener membership tracking:
//! - **store**: session records keyed by a short shareable code
//! - **listeners**: which connections are subscribed to which session

pub mod listeners;
pub mod store;

pub use listeners::ListenerRegistry;
pub use store::{AvatarSettings, CreateSessionRequest, Session, SessionStore};
