//! Stream sessions and their delivery to listeners.
//!
//! A `StreamSession` is the live, cancellable orchestration of one AI response.
//! The `StreamRegistry` guarantees at most one non-terminal session per chat,
//! and `delivery` replays and tails a session's sequenced events.

pub mod delivery;
mod events;
mod registry;
mod session;

pub use delivery::{subscribe, Delivery, EventSubscription};
pub use events::{EventKind, StreamEvent};
pub use registry::StreamRegistry;
pub use session::{StreamSession, StreamState};
