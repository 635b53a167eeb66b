//! Connection pool for user-configured external databases.
//!
//! Handles are dialed lazily on first acquire, reused through a per-connection
//! free-list, and proactively evicted by a background health checker.

mod connector;
mod health;
mod manager;

pub use connector::{Connector, EngineConnector};
pub use manager::{PoolManager, PoolStats, PooledHandle};
