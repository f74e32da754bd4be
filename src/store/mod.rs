//! Event store and lock backends.
//!
//! The in-process backends serve tests and single-process deployments. The
//! PostgreSQL backends share both the event log and the lock between every
//! process connected to the same database.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::{LocalLockCoordinator, MemoryEventRepository};
#[cfg(feature = "postgres")]
pub use postgres::{connect, PgEventRepository, PgLockCoordinator};
