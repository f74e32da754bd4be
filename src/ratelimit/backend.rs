//! Storage and coordination traits consumed by the limiter.
//!
//! The limiter never talks to a database directly. It reads and appends
//! events through an [`EventRepository`] and serializes its check-then-record
//! section through a [`LockCoordinator`]. `crate::store` has in-process and
//! PostgreSQL implementations of both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::Result;

/// A recorded occurrence of an event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Storage-assigned identifier
    pub id: i64,
    /// The event type this occurrence counts against
    pub event_type: String,
    /// When the event happened
    pub occurred_at: DateTime<Utc>,
}

/// Append-only log of events.
///
/// Implementations must be safe to call concurrently; all gating decisions
/// are made by the limiter under a [`LockCoordinator`] lock.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append an event of `event_type` at `occurred_at`.
    async fn insert(&self, event_type: &str, occurred_at: DateTime<Utc>) -> Result<Event>;

    /// Count events of `event_type` with `occurred_at >= since`.
    async fn count_since(&self, event_type: &str, since: DateTime<Utc>) -> Result<u64>;

    /// Delete events of every type with `occurred_at < cutoff`.
    ///
    /// Returns the number of rows removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// All events of `event_type`, in the repository's natural order.
    async fn list_by_type(&self, event_type: &str) -> Result<Vec<Event>>;
}

/// Named mutual exclusion shared by every process using the same backing
/// store.
///
/// `with_lock` must release the lock on every exit path of `body`, including
/// errors and panics, and the backing mechanism must drop the lock if the
/// holding process dies.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Run `body` while holding the lock called `name`.
    async fn with_lock<T, F>(&self, name: &str, body: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send;
}
