//! In-process event log and lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::ratelimit::{Event, EventRepository, LockCoordinator};

/// Event log held in memory, in insertion order.
#[derive(Debug, Default)]
pub struct MemoryEventRepository {
    events: RwLock<Vec<Event>>,
    next_id: AtomicI64,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events of every type.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn insert(&self, event_type: &str, occurred_at: DateTime<Utc>) -> Result<Event> {
        let event = Event {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            event_type: event_type.to_string(),
            occurred_at,
        };
        self.events.write().push(event.clone());
        Ok(event)
    }

    async fn count_since(&self, event_type: &str, since: DateTime<Utc>) -> Result<u64> {
        let events = self.events.read();
        let count = events
            .iter()
            .filter(|e| e.event_type == event_type && e.occurred_at >= since)
            .count();
        Ok(count as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.occurred_at >= cutoff);
        Ok((before - events.len()) as u64)
    }

    async fn list_by_type(&self, event_type: &str) -> Result<Vec<Event>> {
        let events = self.events.read();
        Ok(events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect())
    }
}

/// Named locks shared by everything in this process.
///
/// Guards are dropped on every exit path of the body, including panics.
#[derive(Debug, Default)]
pub struct LocalLockCoordinator {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

#[async_trait]
impl LockCoordinator for LocalLockCoordinator {
    async fn with_lock<T, F>(&self, name: &str, body: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send,
    {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        trace!(lock = name, "Acquired local lock");
        body.await
    }
}
