//! PostgreSQL event log and advisory lock.
//!
//! Events live in `rate_limited_events`. The lock is a session-level
//! `pg_advisory_lock` taken on a dedicated pooled connection, so the server
//! drops it if the holding process dies or the session is closed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::Row;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{Result, SluiceError};
use super::LocalLockCoordinator;
use crate::ratelimit::{Event, EventRepository, LockCoordinator};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS rate_limited_events (
    id BIGSERIAL PRIMARY KEY,
    event_type TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS rate_limited_events_event_type_occurred_at_idx \
    ON rate_limited_events (event_type, occurred_at)";

/// Open a connection pool from configuration.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| SluiceError::Config("database.url is not set".to_string()))?;

    // One connection holds the advisory lock while the body queries on another
    let max_connections = config.max_connections.max(2);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    info!(max_connections = max_connections, "Connected to event store");
    Ok(pool)
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    Ok(Event {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

/// Event log stored in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgEventRepository {
    pool: PgPool,
}

impl PgEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the events table and its `(event_type, occurred_at)` index if
    /// they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        info!("Event store schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn insert(&self, event_type: &str, occurred_at: DateTime<Utc>) -> Result<Event> {
        let row = sqlx::query(
            "INSERT INTO rate_limited_events (event_type, occurred_at) VALUES ($1, $2) \
             RETURNING id, event_type, occurred_at",
        )
        .bind(event_type)
        .bind(occurred_at)
        .fetch_one(&self.pool)
        .await?;
        event_from_row(&row)
    }

    async fn count_since(&self, event_type: &str, since: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limited_events WHERE event_type = $1 AND occurred_at >= $2",
        )
        .bind(event_type)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limited_events WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_by_type(&self, event_type: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT id, event_type, occurred_at FROM rate_limited_events \
             WHERE event_type = $1 ORDER BY id",
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}

/// Cross-process lock backed by PostgreSQL advisory locks.
///
/// Lock names are hashed with `hashtext`, so every process connected to the
/// same database agrees on the key. Callers in one process queue on a local
/// lock first, so at most one pooled connection per name waits on the server
/// while the holder's body still has connections to work with.
#[derive(Debug, Clone)]
pub struct PgLockCoordinator {
    pool: PgPool,
    local: Arc<LocalLockCoordinator>,
}

impl PgLockCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            local: Arc::new(LocalLockCoordinator::new()),
        }
    }

    async fn with_advisory_lock<T, F>(&self, name: &str, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| SluiceError::Lock(format!("no connection for lock '{}': {}", name, e)))?;
        let mut session = LockSession(Some(conn));

        sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
            .bind(name)
            .execute(session.conn()?)
            .await
            .map_err(|e| SluiceError::Lock(format!("failed to acquire '{}': {}", name, e)))?;
        debug!(lock = name, "Acquired advisory lock");

        let result = body.await;

        let unlocked: std::result::Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(name)
                .fetch_one(session.conn()?)
                .await;
        match unlocked {
            Ok(true) => {
                debug!(lock = name, "Released advisory lock");
                session.keep();
            }
            Ok(false) => warn!(lock = name, "Advisory lock was not held at release; closing session"),
            Err(e) => warn!(lock = name, error = %e, "Advisory unlock failed; closing session"),
        }

        result
    }
}

/// Connection that may hold an advisory lock.
///
/// Unless handed back with `keep()` after a clean unlock, the connection is
/// detached from the pool and closed on drop, which ends the session and
/// releases the lock. This covers body panics and a cancelled `with_lock`.
struct LockSession(Option<PoolConnection<Postgres>>);

impl LockSession {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.0
            .as_deref_mut()
            .ok_or_else(|| SluiceError::Lock("lock session already closed".to_string()))
    }

    fn keep(mut self) {
        drop(self.0.take());
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        if let Some(conn) = self.0.take() {
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl LockCoordinator for PgLockCoordinator {
    async fn with_lock<T, F>(&self, name: &str, body: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send,
    {
        self.local
            .with_lock(name, self.with_advisory_lock(name, body))
            .await
    }
}
