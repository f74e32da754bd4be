//! Actions taken when a rule is at quota.
//!
//! Handlers are named at registration time and resolved against the
//! limiter's [`HandlerTable`]. The only built-in is `sleep`, which waits a
//! short fixed interval and lets the tracking loop re-evaluate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SluiceError};

/// Name of the built-in sleeping handler.
pub const SLEEP: &str = "sleep";

/// Default interval the `sleep` handler waits before re-evaluating.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Details of the rule that stopped a `track()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitHit {
    /// Event type being tracked
    pub event_type: String,
    /// Position of the rule in registration order
    pub rule_index: usize,
    /// The rule's maximum
    pub max_events: u64,
    /// Events counted inside the rule's window
    pub count: u64,
    /// How many times a handler has run during this `track()` call, starting at 1
    pub attempt: u32,
}

/// A custom on_limit action.
///
/// Runs while the limiter holds its lock. Returning `Ok(())` makes the
/// limiter re-evaluate its rules; returning an error aborts `track()` without
/// recording an event.
#[async_trait]
pub trait LimitHandler: Send + Sync {
    async fn on_limit(&self, hit: &LimitHit) -> Result<()>;
}

/// Adapter turning an async closure into a [`LimitHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(LimitHit) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> LimitHandler for FnHandler<F>
where
    F: Fn(LimitHit) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn on_limit(&self, hit: &LimitHit) -> Result<()> {
        (self.0)(hit.clone()).await
    }
}

/// A resolved on_limit action.
#[derive(Clone)]
pub enum OnLimit {
    /// Wait for the interval, then re-evaluate
    Sleep(Duration),
    /// Call a handler registered on the limiter
    Custom {
        name: String,
        handler: Arc<dyn LimitHandler>,
    },
}

impl OnLimit {
    /// The name this action was registered under.
    pub fn name(&self) -> &str {
        match self {
            OnLimit::Sleep(_) => SLEEP,
            OnLimit::Custom { name, .. } => name,
        }
    }

    /// Run the action once.
    pub async fn invoke(&self, hit: &LimitHit) -> Result<()> {
        match self {
            OnLimit::Sleep(interval) => {
                tokio::time::sleep(*interval).await;
                Ok(())
            }
            OnLimit::Custom { handler, .. } => handler.on_limit(hit).await,
        }
    }
}

impl fmt::Debug for OnLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnLimit::Sleep(interval) => f.debug_tuple("Sleep").field(interval).finish(),
            OnLimit::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

impl PartialEq for OnLimit {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OnLimit::Sleep(a), OnLimit::Sleep(b)) => a == b,
            (
                OnLimit::Custom { name: a, handler: ha },
                OnLimit::Custom { name: b, handler: hb },
            ) => a == b && Arc::ptr_eq(ha, hb),
            _ => false,
        }
    }
}

/// The named actions a limiter's rules may refer to.
///
/// A custom handler registered as `"sleep"` replaces the built-in one.
#[derive(Clone)]
pub struct HandlerTable {
    sleep_interval: Duration,
    custom: HashMap<String, Arc<dyn LimitHandler>>,
}

impl HandlerTable {
    /// Create a table containing only the built-in `sleep` handler.
    pub fn new(sleep_interval: Duration) -> Self {
        Self {
            sleep_interval,
            custom: HashMap::new(),
        }
    }

    /// Register a custom handler under `name`.
    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn LimitHandler>) {
        self.custom.insert(name.into(), handler);
    }

    /// Change the interval used by the built-in `sleep` handler.
    pub fn set_sleep_interval(&mut self, interval: Duration) {
        self.sleep_interval = interval;
    }

    /// Resolve a handler name, defaulting to `sleep`.
    pub fn resolve(&self, name: Option<&str>) -> Result<OnLimit> {
        let name = name.unwrap_or(SLEEP);
        if let Some(handler) = self.custom.get(name) {
            return Ok(OnLimit::Custom {
                name: name.to_string(),
                handler: Arc::clone(handler),
            });
        }
        if name == SLEEP {
            return Ok(OnLimit::Sleep(self.sleep_interval));
        }
        Err(SluiceError::UnknownLimitHandler(name.to_string()))
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new(DEFAULT_SLEEP_INTERVAL)
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("HandlerTable")
            .field("sleep_interval", &self.sleep_interval)
            .field("custom", &names)
            .finish()
    }
}
