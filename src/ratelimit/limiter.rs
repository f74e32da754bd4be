//! The limiter: quota evaluation and the locked track/record cycle.

use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::backend::{Event, EventRepository, LockCoordinator};
use super::handler::{HandlerTable, LimitHandler, LimitHit, OnLimit};
use super::rules::{LimiterDefinition, RuleSet, RuleSpec};
use super::sweep::SweepTrigger;
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterSettings;
use crate::error::{Result, SluiceError};

/// Gatekeeper for one event type.
///
/// Built once through [`LimiterBuilder`] and immutable afterwards, so it can
/// be shared behind an `Arc` between tasks.
pub struct Limiter<R: ?Sized, L> {
    event_type: Option<String>,
    rules: RuleSet,
    repository: Arc<R>,
    lock: Arc<L>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
    sweep_trigger: SweepTrigger,
    /// track() calls, used by the sweep trigger
    calls: AtomicU64,
}

impl<R, L> Limiter<R, L>
where
    R: EventRepository + ?Sized,
    L: LockCoordinator,
{
    /// Start configuring a limiter over `repository` and `lock`.
    pub fn builder(repository: Arc<R>, lock: Arc<L>) -> LimiterBuilder<R, L> {
        LimiterBuilder::new(repository, lock)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    fn require_event_type(&self) -> Result<&str> {
        self.event_type().ok_or(SluiceError::EventTypeNotSet)
    }

    /// The handler of the first rule at quota, or `None` if no rule is.
    ///
    /// Unlocked read; only `track()` pairs it with a write atomically.
    pub async fn evaluate(&self) -> Result<Option<&OnLimit>> {
        let event_type = self.require_event_type()?;
        let hit = self.rules.evaluate(&*self.repository, event_type).await?;
        Ok(hit.map(|hit| hit.rule.on_limit()))
    }

    /// Whether any rule is at quota.
    pub async fn is_limited(&self) -> Result<bool> {
        Ok(self.evaluate().await?.is_some())
    }

    /// Wait until every rule allows another event, then record one.
    ///
    /// The evaluate loop and the insert run under the coordinator lock, so
    /// no other `track()` sharing the lock can slip an event in between.
    /// Handler errors abort the call without recording.
    pub async fn track(&self) -> Result<Event> {
        let event_type = self.require_event_type()?;

        if self.sweep_trigger.fires(&self.calls) {
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "Stale event sweep failed");
            }
        }

        let lock_name = self.settings.lock_name_for(event_type);
        self.lock
            .with_lock(&lock_name, async {
                let mut attempt = 0u32;
                while let Some(hit) = self.rules.evaluate(&*self.repository, event_type).await? {
                    attempt += 1;
                    let on_limit = hit.rule.on_limit();
                    debug!(
                        event_type = event_type,
                        rule = hit.index,
                        count = hit.count,
                        max_events = hit.rule.max_events(),
                        handler = on_limit.name(),
                        attempt = attempt,
                        "Rate limit reached"
                    );

                    let limit_hit = LimitHit {
                        event_type: event_type.to_string(),
                        rule_index: hit.index,
                        max_events: hit.rule.max_events(),
                        count: hit.count,
                        attempt,
                    };
                    on_limit.invoke(&limit_hit).await?;
                }

                let event = self.repository.insert(event_type, self.clock.now()).await?;
                trace!(event_type = event_type, id = event.id, "Recorded event");
                Ok(event)
            })
            .await
    }

    /// Record an event without checking any rule or taking the lock.
    pub async fn increment(&self) -> Result<Event> {
        let event_type = self.require_event_type()?;
        self.repository.insert(event_type, self.clock.now()).await
    }

    /// All recorded events of this limiter's type.
    pub async fn events(&self) -> Result<Vec<Event>> {
        let event_type = self.require_event_type()?;
        self.repository.list_by_type(event_type).await
    }

    /// Delete events of every type older than the retention horizon.
    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = retention_horizon(self.clock.now(), &self.settings);
        let removed = self.repository.delete_older_than(cutoff).await?;
        info!(cutoff = %cutoff, removed = removed, "Swept stale events");
        Ok(removed)
    }
}

fn retention_horizon(now: DateTime<Utc>, settings: &LimiterSettings) -> DateTime<Utc> {
    now.checked_sub_signed(settings.retention())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Accumulates the configuration of a [`Limiter`].
///
/// Handlers must be added before rules that name them. Rule registration
/// validates immediately; a rejected rule leaves the builder unchanged.
pub struct LimiterBuilder<R: ?Sized, L> {
    event_type: Option<String>,
    rules: RuleSet,
    handlers: HandlerTable,
    repository: Arc<R>,
    lock: Arc<L>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
    sweep_trigger: Option<SweepTrigger>,
}

impl<R, L> LimiterBuilder<R, L>
where
    R: EventRepository + ?Sized,
    L: LockCoordinator,
{
    pub fn new(repository: Arc<R>, lock: Arc<L>) -> Self {
        let settings = LimiterSettings::default();
        Self {
            event_type: None,
            rules: RuleSet::new(),
            handlers: HandlerTable::new(settings.sleep_interval()),
            repository,
            lock,
            clock: Arc::new(SystemClock::new()),
            settings,
            sweep_trigger: None,
        }
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Apply shared settings. Affects rules registered afterwards.
    pub fn settings(mut self, settings: LimiterSettings) -> Self {
        self.handlers.set_sleep_interval(settings.sleep_interval());
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the sweep trigger derived from the settings.
    pub fn sweep_trigger(mut self, trigger: SweepTrigger) -> Self {
        self.sweep_trigger = Some(trigger);
        self
    }

    /// Make `handler` available to rules as `name`.
    pub fn handler(mut self, name: impl Into<String>, handler: impl LimitHandler + 'static) -> Self {
        self.handlers.insert(name, Arc::new(handler));
        self
    }

    /// Register a rule.
    pub fn limit(&mut self, spec: RuleSpec) -> Result<&mut Self> {
        let window_start = self.rules.register(spec, &self.handlers)?;

        let horizon = retention_horizon(self.clock.now(), &self.settings);
        if window_start < horizon {
            warn!(
                event_type = self.event_type.as_deref().unwrap_or_default(),
                window_start = %window_start,
                "Rule window reaches past the retention horizon; swept events will not be counted"
            );
        }
        Ok(self)
    }

    /// Set the event type and register every rule of a declared limiter.
    ///
    /// Stops at the first invalid rule; rules before it stay registered.
    pub fn define(&mut self, definition: &LimiterDefinition) -> Result<&mut Self> {
        self.event_type = Some(definition.event_type.clone());
        for rule in &definition.rules {
            self.limit(rule.to_spec(self.clock.clone())?)?;
        }
        Ok(self)
    }

    pub fn build(self) -> Limiter<R, L> {
        Limiter {
            event_type: self.event_type,
            rules: self.rules,
            repository: self.repository,
            lock: self.lock,
            clock: self.clock,
            sweep_trigger: self
                .sweep_trigger
                .unwrap_or_else(|| self.settings.sweep_trigger()),
            settings: self.settings,
            calls: AtomicU64::new(0),
        }
    }
}
