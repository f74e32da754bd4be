//! Rate rules: registration, validation and per-rule quota evaluation.
//!
//! A rule says "at most `max_events` events since `since()`". Rules are kept
//! in registration order, which is also evaluation order: when several rules
//! are at quota at once, the first one registered decides the action.
//!
//! Rules can be registered programmatically through [`RuleSpec`] or declared
//! in YAML as a [`LimiterDefinition`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, trace};

use super::backend::EventRepository;
use super::handler::{HandlerTable, OnLimit};
use crate::clock::Clock;
use crate::error::{Result, SluiceError};

/// Window start function. Re-invoked on every check so windows slide.
///
/// Returning `None` means the function could not produce a timestamp, which
/// is rejected at registration and reported as an error at evaluation time.
pub type SinceFn = Arc<dyn Fn() -> Option<DateTime<Utc>> + Send + Sync>;

/// Sliding window covering the last `length` of `clock` time.
pub fn window(clock: Arc<dyn Clock>, length: Duration) -> SinceFn {
    Arc::new(move || clock.now().checked_sub_signed(length))
}

/// Time unit for declarative rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl TimeUnit {
    /// Length of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::seconds(1),
            TimeUnit::Minute => Duration::minutes(1),
            TimeUnit::Hour => Duration::hours(1),
            TimeUnit::Day => Duration::days(1),
            TimeUnit::Week => Duration::weeks(1),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(TimeUnit::Second),
            "m" | "min" | "minute" | "minutes" => Ok(TimeUnit::Minute),
            "h" | "hour" | "hours" => Ok(TimeUnit::Hour),
            "d" | "day" | "days" => Ok(TimeUnit::Day),
            "w" | "week" | "weeks" => Ok(TimeUnit::Week),
            other => Err(SluiceError::Config(format!("unknown time unit '{}'", other))),
        }
    }
}

/// A rule as written in configuration.
///
/// `max_events` is signed and optional so that bad input reaches the same
/// validation as programmatic registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub max_events: Option<i64>,
    /// Number of units in the window
    #[serde(default = "default_every")]
    pub every: u32,
    pub unit: TimeUnit,
    #[serde(default)]
    pub on_limit: Option<String>,
}

fn default_every() -> u32 {
    1
}

impl RuleConfig {
    /// Total length of the window.
    ///
    /// Fails for an empty window or one too long to represent.
    pub fn window(&self) -> Result<Duration> {
        if self.every == 0 {
            return Err(SluiceError::Config(
                "rule window must span at least one unit".to_string(),
            ));
        }
        i32::try_from(self.every)
            .ok()
            .and_then(|every| self.unit.duration().checked_mul(every))
            .ok_or_else(|| {
                SluiceError::Config(format!(
                    "rule window of {} {:?} units is too long",
                    self.every, self.unit
                ))
            })
    }

    /// Turn this into a registrable spec whose window is measured on `clock`.
    pub fn to_spec(&self, clock: Arc<dyn Clock>) -> Result<RuleSpec> {
        Ok(RuleSpec {
            max_events: self.max_events,
            since: Some(window(clock, self.window()?)),
            on_limit: self.on_limit.clone(),
        })
    }
}

/// Parses `MAX/UNIT` or `MAX/EVERYUNIT`, e.g. `5/day` or `100/15m`.
impl FromStr for RuleConfig {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        let (max, window) = s
            .split_once('/')
            .ok_or_else(|| SluiceError::Config(format!("rule '{}' is not MAX/WINDOW", s)))?;

        let max_events = max
            .trim()
            .parse::<i64>()
            .map_err(|_| SluiceError::InvalidMaxEvents(None))?;

        let window = window.trim();
        let split = window
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(window.len());
        let (every, unit) = window.split_at(split);
        let every = if every.is_empty() {
            1
        } else {
            every
                .parse::<u32>()
                .map_err(|e| SluiceError::Config(format!("rule '{}': {}", s, e)))?
        };
        let rule = RuleConfig {
            max_events: Some(max_events),
            every,
            unit: unit.parse()?,
            on_limit: None,
        };
        rule.window()
            .map_err(|e| SluiceError::Config(format!("rule '{}': {}", s, e)))?;
        Ok(rule)
    }
}

/// A named limiter as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterDefinition {
    pub event_type: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl LimiterDefinition {
    /// Load definitions from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter definitions");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load definitions from a YAML string holding one definition or a list.
    pub fn from_yaml(yaml: &str) -> Result<Vec<Self>> {
        if let Ok(single) = serde_yaml::from_str::<LimiterDefinition>(yaml) {
            return Ok(vec![single]);
        }

        serde_yaml::from_str(yaml).map_err(|e| {
            SluiceError::Config(format!("Failed to parse limiter definitions: {}", e))
        })
    }
}

/// Unvalidated rule registration input.
#[derive(Clone, Default)]
pub struct RuleSpec {
    pub max_events: Option<i64>,
    pub since: Option<SinceFn>,
    pub on_limit: Option<String>,
}

impl RuleSpec {
    /// At most `max_events` events since `since()`, handled by `sleep`.
    pub fn new<F>(max_events: i64, since: F) -> Self
    where
        F: Fn() -> Option<DateTime<Utc>> + Send + Sync + 'static,
    {
        Self {
            max_events: Some(max_events),
            since: Some(Arc::new(since)),
            on_limit: None,
        }
    }

    /// Name the handler to run when this rule is at quota.
    pub fn on_limit(mut self, handler: impl Into<String>) -> Self {
        self.on_limit = Some(handler.into());
        self
    }
}

/// A validated, immutable rule.
#[derive(Clone)]
pub struct Rule {
    max_events: u64,
    since: SinceFn,
    on_limit: OnLimit,
}

impl Rule {
    pub fn max_events(&self) -> u64 {
        self.max_events
    }

    /// Evaluate the window start now.
    pub fn window_start(&self) -> Result<DateTime<Utc>> {
        (self.since)().ok_or_else(|| {
            SluiceError::InvalidSinceFunction("window start could not be computed".to_string())
        })
    }

    pub fn on_limit(&self) -> &OnLimit {
        &self.on_limit
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("max_events", &self.max_events)
            .field("on_limit", &self.on_limit)
            .finish_non_exhaustive()
    }
}

/// The first rule found at quota.
#[derive(Debug)]
pub struct QuotaHit<'a> {
    pub index: usize,
    pub rule: &'a Rule,
    pub count: u64,
}

/// Rules for one event type, in registration order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `spec` and append it.
    ///
    /// Checks run in order: max_events, since (probed once), on_limit. On
    /// failure nothing is appended. Returns the probed window start.
    pub fn register(&mut self, spec: RuleSpec, handlers: &HandlerTable) -> Result<DateTime<Utc>> {
        let max_events = match spec.max_events {
            Some(n) if n >= 1 => n as u64,
            other => return Err(SluiceError::InvalidMaxEvents(other)),
        };

        let since = spec
            .since
            .ok_or_else(|| SluiceError::InvalidSinceFunction("since is required".to_string()))?;
        let probed = since().ok_or_else(|| {
            SluiceError::InvalidSinceFunction("since did not return a timestamp".to_string())
        })?;

        let on_limit = handlers.resolve(spec.on_limit.as_deref())?;

        self.rules.push(Rule {
            max_events,
            since,
            on_limit,
        });
        Ok(probed)
    }

    /// Find the first rule, in registration order, whose window already holds
    /// `max_events` events of `event_type`.
    ///
    /// Each rule computes its own window start when it is reached.
    pub async fn evaluate<R>(&self, repository: &R, event_type: &str) -> Result<Option<QuotaHit<'_>>>
    where
        R: EventRepository + ?Sized,
    {
        for (index, rule) in self.rules.iter().enumerate() {
            let since = rule.window_start()?;
            let count = repository.count_since(event_type, since).await?;

            trace!(
                event_type = event_type,
                rule = index,
                since = %since,
                count = count,
                max_events = rule.max_events,
                "Evaluated rule"
            );

            if count >= rule.max_events {
                return Ok(Some(QuotaHit { index, rule, count }));
            }
        }
        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Rule> {
        self.rules.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}
