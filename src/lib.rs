//! Sluice - multi-rule sliding-window rate limiting over a shared event log
//!
//! A [`Limiter`] guards one event type with an ordered list of rules, each
//! allowing at most N events since a window start. `track()` waits (or runs a
//! custom handler) until every rule has room, then records the event. The
//! check and the record happen under a lock shared by every process using the
//! same store, so concurrent callers cannot over-admit.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{LimiterSettings, SluiceConfig};
pub use error::{Result, SluiceError};
pub use ratelimit::{
    handler_fn, window, Event, EventRepository, LimitHandler, LimitHit, Limiter, LimiterBuilder,
    LockCoordinator, OnLimit, RuleSpec, SweepTrigger,
};
