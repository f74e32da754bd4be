//! Rule evaluation, gating and recording.

mod backend;
mod handler;
mod limiter;
pub mod rules;
pub mod sweep;

pub use backend::{Event, EventRepository, LockCoordinator};
pub use handler::{
    handler_fn, FnHandler, HandlerTable, LimitHandler, LimitHit, OnLimit, DEFAULT_SLEEP_INTERVAL,
    SLEEP,
};
pub use limiter::{Limiter, LimiterBuilder};
pub use rules::{window, LimiterDefinition, Rule, RuleConfig, RuleSet, RuleSpec, SinceFn, TimeUnit};
pub use sweep::SweepTrigger;
