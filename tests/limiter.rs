//! End-to-end behaviour of `Limiter` over the in-process backends.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use sluice::store::{LocalLockCoordinator, MemoryEventRepository};
use sluice::{
    handler_fn, window, Clock, Event, EventRepository, LimitHit, Limiter, LockCoordinator,
    ManualClock, Result, RuleSpec, SluiceError, SweepTrigger,
};

fn memory_limiter(
    repository: &Arc<MemoryEventRepository>,
    lock: &Arc<LocalLockCoordinator>,
) -> sluice::LimiterBuilder<MemoryEventRepository, LocalLockCoordinator> {
    Limiter::builder(repository.clone(), lock.clone()).sweep_trigger(SweepTrigger::Never)
}

fn days_ago(days: i64) -> impl Fn() -> Option<DateTime<Utc>> + Send + Sync + 'static {
    move || Some(Utc::now() - Duration::days(days))
}

fn hours_ago(hours: i64) -> impl Fn() -> Option<DateTime<Utc>> + Send + Sync + 'static {
    move || Some(Utc::now() - Duration::hours(hours))
}

#[tokio::test]
async fn handler_invoked_when_matching_event_in_window() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    repository.insert("FivePerDay", Utc::now()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut builder = memory_limiter(&repository, &lock)
        .event_type("FivePerDay")
        .handler(
            "custom_on_limit_handler",
            handler_fn(move |hit: LimitHit| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SluiceError::handler_abort(
                        "custom_on_limit_handler",
                        format!("{} in window", hit.count),
                    ))
                }
            }),
        );
    assert_ok!(builder.limit(RuleSpec::new(1, days_ago(1)).on_limit("custom_on_limit_handler")));
    let limiter = builder.build();

    assert_err!(limiter.track().await);
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(repository.len(), 1);
}

#[tokio::test]
async fn one_per_day_limited_by_recent_event() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    repository
        .insert("OnePerDay", Utc::now() - Duration::hours(6))
        .await
        .unwrap();

    let mut builder = memory_limiter(&repository, &lock).event_type("OnePerDay");
    assert_ok!(builder.limit(RuleSpec::new(1, days_ago(1))));
    let limiter = builder.build();

    let on_limit = limiter.evaluate().await.unwrap();
    assert_eq!(on_limit.map(|h| h.name()), Some("sleep"));
    assert!(limiter.is_limited().await.unwrap());
}

#[tokio::test]
async fn other_event_types_do_not_count() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    repository
        .insert("SomeOtherLimiter", Utc::now() - Duration::hours(6))
        .await
        .unwrap();

    let mut builder = memory_limiter(&repository, &lock).event_type("OnePerDay");
    assert_ok!(builder.limit(RuleSpec::new(1, days_ago(1))));
    let limiter = builder.build();

    assert!(!limiter.is_limited().await.unwrap());
}

#[tokio::test]
async fn rules_use_their_own_window_and_max() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    repository
        .insert("ComplexLimiter", Utc::now() - Duration::hours(6))
        .await
        .unwrap();

    // Day window sees the event but allows 10; hour window allows 1 but is empty
    let mut builder = memory_limiter(&repository, &lock).event_type("ComplexLimiter");
    assert_ok!(builder.limit(RuleSpec::new(10, days_ago(1))));
    assert_ok!(builder.limit(RuleSpec::new(1, hours_ago(1))));
    let loose_first = builder.build();
    assert!(!loose_first.is_limited().await.unwrap());

    // Day window allows only 1
    let mut builder = memory_limiter(&repository, &lock).event_type("ComplexLimiter");
    assert_ok!(builder.limit(RuleSpec::new(1, days_ago(1))));
    assert_ok!(builder.limit(RuleSpec::new(10, hours_ago(1))));
    let strict_first = builder.build();
    assert!(strict_first.is_limited().await.unwrap());
}

#[tokio::test]
async fn reads_are_idempotent() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    let mut builder = memory_limiter(&repository, &lock).event_type("Reads");
    assert_ok!(builder.limit(RuleSpec::new(3, days_ago(1))));
    let limiter = builder.build();

    for _ in 0..3 {
        limiter.increment().await.unwrap();
    }

    let first = (limiter.is_limited().await.unwrap(), limiter.events().await.unwrap());
    let second = (limiter.is_limited().await.unwrap(), limiter.events().await.unwrap());
    assert_eq!(first, second);
    assert!(first.0);
    assert_eq!(first.1.len(), 3);
}

#[tokio::test]
async fn events_lists_only_own_type() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    let mut expected = Vec::new();
    for _ in 0..5 {
        expected.push(
            repository
                .insert("FivePerDay", Utc::now() - Duration::hours(6))
                .await
                .unwrap(),
        );
    }
    repository
        .insert("SomeOtherEventType", Utc::now() - Duration::hours(6))
        .await
        .unwrap();

    let limiter = memory_limiter(&repository, &lock).event_type("FivePerDay").build();
    assert_eq!(limiter.events().await.unwrap(), expected);
}

#[tokio::test]
async fn track_records_exactly_once_after_retries() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    let clock = ManualClock::new(Utc::now());
    let clock_ref: Arc<dyn Clock> = Arc::new(clock.clone());

    let advancing = clock.clone();
    let mut builder = memory_limiter(&repository, &lock)
        .event_type("Retries")
        .clock(clock_ref.clone())
        .handler(
            "wait",
            handler_fn(move |_| {
                let clock = advancing.clone();
                async move {
                    clock.advance(Duration::minutes(10));
                    Ok(())
                }
            }),
        );
    assert_ok!(builder.limit(RuleSpec {
        max_events: Some(2),
        since: Some(window(clock_ref, Duration::hours(1))),
        on_limit: Some("wait".to_string()),
    }));
    let limiter = builder.build();

    limiter.track().await.unwrap();
    limiter.track().await.unwrap();
    let before = limiter.events().await.unwrap().len();
    limiter.track().await.unwrap();
    assert_eq!(limiter.events().await.unwrap().len(), before + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_track_never_double_admits() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    let mut builder = memory_limiter(&repository, &lock)
        .event_type("OneOnly")
        .handler(
            "reject",
            handler_fn(|_| async { Err(SluiceError::handler_abort("reject", "at quota")) }),
        );
    assert_ok!(builder.limit(RuleSpec::new(1, days_ago(1)).on_limit("reject")));
    let limiter = Arc::new(builder.build());

    let attempts = (0..16).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.track().await })
    });
    let results: Vec<Result<Event>> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(limiter.events().await.unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_failure_does_not_fail_track() {
    let lock = Arc::new(LocalLockCoordinator::new());
    let repository = Arc::new(NoDeletes::default());
    let limiter = Limiter::builder(repository.clone(), lock)
        .event_type("Sweeping")
        .sweep_trigger(SweepTrigger::Always)
        .build();

    assert_ok!(limiter.track().await);
    assert_err!(limiter.sweep().await);
    assert_eq!(repository.inner.len(), 1);
}

#[tokio::test]
async fn lock_failure_records_nothing() {
    let repository = Arc::new(MemoryEventRepository::new());
    let limiter = Limiter::builder(repository.clone(), Arc::new(Unavailable))
        .event_type("Locked")
        .sweep_trigger(SweepTrigger::Never)
        .build();

    let err = limiter.track().await.unwrap_err();
    assert!(matches!(err, SluiceError::Lock(_)));
    assert!(repository.is_empty());
}

#[tokio::test]
async fn per_event_type_locks_keep_types_independent() {
    let repository = Arc::new(MemoryEventRepository::new());
    let lock = Arc::new(LocalLockCoordinator::new());
    let settings = sluice::LimiterSettings {
        lock_per_event_type: true,
        ..Default::default()
    };

    let a = memory_limiter(&repository, &lock)
        .settings(settings.clone())
        .event_type("A")
        .build();
    let b = memory_limiter(&repository, &lock)
        .settings(settings)
        .event_type("B")
        .build();

    // Holding A's lock does not stop B from tracking
    let recorded = lock
        .with_lock(&a.settings().lock_name_for("A"), async { b.track().await })
        .await
        .unwrap();
    assert_eq!(recorded.event_type, "B");
}

/// Wraps the memory repository but refuses to delete.
#[derive(Default)]
struct NoDeletes {
    inner: MemoryEventRepository,
}

#[async_trait]
impl EventRepository for NoDeletes {
    async fn insert(&self, event_type: &str, occurred_at: DateTime<Utc>) -> Result<Event> {
        self.inner.insert(event_type, occurred_at).await
    }

    async fn count_since(&self, event_type: &str, since: DateTime<Utc>) -> Result<u64> {
        self.inner.count_since(event_type, since).await
    }

    async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Err(SluiceError::Storage("delete not permitted".to_string()))
    }

    async fn list_by_type(&self, event_type: &str) -> Result<Vec<Event>> {
        self.inner.list_by_type(event_type).await
    }
}

/// Lock backend whose store is unreachable.
struct Unavailable;

#[async_trait]
impl LockCoordinator for Unavailable {
    async fn with_lock<T, F>(&self, name: &str, _body: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send,
    {
        Err(SluiceError::Lock(format!("cannot reach lock '{}'", name)))
    }
}
