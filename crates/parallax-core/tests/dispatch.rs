//! Integration tests for the capture, dispatch and replay cycle.
//!
//! Each test owns its own parallelized functions and counters so tests can run
//! concurrently in one binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use parallax_core::{
    Backend, CompletionMode, EnvState, Error, JobHandle, JobSpec, MemoryCache, Notifier,
    Parallelized, ParallelizedEnvironment, PersistentCache, PoolBackend, Result, SyncBackend,
    cached,
};

// =============================================================================
// Test Helpers
// =============================================================================

/// Body of every counted `add`: memoized, counting real executions.
fn counted_add(name: &str, counter: &AtomicUsize, a: i64, b: i64) -> i64 {
    cached(name, &(a, b), || {
        counter.fetch_add(1, Ordering::SeqCst);
        a + b
    })
}

fn memory_cache() -> Arc<dyn PersistentCache> {
    Arc::new(MemoryCache::new())
}

/// Backend that records the job spec it was given, then runs it synchronously.
#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<JobSpec>>,
}

impl Backend for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    fn mode(&self) -> CompletionMode {
        CompletionMode::Poll
    }

    fn start(
        &self,
        cache: Arc<dyn PersistentCache>,
        jobs: JobSpec,
        notifier: Option<Notifier>,
    ) -> Result<Vec<JobHandle>> {
        self.seen.lock().unwrap().push(jobs.clone());
        SyncBackend.start(cache, jobs, notifier)
    }

    fn prune(&self, handles: &[JobHandle]) -> Result<Vec<JobHandle>> {
        SyncBackend.prune(handles)
    }

    fn wait(&self, handle: &JobHandle) -> Result<()> {
        SyncBackend.wait(handle)
    }
}

// =============================================================================
// Fallback: no backend
// =============================================================================

static FALLBACK_CALLS: AtomicUsize = AtomicUsize::new(0);

static FALLBACK_ADD: LazyLock<Parallelized<(i64, i64), i64>> = LazyLock::new(|| {
    Parallelized::new("dispatch::fallback_add", |(a, b): (i64, i64)| {
        counted_add("dispatch::fallback_add", &FALLBACK_CALLS, a, b)
    })
    .routing_key(|(a, _)| *a)
});

#[test]
fn test_fallback_runs_calls_directly() {
    let mut env = ParallelizedEnvironment::new(None).unwrap();
    let mut results = Vec::new();
    let mut passes = 0;

    while env.advance().unwrap() {
        passes += 1;
        results = vec![
            FALLBACK_ADD.call((1, 2)),
            FALLBACK_ADD.call((3, 4)),
            FALLBACK_ADD.call((5, 6)),
        ];
    }

    assert_eq!(passes, 1);
    assert_eq!(results, vec![3, 7, 11]);
    assert_eq!(FALLBACK_CALLS.load(Ordering::SeqCst), 3);

    // Outside any environment the call still runs
    assert_eq!(FALLBACK_ADD.call((1, 2)), 3);
    assert_eq!(FALLBACK_CALLS.load(Ordering::SeqCst), 4);
}

// =============================================================================
// Pool of two workers
// =============================================================================

static POOL_CALLS: AtomicUsize = AtomicUsize::new(0);

static POOL_ADD: LazyLock<Parallelized<(i64, i64), i64>> = LazyLock::new(|| {
    Parallelized::new("dispatch::pool_add", |(a, b): (i64, i64)| {
        counted_add("dispatch::pool_add", &POOL_CALLS, a, b)
    })
    .routing_key(|(a, _)| a % 2)
});

#[test]
fn test_pool_executes_once_and_replays_from_cache() {
    let backend: Arc<dyn Backend> = Arc::new(PoolBackend::new(2).unwrap());
    let mut env = ParallelizedEnvironment::with_cache(Some(backend), memory_cache());
    let mut passes = Vec::new();

    while env.advance().unwrap() {
        let results = vec![POOL_ADD.call((1, 2)), POOL_ADD.call((3, 4)), POOL_ADD.call((4, 6))];
        passes.push((env.capturing(), results, POOL_CALLS.load(Ordering::SeqCst)));
    }

    assert_eq!(passes.len(), 2);

    let (capturing, placeholders, calls_during_capture) = &passes[0];
    assert!(*capturing);
    assert_eq!(placeholders, &vec![0, 0, 0]);
    assert_eq!(*calls_during_capture, 0);

    let (capturing, results, calls_after_compute) = &passes[1];
    assert!(!*capturing);
    assert_eq!(results, &vec![3, 7, 10]);
    assert_eq!(*calls_after_compute, 3);

    assert_eq!(env.state(), EnvState::Done);
}

// =============================================================================
// Grouping
// =============================================================================

static GROUPED_CALLS: AtomicUsize = AtomicUsize::new(0);

static GROUPED_ADD: LazyLock<Parallelized<(i64, i64), i64>> = LazyLock::new(|| {
    Parallelized::new("dispatch::grouped_add", |(a, b): (i64, i64)| {
        counted_add("dispatch::grouped_add", &GROUPED_CALLS, a, b)
    })
    .routing_key(|(a, _)| *a)
});

static UNKEYED_CALLS: AtomicUsize = AtomicUsize::new(0);

static UNKEYED_ADD: LazyLock<Parallelized<(i64, i64), i64>> = LazyLock::new(|| {
    Parallelized::new("dispatch::unkeyed_add", |(a, b): (i64, i64)| {
        counted_add("dispatch::unkeyed_add", &UNKEYED_CALLS, a, b)
    })
});

#[test]
fn test_calls_grouped_by_routing_key() {
    let backend = Arc::new(Recording::default());
    let mut env = ParallelizedEnvironment::with_cache(Some(backend.clone()), memory_cache());

    let total = env
        .run(|| {
            GROUPED_ADD.call((1, 2))
                + GROUPED_ADD.call((1, 3))
                + GROUPED_ADD.call((2, 3))
                + UNKEYED_ADD.call((9, 9))
                + UNKEYED_ADD.call((8, 8))
        })
        .unwrap();
    assert_eq!(total, 3 + 4 + 5 + 18 + 16);

    let seen = backend.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let spec = &seen[0];

    // Keys 1 and 2, plus the shared unit key of the unkeyed function
    assert_eq!(spec.len(), 3);
    assert_eq!(spec.call_count(), 5);
    let sizes: HashMap<String, usize> = spec
        .units()
        .map(|(key, group)| (key.to_string(), group.call_count()))
        .collect();
    assert_eq!(sizes["1"], 2);
    assert_eq!(sizes["2"], 1);
    assert_eq!(sizes["null"], 2);

    assert_eq!(GROUPED_CALLS.load(Ordering::SeqCst), 3);
    assert_eq!(UNKEYED_CALLS.load(Ordering::SeqCst), 2);
}

#[test]
fn test_nothing_captured_skips_backend() {
    let backend = Arc::new(Recording::default());
    let mut env = ParallelizedEnvironment::with_cache(Some(backend.clone()), memory_cache());

    let passes = {
        let mut passes = 0;
        while env.advance().unwrap() {
            passes += 1;
        }
        passes
    };

    assert_eq!(passes, 2);
    assert!(backend.seen.lock().unwrap().is_empty());
}

// =============================================================================
// Errors
// =============================================================================

static BAD_KEY_CALLS: AtomicUsize = AtomicUsize::new(0);

static BAD_KEY: LazyLock<Parallelized<(i64,), i64>> = LazyLock::new(|| {
    Parallelized::new("dispatch::bad_key", |(x,): (i64,)| {
        BAD_KEY_CALLS.fetch_add(1, Ordering::SeqCst);
        x
    })
    .routing_key(|(x,)| -> HashMap<(i64, i64), i64> { [((*x, *x), 0)].into_iter().collect() })
});

#[test]
fn test_malformed_key_fails_before_dispatch() {
    let backend = Arc::new(Recording::default());
    let mut env = ParallelizedEnvironment::with_cache(Some(backend.clone()), memory_cache());

    assert!(env.advance().unwrap());
    assert_eq!(BAD_KEY.call((5,)), 0);

    match env.advance() {
        Err(Error::MalformedKey { function, .. }) => assert_eq!(function, "dispatch::bad_key"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(env.state(), EnvState::Done);
    assert!(!env.advance().unwrap());

    assert!(backend.seen.lock().unwrap().is_empty());
    assert_eq!(BAD_KEY_CALLS.load(Ordering::SeqCst), 0);
}

static SCALE_CALLS: AtomicUsize = AtomicUsize::new(0);

static SCALE: LazyLock<Parallelized<(f64,), f64>> = LazyLock::new(|| {
    Parallelized::new("dispatch::scale", |(x,): (f64,)| {
        SCALE_CALLS.fetch_add(1, Ordering::SeqCst);
        x * 10.0
    })
});

#[test]
fn test_unreadable_arguments_fail_before_dispatch() {
    let backend = Arc::new(Recording::default());
    let mut env = ParallelizedEnvironment::with_cache(Some(backend.clone()), memory_cache());

    assert!(env.advance().unwrap());
    let _ = SCALE.call((1.5,));
    let _ = SCALE.call((f64::INFINITY,));

    match env.advance() {
        Err(Error::Serialization(message)) => assert!(message.contains("dispatch::scale")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(env.state(), EnvState::Done);
    assert!(backend.seen.lock().unwrap().is_empty());
    assert_eq!(SCALE_CALLS.load(Ordering::SeqCst), 0);

    // Directly the same call is fine
    assert_eq!(SCALE.call((f64::INFINITY,)), f64::INFINITY);
}

static DIVIDE: LazyLock<Parallelized<(i64, i64), std::result::Result<i64, String>>> =
    LazyLock::new(|| {
        Parallelized::with_default(
            "dispatch::divide",
            |(a, b): (i64, i64)| a.checked_div(b).ok_or_else(|| format!("cannot divide {} by zero", a)),
            |_| Ok(0),
        )
        .routing_key(|(_, b)| *b)
        .fail_on_err()
    });

#[test]
fn test_remote_failure_surfaces_from_advance() {
    for backend in [
        Arc::new(SyncBackend) as Arc<dyn Backend>,
        Arc::new(PoolBackend::new(2).unwrap()),
    ] {
        let mut env = ParallelizedEnvironment::with_cache(Some(backend), memory_cache());

        assert!(env.advance().unwrap());
        let _ = DIVIDE.call((6, 3));
        let _ = DIVIDE.call((1, 0));

        match env.advance() {
            Err(e @ Error::Remote { .. }) => {
                assert!(e.to_string().contains("cannot divide 1 by zero"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(env.state(), EnvState::Done);
        assert!(!env.advance().unwrap());
    }
}

#[test]
fn test_backend_requires_cache() {
    // Only holds when no process-wide cache was installed by this binary
    if parallax_core::persistent_cache().is_none() {
        let result = ParallelizedEnvironment::new(Some(Arc::new(SyncBackend)));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
    assert!(ParallelizedEnvironment::new(None).is_ok());
}
