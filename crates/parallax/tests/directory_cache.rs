//! Environments sharing the process-wide directory cache.

use std::sync::atomic::{AtomicUsize, Ordering};

use parallax::prelude::*;

static MUL_CALLS: AtomicUsize = AtomicUsize::new(0);

#[parallelized(key = |a, _b| *a)]
fn mul(a: i64, b: i64) -> i64 {
    cached("directory_cache::mul", &(a, b), || {
        MUL_CALLS.fetch_add(1, Ordering::SeqCst);
        a * b
    })
}

#[test]
fn test_second_environment_reuses_cached_results() {
    let temp = tempfile::TempDir::new().unwrap();
    let cache = DirectoryCache::new(temp.path().join("cache")).unwrap();
    set_persistent_cache(Some(Arc::new(cache)));

    let body = || mul(2, 3) + mul(4, 5) + mul(2, 7);
    for _ in 0..2 {
        let mut env =
            ParallelizedEnvironment::new(Some(Arc::new(PoolBackend::new(2).unwrap()))).unwrap();
        assert_eq!(env.run(body).unwrap(), 6 + 20 + 14);
    }

    // The second environment still dispatches, but every call hits the cache
    assert_eq!(MUL_CALLS.load(Ordering::SeqCst), 3);
    assert!(std::fs::read_dir(temp.path().join("cache")).unwrap().count() >= 3);

    // Outside any environment the global cache answers too
    assert_eq!(mul(4, 5), 20);
    assert_eq!(MUL_CALLS.load(Ordering::SeqCst), 3);

    set_persistent_cache(None);
}
