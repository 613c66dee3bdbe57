//! Persistent cache collaborator.
//!
//! The engine never stores results itself. Parallelized functions memoize
//! through whatever [`PersistentCache`] is current; backends make the
//! environment's cache current while they run a unit, so results computed
//! remotely become visible to the replay pass in the calling process.
//!
//! Lookup order for [`persistent_cache`]:
//! 1. the cache made current on this thread by [`caching_into`] or a
//!    [`CacheScope`]
//! 2. the process-wide cache installed by [`set_persistent_cache`]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rustc_hash::FxHasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Storage for computed results, shared between the calling process and
/// whatever executes job units.
pub trait PersistentCache: Send + Sync + fmt::Debug {
    /// Fetch the bytes stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous entry.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Descriptor another process can use to reopen this cache.
    ///
    /// Caches that only live in memory return a configuration error.
    fn handle(&self) -> Result<CacheHandle>;
}

/// Serializable description of a cache, for crossing process boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheHandle {
    /// A [`DirectoryCache`] rooted at `path`.
    Directory { path: PathBuf },
}

impl CacheHandle {
    /// Reopen the cache described by this handle.
    pub fn open(&self) -> Result<Arc<dyn PersistentCache>> {
        match self {
            CacheHandle::Directory { path } => Ok(Arc::new(DirectoryCache::new(path)?)),
        }
    }
}

// =============================================================================
// Current cache
// =============================================================================

static GLOBAL: RwLock<Option<Arc<dyn PersistentCache>>> = RwLock::new(None);

thread_local! {
    static SCOPED: RefCell<Vec<Arc<dyn PersistentCache>>> = const { RefCell::new(Vec::new()) };
}

/// Install `cache` as the process-wide cache, returning the previous one.
pub fn set_persistent_cache(
    cache: Option<Arc<dyn PersistentCache>>,
) -> Option<Arc<dyn PersistentCache>> {
    let mut global = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *global, cache)
}

/// The cache calls on this thread should use, if any.
pub fn persistent_cache() -> Option<Arc<dyn PersistentCache>> {
    if let Some(scoped) = SCOPED.with(|s| s.borrow().last().cloned()) {
        return Some(scoped);
    }
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Keeps a cache current on this thread until dropped.
///
/// Scopes must be dropped in reverse order of creation on the thread that
/// created them.
#[must_use = "the cache stops being current as soon as the scope is dropped"]
pub struct CacheScope {
    _thread: PhantomData<*const ()>,
}

impl CacheScope {
    /// Make `cache` this thread's current cache.
    pub fn enter(cache: Arc<dyn PersistentCache>) -> Self {
        SCOPED.with(|s| s.borrow_mut().push(cache));
        Self {
            _thread: PhantomData,
        }
    }
}

impl Drop for CacheScope {
    fn drop(&mut self) {
        SCOPED.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

impl fmt::Debug for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CacheScope")
    }
}

/// Run `f` with `cache` as this thread's current cache.
///
/// Scopes nest; the previous cache is restored even if `f` panics.
pub fn caching_into<T>(cache: Arc<dyn PersistentCache>, f: impl FnOnce() -> T) -> T {
    let _scope = CacheScope::enter(cache);
    f()
}

/// Memoize `compute` in the current cache under `name` and `args`.
///
/// Without a current cache this just calls `compute`. Cache failures are
/// logged and fall back to computing.
pub fn cached<A, R>(name: &str, args: &A, compute: impl FnOnce() -> R) -> R
where
    A: Serialize + ?Sized,
    R: Serialize + DeserializeOwned,
{
    let Some(cache) = persistent_cache() else {
        return compute();
    };

    let key = match cache_key(name, args) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!("Cannot build cache key for {}: {}", name, e);
            return compute();
        }
    };

    match cache.get(&key) {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(value) => return value,
            Err(e) => tracing::warn!("Discarding unreadable cache entry for {}: {}", name, e),
        },
        Ok(None) => {}
        Err(e) => tracing::warn!("Cache lookup for {} failed: {}", name, e),
    }

    let value = compute();
    match serde_json::to_vec(&value) {
        Ok(bytes) => {
            if let Err(e) = cache.put(&key, &bytes) {
                tracing::warn!("Cache store for {} failed: {}", name, e);
            }
        }
        Err(e) => tracing::warn!("Cannot serialize result of {}: {}", name, e),
    }
    value
}

/// Cache key for a call: function name plus canonical JSON arguments.
pub fn cache_key<A: Serialize + ?Sized>(name: &str, args: &A) -> Result<String> {
    let args = serde_json::to_value(args).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(format!("{}:{}", name, args))
}

// =============================================================================
// Implementations
// =============================================================================

/// In-memory cache. Visible to every thread of this process, never to others.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn handle(&self) -> Result<CacheHandle> {
        Err(Error::Configuration(
            "memory cache cannot be shared with other processes".to_string(),
        ))
    }
}

/// Directory-backed cache: one file per entry.
///
/// File names are the FxHash of the key bytes, which does not depend on the
/// compiler or the binary, so any build can reopen an existing directory.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

/// On-disk entry. The key is kept to detect hash collisions.
#[derive(Serialize, Deserialize)]
struct Entry {
    key: String,
    value: Vec<u8>,
}

impl DirectoryCache {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if root.exists() && !root.is_dir() {
            return Err(Error::Configuration(format!(
                "cache path {} exists and is not a directory",
                root.display()
            )));
        }
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = FxHasher::default();
        hasher.write(key.as_bytes());
        self.root.join(format!("{:016x}.json", hasher.finish()))
    }
}

impl PersistentCache for DirectoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let entry: Entry =
            serde_json::from_slice(&bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok((entry.key == key).then_some(entry.value))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let entry = Entry {
            key: key.to_string(),
            value: value.to_vec(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| Error::Serialization(e.to_string()))?;

        // Write then rename so concurrent readers never see a torn entry
        let path = self.entry_path(key);
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn handle(&self) -> Result<CacheHandle> {
        Ok(CacheHandle::Directory {
            path: self.root.clone(),
        })
    }
}
