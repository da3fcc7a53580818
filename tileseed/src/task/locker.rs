//! Mutual exclusion per named cache.
//!
//! Two tasks touching the same cache must not run at the same time. The run
//! loop asks a [`CacheLocker`] before every task and requeues the task if the
//! cache is busy.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::TaskError;

/// Held while a task runs. Releases the cache on drop.
pub struct CacheLock {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CacheLock {
    /// Lock that releases nothing.
    pub fn unguarded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            release: None,
        }
    }

    /// Lock that runs `release` when dropped.
    pub fn with_release(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for CacheLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLock").field("name", &self.name).finish()
    }
}

/// Source of [`CacheLock`]s.
pub trait CacheLocker: Send + Sync {
    /// Locks `name` without waiting. A busy cache yields [`TaskError::Lock`].
    fn try_lock(&self, name: &str) -> Result<CacheLock, TaskError>;
}

/// Locker that always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLocker;

impl CacheLocker for NoopLocker {
    fn try_lock(&self, name: &str) -> Result<CacheLock, TaskError> {
        Ok(CacheLock::unguarded(name))
    }
}

/// Locker shared by all runs inside one process.
#[derive(Debug, Default, Clone)]
pub struct LocalCacheLocker {
    locked: Arc<Mutex<HashSet<String>>>,
}

impl LocalCacheLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locked.lock().contains(name)
    }
}

impl CacheLocker for LocalCacheLocker {
    fn try_lock(&self, name: &str) -> Result<CacheLock, TaskError> {
        if !self.locked.lock().insert(name.to_string()) {
            return Err(TaskError::Lock(name.to_string()));
        }
        let locked = Arc::clone(&self.locked);
        let key = name.to_string();
        Ok(CacheLock::with_release(name, move || {
            locked.lock().remove(&key);
        }))
    }
}
