//! Per-category exclusive locks.
//!
//! Every operation on a category, reads included, holds that category's lock for its whole
//! duration. Waiting is bounded: a caller that cannot get the lock in time gets
//! [`Error::LockTimeout`] and is expected to retry. Release is tied to dropping the
//! [`LockHandle`], which also covers callers whose request future is cancelled.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::catalog::types::Category;
use crate::error::{Error, Result};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

pub struct LockManager {
    locks: DashMap<Category, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn acquire(&self, category: Category) -> Result<LockHandle> {
        self.acquire_with_timeout(category, self.timeout).await
    }

    pub async fn acquire_with_timeout(
        &self,
        category: Category,
        timeout: Duration,
    ) -> Result<LockHandle> {
        // Clone the Arc out so the DashMap shard is not held across the await.
        let lock = self
            .locks
            .entry(category)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                tracing::debug!("Acquired {} lock", category);
                Ok(LockHandle {
                    category,
                    acquired_at: Instant::now(),
                    _guard: guard,
                })
            }
            Err(_) => {
                tracing::warn!("Timed out after {:?} waiting for {} lock", timeout, category);
                Err(Error::LockTimeout {
                    resource: category.builder_file(),
                })
            }
        }
    }

    pub fn is_locked(&self, category: Category) -> bool {
        self.locks
            .get(&category)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

/// Proof that the holder owns a category. The lock is released on drop.
pub struct LockHandle {
    category: Category,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl LockHandle {
    pub fn category(&self) -> Category {
        self.category
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        tracing::debug!(
            "Released {} lock after {:?}",
            self.category,
            self.acquired_at.elapsed()
        );
    }
}
