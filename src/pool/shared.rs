//! Pool shared between concurrent sessions.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::gate::SingleFlight;

use super::{AccountPool, PoolEntry};

/// Cloneable handle to one [`AccountPool`] behind an async mutex.
///
/// Reloads go through a single-flight gate: concurrent reload triggers
/// collapse into one store read.
pub struct SharedPool<T: PoolEntry> {
    inner: Arc<Mutex<AccountPool<T>>>,
    reload: Arc<SingleFlight<bool>>,
}

impl<T: PoolEntry> Clone for SharedPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            reload: Arc::clone(&self.reload),
        }
    }
}

impl<T: PoolEntry> SharedPool<T> {
    pub fn new(pool: AccountPool<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(pool)),
            reload: Arc::new(SingleFlight::new()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, AccountPool<T>> {
        self.inner.lock().await
    }

    /// Select and return a snapshot of the picked entry.
    pub async fn select(&self, kind: Option<T::Kind>) -> Option<T> {
        self.inner.lock().await.select(kind).cloned()
    }

    pub async fn selected(&self) -> Option<T> {
        self.inner.lock().await.selected().cloned()
    }

    /// Reload from `path`. A reload already in flight is joined, not repeated.
    pub async fn reload(&self, path: &Path) -> bool {
        let flight = self
            .reload
            .run(|| async { self.inner.lock().await.load(path) })
            .await;
        if !flight.is_leader() {
            debug!(path = %path.display(), "Joined in-flight pool reload");
        }
        flight.into_inner().unwrap_or(false)
    }
}
