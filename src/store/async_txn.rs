//! `AsyncTransaction`: immediate sync-style cache with a serial async
//! backend chain (spec.md §4.3).
//!
//! Writes land in an in-memory [`moka`] cache immediately so a
//! synchronous-style caller sees them right away; the real backend
//! mutation is enqueued onto a serial chain of spawned tasks so backend
//! calls still execute in submission order. A synchronous-style read
//! (`get_sync`) raises `EAGAIN` on a cache miss and kicks off an async
//! prefetch rather than blocking.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::error::{eagain, Result};
use crate::store::Transaction;

pub struct AsyncTransaction {
    inner: Arc<AsyncMutex<Box<dyn Transaction>>>,
    cache: moka::sync::Cache<u32, Vec<u8>>,
    chain: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncTransaction {
    pub fn new(inner: Box<dyn Transaction>) -> Self {
        Self {
            inner: Arc::new(AsyncMutex::new(inner)),
            cache: moka::sync::Cache::new(10_000),
            chain: Mutex::new(None),
        }
    }

    /// Synchronous-style read. `EAGAIN` on a cache miss; a background
    /// prefetch is started so a retry is likely to hit.
    pub fn get_sync(&self, id: u32) -> Result<Vec<u8>> {
        match self.cache.get(&id) {
            Some(data) => Ok(data),
            None => {
                self.prefetch(id);
                Err(eagain("cache miss; prefetch started").with_path(id.to_string()))
            }
        }
    }

    fn prefetch(&self, id: u32) {
        let inner = self.inner.clone();
        let cache = self.cache.clone();
        self.enqueue(async move {
            let mut txn = inner.lock().await;
            if let Ok(data) = txn.get(id, None).await {
                cache.insert(id, data);
            }
        });
    }

    /// Writes through the cache immediately, then enqueues the backend
    /// mutation. Returns the new (cache-visible) size.
    pub async fn set(&self, id: u32, data: Vec<u8>, offset: Option<u64>) -> Result<u64> {
        let mut current = self.cache.get(&id).unwrap_or_default();
        let start = offset.unwrap_or(0) as usize;
        let needed = start + data.len();
        if current.len() < needed {
            current.resize(needed, 0);
        }
        current[start..needed].copy_from_slice(&data);
        let new_size = current.len() as u64;
        self.cache.insert(id, current);

        let inner = self.inner.clone();
        self.enqueue(async move {
            let mut txn = inner.lock().await;
            let _ = txn.set(id, &data, offset).await;
        });
        Ok(new_size)
    }

    pub async fn remove(&self, id: u32) -> Result<()> {
        self.cache.invalidate(&id);
        let inner = self.inner.clone();
        self.enqueue(async move {
            let mut txn = inner.lock().await;
            let _ = txn.remove(id).await;
        });
        Ok(())
    }

    /// Enqueues `fut` onto the serial chain: it will not start until every
    /// previously enqueued operation has finished.
    fn enqueue(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let previous = self.chain.lock().expect("chain mutex poisoned").take();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            fut.await;
        });
        *self.chain.lock().expect("chain mutex poisoned") = Some(handle);
    }

    /// Awaits every enqueued backend operation. Callers MUST await this
    /// before treating the transaction's state as quiescent (e.g. before
    /// `commit`/`abort`).
    pub async fn quiesce(&self) {
        let handle = self.chain.lock().expect("chain mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn commit(self) -> Result<()> {
        self.quiesce().await;
        let inner = Arc::try_unwrap(self.inner)
            .unwrap_or_else(|arc| panic!("commit called while {} references remain", Arc::strong_count(&arc)))
            .into_inner();
        inner.commit().await
    }

    pub async fn abort(self) -> Result<()> {
        self.quiesce().await;
        let inner = Arc::try_unwrap(self.inner)
            .unwrap_or_else(|arc| panic!("abort called while {} references remain", Arc::strong_count(&arc)))
            .into_inner();
        inner.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;

    #[tokio::test]
    async fn sync_read_misses_then_hits_after_prefetch_settles() {
        let store = MemoryStore::new();
        {
            let mut setup = store.transaction().await.unwrap();
            setup.set(1, b"hello", None).await.unwrap();
            setup.commit().await.unwrap();
        }

        let inner = store.transaction().await.unwrap();
        let txn = AsyncTransaction::new(inner);
        assert!(txn.get_sync(1).is_err());
        txn.quiesce().await;
        assert_eq!(txn.get_sync(1).unwrap(), b"hello");
        txn.abort().await.unwrap();
    }

    #[tokio::test]
    async fn write_is_visible_in_cache_before_backend_settles() {
        let store = MemoryStore::new();
        let inner = store.transaction().await.unwrap();
        let txn = AsyncTransaction::new(inner);
        txn.set(5, b"value".to_vec(), None).await.unwrap();
        // Cache reflects the write immediately, no EAGAIN.
        assert_eq!(txn.get_sync(5).unwrap(), b"value");
        txn.commit().await.unwrap();
    }
}
