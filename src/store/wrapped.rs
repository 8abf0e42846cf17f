//! Rollback-capable layer over a raw [`Transaction`] (spec.md §4.3 Design Notes).
//!
//! For every observed key the first value seen is stashed; for every
//! mutation the key is recorded as modified and its pre-image stashed
//! (via a fresh read, if not already captured). `abort` restores every
//! modified key to its pre-image, key by key, best-effort.

use std::collections::HashMap;

use crate::error::{eio, Result};
use crate::store::Transaction;

/// Composite stash key: `(store key, observed offset)`. Using a tuple
/// keeps equality trivial, per spec.md's allowance for "a 64-bit
/// composite integer instead" of the `id + '@' + offset` string scheme.
type StashKey = (u32, u64);

pub struct WrappedTransaction {
    inner: Option<Box<dyn Transaction>>,
    originals: HashMap<StashKey, Option<Vec<u8>>>,
    modified: Vec<StashKey>,
    done: bool,
}

impl WrappedTransaction {
    pub fn new(inner: Box<dyn Transaction>) -> Self {
        Self { inner: Some(inner), originals: HashMap::new(), modified: Vec::new(), done: false }
    }

    pub async fn keys(&mut self) -> Result<Vec<u32>> {
        self.inner_mut()?.keys().await
    }

    pub async fn get(&mut self, id: u32, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
        let offset = range.map(|(o, _)| o).unwrap_or(0);
        let data = self.inner_mut()?.get(id, range).await?;
        self.originals.entry((id, offset)).or_insert_with(|| Some(data.clone()));
        Ok(data)
    }

    pub async fn set(&mut self, id: u32, data: &[u8], offset: Option<u64>) -> Result<u64> {
        self.stash_pre_image(id, offset.unwrap_or(0)).await;
        self.inner_mut()?.set(id, data, offset).await
    }

    pub async fn remove(&mut self, id: u32) -> Result<()> {
        self.stash_pre_image(id, 0).await;
        self.inner_mut()?.remove(id).await
    }

    /// Makes this transaction's mutations visible. No-ops on a later `abort`.
    pub async fn commit(mut self) -> Result<()> {
        let inner = self.inner.take().ok_or_else(|| eio("transaction already finished"))?;
        self.done = true;
        let result = inner.commit().await;
        tracing::debug!(modified = self.modified.len(), ok = result.is_ok(), "transaction commit");
        result
    }

    /// Restores every modified key to its pre-transaction value.
    pub async fn abort(mut self) -> Result<()> {
        tracing::debug!(modified = self.modified.len(), "transaction abort");
        self.restore().await
    }

    async fn stash_pre_image(&mut self, id: u32, offset: u64) {
        let key = (id, offset);
        if self.originals.contains_key(&key) {
            if !self.modified.contains(&key) {
                self.modified.push(key);
            }
            return;
        }
        let pre = match self.inner_mut() {
            Ok(inner) => inner.get(id, None).await.ok(),
            Err(_) => None,
        };
        self.originals.insert(key, pre);
        self.modified.push(key);
    }

    async fn restore(&mut self) -> Result<()> {
        let mut inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        for key in self.modified.drain(..) {
            let (id, _offset) = key;
            let original = self.originals.get(&key).cloned().flatten();
            // Remove first so a shrink-on-restore isn't masked by a stale tail.
            let _ = inner.remove(id).await;
            if let Some(original) = original {
                let _ = inner.set(id, &original, None).await;
            }
        }
        self.done = true;
        inner.abort().await
    }

    fn inner_mut(&mut self) -> Result<&mut Box<dyn Transaction>> {
        self.inner.as_mut().ok_or_else(|| eio("transaction already finished"))
    }
}

impl Drop for WrappedTransaction {
    /// Best-effort scoped release: a transaction dropped without an
    /// explicit `commit`/`abort` is rolled back on a detached task when a
    /// tokio runtime is reachable, otherwise the skip is logged. This is
    /// the Rust analogue of the resource-scoped acquisition pattern
    /// spec.md describes (real `AsyncDrop` doesn't exist on stable Rust).
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(mut inner) = self.inner.take() else { return };
        let originals = std::mem::take(&mut self.originals);
        let modified = std::mem::take(&mut self.modified);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for key in modified {
                        let (id, _offset) = key;
                        let original = originals.get(&key).cloned().flatten();
                        let _ = inner.remove(id).await;
                        if let Some(original) = original {
                            let _ = inner.set(id, &original, None).await;
                        }
                    }
                    let _ = inner.abort().await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    "transaction dropped without commit/abort outside a tokio runtime; rollback skipped"
                );
            }
        }
    }
}
