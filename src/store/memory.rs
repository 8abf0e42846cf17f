//! In-memory [`Store`] used for tests and simple non-persistent mounts.
//!
//! Grounded in the teacher's `examples/in_memory/filesystem.rs` state
//! table: a single `HashMap` guarded by a `tokio::sync::RwLock`, with
//! pending writes buffered per-transaction and only applied to the
//! shared map on commit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{enodata, Result};
use crate::store::{Store, StoreFlags, Transaction};

#[derive(Default)]
struct Shared {
    blobs: HashMap<u32, Vec<u8>>,
}

/// A `Store` backed entirely by process memory; nothing survives a restart.
pub struct MemoryStore {
    shared: Arc<RwLock<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { shared: Arc::new(RwLock::new(Shared::default())) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn transaction(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction { shared: self.shared.clone(), pending: HashMap::new() }))
    }

    async fn clear(&self) -> Result<()> {
        self.shared.write().await.blobs.clear();
        Ok(())
    }
}

/// `None` in `pending` marks a deletion scheduled for commit.
struct MemoryTransaction {
    shared: Arc<RwLock<Shared>>,
    pending: HashMap<u32, Option<Vec<u8>>>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn keys(&mut self) -> Result<Vec<u32>> {
        let shared = self.shared.read().await;
        let mut keys: Vec<u32> = shared.blobs.keys().copied().collect();
        for (&id, value) in &self.pending {
            match value {
                Some(_) if !keys.contains(&id) => keys.push(id),
                None => keys.retain(|&k| k != id),
                _ => {}
            }
        }
        Ok(keys)
    }

    async fn get(&mut self, id: u32, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
        let full = match self.pending.get(&id) {
            Some(Some(data)) => data.clone(),
            Some(None) => return Err(enodata("key removed in transaction").with_path(id.to_string())),
            None => {
                let shared = self.shared.read().await;
                shared
                    .blobs
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| enodata("no such key").with_path(id.to_string()))?
            }
        };
        match range {
            Some((offset, end)) => {
                let start = (offset as usize).min(full.len());
                let stop = (end as usize).min(full.len());
                Ok(full[start..stop.max(start)].to_vec())
            }
            None => Ok(full),
        }
    }

    async fn set(&mut self, id: u32, data: &[u8], offset: Option<u64>) -> Result<u64> {
        let mut current = match self.pending.get(&id) {
            Some(Some(data)) => data.clone(),
            Some(None) | None => {
                if offset.is_some() {
                    match self.get(id, None).await {
                        Ok(existing) => existing,
                        Err(_) => Vec::new(),
                    }
                } else {
                    Vec::new()
                }
            }
        };

        let offset = offset.unwrap_or(0) as usize;
        let needed = offset + data.len();
        if current.len() < needed {
            current.resize(needed, 0);
        }
        current[offset..needed].copy_from_slice(data);
        let new_size = current.len() as u64;
        self.pending.insert(id, Some(current));
        Ok(new_size)
    }

    async fn remove(&mut self, id: u32) -> Result<()> {
        self.pending.insert(id, None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut shared = self.shared.write().await;
        for (id, value) in self.pending {
            match value {
                Some(data) => {
                    shared.blobs.insert(id, data);
                }
                None => {
                    shared.blobs.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut txn = store.transaction().await.unwrap();
        txn.set(1, b"hello", None).await.unwrap();

        let mut other = store.transaction().await.unwrap();
        assert!(other.get(1, None).await.is_err());

        txn.commit().await.unwrap();
        let mut after = store.transaction().await.unwrap();
        assert_eq!(after.get(1, None).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let mut txn = store.transaction().await.unwrap();
        txn.set(1, b"hello", None).await.unwrap();
        txn.abort().await.unwrap();

        let mut after = store.transaction().await.unwrap();
        assert!(after.get(1, None).await.is_err());
    }

    #[tokio::test]
    async fn partial_write_extends_and_zero_fills() {
        let store = MemoryStore::new();
        let mut txn = store.transaction().await.unwrap();
        txn.set(1, b"abc", None).await.unwrap();
        txn.set(1, b"Z", Some(5)).await.unwrap();
        let value = txn.get(1, None).await.unwrap();
        assert_eq!(value, vec![b'a', b'b', b'c', 0, 0, b'Z']);
        txn.commit().await.unwrap();
    }
}
