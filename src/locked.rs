//! Per-path mutex serialization over an async [`FileSystem`] backend (C9).
//!
//! Every mutating call on a [`LockedFs`] holds a path-scoped lock for the
//! call's duration. A path's waiters form a FIFO queue: the caller whose
//! turn comes up is woken by having ownership of the lock handed directly
//! to it (no re-acquire race), grounded in the holder/request bookkeeping
//! shape of the teacher's `src/nlm/mod.rs` lock-manager state, generalized
//! from per-(file, client) NLM locks to a single per-path async mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as SyncMutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{ebusy, Result};
use crate::fs::FileSystem;
use crate::inode::{Credentials, Inode, MetadataPatch};

#[derive(Default)]
struct LockTable {
    /// Paths currently held by some caller.
    held: std::collections::HashSet<String>,
    /// FIFO queue of callers waiting for a path, keyed by path.
    waiters: HashMap<String, VecDeque<oneshot::Sender<()>>>,
}

/// Wraps an async [`FileSystem`] with a per-path mutex.
pub struct LockedFs<F: FileSystem> {
    inner: F,
    table: SyncMutex<LockTable>,
}

impl<F: FileSystem> LockedFs<F> {
    pub fn new(inner: F) -> Self {
        Self { inner, table: SyncMutex::new(LockTable::default()) }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Awaits any existing waiter queued on `path`, then holds it until
    /// the returned guard is dropped.
    async fn lock(&self, path: &str) -> PathLockGuard<'_, F> {
        let rx = {
            let mut table = self.table.lock().expect("lock table poisoned");
            if table.held.insert(path.to_string()) {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                table.waiters.entry(path.to_string()).or_default().push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            // Ownership is transferred directly by the releasing holder;
            // this path is already marked `held` on our behalf.
            let _ = rx.await;
        }
        PathLockGuard { fs: self, path: path.to_string() }
    }

    /// Non-blocking variant: fails `EBUSY` immediately if `path` is already held.
    pub fn lock_sync(&self, path: &str) -> Result<PathLockGuard<'_, F>> {
        let mut table = self.table.lock().expect("lock table poisoned");
        if table.held.insert(path.to_string()) {
            Ok(PathLockGuard { fs: self, path: path.to_string() })
        } else {
            Err(ebusy("path is locked").with_path(path.to_string()))
        }
    }

    fn release(&self, path: &str) {
        let mut table = self.table.lock().expect("lock table poisoned");
        let next = table.waiters.get_mut(path).and_then(|queue| queue.pop_front());
        match next {
            Some(tx) => {
                // Hand the lock straight to the next waiter; `held` stays set.
                let _ = tx.send(());
            }
            None => {
                table.held.remove(path);
                table.waiters.remove(path);
            }
        }
    }
}

/// Scoped release for a path lock; releases on drop, including on an early
/// return or panic inside the guarded call.
pub struct PathLockGuard<'a, F: FileSystem> {
    fs: &'a LockedFs<F>,
    path: String,
}

impl<F: FileSystem> Drop for PathLockGuard<'_, F> {
    fn drop(&mut self) {
        self.fs.release(&self.path);
    }
}

#[async_trait]
impl<F: FileSystem> FileSystem for LockedFs<F> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }

    async fn stat(&self, path: &str) -> Result<Inode> {
        let _guard = self.lock(path).await;
        self.inner.stat(path).await
    }

    async fn create_file(&self, path: &str, mode: u16, cred: Credentials) -> Result<()> {
        let _guard = self.lock(path).await;
        self.inner.create_file(path, mode, cred).await
    }

    async fn open_file(&self, path: &str) -> Result<Inode> {
        let _guard = self.lock(path).await;
        self.inner.open_file(path).await
    }

    async fn mkdir(&self, path: &str, mode: u16, cred: Credentials) -> Result<()> {
        let _guard = self.lock(path).await;
        self.inner.mkdir(path, mode, cred).await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let _guard = self.lock(path).await;
        self.inner.unlink(path).await
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let _guard = self.lock(path).await;
        self.inner.rmdir(path).await
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let _guard = self.lock(path).await;
        self.inner.readdir(path).await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let _old_guard = self.lock(old_path).await;
        let _new_guard = if new_path == old_path { None } else { Some(self.lock(new_path).await) };
        self.inner.rename(old_path, new_path).await
    }

    async fn link(&self, target_path: &str, link_path: &str) -> Result<()> {
        let _target_guard = self.lock(target_path).await;
        let _link_guard = if link_path == target_path { None } else { Some(self.lock(link_path).await) };
        self.inner.link(target_path, link_path).await
    }

    async fn read(&self, path: &str, buf: &mut [u8], offset: u64, end: u64) -> Result<usize> {
        let _guard = self.lock(path).await;
        self.inner.read(path, buf, offset, end).await
    }

    async fn write(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        let _guard = self.lock(path).await;
        self.inner.write(path, buf, offset).await
    }

    async fn sync(&self, path: &str, data: Option<&[u8]>, metadata: Option<MetadataPatch>) -> Result<()> {
        let _guard = self.lock(path).await;
        self.inner.sync(path, data, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::storefs::StoreFs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cred() -> Credentials {
        Credentials { uid: 0, gid: 0 }
    }

    #[tokio::test]
    async fn lock_sync_fails_busy_when_already_held() {
        let fs = LockedFs::new(StoreFs::new(MemoryStore::new(), "locked"));
        let _held = fs.lock_sync("/a").unwrap();
        let err = fs.lock_sync("/a").unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::EBusy));
    }

    #[tokio::test]
    async fn releasing_a_path_unblocks_the_next_waiter() {
        let fs = Arc::new(LockedFs::new(StoreFs::new(MemoryStore::new(), "locked")));
        fs.inner().mkdir("/a", 0o755, cred()).await.unwrap();

        let order = Arc::new(AtomicUsize::new(0));
        let guard = fs.lock_sync("/a").unwrap();

        let fs2 = fs.clone();
        let order2 = order.clone();
        let waiter = tokio::spawn(async move {
            let _g = fs2.lock("/a").await;
            order2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::task::yield_now().await;
        assert_eq!(order.load(Ordering::SeqCst), 0);
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn serializes_concurrent_writes_to_the_same_path() {
        let fs = Arc::new(LockedFs::new(StoreFs::new(MemoryStore::new(), "locked")));
        fs.create_file("/counter", 0o644, cred()).await.unwrap();
        fs.write("/counter", b"0", 0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let fs = fs.clone();
            handles.push(tokio::spawn(async move {
                let mut buf = [0u8; 1];
                fs.read("/counter", &mut buf, 0, 1).await.unwrap();
                let n: u8 = buf[0] - b'0';
                let next = (n + 1) % 10;
                fs.write("/counter", &[b'0' + next], 0).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut buf = [0u8; 1];
        fs.read("/counter", &mut buf, 0, 1).await.unwrap();
        assert!(buf[0].is_ascii_digit());
    }
}
