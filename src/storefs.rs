//! File-system semantics layered over a transactional key→bytes [`Store`] (C3).
//!
//! Grounded in the teacher's `examples/in_memory/filesystem.rs` inode/listing
//! state machine, generalized from a single in-process map to any `Store`
//! backend via [`WrappedTransaction`]. A directory's data blob is a JSON
//! object mapping entry name to child `ino`; `.`/`..` are never stored.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::{
    ebusy, eexist, einval, eio, eisdir, enodata, enoent, enospc, enotdir, enotempty, eperm, Result,
};
use crate::fs::FileSystem;
use crate::inode::{Credentials, Inode, MetadataPatch, S_IFDIR, S_IFREG, S_ISGID, S_ISUID};
use crate::path;
use crate::store::wrapped::WrappedTransaction;
use crate::store::{Store, StoreFlags};

fn now_ms() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0)
}

type Listing = BTreeMap<String, u32>;

fn decode_listing(bytes: &[u8]) -> Result<Listing> {
    if bytes.is_empty() {
        return Ok(Listing::new());
    }
    serde_json::from_slice(bytes).map_err(|e| eio(format!("corrupt directory listing: {e}")))
}

fn encode_listing(listing: &Listing) -> Vec<u8> {
    serde_json::to_vec(listing).expect("a BTreeMap<String, u32> always serializes")
}

/// Implements [`FileSystem`] over any transactional key→bytes [`Store`].
pub struct StoreFs<S: Store> {
    store: S,
    name: String,
}

impl<S: Store> StoreFs<S> {
    pub fn new(store: S, name: impl Into<String>) -> Self {
        Self { store, name: name.into() }
    }

    fn partial(&self) -> bool {
        self.store.flags().contains(StoreFlags::PARTIAL)
    }

    /// Creates the root inode (key/ino 0) if absent. Idempotent.
    pub async fn check_root(&self) -> Result<()> {
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        if txn.get(0, None).await.is_ok() {
            return Ok(());
        }
        let now = now_ms();
        let root = Inode::new(0, 1, S_IFDIR | 0o777, now, Credentials::default());
        txn.set(0, &root.encode()?, None).await?;
        txn.set(1, &encode_listing(&Listing::new()), None).await?;
        txn.commit().await
    }

    async fn load_inode(&self, txn: &mut WrappedTransaction, ino: u32) -> Result<Inode> {
        let bytes = txn.get(ino, None).await?;
        Inode::decode(&bytes)
    }

    async fn load_listing(&self, txn: &mut WrappedTransaction, data: u32) -> Result<Listing> {
        let bytes = txn.get(data, None).await?;
        decode_listing(&bytes)
    }

    /// Walks from the root to `path`, detecting cycles via a visited-ino set.
    async fn find_inode(&self, txn: &mut WrappedTransaction, path: &str) -> Result<Inode> {
        let normalized = path::normalize(path);
        let mut current = self.load_inode(txn, 0).await?;
        let mut visited = vec![0u32];

        for component in normalized.split('/').filter(|s| !s.is_empty()) {
            if !current.is_dir() {
                return Err(enotdir("not a directory").with_path(path.to_string()));
            }
            let listing = self.load_listing(txn, current.data).await?;
            let child_ino = *listing
                .get(component)
                .ok_or_else(|| enoent("no such file or directory").with_path(path.to_string()))?;
            if visited.contains(&child_ino) {
                return Err(eio("Infinite loop detected").with_path(path.to_string()));
            }
            visited.push(child_ino);
            current = self.load_inode(txn, child_ino).await?;
        }
        Ok(current)
    }

    /// Resolves `path`'s parent directory inode and final component name.
    async fn find_parent(&self, txn: &mut WrappedTransaction, path: &str) -> Result<(Inode, String)> {
        let normalized = path::normalize(path);
        let dir = path::dirname(&normalized);
        let name = path::basename(&normalized);
        if name.is_empty() {
            return Err(einval("empty path component").with_path(path.to_string()));
        }
        let parent = self.find_inode(txn, &dir).await?;
        if !parent.is_dir() {
            return Err(enotdir("parent is not a directory").with_path(path.to_string()));
        }
        Ok((parent, name))
    }

    /// Allocates a fresh `(ino, data)` key pair: `max(existing keys) + 1`, `+2`.
    async fn allocate_keys(&self, txn: &mut WrappedTransaction) -> Result<(u32, u32)> {
        let keys = txn.keys().await?;
        let max = keys.into_iter().max().unwrap_or(0);
        let ino = max.checked_add(1).ok_or_else(|| enospc("store key space exhausted"))?;
        let data = ino.checked_add(1).ok_or_else(|| enospc("store key space exhausted"))?;
        Ok((ino, data))
    }

    async fn create_inode(&self, path: &str, mode: u16, cred: Credentials, type_bit: u16) -> Result<()> {
        self.check_root().await?;
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        let (parent, name) = self.find_parent(&mut txn, path).await?;
        let mut listing = self.load_listing(&mut txn, parent.data).await?;
        if listing.contains_key(&name) {
            return Err(eexist("already exists").with_path(path.to_string()));
        }
        let (ino, data) = self.allocate_keys(&mut txn).await?;

        let mut owner = cred;
        if parent.mode & S_ISUID != 0 {
            owner.uid = parent.uid;
        }
        if parent.mode & S_ISGID != 0 {
            owner.gid = parent.gid;
        }

        let now = now_ms();
        let inode = Inode::new(ino, data, mode | type_bit, now, owner);
        txn.set(ino, &inode.encode()?, None).await?;
        let initial_data = if type_bit == S_IFDIR { encode_listing(&Listing::new()) } else { Vec::new() };
        txn.set(data, &initial_data, None).await?;

        listing.insert(name, ino);
        txn.set(parent.data, &encode_listing(&listing), None).await?;
        txn.commit().await
    }

    /// Shared `unlink`/`rmdir` body: `expect_dir` selects which type is
    /// accepted. A type mismatch in either direction fails `EISDIR`,
    /// matching spec.md's symmetric wording for both operations.
    async fn remove_entry(&self, path: &str, expect_dir: bool) -> Result<()> {
        self.check_root().await?;
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        let (parent, name) = self.find_parent(&mut txn, path).await?;
        let mut listing = self.load_listing(&mut txn, parent.data).await?;
        let ino = *listing
            .get(&name)
            .ok_or_else(|| enoent("no such file or directory").with_path(path.to_string()))?;
        let mut inode = self.load_inode(&mut txn, ino).await?;

        if expect_dir != inode.is_dir() {
            return Err(eisdir("is a directory").with_path(path.to_string()));
        }
        if expect_dir {
            let child_listing = self.load_listing(&mut txn, inode.data).await?;
            if !child_listing.is_empty() {
                return Err(enotempty("directory not empty").with_path(path.to_string()));
            }
        }

        listing.remove(&name);
        txn.set(parent.data, &encode_listing(&listing), None).await?;

        inode.nlink = inode.nlink.saturating_sub(1);
        if inode.nlink == 0 {
            txn.remove(ino).await?;
            txn.remove(inode.data).await?;
        } else {
            txn.set(ino, &inode.encode()?, None).await?;
        }

        txn.commit().await
    }

    async fn rename_impl(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.check_root().await?;
        let old_norm = path::normalize(old_path);
        let new_norm = path::normalize(new_path);
        let new_dir = path::dirname(&new_norm);
        if new_dir == old_norm || path::is_ancestor(&old_norm, &new_dir) {
            return Err(ebusy("rename target is inside the source subtree").with_path(new_path.to_string()));
        }

        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        let (old_parent, old_name) = self.find_parent(&mut txn, &old_norm).await?;
        let mut old_listing = self.load_listing(&mut txn, old_parent.data).await?;
        let moved_ino = *old_listing
            .get(&old_name)
            .ok_or_else(|| enoent("no such file or directory").with_path(old_path.to_string()))?;

        let (new_parent, new_name) = self.find_parent(&mut txn, &new_norm).await?;
        let same_parent = new_parent.ino == old_parent.ino;
        let mut new_listing =
            if same_parent { None } else { Some(self.load_listing(&mut txn, new_parent.data).await?) };

        let dest_listing = new_listing.as_ref().unwrap_or(&old_listing);
        if let Some(&existing_ino) = dest_listing.get(&new_name) {
            let mut existing = self.load_inode(&mut txn, existing_ino).await?;
            if existing.is_dir() {
                return Err(eperm("cannot rename over a directory").with_path(new_path.to_string()));
            }
            existing.nlink = existing.nlink.saturating_sub(1);
            if existing.nlink == 0 {
                txn.remove(existing_ino).await?;
                txn.remove(existing.data).await?;
            } else {
                txn.set(existing_ino, &existing.encode()?, None).await?;
            }
        }

        old_listing.remove(&old_name);
        match &mut new_listing {
            Some(listing) => {
                listing.insert(new_name, moved_ino);
            }
            None => {
                old_listing.insert(new_name, moved_ino);
            }
        }

        txn.set(old_parent.data, &encode_listing(&old_listing), None).await?;
        if let Some(listing) = new_listing {
            txn.set(new_parent.data, &encode_listing(&listing), None).await?;
        }
        txn.commit().await
    }

    async fn link_impl(&self, target_path: &str, link_path: &str) -> Result<()> {
        self.check_root().await?;
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        let mut target = self.find_inode(&mut txn, target_path).await?;
        if target.is_dir() {
            return Err(eperm("cannot link a directory").with_path(target_path.to_string()));
        }
        let (link_parent, link_name) = self.find_parent(&mut txn, link_path).await?;
        let mut listing = self.load_listing(&mut txn, link_parent.data).await?;
        if listing.contains_key(&link_name) {
            return Err(eexist("already exists").with_path(link_path.to_string()));
        }

        target.nlink += 1;
        txn.set(target.ino, &target.encode()?, None).await?;
        listing.insert(link_name, target.ino);
        txn.set(link_parent.data, &encode_listing(&listing), None).await?;
        txn.commit().await
    }

    async fn read_impl(&self, path: &str, buf: &mut [u8], offset: u64, end: u64) -> Result<usize> {
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        let inode = self.find_inode(&mut txn, path).await?;
        let data = if self.partial() {
            txn.get(inode.data, Some((offset, end)))
                .await
                .map_err(|_| enodata("no data").with_path(path.to_string()))?
        } else {
            let full = txn
                .get(inode.data, None)
                .await
                .map_err(|_| enodata("no data").with_path(path.to_string()))?;
            let start = (offset as usize).min(full.len());
            let stop = (end as usize).min(full.len());
            full[start..stop.max(start)].to_vec()
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        txn.abort().await.ok();
        Ok(n)
    }

    async fn write_impl(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        let mut inode = self.find_inode(&mut txn, path).await?;
        if inode.is_dir() {
            return Err(eisdir("is a directory").with_path(path.to_string()));
        }

        let new_size = if self.partial() {
            txn.set(inode.data, buf, Some(offset)).await?
        } else {
            let mut current = txn.get(inode.data, None).await.unwrap_or_default();
            let start = offset as usize;
            let needed = start + buf.len();
            if current.len() < needed {
                current.resize(needed, 0);
            }
            current[start..needed].copy_from_slice(buf);
            txn.set(inode.data, &current, None).await?
        };

        let now = now_ms();
        inode.update(&MetadataPatch {
            size: Some(new_size as u32),
            mtime: Some(now),
            ctime: Some(now),
            ..Default::default()
        });
        txn.set(inode.ino, &inode.encode()?, None).await?;
        txn.commit().await?;
        Ok(buf.len())
    }

    async fn sync_impl(&self, path: &str, data: Option<&[u8]>, metadata: Option<MetadataPatch>) -> Result<()> {
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        let mut inode = self.find_inode(&mut txn, path).await?;
        if let Some(data) = data {
            txn.set(inode.data, data, None).await?;
        }
        if let Some(patch) = metadata {
            inode.update(&patch);
        }
        txn.set(inode.ino, &inode.encode()?, None).await?;
        txn.commit().await
    }
}

#[async_trait]
impl<S: Store> FileSystem for StoreFs<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &str) -> Result<Inode> {
        self.check_root().await?;
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        self.find_inode(&mut txn, path).await
    }

    async fn create_file(&self, path: &str, mode: u16, cred: Credentials) -> Result<()> {
        self.create_inode(path, mode, cred, S_IFREG).await
    }

    async fn mkdir(&self, path: &str, mode: u16, cred: Credentials) -> Result<()> {
        self.create_inode(path, mode, cred, S_IFDIR).await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        self.remove_entry(path, false).await
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.remove_entry(path, true).await
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        self.check_root().await?;
        let mut txn = WrappedTransaction::new(self.store.transaction().await?);
        let inode = self.find_inode(&mut txn, path).await?;
        if !inode.is_dir() {
            return Err(enotdir("not a directory").with_path(path.to_string()));
        }
        let listing = self.load_listing(&mut txn, inode.data).await?;
        Ok(listing.into_keys().collect())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.rename_impl(old_path, new_path).await
    }

    async fn link(&self, target_path: &str, link_path: &str) -> Result<()> {
        self.link_impl(target_path, link_path).await
    }

    async fn read(&self, path: &str, buf: &mut [u8], offset: u64, end: u64) -> Result<usize> {
        self.read_impl(path, buf, offset, end).await
    }

    async fn write(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        self.write_impl(path, buf, offset).await
    }

    async fn sync(&self, path: &str, data: Option<&[u8]>, metadata: Option<MetadataPatch>) -> Result<()> {
        self.sync_impl(path, data, metadata).await
    }
}
