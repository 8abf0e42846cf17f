//! Copy-on-write overlay: read-only lower + writable upper + deletion journal (C5).
//!
//! A path "exists" in the overlay if it exists on upper OR it exists on
//! lower and is not marked deleted in the journal. Every mutating
//! operation copies its target (and missing ancestor directories) up to
//! the writable layer first.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{einval, enoent, enotempty, Result};
use crate::fs::FileSystem;
use crate::inode::{Credentials, Inode, MetadataPatch};
use crate::path;

const JOURNAL_MAGIC: &str = "#journal@v0";

/// Ordered log of deletions recorded against paths that still exist on
/// the read-only lower layer.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    deleted: Vec<String>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delete(&mut self, path: &str) {
        self.deleted.push(path::normalize(path));
    }

    pub fn is_deleted(&self, path: &str) -> bool {
        let normalized = path::normalize(path);
        self.deleted.iter().any(|p| *p == normalized)
    }

    /// Serializes the full log as text: a magic first line, then one
    /// `delete <path>` line per entry.
    pub fn serialize(&self) -> String {
        let mut out = String::from(JOURNAL_MAGIC);
        out.push('\n');
        for path in &self.deleted {
            out.push_str("delete ");
            out.push_str(path);
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        match lines.next() {
            Some(first) if first.trim() == JOURNAL_MAGIC => {}
            _ => return Err(einval("not a ZenFS deletion journal")),
        }
        let mut deleted = Vec::new();
        for line in lines {
            if let Some(path) = line.strip_prefix("delete ") {
                deleted.push(path.to_string());
            }
        }
        Ok(Journal { deleted })
    }

    /// Replaces the in-memory log with `text`'s contents in a single
    /// atomic step (spec.md Open Question 3), never a merge-in-place.
    pub fn restore(&mut self, text: &str) -> Result<()> {
        *self = Journal::parse(text)?;
        Ok(())
    }
}

/// Composes a read-only `lower` with a writable `upper`, backed by a
/// deletion journal for paths that are removed but still present below.
pub struct CopyOnWrite<L: FileSystem, U: FileSystem> {
    lower: Arc<L>,
    upper: Arc<U>,
    journal: Mutex<Journal>,
}

impl<L: FileSystem, U: FileSystem> CopyOnWrite<L, U> {
    pub fn new(lower: Arc<L>, upper: Arc<U>) -> Result<Self> {
        Self::with_journal(lower, upper, Journal::new())
    }

    pub fn with_journal(lower: Arc<L>, upper: Arc<U>, journal: Journal) -> Result<Self> {
        if upper.read_only() {
            return Err(einval("upper file system must be writable"));
        }
        Ok(Self { lower, upper, journal: Mutex::new(journal) })
    }

    pub async fn journal_text(&self) -> String {
        self.journal.lock().await.serialize()
    }

    async fn remove(&self, path: &str, is_dir: bool) -> Result<()> {
        if is_dir {
            let listing = self.readdir_impl(path).await?;
            if !listing.is_empty() {
                return Err(enotempty("directory not empty").with_path(path.to_string()));
            }
        }

        let on_upper = self.upper.stat(path).await.is_ok();
        if on_upper {
            if is_dir {
                self.upper.rmdir(path).await?;
            } else {
                self.upper.unlink(path).await?;
            }
        }

        let on_lower = self.lower.stat(path).await.is_ok();
        if on_lower {
            self.journal.lock().await.record_delete(path);
        } else if !on_upper {
            return Err(enoent("no such file or directory").with_path(path.to_string()));
        }
        Ok(())
    }

    async fn readdir_impl(&self, path: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        if let Ok(upper_names) = self.upper.readdir(path).await {
            names.extend(upper_names);
        }
        if let Ok(lower_names) = self.lower.readdir(path).await {
            for name in lower_names {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        let journal = self.journal.lock().await;
        names.retain(|name| {
            let full = path::join(&[path, name]);
            !journal.is_deleted(&full)
        });
        Ok(names)
    }

    /// Ensures every directory from `dir` up to (and including) `dir`
    /// exists on upper, creating missing ones with the lower's mode.
    fn ensure_parent_dirs<'a>(&'a self, dir: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if dir == "/" || self.upper.stat(dir).await.is_ok() {
                return Ok(());
            }
            let parent = path::dirname(dir);
            if parent != dir {
                self.ensure_parent_dirs(&parent).await?;
            }
            let mode = match self.lower.stat(dir).await {
                Ok(inode) => inode.mode & 0o7777,
                Err(_) => 0o755,
            };
            self.upper.mkdir(dir, mode, Credentials::default()).await?;
            Ok(())
        })
    }

    /// Copies `path` onto upper if it lives only on lower, recursing
    /// into directories. A no-op if `path` already exists on upper.
    fn copy_up<'a>(&'a self, path: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.upper.stat(path).await.is_ok() {
                return Ok(());
            }
            let lower_inode = self
                .lower
                .stat(path)
                .await
                .map_err(|_| enoent("no such file or directory").with_path(path.to_string()))?;
            if self.journal.lock().await.is_deleted(path) {
                return Err(enoent("no such file or directory").with_path(path.to_string()));
            }

            let parent = path::dirname(path);
            if parent != path {
                self.ensure_parent_dirs(&parent).await?;
            }

            let owner = Credentials { uid: lower_inode.uid, gid: lower_inode.gid };
            if lower_inode.is_dir() {
                self.upper.mkdir(path, lower_inode.mode & 0o7777, owner).await?;
                for name in self.lower.readdir(path).await? {
                    let child = path::join(&[path, &name]);
                    self.copy_up(&child).await?;
                }
            } else {
                self.upper.create_file(path, lower_inode.mode & 0o7777, owner).await?;
                let mut buf = vec![0u8; lower_inode.size as usize];
                let n = self.lower.read(path, &mut buf, 0, lower_inode.size as u64).await.unwrap_or(0);
                if n > 0 {
                    self.upper.write(path, &buf[..n], 0).await?;
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl<L: FileSystem, U: FileSystem> FileSystem for CopyOnWrite<L, U> {
    fn name(&self) -> &str {
        "cow"
    }

    async fn stat(&self, path: &str) -> Result<Inode> {
        if let Ok(inode) = self.upper.stat(path).await {
            return Ok(inode);
        }
        if self.journal.lock().await.is_deleted(path) {
            return Err(enoent("no such file or directory").with_path(path.to_string()));
        }
        self.lower.stat(path).await
    }

    async fn create_file(&self, path: &str, mode: u16, cred: Credentials) -> Result<()> {
        let parent = path::dirname(path);
        self.ensure_parent_dirs(&parent).await?;
        self.upper.create_file(path, mode, cred).await
    }

    async fn mkdir(&self, path: &str, mode: u16, cred: Credentials) -> Result<()> {
        let parent = path::dirname(path);
        self.ensure_parent_dirs(&parent).await?;
        self.upper.mkdir(path, mode, cred).await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        self.remove(path, false).await
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.remove(path, true).await
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        self.readdir_impl(path).await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.copy_up(old_path).await?;
        let new_parent = path::dirname(new_path);
        self.ensure_parent_dirs(&new_parent).await?;
        self.upper.rename(old_path, new_path).await
    }

    async fn link(&self, target_path: &str, link_path: &str) -> Result<()> {
        self.copy_up(target_path).await?;
        let link_parent = path::dirname(link_path);
        self.ensure_parent_dirs(&link_parent).await?;
        self.upper.link(target_path, link_path).await
    }

    async fn read(&self, path: &str, buf: &mut [u8], offset: u64, end: u64) -> Result<usize> {
        if self.upper.stat(path).await.is_ok() {
            return self.upper.read(path, buf, offset, end).await;
        }
        if self.journal.lock().await.is_deleted(path) {
            return Err(enoent("no such file or directory").with_path(path.to_string()));
        }
        self.lower.read(path, buf, offset, end).await
    }

    async fn write(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        self.copy_up(path).await?;
        self.upper.write(path, buf, offset).await
    }

    async fn sync(&self, path: &str, data: Option<&[u8]>, metadata: Option<MetadataPatch>) -> Result<()> {
        self.copy_up(path).await?;
        self.upper.sync(path, data, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storefs::StoreFs;
    use crate::store::memory::MemoryStore;

    fn cred() -> Credentials {
        Credentials { uid: 0, gid: 0 }
    }

    async fn seeded_lower() -> StoreFs<MemoryStore> {
        let fs = StoreFs::new(MemoryStore::new(), "lower");
        fs.create_file("/file", 0o644, cred()).await.unwrap();
        fs.write("/file", b"lower bytes", 0).await.unwrap();
        fs
    }

    #[tokio::test]
    async fn delete_then_readdir_excludes_the_lower_only_entry() {
        let lower = Arc::new(seeded_lower().await);
        let upper = Arc::new(StoreFs::new(MemoryStore::new(), "upper"));
        let cow = CopyOnWrite::new(lower, upper).unwrap();

        cow.unlink("/file").await.unwrap();
        assert_eq!(cow.readdir("/").await.unwrap(), Vec::<String>::new());
        assert!(cow.stat("/file").await.is_err());
    }

    #[tokio::test]
    async fn journal_survives_a_restore_round_trip() {
        let lower = Arc::new(seeded_lower().await);
        let upper = Arc::new(StoreFs::new(MemoryStore::new(), "upper"));
        let cow = CopyOnWrite::new(lower.clone(), upper.clone()).unwrap();
        cow.unlink("/file").await.unwrap();
        let text = cow.journal_text().await;

        let journal = Journal::parse(&text).unwrap();
        let reopened = CopyOnWrite::with_journal(lower, Arc::new(StoreFs::new(MemoryStore::new(), "upper2")), journal).unwrap();
        assert_eq!(reopened.readdir("/").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn write_copies_up_and_leaves_lower_untouched() {
        let lower = Arc::new(seeded_lower().await);
        let upper = Arc::new(StoreFs::new(MemoryStore::new(), "upper"));
        let cow = CopyOnWrite::new(lower.clone(), upper.clone()).unwrap();

        cow.write("/file", b"!", 11).await.unwrap();
        let mut buf = [0u8; 12];
        cow.read("/file", &mut buf, 0, 12).await.unwrap();
        assert_eq!(&buf, b"lower bytes!");

        let mut lower_buf = [0u8; 11];
        lower.read("/file", &mut lower_buf, 0, 11).await.unwrap();
        assert_eq!(&lower_buf, b"lower bytes");
    }
}
