//! Shared capability surface implemented by every backend.
//!
//! Generalizes the teacher's fixed-procedure `Vfs` trait (`vfs.rs`) into
//! the path-oriented capability set named in spec.md §9 Design Notes:
//! `{rename, stat, openFile, createFile, unlink, rmdir, mkdir, readdir,
//! link, sync, read, write}`.

use async_trait::async_trait;

use crate::error::Result;
use crate::inode::{Credentials, Inode, MetadataPatch};

/// A mounted, path-addressed file system backend.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// A short identifying name, used in diagnostics.
    fn name(&self) -> &str;

    /// Whether this backend rejects all mutating operations.
    fn read_only(&self) -> bool {
        false
    }

    async fn stat(&self, path: &str) -> Result<Inode>;

    async fn create_file(&self, path: &str, mode: u16, cred: Credentials) -> Result<()>;

    /// Opens an existing file, returning its inode (a "lazy file handle"
    /// in spec.md terms is just the path plus this inode snapshot).
    async fn open_file(&self, path: &str) -> Result<Inode> {
        self.stat(path).await
    }

    async fn mkdir(&self, path: &str, mode: u16, cred: Credentials) -> Result<()>;

    async fn unlink(&self, path: &str) -> Result<()>;

    async fn rmdir(&self, path: &str) -> Result<()>;

    async fn readdir(&self, path: &str) -> Result<Vec<String>>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;

    async fn link(&self, target_path: &str, link_path: &str) -> Result<()>;

    async fn read(&self, path: &str, buf: &mut [u8], offset: u64, end: u64) -> Result<usize>;

    async fn write(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize>;

    async fn sync(&self, path: &str, data: Option<&[u8]>, metadata: Option<MetadataPatch>) -> Result<()>;
}
