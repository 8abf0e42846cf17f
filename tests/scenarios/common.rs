use std::sync::Arc;

use zenfs_core::context::{bind_context, Context, ContextInit, Credentials};
use zenfs_core::fs::FileSystem;
use zenfs_core::locked::LockedFs;
use zenfs_core::store::memory::MemoryStore;
use zenfs_core::storefs::StoreFs;

pub fn root_cred() -> zenfs_core::inode::Credentials {
    zenfs_core::inode::Credentials { uid: 0, gid: 0 }
}

/// A bound context with a single in-memory backend mounted at `/`,
/// wrapped in [`LockedFs`] so every scenario exercises the same mount
/// router and per-path serialization a real caller would go through.
pub struct Fixture {
    pub ctx: Arc<Context>,
}

impl Fixture {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("zenfs_core=debug").try_init();
        let ctx = bind_context(None, ContextInit { credentials: Some(Credentials::root()), ..Default::default() });
        let backend: Arc<dyn FileSystem> = Arc::new(LockedFs::new(StoreFs::new(MemoryStore::new(), "root")));
        ctx.mount("/", backend).expect("mount root backend");
        Fixture { ctx }
    }

    pub async fn stat(&self, path: &str) -> zenfs_core::Result<zenfs_core::Inode> {
        let resolved = self.ctx.resolve_mount(path)?;
        resolved.fs.stat(&resolved.relative_path).await
    }

    pub async fn create_file(&self, path: &str, mode: u16) -> zenfs_core::Result<()> {
        let resolved = self.ctx.resolve_mount(path)?;
        resolved.fs.create_file(&resolved.relative_path, mode, root_cred()).await
    }

    pub async fn mkdir(&self, path: &str, mode: u16) -> zenfs_core::Result<()> {
        let resolved = self.ctx.resolve_mount(path)?;
        resolved.fs.mkdir(&resolved.relative_path, mode, root_cred()).await
    }

    pub async fn write(&self, path: &str, buf: &[u8], offset: u64) -> zenfs_core::Result<usize> {
        let resolved = self.ctx.resolve_mount(path)?;
        resolved.fs.write(&resolved.relative_path, buf, offset).await
    }

    pub async fn read(&self, path: &str, buf: &mut [u8], offset: u64, end: u64) -> zenfs_core::Result<usize> {
        let resolved = self.ctx.resolve_mount(path)?;
        resolved.fs.read(&resolved.relative_path, buf, offset, end).await
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> zenfs_core::Result<()> {
        let resolved = self.ctx.resolve_mount(old_path)?;
        let new_resolved = self.ctx.resolve_mount(new_path)?;
        assert_eq!(resolved.mount_point, new_resolved.mount_point, "scenario fixture has a single mount");
        resolved.fs.rename(&resolved.relative_path, &new_resolved.relative_path).await
    }

    pub async fn readdir(&self, path: &str) -> zenfs_core::Result<Vec<String>> {
        let resolved = self.ctx.resolve_mount(path)?;
        resolved.fs.readdir(&resolved.relative_path).await
    }
}
