//! Mount table: longest-prefix resolution from absolute paths to backends (C4).
//!
//! Grounded in the teacher's `src/export/mod.rs` export-registry pattern
//! (a path-keyed table with a similar guard-lookup shape), generalized
//! from NFS exports to arbitrary `FileSystem` mounts.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{einval, eio, Result};
use crate::fs::FileSystem;
use crate::path;

/// The result of resolving a path against a [`MountTable`].
pub struct ResolvedMount {
    pub fs: Arc<dyn FileSystem>,
    /// `path` rewritten relative to `mount_point`; always starts with `/`.
    pub relative_path: String,
    pub mount_point: String,
}

/// Map from absolute normalized mount-point path to a backend.
///
/// Single-writer: concurrent `mount`/`umount` is not supported, matching
/// spec.md §5's "the mount map is a single-writer structure".
#[derive(Default, Clone)]
pub struct MountTable {
    mounts: BTreeMap<String, Arc<dyn FileSystem>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, path: &str, fs: Arc<dyn FileSystem>) -> Result<()> {
        let normalized = path::normalize(path);
        if !normalized.starts_with('/') {
            return Err(einval("mount path must be absolute").with_path(path.to_string()));
        }
        if self.mounts.contains_key(&normalized) {
            return Err(einval("already mounted").with_path(normalized));
        }
        self.mounts.insert(normalized, fs);
        Ok(())
    }

    pub fn umount(&mut self, path: &str) {
        let normalized = path::normalize(path);
        if self.mounts.remove(&normalized).is_none() {
            tracing::warn!(path = %normalized, "umount: no mount at path");
        }
    }

    /// Resolves `path` to the mount with the longest prefix that is an
    /// ancestor of it (or equal to it). `EIO` "no file system" if none.
    pub fn resolve(&self, path: &str) -> Result<ResolvedMount> {
        let normalized = path::normalize(path);
        let best = self
            .mounts
            .iter()
            .filter(|(mount_point, _)| {
                mount_point.as_str() == normalized.as_str() || path::is_ancestor(mount_point, &normalized)
            })
            .max_by_key(|(mount_point, _)| mount_point.len());

        let (mount_point, fs) =
            best.ok_or_else(|| eio("no file system").with_path(normalized.clone()))?;

        let relative_path = if mount_point == "/" {
            normalized.clone()
        } else {
            normalized[mount_point.len()..].to_string()
        };
        let relative_path = if relative_path.is_empty() { "/".to_string() } else { relative_path };

        Ok(ResolvedMount { fs: fs.clone(), relative_path, mount_point: mount_point.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{Credentials, Inode, MetadataPatch};
    use async_trait::async_trait;

    struct StubFs(&'static str);

    #[async_trait]
    impl FileSystem for StubFs {
        fn name(&self) -> &str {
            self.0
        }
        async fn stat(&self, _path: &str) -> Result<Inode> {
            Err(crate::error::enoent("stub"))
        }
        async fn create_file(&self, _path: &str, _mode: u16, _cred: Credentials) -> Result<()> {
            Ok(())
        }
        async fn mkdir(&self, _path: &str, _mode: u16, _cred: Credentials) -> Result<()> {
            Ok(())
        }
        async fn unlink(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn rmdir(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn readdir(&self, _path: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn rename(&self, _old: &str, _new: &str) -> Result<()> {
            Ok(())
        }
        async fn link(&self, _target: &str, _link: &str) -> Result<()> {
            Ok(())
        }
        async fn read(&self, _path: &str, _buf: &mut [u8], _offset: u64, _end: u64) -> Result<usize> {
            Ok(0)
        }
        async fn write(&self, _path: &str, _buf: &[u8], _offset: u64) -> Result<usize> {
            Ok(0)
        }
        async fn sync(&self, _path: &str, _data: Option<&[u8]>, _metadata: Option<MetadataPatch>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resolves_the_longest_matching_prefix() {
        let mut table = MountTable::new();
        table.mount("/", Arc::new(StubFs("root"))).unwrap();
        table.mount("/mnt/data", Arc::new(StubFs("data"))).unwrap();

        let resolved = table.resolve("/mnt/data/file.txt").unwrap();
        assert_eq!(resolved.fs.name(), "data");
        assert_eq!(resolved.relative_path, "/file.txt");

        let resolved_root = table.resolve("/elsewhere").unwrap();
        assert_eq!(resolved_root.fs.name(), "root");
    }

    #[test]
    fn mounting_the_same_path_twice_is_rejected() {
        let mut table = MountTable::new();
        table.mount("/a", Arc::new(StubFs("a"))).unwrap();
        assert!(table.mount("/a", Arc::new(StubFs("a2"))).is_err());
    }

    #[test]
    fn resolving_with_no_mounts_fails() {
        let table = MountTable::new();
        assert!(table.resolve("/anything").is_err());
    }

    #[test]
    fn umount_of_an_absent_path_does_not_panic() {
        let mut table = MountTable::new();
        table.umount("/never/mounted");
    }
}
