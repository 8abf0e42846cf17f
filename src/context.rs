//! Bound file-system views: root/pwd, credentials, and a descriptor
//! table, with chroot-narrowing between a context and its children (C8).
//!
//! A [`Context`] is the thing a caller actually holds: every path it
//! resolves is first joined against its `pwd` (if relative) or its
//! `root` (if absolute), the result then carries into mount resolution.
//! [`bind_context`] mirrors the teacher's uid-registry pattern in
//! `src/export/mod.rs` — a child inherits whatever its parent has unless
//! the caller overrides it — generalized from "a uid per export" to "a
//! full context per bind".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{ebade, ebusy, eperm, Result};
use crate::fs::FileSystem;
use crate::inode::Inode;
use crate::mount::MountTable;
use crate::path;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Caller identity carried by a [`Context`]: real and effective ids plus
/// supplementary groups. Distinct from [`crate::inode::Credentials`],
/// which is the narrower (uid, gid) pair inode access checks compare
/// against — see [`Credentials::as_access`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub groups: Vec<u32>,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials::root()
    }
}

impl Credentials {
    pub fn root() -> Self {
        Credentials { uid: 0, gid: 0, euid: 0, egid: 0, groups: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.euid == 0 || self.egid == 0
    }

    /// The (uid, gid) pair inode ownership/access checks use — POSIX
    /// access checks compare against the *effective*, not real, ids.
    pub fn as_access(&self) -> crate::inode::Credentials {
        crate::inode::Credentials { uid: self.euid, gid: self.egid }
    }
}

/// A caller's view of an open path: the path it was opened under (real,
/// root-relative) and the inode snapshot observed at open time.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub path: String,
    pub inode: Inode,
}

/// Optional overrides for [`bind_context`]; any field left `None` is
/// inherited from the parent (or defaulted, for a root context).
#[derive(Default)]
pub struct ContextInit {
    pub root: Option<String>,
    pub pwd: Option<String>,
    pub credentials: Option<Credentials>,
    pub mounts: Option<MountTable>,
}

/// A bound view over the mounted file systems: root (its chroot), pwd,
/// credentials, and a descriptor table, with a parent/children tree
/// mirroring how binds were derived.
pub struct Context {
    pub id: u64,
    root: RwLock<String>,
    pwd: RwLock<String>,
    credentials: RwLock<Credentials>,
    descriptors: Mutex<HashMap<u32, Descriptor>>,
    next_fd: AtomicU32,
    mounts: RwLock<MountTable>,
    parent: Option<Arc<Context>>,
    children: Mutex<Vec<Arc<Context>>>,
}

impl Context {
    pub fn root(&self) -> String {
        self.root.read().expect("root lock poisoned").clone()
    }

    pub fn pwd(&self) -> String {
        self.pwd.read().expect("pwd lock poisoned").clone()
    }

    pub fn set_pwd(&self, pwd: String) {
        *self.pwd.write().expect("pwd lock poisoned") = pwd;
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.read().expect("credentials lock poisoned").clone()
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().expect("credentials lock poisoned") = credentials;
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> Vec<Arc<Context>> {
        self.children.lock().expect("children mutex poisoned").clone()
    }

    pub fn mount(&self, path: &str, fs: Arc<dyn FileSystem>) -> Result<()> {
        self.mounts.write().expect("mounts lock poisoned").mount(path, fs)
    }

    pub fn umount(&self, path: &str) {
        self.mounts.write().expect("mounts lock poisoned").umount(path);
    }

    /// Joins `path` against `pwd` (if relative) or `root` (if absolute).
    pub fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            crate::path::join(&[&self.root(), path])
        } else {
            crate::path::join(&[&self.pwd(), path])
        }
    }

    /// Resolves `path` (per [`Context::resolve_path`]) against the mount table.
    pub fn resolve_mount(&self, path: &str) -> Result<crate::mount::ResolvedMount> {
        let real = self.resolve_path(path);
        self.mounts.read().expect("mounts lock poisoned").resolve(&real)
    }

    pub fn open_descriptor(&self, path: String, inode: Inode) -> u32 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.descriptors.lock().expect("descriptors mutex poisoned").insert(fd, Descriptor { path, inode });
        fd
    }

    pub fn descriptor(&self, fd: u32) -> Option<Descriptor> {
        self.descriptors.lock().expect("descriptors mutex poisoned").get(&fd).cloned()
    }

    pub fn close_descriptor(&self, fd: u32) -> Result<()> {
        self.descriptors
            .lock()
            .expect("descriptors mutex poisoned")
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| ebade("no such descriptor"))
    }
}

/// Creates a child of `parent` (or a fresh root context if `None`),
/// copying any field left unset in `init` from the parent.
pub fn bind_context(parent: Option<&Arc<Context>>, init: ContextInit) -> Arc<Context> {
    let (root, pwd, credentials, mounts) = match parent {
        Some(p) => (
            init.root.unwrap_or_else(|| p.root()),
            init.pwd.unwrap_or_else(|| p.pwd()),
            init.credentials.unwrap_or_else(|| p.credentials()),
            init.mounts.unwrap_or_else(|| p.mounts.read().expect("mounts lock poisoned").clone()),
        ),
        None => (
            init.root.unwrap_or_else(|| "/".to_string()),
            init.pwd.unwrap_or_else(|| "/".to_string()),
            init.credentials.unwrap_or_default(),
            init.mounts.unwrap_or_default(),
        ),
    };

    let child = Arc::new(Context {
        id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
        root: RwLock::new(root),
        pwd: RwLock::new(pwd),
        credentials: RwLock::new(credentials),
        descriptors: Mutex::new(HashMap::new()),
        next_fd: AtomicU32::new(0),
        mounts: RwLock::new(mounts),
        parent: parent.cloned(),
        children: Mutex::new(Vec::new()),
    });

    if let Some(p) = parent {
        p.children.lock().expect("children mutex poisoned").push(child.clone());
    }
    child
}

/// Narrows `ctx`'s root to `path` (resolved the same way any other path
/// argument would be). Requires root credentials; the new root must stay
/// within the current root; every open descriptor must already lie
/// within the new root, and is rewritten relative to it.
pub fn chroot(ctx: &Arc<Context>, path: &str) -> Result<()> {
    if !ctx.credentials().is_root() {
        return Err(eperm("chroot requires root credentials"));
    }

    let current_root = ctx.root();
    let new_root = ctx.resolve_path(path);
    if new_root != current_root && !path::is_ancestor(&current_root, &new_root) {
        return Err(eperm("chroot target escapes the current root").with_path(new_root));
    }

    let mut descriptors = ctx.descriptors.lock().expect("descriptors mutex poisoned");
    for descriptor in descriptors.values() {
        if descriptor.path != new_root && !path::is_ancestor(&new_root, &descriptor.path) {
            return Err(ebusy("open descriptor would escape the new root").with_path(descriptor.path.clone()));
        }
    }
    for descriptor in descriptors.values_mut() {
        descriptor.path = rewrite_relative(&new_root, &descriptor.path);
    }
    drop(descriptors);

    let new_pwd = if ctx.pwd() == new_root || path::is_ancestor(&new_root, &ctx.pwd()) {
        ctx.pwd()
    } else {
        new_root.clone()
    };

    *ctx.root.write().expect("root lock poisoned") = new_root;
    ctx.set_pwd(new_pwd);
    Ok(())
}

fn rewrite_relative(new_root: &str, absolute: &str) -> String {
    if new_root == "/" {
        return absolute.to_string();
    }
    let tail = &absolute[new_root.len()..];
    if tail.is_empty() {
        "/".to_string()
    } else {
        tail.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{Credentials as AccessCredentials, Inode, S_IFREG};

    fn sample_inode(path: &str) -> Inode {
        let _ = path;
        Inode::new(1, 2, S_IFREG | 0o644, 0.0, AccessCredentials::default())
    }

    #[test]
    fn bind_context_inherits_unset_fields_from_parent() {
        let parent = bind_context(None, ContextInit { root: Some("/srv".to_string()), ..Default::default() });
        let child = bind_context(Some(&parent), ContextInit::default());
        assert_eq!(child.root(), "/srv");
        assert_eq!(child.pwd(), parent.pwd());
        assert_eq!(parent.children().len(), 1);
    }

    #[test]
    fn bind_context_overrides_take_precedence() {
        let parent = bind_context(None, ContextInit::default());
        let child = bind_context(Some(&parent), ContextInit { pwd: Some("/tmp".to_string()), ..Default::default() });
        assert_eq!(child.pwd(), "/tmp");
        assert_eq!(parent.pwd(), "/");
    }

    #[test]
    fn chroot_rejects_non_root_credentials() {
        let ctx = bind_context(None, ContextInit { credentials: Some(Credentials { uid: 1, gid: 1, euid: 1, egid: 1, groups: vec![] }), ..Default::default() });
        assert!(chroot(&ctx, "/jail").is_err());
    }

    #[test]
    fn chroot_rejects_escaping_the_current_root() {
        let ctx = bind_context(None, ContextInit { root: Some("/jail".to_string()), ..Default::default() });
        assert!(chroot(&ctx, "/../etc").is_err());
    }

    #[test]
    fn chroot_narrows_root_and_rewrites_descriptors() {
        let ctx = bind_context(None, ContextInit::default());
        let fd = ctx.open_descriptor("/srv/data/file".to_string(), sample_inode("/srv/data/file"));

        chroot(&ctx, "/srv").unwrap();

        assert_eq!(ctx.root(), "/srv");
        let descriptor = ctx.descriptor(fd).unwrap();
        assert_eq!(descriptor.path, "/data/file");
    }

    #[test]
    fn chroot_rejects_when_a_descriptor_would_escape_the_new_root() {
        let ctx = bind_context(None, ContextInit::default());
        ctx.open_descriptor("/elsewhere/file".to_string(), sample_inode("/elsewhere/file"));
        assert!(chroot(&ctx, "/srv").is_err());
    }

    #[test]
    fn descriptor_table_opens_and_closes() {
        let ctx = bind_context(None, ContextInit::default());
        let fd = ctx.open_descriptor("/a".to_string(), sample_inode("/a"));
        assert!(ctx.descriptor(fd).is_some());
        ctx.close_descriptor(fd).unwrap();
        assert!(ctx.descriptor(fd).is_none());
        assert!(ctx.close_descriptor(fd).is_err());
    }
}
