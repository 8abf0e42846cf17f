//! S4 — CoW delete + readdir, then a re-mount from the serialized
//! journal observes the same deletion.

use std::sync::Arc;

use zenfs_core::context::{bind_context, ContextInit, Credentials as ContextCredentials};
use zenfs_core::fs::FileSystem;
use zenfs_core::inode::Credentials;
use zenfs_core::overlay::{CopyOnWrite, Journal};
use zenfs_core::store::memory::MemoryStore;
use zenfs_core::storefs::StoreFs;

fn cred() -> Credentials {
    Credentials { uid: 0, gid: 0 }
}

async fn seeded_lower() -> Arc<StoreFs<MemoryStore>> {
    let lower = StoreFs::new(MemoryStore::new(), "lower");
    lower.create_file("/file", 0o644, cred()).await.unwrap();
    lower.write("/file", b"lower bytes", 0).await.unwrap();
    Arc::new(lower)
}

#[tokio::test]
async fn delete_survives_remount_from_the_serialized_journal() {
    let lower = seeded_lower().await;
    let upper = Arc::new(StoreFs::new(MemoryStore::new(), "upper"));
    let cow = Arc::new(CopyOnWrite::new(lower.clone(), upper).unwrap());

    let ctx = bind_context(None, ContextInit { credentials: Some(ContextCredentials::root()), ..Default::default() });
    let cow_fs: Arc<dyn FileSystem> = cow.clone();
    ctx.mount("/ro", cow_fs).expect("mount cow overlay");

    let resolved = ctx.resolve_mount("/ro/file").unwrap();
    resolved.fs.unlink(&resolved.relative_path).await.unwrap();

    let listing = ctx.resolve_mount("/ro").unwrap();
    assert_eq!(listing.fs.readdir(&listing.relative_path).await.unwrap(), Vec::<String>::new());

    let journal_text = cow.journal_text().await;

    // Re-mount: a fresh overlay over the same lower, a fresh upper, and
    // the journal restored from its serialized text rather than reused
    // in-process.
    let reopened_upper = Arc::new(StoreFs::new(MemoryStore::new(), "upper2"));
    let restored_journal = Journal::parse(&journal_text).unwrap();
    let reopened = Arc::new(CopyOnWrite::with_journal(lower, reopened_upper, restored_journal).unwrap());

    let ctx2 = bind_context(None, ContextInit { credentials: Some(ContextCredentials::root()), ..Default::default() });
    let reopened_fs: Arc<dyn FileSystem> = reopened;
    ctx2.mount("/ro", reopened_fs).expect("mount reopened overlay");

    let resolved2 = ctx2.resolve_mount("/ro").unwrap();
    assert_eq!(resolved2.fs.readdir(&resolved2.relative_path).await.unwrap(), Vec::<String>::new());
    let file_resolved = ctx2.resolve_mount("/ro/file").unwrap();
    assert!(file_resolved.fs.stat(&file_resolved.relative_path).await.is_err());
}
