//! S1 — create/read cycle, exercised through a bound [`Context`] rather
//! than directly against a `StoreFs`, so mount resolution and per-path
//! locking are on the call path too.

use crate::common::Fixture;

#[tokio::test]
async fn create_write_read_round_trips_through_a_mounted_context() {
    let fixture = Fixture::new();

    fixture.mkdir("/a", 0o755).await.expect("mkdir succeeds");
    fixture.create_file("/a/f", 0o644).await.expect("create succeeds");
    fixture.write("/a/f", b"hello", 0).await.expect("write succeeds");

    let mut buf = [0u8; 5];
    let n = fixture.read("/a/f", &mut buf, 0, 5).await.expect("read succeeds");
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");

    let inode = fixture.stat("/a/f").await.expect("stat succeeds");
    assert_eq!(inode.size, 5);
}

#[tokio::test]
async fn reading_a_missing_file_fails_enoent() {
    let fixture = Fixture::new();
    let err = fixture.stat("/never/created").await.unwrap_err();
    assert_eq!(err.code(), Some(zenfs_core::ErrorCode::ENoEnt));
}
