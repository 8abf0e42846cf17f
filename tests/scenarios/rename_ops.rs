//! S2 — rename-over-file, and S3 — rename-into-subdir `EBUSY`, both
//! through a bound [`Context`].

use crate::common::Fixture;

#[tokio::test]
async fn rename_over_an_existing_file_replaces_it_and_keeps_listing_count() {
    let fixture = Fixture::new();
    fixture.create_file("/x", 0o644).await.unwrap();
    fixture.write("/x", b"xbytes", 0).await.unwrap();
    fixture.create_file("/y", 0o644).await.unwrap();

    let before = fixture.readdir("/").await.unwrap().len();
    fixture.rename("/x", "/y").await.unwrap();
    let after = fixture.readdir("/").await.unwrap().len();

    assert!(fixture.stat("/x").await.is_err());
    let mut buf = [0u8; 6];
    fixture.read("/y", &mut buf, 0, 6).await.unwrap();
    assert_eq!(&buf, b"xbytes");
    assert_eq!(before, after);
}

#[tokio::test]
async fn renaming_a_directory_into_its_own_subtree_is_rejected_as_busy() {
    let fixture = Fixture::new();
    fixture.mkdir("/a", 0o755).await.unwrap();

    let err = fixture.rename("/a", "/a/b").await.unwrap_err();
    assert_eq!(err.code(), Some(zenfs_core::ErrorCode::EBusy));
}
