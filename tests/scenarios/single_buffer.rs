//! S5 — SingleBuffer cross-thread: one OS thread writes through a
//! `StoreFs` mount, a second (real `std::thread`, its own Tokio
//! runtime) mounts the same shared buffer and reads it back.

use std::sync::Arc;
use std::thread;

use zenfs_core::inode::Credentials;
use zenfs_core::single_buffer::SingleBufferStore;
use zenfs_core::storefs::StoreFs;
use zenfs_core::FileSystem;

fn cred() -> Credentials {
    Credentials { uid: 0, gid: 0 }
}

#[test]
fn a_write_from_one_thread_is_visible_to_a_mount_on_another() {
    let store = SingleBufferStore::open(Vec::new(), 256 * 1024, b"cross-thread").unwrap();

    let writer_store = store.clone();
    let writer = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let fs = StoreFs::new(writer_store, "writer");
            fs.create_file("/worker.txt", 0o644, cred()).await.unwrap();
            fs.write("/worker.txt", b"X", 0).await.unwrap();
            fs.stat("/worker.txt").await.unwrap().mtime
        })
    });
    let write_mtime = writer.join().unwrap();

    let reader_store = store.clone();
    let reader = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let fs = StoreFs::new(reader_store, "reader");
            let mut buf = [0u8; 1];
            fs.read("/worker.txt", &mut buf, 0, 1).await.unwrap();
            (buf[0], fs.stat("/worker.txt").await.unwrap().mtime)
        })
    });
    let (byte, read_mtime) = reader.join().unwrap();

    assert_eq!(byte, b'X');
    assert!(read_mtime >= write_mtime, "timestamps observed across the two threads must not go backwards");
}
