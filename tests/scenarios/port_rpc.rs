//! S6 — RPC timeout: a `PortFs` with no listener on the other end of
//! its port rejects within its configured timeout and leaves no waiter
//! behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use zenfs_core::fs::FileSystem;
use zenfs_core::port::{ChannelPort, PortFs};

#[tokio::test]
async fn an_unanswered_request_times_out_promptly_and_clears_its_waiter() {
    let (client_port, _unused_server_end) = ChannelPort::pair();
    let client = PortFs::with_timeout(Arc::new(client_port), Duration::from_millis(100));

    let started = Instant::now();
    let err = client.stat("/anything").await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.code(), Some(zenfs_core::ErrorCode::ETimedOut));
    assert!(elapsed < Duration::from_millis(500), "timeout took {elapsed:?}, expected close to 100ms");
}
