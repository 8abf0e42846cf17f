//! Message-channel projection of a [`FileSystem`] across a boundary (C7).
//!
//! `Port` abstracts a bidirectional text-message transport; the wire
//! encoding ("Z" + version + JSON, base64-prefixed binary fields) that
//! spec.md describes for a WebSocket transport is one realization of
//! that interface, not the interface itself, so the trait here only
//! commits to `send`/`recv` of opaque `String` messages and lets a given
//! transport choose its own encoding underneath. [`ChannelPort`] is the
//! concrete, same-process transport used by tests and by in-process
//! client/server pairs; it also doubles as the "buffer messages sent
//! before the server starts listening" guarantee spec.md calls
//! `catchMessages`, since a `tokio::sync::mpsc` channel already queues
//! anything sent before the receiving end is polled.
//!
//! `PortFs` proxies every [`FileSystem`] method through [`PortFs::rpc`]:
//! it serializes a request, registers a `oneshot` waiter for its id in a
//! per-port registry, and resolves that waiter when a background task
//! reading `port.recv()` sees a matching response. `handle_request`/
//! `serve` are the server-side counterpart, dispatching into a local
//! `FileSystem` and serializing the result (or a captured error) back.
//!
//! Extended attributes are not represented in the wire DTOs below: they
//! are local-store metadata, not part of the path-oriented `FileSystem`
//! surface PortFs projects, so a `PortFs`-backed mount never carries
//! `Inode::attributes` across the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::{eio, etimedout, ErrorCode, Result, ZenFsError};
use crate::fs::FileSystem;
use crate::inode::{Credentials, Inode, InodeFlags, MetadataPatch};

/// Default per-request timeout: spec.md §4.7.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Plain-data configuration surface for [`PortFs`]; the configuration
/// *loader* that would produce one is out of scope here (spec.md §1
/// Non-goals), but the shape a caller's own loader would feed in is not.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortFsConfig {
    pub timeout_ms: u64,
}

impl Default for PortFsConfig {
    fn default() -> Self {
        PortFsConfig { timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64 }
    }
}

impl PortFsConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A bidirectional text-message transport.
#[async_trait]
pub trait Port: Send + Sync + 'static {
    async fn send(&self, message: String) -> Result<()>;
    async fn recv(&self) -> Result<String>;
}

/// Same-process transport over a pair of `tokio::sync::mpsc` channels.
pub struct ChannelPort {
    tx: mpsc::Sender<String>,
    rx: AsyncMutex<mpsc::Receiver<String>>,
}

impl ChannelPort {
    /// Builds two cross-wired ends; messages sent on one arrive on the other.
    pub fn pair() -> (Self, Self) {
        let (tx_to_b, rx_from_a) = mpsc::channel(256);
        let (tx_to_a, rx_from_b) = mpsc::channel(256);
        let a = ChannelPort { tx: tx_to_b, rx: AsyncMutex::new(rx_from_b) };
        let b = ChannelPort { tx: tx_to_a, rx: AsyncMutex::new(rx_from_a) };
        (a, b)
    }
}

#[async_trait]
impl Port for ChannelPort {
    async fn send(&self, message: String) -> Result<()> {
        self.tx.send(message).await.map_err(|_| eio("port send failed: peer dropped"))
    }

    async fn recv(&self) -> Result<String> {
        self.rx.lock().await.recv().await.ok_or_else(|| eio("port closed"))
    }
}

fn random_hex_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CredentialsWire {
    pub uid: u32,
    pub gid: u32,
}

impl From<Credentials> for CredentialsWire {
    fn from(c: Credentials) -> Self {
        CredentialsWire { uid: c.uid, gid: c.gid }
    }
}

impl From<CredentialsWire> for Credentials {
    fn from(w: CredentialsWire) -> Self {
        Credentials { uid: w.uid, gid: w.gid }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatchWire {
    pub size: Option<u32>,
    pub mode: Option<u16>,
    pub nlink: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<f64>,
    pub mtime: Option<f64>,
    pub ctime: Option<f64>,
    pub birthtime: Option<f64>,
    pub flags: Option<u32>,
}

impl From<MetadataPatch> for MetadataPatchWire {
    fn from(p: MetadataPatch) -> Self {
        MetadataPatchWire {
            size: p.size,
            mode: p.mode,
            nlink: p.nlink,
            uid: p.uid,
            gid: p.gid,
            atime: p.atime,
            mtime: p.mtime,
            ctime: p.ctime,
            birthtime: p.birthtime,
            flags: p.flags.map(|f| f.bits()),
        }
    }
}

impl From<MetadataPatchWire> for MetadataPatch {
    fn from(w: MetadataPatchWire) -> Self {
        MetadataPatch {
            size: w.size,
            mode: w.mode,
            nlink: w.nlink,
            uid: w.uid,
            gid: w.gid,
            atime: w.atime,
            mtime: w.mtime,
            ctime: w.ctime,
            birthtime: w.birthtime,
            flags: w.flags.map(InodeFlags::from_bits_truncate),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeWire {
    pub data: u32,
    pub size: u32,
    pub mode: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: f64,
    pub birthtime: f64,
    pub mtime: f64,
    pub ctime: f64,
    pub ino: u32,
    pub version: u32,
    pub flags: u32,
}

impl From<&Inode> for InodeWire {
    fn from(inode: &Inode) -> Self {
        InodeWire {
            data: inode.data,
            size: inode.size,
            mode: inode.mode,
            nlink: inode.nlink,
            uid: inode.uid,
            gid: inode.gid,
            atime: inode.atime,
            birthtime: inode.birthtime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            ino: inode.ino,
            version: inode.version,
            flags: inode.flags.bits(),
        }
    }
}

impl From<InodeWire> for Inode {
    fn from(w: InodeWire) -> Self {
        Inode {
            data: w.data,
            size: w.size,
            mode: w.mode,
            nlink: w.nlink,
            uid: w.uid,
            gid: w.gid,
            atime: w.atime,
            birthtime: w.birthtime,
            mtime: w.mtime,
            ctime: w.ctime,
            ino: w.ino,
            version: w.version,
            flags: InodeFlags::from_bits_truncate(w.flags),
            attributes: crate::inode::Attributes::default(),
        }
    }
}

/// One `FileSystem` call, adjacently tagged so the wire shape is
/// `{"method": "...", "args": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum RpcCall {
    Stat { path: String },
    CreateFile { path: String, mode: u16, cred: CredentialsWire },
    OpenFile { path: String },
    Mkdir { path: String, mode: u16, cred: CredentialsWire },
    Unlink { path: String },
    Rmdir { path: String },
    Readdir { path: String },
    Rename { old_path: String, new_path: String },
    Link { target_path: String, link_path: String },
    Read { path: String, len: usize, offset: u64, end: u64 },
    Write { path: String, data: Vec<u8>, offset: u64 },
    Sync { path: String, data: Option<Vec<u8>>, metadata: Option<MetadataPatchWire> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcValue {
    Unit,
    Inode(InodeWire),
    Names(Vec<String>),
    Bytes(Vec<u8>),
    Count(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorWire {
    pub code: String,
    pub errno: i32,
    pub message: String,
    pub path: Option<String>,
}

impl From<&ZenFsError> for RpcErrorWire {
    fn from(err: &ZenFsError) -> Self {
        match err {
            ZenFsError::System { code, message, path, .. } => {
                RpcErrorWire { code: code.name().to_string(), errno: code.errno(), message: message.clone(), path: path.clone() }
            }
            ZenFsError::Transport { message, .. } => {
                RpcErrorWire { code: ErrorCode::EIo.name().to_string(), errno: ErrorCode::EIo.errno(), message: message.clone(), path: None }
            }
        }
    }
}

impl RpcErrorWire {
    fn into_zenfs_error(self) -> ZenFsError {
        let code = match self.code.as_str() {
            "EACCES" => ErrorCode::EAcces,
            "EAGAIN" => ErrorCode::EAgain,
            "EBADE" => ErrorCode::EBadE,
            "EBUSY" => ErrorCode::EBusy,
            "EDEADLK" => ErrorCode::EDeadlk,
            "EEXIST" => ErrorCode::EExist,
            "EINVAL" => ErrorCode::EInval,
            "EISDIR" => ErrorCode::EIsDir,
            "ENODATA" => ErrorCode::ENoData,
            "ENOENT" => ErrorCode::ENoEnt,
            "ENOSPC" => ErrorCode::ENoSpc,
            "ENOTDIR" => ErrorCode::ENotDir,
            "ENOTEMPTY" => ErrorCode::ENotEmpty,
            "ENOTSUP" => ErrorCode::ENotSup,
            "EOVERFLOW" => ErrorCode::EOverflow,
            "EPERM" => ErrorCode::EPerm,
            "EPROTONOSUPPORT" => ErrorCode::EProtoNoSupport,
            "EREMOTEIO" => ErrorCode::ERemoteIo,
            "EROFS" => ErrorCode::ERoFs,
            "ETIMEDOUT" => ErrorCode::ETimedOut,
            _ => ErrorCode::EIo,
        };
        let mut err = ZenFsError::new(code, self.message);
        if let Some(path) = self.path {
            err = err.with_path(path);
        }
        err
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(rename = "_zenfs")]
    pub zenfs: bool,
    pub id: String,
    #[serde(flatten)]
    pub call: RpcCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<RpcValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<RpcErrorWire>,
}

type PendingMap = Arc<SyncMutex<HashMap<String, oneshot::Sender<std::result::Result<RpcValue, RpcErrorWire>>>>>;

/// Projects a remote `FileSystem` across a [`Port`] as an RPC client.
pub struct PortFs<P: Port> {
    port: Arc<P>,
    pending: PendingMap,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl<P: Port> PortFs<P> {
    pub fn new(port: Arc<P>) -> Self {
        Self::with_timeout(port, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(port: Arc<P>, timeout: Duration) -> Self {
        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let listener = tokio::spawn(listen(port.clone(), pending.clone()));
        Self { port, pending, timeout, listener }
    }

    /// Builds a client from a plain-data [`PortFsConfig`], e.g. one
    /// deserialized by a caller's own configuration loader.
    pub fn with_config(port: Arc<P>, config: PortFsConfig) -> Self {
        Self::with_timeout(port, config.timeout())
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending mutex poisoned").len()
    }

    async fn rpc(&self, call: RpcCall) -> Result<RpcValue> {
        let id = random_hex_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending mutex poisoned").insert(id.clone(), tx);

        let request = RpcRequest { zenfs: true, id: id.clone(), call };
        let text = serde_json::to_string(&request)
            .map_err(|e| ZenFsError::transport_with_source("failed to encode RPC request", e))?;

        if let Err(err) = self.port.send(text).await {
            self.pending.lock().expect("pending mutex poisoned").remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(err.into_zenfs_error()),
            Ok(Err(_)) => Err(eio("RPC listener closed").with_path(id)),
            Err(_) => {
                self.pending.lock().expect("pending mutex poisoned").remove(&id);
                Err(etimedout("RPC request timed out").with_path(id))
            }
        }
    }
}

impl<P: Port> Drop for PortFs<P> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(port: Arc<impl Port>, pending: PendingMap) {
    loop {
        let text = match port.recv().await {
            Ok(text) => text,
            Err(_) => break,
        };
        let response: RpcResponse = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let sender = pending.lock().expect("pending mutex poisoned").remove(&response.id);
        match sender {
            Some(sender) => {
                let result = match response.error {
                    Some(err) => Err(err),
                    None => Ok(response.value.unwrap_or(RpcValue::Unit)),
                };
                let _ = sender.send(result);
            }
            None => tracing::warn!(id = %response.id, "RPC response for unknown request id"),
        }
    }
}

fn expect_unit(value: RpcValue) -> Result<()> {
    match value {
        RpcValue::Unit => Ok(()),
        _ => Err(eio("unexpected RPC response shape")),
    }
}

fn expect_inode(value: RpcValue) -> Result<Inode> {
    match value {
        RpcValue::Inode(wire) => Ok(wire.into()),
        _ => Err(eio("unexpected RPC response shape")),
    }
}

fn expect_names(value: RpcValue) -> Result<Vec<String>> {
    match value {
        RpcValue::Names(names) => Ok(names),
        _ => Err(eio("unexpected RPC response shape")),
    }
}

fn expect_bytes(value: RpcValue) -> Result<Vec<u8>> {
    match value {
        RpcValue::Bytes(bytes) => Ok(bytes),
        _ => Err(eio("unexpected RPC response shape")),
    }
}

fn expect_count(value: RpcValue) -> Result<usize> {
    match value {
        RpcValue::Count(n) => Ok(n),
        _ => Err(eio("unexpected RPC response shape")),
    }
}

#[async_trait]
impl<P: Port> FileSystem for PortFs<P> {
    fn name(&self) -> &str {
        "port"
    }

    async fn stat(&self, path: &str) -> Result<Inode> {
        expect_inode(self.rpc(RpcCall::Stat { path: path.to_string() }).await?)
    }

    async fn create_file(&self, path: &str, mode: u16, cred: Credentials) -> Result<()> {
        expect_unit(self.rpc(RpcCall::CreateFile { path: path.to_string(), mode, cred: cred.into() }).await?)
    }

    async fn open_file(&self, path: &str) -> Result<Inode> {
        expect_inode(self.rpc(RpcCall::OpenFile { path: path.to_string() }).await?)
    }

    async fn mkdir(&self, path: &str, mode: u16, cred: Credentials) -> Result<()> {
        expect_unit(self.rpc(RpcCall::Mkdir { path: path.to_string(), mode, cred: cred.into() }).await?)
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        expect_unit(self.rpc(RpcCall::Unlink { path: path.to_string() }).await?)
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        expect_unit(self.rpc(RpcCall::Rmdir { path: path.to_string() }).await?)
    }

    async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        expect_names(self.rpc(RpcCall::Readdir { path: path.to_string() }).await?)
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        expect_unit(self.rpc(RpcCall::Rename { old_path: old_path.to_string(), new_path: new_path.to_string() }).await?)
    }

    async fn link(&self, target_path: &str, link_path: &str) -> Result<()> {
        expect_unit(self.rpc(RpcCall::Link { target_path: target_path.to_string(), link_path: link_path.to_string() }).await?)
    }

    async fn read(&self, path: &str, buf: &mut [u8], offset: u64, end: u64) -> Result<usize> {
        let bytes = expect_bytes(self.rpc(RpcCall::Read { path: path.to_string(), len: buf.len(), offset, end }).await?)?;
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    async fn write(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        expect_count(self.rpc(RpcCall::Write { path: path.to_string(), data: buf.to_vec(), offset }).await?)
    }

    async fn sync(&self, path: &str, data: Option<&[u8]>, metadata: Option<MetadataPatch>) -> Result<()> {
        expect_unit(
            self.rpc(RpcCall::Sync {
                path: path.to_string(),
                data: data.map(|d| d.to_vec()),
                metadata: metadata.map(Into::into),
            })
            .await?,
        )
    }
}

async fn dispatch(fs: &dyn FileSystem, call: RpcCall) -> Result<RpcValue> {
    match call {
        RpcCall::Stat { path } => fs.stat(&path).await.map(|i| RpcValue::Inode((&i).into())),
        RpcCall::CreateFile { path, mode, cred } => fs.create_file(&path, mode, cred.into()).await.map(|_| RpcValue::Unit),
        RpcCall::OpenFile { path } => fs.open_file(&path).await.map(|i| RpcValue::Inode((&i).into())),
        RpcCall::Mkdir { path, mode, cred } => fs.mkdir(&path, mode, cred.into()).await.map(|_| RpcValue::Unit),
        RpcCall::Unlink { path } => fs.unlink(&path).await.map(|_| RpcValue::Unit),
        RpcCall::Rmdir { path } => fs.rmdir(&path).await.map(|_| RpcValue::Unit),
        RpcCall::Readdir { path } => fs.readdir(&path).await.map(RpcValue::Names),
        RpcCall::Rename { old_path, new_path } => fs.rename(&old_path, &new_path).await.map(|_| RpcValue::Unit),
        RpcCall::Link { target_path, link_path } => fs.link(&target_path, &link_path).await.map(|_| RpcValue::Unit),
        RpcCall::Read { path, len, offset, end } => {
            let mut buf = vec![0u8; len];
            let n = fs.read(&path, &mut buf, offset, end).await?;
            buf.truncate(n);
            Ok(RpcValue::Bytes(buf))
        }
        RpcCall::Write { path, data, offset } => fs.write(&path, &data, offset).await.map(RpcValue::Count),
        RpcCall::Sync { path, data, metadata } => {
            fs.sync(&path, data.as_deref(), metadata.map(Into::into)).await.map(|_| RpcValue::Unit)
        }
    }
}

/// Handles one decoded request against a local `FileSystem`, capturing
/// a failure into the response's `error` field instead of propagating it.
pub async fn handle_request(fs: &dyn FileSystem, request: RpcRequest) -> RpcResponse {
    match dispatch(fs, request.call).await {
        Ok(value) => RpcResponse { id: request.id, value: Some(value), error: None },
        Err(err) => RpcResponse { id: request.id, value: None, error: Some((&err).into()) },
    }
}

/// Runs a server loop over `port`, dispatching every request into `fs`
/// until the port closes.
pub async fn serve(port: Arc<impl Port>, fs: Arc<dyn FileSystem>) -> Result<()> {
    loop {
        let text = match port.recv().await {
            Ok(text) => text,
            Err(_) => return Ok(()),
        };
        let request: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let response = handle_request(fs.as_ref(), request).await;
        let encoded = serde_json::to_string(&response)
            .map_err(|e| ZenFsError::transport_with_source("failed to encode RPC response", e))?;
        port.send(encoded).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::storefs::StoreFs;

    fn cred() -> Credentials {
        Credentials { uid: 0, gid: 0 }
    }

    #[tokio::test]
    async fn round_trips_create_write_stat_over_a_channel_port() {
        let (client_port, server_port) = ChannelPort::pair();
        let server_fs: Arc<dyn FileSystem> = Arc::new(StoreFs::new(MemoryStore::new(), "server"));
        tokio::spawn(serve(Arc::new(server_port), server_fs));

        let client = PortFs::new(Arc::new(client_port));
        client.create_file("/greeting", 0o644, cred()).await.unwrap();
        client.write("/greeting", b"hello over rpc", 0).await.unwrap();

        let inode = client.stat("/greeting").await.unwrap();
        assert_eq!(inode.size, 14);

        let mut buf = [0u8; 14];
        let n = client.read("/greeting", &mut buf, 0, 14).await.unwrap();
        assert_eq!(&buf[..n], b"hello over rpc");
    }

    #[tokio::test]
    async fn a_request_with_no_listener_times_out_and_clears_its_waiter() {
        let (client_port, _server_port) = ChannelPort::pair();
        let client = PortFs::with_timeout(Arc::new(client_port), Duration::from_millis(50));

        let err = client.stat("/anything").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ETimedOut));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn a_response_for_an_unknown_id_is_dropped_not_fatal() {
        let (client_port, server_port) = ChannelPort::pair();
        let client = PortFs::new(Arc::new(client_port));
        let stray = RpcResponse { id: "deadbeef".to_string(), value: Some(RpcValue::Unit), error: None };
        server_port.send(serde_json::to_string(&stray).unwrap()).await.unwrap();

        // give the listener a moment to consume the stray response
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.pending_count(), 0);
    }
}
