//! Key→bytes store abstraction with transactional get/set (C2).
//!
//! A [`Store`] is the backend contract most file-system implementations
//! (`StoreFs`, `SingleBufferStore`-fed mounts) share: numeric keys
//! addressing opaque byte blobs, accessed through short-lived
//! [`Transaction`]s that become visible only on [`Transaction::commit`].

pub mod async_txn;
pub mod memory;
pub mod wrapped;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// Optional capabilities a [`Store`] may advertise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StoreFlags: u32 {
        /// `get`/`set` accept an `[offset, end)` sub-range instead of
        /// always returning/replacing the whole blob.
        const PARTIAL = 1 << 0;
    }
}

/// A key→bytes backend exposing transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// A short identifying name, used in diagnostics.
    fn name(&self) -> &str;

    /// Capabilities this store advertises.
    fn flags(&self) -> StoreFlags {
        StoreFlags::empty()
    }

    /// Starts a new transaction.
    async fn transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Flushes any buffered state to the backing medium.
    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Removes every key from the store.
    async fn clear(&self) -> Result<()>;
}

/// A scoped unit of reads and writes with commit/abort semantics.
///
/// Implementations are consumed by [`Transaction::commit`] and
/// [`Transaction::abort`] so that, once either has run, the transaction
/// cannot be reused — mirroring the "exiting a transaction without
/// explicit commit triggers abort" scoped-acquisition guarantee from
/// spec.md §4.3/§5 (enforced one level up, by [`wrapped::WrappedTransaction`]).
#[async_trait]
pub trait Transaction: Send {
    /// All keys currently present in the store, as observed by this transaction.
    async fn keys(&mut self) -> Result<Vec<u32>>;

    /// Reads `id`'s blob, optionally restricted to `[offset, end)`.
    async fn get(&mut self, id: u32, range: Option<(u64, u64)>) -> Result<Vec<u8>>;

    /// Writes `data` to `id`, optionally at `offset`. Returns the blob's new size.
    async fn set(&mut self, id: u32, data: &[u8], offset: Option<u64>) -> Result<u64>;

    /// Deletes `id` entirely.
    async fn remove(&mut self, id: u32) -> Result<()>;

    /// Makes every mutation performed on this transaction visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every mutation performed on this transaction.
    async fn abort(self: Box<Self>) -> Result<()>;
}
