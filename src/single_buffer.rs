//! Superblock + rotating metadata-block chain, implementing [`Store`]
//! directly against one contiguous, optionally cross-thread-shared byte
//! buffer (C6).
//!
//! The buffer itself lives behind a single `std::sync::Mutex<Vec<u8>>`:
//! every `get`/`set`/`remove` takes the lock for the duration of a
//! synchronous slice operation (never held across an `.await`), which
//! gives the same cross-thread exclusion spec.md asks of per-field
//! atomics without requiring `unsafe` pointer-cast atomics over
//! arbitrary, not-necessarily-aligned byte offsets. `used_bytes` is
//! additionally mirrored into a real `AtomicU64` so its current value
//! can be read without taking the buffer lock. The on-disk `locked`
//! word inside each metadata block is preserved for format fidelity and
//! exposed through [`SingleBufferStore::lock_block`], a scoped guard
//! used by callers that want to honor the block-level lock explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ebusy, eio, enodata, enospc, Result};
use crate::store::{Store, StoreFlags, Transaction};

/// Plain-data configuration surface for [`SingleBufferStore::open`]; the
/// loader that would produce one from a file/CLI is out of scope here
/// (spec.md §1 Non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleBufferConfig {
    pub label: [u8; 64],
    pub total_bytes: u64,
}

pub const MAGIC: u32 = 0x62732e7a;
pub const INODE_FORMAT: u16 = 5;
pub const SUPERBLOCK_SIZE: usize = 256;
pub const ITEMS_PER_BLOCK: usize = 255;
const ITEM_SIZE: usize = 12;
const METADATA_HEADER_SIZE: usize = 16;
const METADATA_ITEMS_SIZE: usize = ITEMS_PER_BLOCK * ITEM_SIZE;
pub const METADATA_BLOCK_SIZE: usize = METADATA_HEADER_SIZE + METADATA_ITEMS_SIZE + 4;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn align4(n: u64) -> u64 {
    (n + 3) & !3
}

#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u32,
    pub version: u16,
    pub inode_format: u16,
    pub flags: u32,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub uuid: [u8; 16],
    pub metadata_block_size: u32,
    pub metadata_offset: u32,
    pub label: [u8; 64],
}

impl Superblock {
    fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        LittleEndian::write_u32(&mut buf[4..], self.magic);
        LittleEndian::write_u16(&mut buf[8..], self.version);
        LittleEndian::write_u16(&mut buf[10..], self.inode_format);
        LittleEndian::write_u32(&mut buf[12..], self.flags);
        LittleEndian::write_u64(&mut buf[16..], self.used_bytes);
        LittleEndian::write_u64(&mut buf[24..], self.total_bytes);
        buf[32..48].copy_from_slice(&self.uuid);
        LittleEndian::write_u32(&mut buf[48..], self.metadata_block_size);
        LittleEndian::write_u32(&mut buf[52..], self.metadata_offset);
        buf[56..120].copy_from_slice(&self.label);
        let checksum = crc32c::crc32c(&buf[4..]);
        LittleEndian::write_u32(&mut buf[0..], checksum);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(eio("truncated superblock"));
        }
        let stored = LittleEndian::read_u32(&buf[0..]);
        let computed = crc32c::crc32c(&buf[4..SUPERBLOCK_SIZE]);
        if stored != computed {
            return Err(eio("superblock checksum mismatch"));
        }
        let magic = LittleEndian::read_u32(&buf[4..]);
        if magic != MAGIC {
            return Err(eio("bad superblock magic"));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[32..48]);
        let mut label = [0u8; 64];
        label.copy_from_slice(&buf[56..120]);
        Ok(Superblock {
            magic,
            version: LittleEndian::read_u16(&buf[8..]),
            inode_format: LittleEndian::read_u16(&buf[10..]),
            flags: LittleEndian::read_u32(&buf[12..]),
            used_bytes: LittleEndian::read_u64(&buf[16..]),
            total_bytes: LittleEndian::read_u64(&buf[24..]),
            uuid,
            metadata_block_size: LittleEndian::read_u32(&buf[48..]),
            metadata_offset: LittleEndian::read_u32(&buf[52..]),
            label,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MetadataEntry {
    id: u32,
    offset: u32,
    size: u32,
}

impl MetadataEntry {
    fn is_unused(&self) -> bool {
        self.offset == 0
    }
}

#[derive(Debug, Clone)]
struct MetadataBlock {
    timestamp: u64,
    previous_offset: u32,
    items: Vec<MetadataEntry>,
    locked: i32,
}

impl MetadataBlock {
    fn fresh(previous_offset: u32) -> Self {
        MetadataBlock { timestamp: now_ms(), previous_offset, items: vec![MetadataEntry::default(); ITEMS_PER_BLOCK], locked: 0 }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; METADATA_BLOCK_SIZE];
        LittleEndian::write_u64(&mut buf[4..], self.timestamp);
        LittleEndian::write_u32(&mut buf[12..], self.previous_offset);
        let mut offset = METADATA_HEADER_SIZE;
        for item in &self.items {
            LittleEndian::write_u32(&mut buf[offset..], item.id);
            LittleEndian::write_u32(&mut buf[offset + 4..], item.offset);
            LittleEndian::write_u32(&mut buf[offset + 8..], item.size);
            offset += ITEM_SIZE;
        }
        LittleEndian::write_i32(&mut buf[METADATA_HEADER_SIZE + METADATA_ITEMS_SIZE..], self.locked);
        let checksum = crc32c::crc32c(&buf[4..]);
        LittleEndian::write_u32(&mut buf[0..], checksum);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < METADATA_BLOCK_SIZE {
            return Err(eio("truncated metadata block"));
        }
        let stored = LittleEndian::read_u32(&buf[0..]);
        let computed = crc32c::crc32c(&buf[4..METADATA_BLOCK_SIZE]);
        if stored != computed {
            return Err(eio("metadata block checksum mismatch"));
        }
        let timestamp = LittleEndian::read_u64(&buf[4..]);
        let previous_offset = LittleEndian::read_u32(&buf[12..]);
        let mut items = Vec::with_capacity(ITEMS_PER_BLOCK);
        let mut offset = METADATA_HEADER_SIZE;
        for _ in 0..ITEMS_PER_BLOCK {
            items.push(MetadataEntry {
                id: LittleEndian::read_u32(&buf[offset..]),
                offset: LittleEndian::read_u32(&buf[offset + 4..]),
                size: LittleEndian::read_u32(&buf[offset + 8..]),
            });
            offset += ITEM_SIZE;
        }
        let locked = LittleEndian::read_i32(&buf[METADATA_HEADER_SIZE + METADATA_ITEMS_SIZE..]);
        Ok(MetadataBlock { timestamp, previous_offset, items, locked })
    }
}

struct Shared {
    buffer: Mutex<Vec<u8>>,
    used_bytes: AtomicU64,
}

impl Shared {
    fn rewrite_block(buffer: &mut [u8], offset: u32, block: &mut MetadataBlock) {
        block.timestamp = now_ms();
        let encoded = block.encode();
        buffer[offset as usize..offset as usize + METADATA_BLOCK_SIZE].copy_from_slice(&encoded);
    }

    /// Updates `used_bytes` in the superblock (re-encoding it so its CRC32C
    /// stays in sync) and in the atomic mirror callers can read lock-free.
    fn set_used_bytes(shared: &Arc<Shared>, buffer: &mut [u8], used: u64) -> Result<()> {
        let mut superblock = Superblock::decode(&buffer[..SUPERBLOCK_SIZE])?;
        superblock.used_bytes = used;
        buffer[..SUPERBLOCK_SIZE].copy_from_slice(&superblock.encode());
        shared.used_bytes.store(used, Ordering::SeqCst);
        Ok(())
    }

    /// Metadata block offsets, newest first.
    fn chain(buffer: &[u8]) -> Result<Vec<u32>> {
        let mut offsets = Vec::new();
        let mut offset = Superblock::decode(&buffer[..SUPERBLOCK_SIZE])?.metadata_offset;
        loop {
            offsets.push(offset);
            let block = MetadataBlock::decode(&buffer[offset as usize..offset as usize + METADATA_BLOCK_SIZE])?;
            if block.previous_offset == 0 {
                break;
            }
            offset = block.previous_offset;
        }
        Ok(offsets)
    }

    fn keys(buffer: &[u8]) -> Result<Vec<u32>> {
        let mut seen = Vec::new();
        for offset in Self::chain(buffer)? {
            let block = MetadataBlock::decode(&buffer[offset as usize..offset as usize + METADATA_BLOCK_SIZE])?;
            for item in &block.items {
                if !item.is_unused() && !seen.contains(&item.id) {
                    seen.push(item.id);
                }
            }
        }
        Ok(seen)
    }

    fn find_entry(buffer: &[u8], id: u32) -> Result<Option<MetadataEntry>> {
        for offset in Self::chain(buffer)? {
            let block = MetadataBlock::decode(&buffer[offset as usize..offset as usize + METADATA_BLOCK_SIZE])?;
            if let Some(entry) = block.items.iter().find(|e| !e.is_unused() && e.id == id) {
                return Ok(Some(*entry));
            }
        }
        Ok(None)
    }

    fn get(buffer: &[u8], id: u32) -> Result<Vec<u8>> {
        let entry = Self::find_entry(buffer, id)?.ok_or_else(|| enodata("no such key"))?;
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        Ok(buffer[start..end].to_vec())
    }

    /// Excludes the superblock, any metadata block, any live entry region,
    /// and anything past the buffer's capacity.
    fn is_unused(buffer: &[u8], offset: u32, length: u32) -> Result<bool> {
        if length == 0 {
            return Ok(true);
        }
        let start = offset as u64;
        let end = start + length as u64;
        if start < SUPERBLOCK_SIZE as u64 || end > buffer.len() as u64 {
            return Ok(false);
        }
        for block_offset in Self::chain(buffer)? {
            let block_start = block_offset as u64;
            let block_end = block_start + METADATA_BLOCK_SIZE as u64;
            if start < block_end && end > block_start {
                return Ok(false);
            }
            let block = MetadataBlock::decode(&buffer[block_offset as usize..block_offset as usize + METADATA_BLOCK_SIZE])?;
            for item in &block.items {
                if item.is_unused() {
                    continue;
                }
                let item_start = item.offset as u64;
                let item_end = item_start + item.size as u64;
                if start < item_end && end > item_start {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn set(shared: &Arc<Shared>, id: u32, data: &[u8]) -> Result<u64> {
        let mut buffer = shared.buffer.lock().expect("single-buffer mutex poisoned");
        let chain = Self::chain(&buffer)?;

        for &block_offset in &chain {
            let mut block = MetadataBlock::decode(&buffer[block_offset as usize..block_offset as usize + METADATA_BLOCK_SIZE])?;
            let Some(slot) = block.items.iter().position(|e| !e.is_unused() && e.id == id) else { continue };
            let existing = block.items[slot];

            let grows_by = (data.len() as u32).saturating_sub(existing.size);
            let overwrite_in_place = existing.size as usize == data.len()
                || data.len() < existing.size as usize
                || Self::is_unused(&buffer, existing.offset + existing.size, grows_by)?;

            if overwrite_in_place {
                buffer[existing.offset as usize..existing.offset as usize + data.len()].copy_from_slice(data);
                block.items[slot].size = data.len() as u32;
                Self::rewrite_block(&mut buffer, block_offset, &mut block);
                let grown_end = existing.offset as u64 + data.len() as u64;
                if grown_end > shared.used_bytes.load(Ordering::SeqCst) {
                    Self::set_used_bytes(shared, &mut buffer, grown_end)?;
                }
                return Ok(data.len() as u64);
            }

            block.items[slot] = MetadataEntry::default();
            Self::rewrite_block(&mut buffer, block_offset, &mut block);
            break;
        }

        Self::append(shared, &mut buffer, &chain, id, data)
    }

    fn append(shared: &Arc<Shared>, buffer: &mut Vec<u8>, chain: &[u32], id: u32, data: &[u8]) -> Result<u64> {
        let used = shared.used_bytes.load(Ordering::SeqCst);
        let data_offset = used;
        let new_used = used + data.len() as u64;
        if new_used > buffer.len() as u64 {
            return Err(enospc("single-buffer store exhausted"));
        }
        buffer[data_offset as usize..new_used as usize].copy_from_slice(data);
        Self::set_used_bytes(shared, buffer, new_used)?;

        let newest_offset = chain[0];
        let mut newest = MetadataBlock::decode(&buffer[newest_offset as usize..newest_offset as usize + METADATA_BLOCK_SIZE])?;
        let target_offset = match newest.items.iter().position(|e| e.is_unused()) {
            Some(slot) => {
                newest.items[slot] = MetadataEntry { id, offset: data_offset as u32, size: data.len() as u32 };
                Self::rewrite_block(buffer, newest_offset, &mut newest);
                return Ok(data.len() as u64);
            }
            None => Self::rotate_metadata(shared, buffer, newest_offset)?,
        };

        let mut rotated = MetadataBlock::decode(&buffer[target_offset as usize..target_offset as usize + METADATA_BLOCK_SIZE])?;
        rotated.items[0] = MetadataEntry { id, offset: data_offset as u32, size: data.len() as u32 };
        Self::rewrite_block(buffer, target_offset, &mut rotated);
        Ok(data.len() as u64)
    }

    /// Aligns `used_bytes` to 4, allocates a new block after it, chains
    /// `previous_offset` to the old newest block, updates the superblock.
    fn rotate_metadata(shared: &Arc<Shared>, buffer: &mut Vec<u8>, old_newest_offset: u32) -> Result<u32> {
        let new_offset = align4(shared.used_bytes.load(Ordering::SeqCst));
        let new_used = new_offset + METADATA_BLOCK_SIZE as u64;
        if new_used > buffer.len() as u64 {
            return Err(enospc("single-buffer store exhausted"));
        }
        let block = MetadataBlock::fresh(old_newest_offset);
        let encoded = block.encode();
        buffer[new_offset as usize..new_used as usize].copy_from_slice(&encoded);

        let mut superblock = Superblock::decode(&buffer[..SUPERBLOCK_SIZE])?;
        superblock.metadata_offset = new_offset as u32;
        superblock.used_bytes = new_used;
        buffer[..SUPERBLOCK_SIZE].copy_from_slice(&superblock.encode());
        shared.used_bytes.store(new_used, Ordering::SeqCst);

        Ok(new_offset as u32)
    }

    fn remove(buffer: &mut Vec<u8>, id: u32) -> Result<()> {
        for block_offset in Self::chain(buffer)? {
            let mut block = MetadataBlock::decode(&buffer[block_offset as usize..block_offset as usize + METADATA_BLOCK_SIZE])?;
            if let Some(slot) = block.items.iter().position(|e| !e.is_unused() && e.id == id) {
                block.items[slot] = MetadataEntry::default();
                Self::rewrite_block(buffer, block_offset, &mut block);
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Implements [`Store`] directly against one contiguous byte buffer.
///
/// Cheaply `Clone`: every clone shares the same underlying buffer, which
/// is how two mounts (possibly on different threads) observe the same
/// layout without re-opening it from bytes.
#[derive(Clone)]
pub struct SingleBufferStore {
    shared: Arc<Shared>,
}

impl SingleBufferStore {
    /// Opens `buffer`, bootstrapping a fresh layout if no valid
    /// superblock is found, or verifying an existing one. `total_bytes`
    /// is the buffer's final capacity; `buffer` is zero-extended to it.
    pub fn open(mut buffer: Vec<u8>, total_bytes: u64, label: &[u8]) -> Result<Self> {
        let total_bytes = total_bytes.max(buffer.len() as u64);
        if (buffer.len() as u64) < total_bytes {
            buffer.resize(total_bytes as usize, 0);
        }

        let fresh = buffer.len() < SUPERBLOCK_SIZE || LittleEndian::read_u32(&buffer[4..]) != MAGIC;

        let used_bytes = if fresh {
            let metadata_offset = SUPERBLOCK_SIZE as u32;
            let used = (SUPERBLOCK_SIZE + METADATA_BLOCK_SIZE) as u64;
            let mut label_bytes = [0u8; 64];
            let n = label.len().min(64);
            label_bytes[..n].copy_from_slice(&label[..n]);
            let mut uuid_bytes = [0u8; 16];
            uuid_bytes.copy_from_slice(Uuid::new_v4().as_bytes());

            let superblock = Superblock {
                magic: MAGIC,
                version: 0,
                inode_format: INODE_FORMAT,
                flags: 0,
                used_bytes: used,
                total_bytes,
                uuid: uuid_bytes,
                metadata_block_size: METADATA_BLOCK_SIZE as u32,
                metadata_offset,
                label: label_bytes,
            };
            let block = MetadataBlock::fresh(0);

            buffer[..SUPERBLOCK_SIZE].copy_from_slice(&superblock.encode());
            let encoded = block.encode();
            buffer[metadata_offset as usize..metadata_offset as usize + METADATA_BLOCK_SIZE].copy_from_slice(&encoded);
            used
        } else {
            let superblock = Superblock::decode(&buffer[..SUPERBLOCK_SIZE])?;
            if superblock.inode_format != INODE_FORMAT {
                return Err(eio("inode format mismatch"));
            }
            if superblock.metadata_block_size as usize != METADATA_BLOCK_SIZE {
                return Err(eio("metadata block size mismatch"));
            }
            let offset = superblock.metadata_offset as usize;
            MetadataBlock::decode(&buffer[offset..offset + METADATA_BLOCK_SIZE])?;
            superblock.used_bytes
        };

        Ok(Self { shared: Arc::new(Shared { buffer: Mutex::new(buffer), used_bytes: AtomicU64::new(used_bytes) }) })
    }

    /// Opens `buffer` from a plain-data [`SingleBufferConfig`], e.g. one
    /// deserialized by a caller's own configuration loader.
    pub fn open_with_config(buffer: Vec<u8>, config: &SingleBufferConfig) -> Result<Self> {
        Self::open(buffer, config.total_bytes, &config.label)
    }

    /// A copy of the raw buffer, e.g. to hand to another thread/mount
    /// that opens the same layout.
    pub fn snapshot(&self) -> Vec<u8> {
        self.shared.buffer.lock().expect("single-buffer mutex poisoned").clone()
    }

    pub fn used_bytes(&self) -> u64 {
        self.shared.used_bytes.load(Ordering::SeqCst)
    }

    /// Acquires the scoped lock on the metadata block at `offset`,
    /// retrying up to 5 times with a short bounded wait before `EBUSY`.
    pub async fn lock_block(&self, offset: u32) -> Result<BlockLockGuard<'_>> {
        for attempt in 0..5u32 {
            {
                let mut buffer = self.shared.buffer.lock().expect("single-buffer mutex poisoned");
                let mut block =
                    MetadataBlock::decode(&buffer[offset as usize..offset as usize + METADATA_BLOCK_SIZE])?;
                if block.locked == 0 {
                    block.locked = 1;
                    Shared::rewrite_block(&mut buffer, offset, &mut block);
                    return Ok(BlockLockGuard { shared: &self.shared, offset });
                }
            }
            tokio::time::sleep(Duration::from_millis(5 * (attempt as u64 + 1))).await;
        }
        Err(ebusy("metadata block is locked").with_path(format!("offset {offset}")))
    }
}

/// Scoped release for [`SingleBufferStore::lock_block`]; releases even
/// if the holder panics or returns early.
pub struct BlockLockGuard<'a> {
    shared: &'a Arc<Shared>,
    offset: u32,
}

impl Drop for BlockLockGuard<'_> {
    fn drop(&mut self) {
        let mut buffer = self.shared.buffer.lock().expect("single-buffer mutex poisoned");
        if let Ok(mut block) = MetadataBlock::decode(&buffer[self.offset as usize..self.offset as usize + METADATA_BLOCK_SIZE]) {
            block.locked = 0;
            Shared::rewrite_block(&mut buffer, self.offset, &mut block);
        }
    }
}

#[async_trait]
impl Store for SingleBufferStore {
    fn name(&self) -> &str {
        "single-buffer"
    }

    fn flags(&self) -> StoreFlags {
        StoreFlags::PARTIAL
    }

    async fn transaction(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(SingleBufferTransaction { shared: self.shared.clone() }))
    }

    async fn clear(&self) -> Result<()> {
        let mut buffer = self.shared.buffer.lock().expect("single-buffer mutex poisoned");
        let mut superblock = Superblock::decode(&buffer[..SUPERBLOCK_SIZE])?;
        let metadata_offset = SUPERBLOCK_SIZE as u32;
        let used = (SUPERBLOCK_SIZE + METADATA_BLOCK_SIZE) as u64;
        superblock.metadata_offset = metadata_offset;
        superblock.used_bytes = used;
        buffer[..SUPERBLOCK_SIZE].copy_from_slice(&superblock.encode());
        let block = MetadataBlock::fresh(0);
        let encoded = block.encode();
        buffer[metadata_offset as usize..metadata_offset as usize + METADATA_BLOCK_SIZE].copy_from_slice(&encoded);
        self.shared.used_bytes.store(used, Ordering::SeqCst);
        Ok(())
    }
}

struct SingleBufferTransaction {
    shared: Arc<Shared>,
}

#[async_trait]
impl Transaction for SingleBufferTransaction {
    async fn keys(&mut self) -> Result<Vec<u32>> {
        let buffer = self.shared.buffer.lock().expect("single-buffer mutex poisoned");
        Shared::keys(&buffer)
    }

    async fn get(&mut self, id: u32, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
        let buffer = self.shared.buffer.lock().expect("single-buffer mutex poisoned");
        let full = Shared::get(&buffer, id)?;
        match range {
            Some((offset, end)) => {
                let start = (offset as usize).min(full.len());
                let stop = (end as usize).min(full.len());
                Ok(full[start..stop.max(start)].to_vec())
            }
            None => Ok(full),
        }
    }

    async fn set(&mut self, id: u32, data: &[u8], offset: Option<u64>) -> Result<u64> {
        match offset {
            None => Shared::set(&self.shared, id, data),
            Some(offset) => {
                let mut current = {
                    let buffer = self.shared.buffer.lock().expect("single-buffer mutex poisoned");
                    Shared::get(&buffer, id).unwrap_or_default()
                };
                let start = offset as usize;
                let needed = start + data.len();
                if current.len() < needed {
                    current.resize(needed, 0);
                }
                current[start..needed].copy_from_slice(data);
                Shared::set(&self.shared, id, &current)
            }
        }
    }

    async fn remove(&mut self, id: u32) -> Result<()> {
        let mut buffer = self.shared.buffer.lock().expect("single-buffer mutex poisoned");
        Shared::remove(&mut buffer, id)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_store() -> SingleBufferStore {
        SingleBufferStore::open(Vec::new(), 64 * 1024, b"test").unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = fresh_store();
        let mut txn = store.transaction().await.unwrap();
        txn.set(1, b"hello", None).await.unwrap();
        assert_eq!(txn.get(1, None).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn reopening_an_existing_buffer_verifies_instead_of_resetting() {
        let store = fresh_store();
        let mut txn = store.transaction().await.unwrap();
        txn.set(7, b"persisted", None).await.unwrap();
        drop(txn);

        let bytes = store.snapshot();
        let reopened = SingleBufferStore::open(bytes, 64 * 1024, b"test").unwrap();
        let mut txn2 = reopened.transaction().await.unwrap();
        assert_eq!(txn2.get(7, None).await.unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn shrinking_a_value_overwrites_in_place() {
        let store = fresh_store();
        let mut txn = store.transaction().await.unwrap();
        txn.set(1, b"abcdef", None).await.unwrap();
        txn.set(1, b"xy", None).await.unwrap();
        assert_eq!(txn.get(1, None).await.unwrap(), b"xy");
    }

    #[tokio::test]
    async fn metadata_rotates_once_the_newest_block_is_full() {
        let store = fresh_store();
        let mut txn = store.transaction().await.unwrap();
        for id in 0..(ITEMS_PER_BLOCK as u32 + 1) {
            txn.set(id, b"x", None).await.unwrap();
        }
        let keys = txn.keys().await.unwrap();
        assert_eq!(keys.len(), ITEMS_PER_BLOCK + 1);
    }

    #[tokio::test]
    async fn concurrent_writers_from_two_tasks_both_become_visible() {
        let store = Arc::new(fresh_store());
        let a = store.clone();
        let b = store.clone();

        let handle_a = tokio::spawn(async move {
            let mut txn = a.transaction().await.unwrap();
            txn.set(100, b"A", None).await.unwrap();
        });
        let handle_b = tokio::spawn(async move {
            let mut txn = b.transaction().await.unwrap();
            txn.set(200, b"B", None).await.unwrap();
        });
        handle_a.await.unwrap();
        handle_b.await.unwrap();

        let mut txn = store.transaction().await.unwrap();
        assert_eq!(txn.get(100, None).await.unwrap(), b"A");
        assert_eq!(txn.get(200, None).await.unwrap(), b"B");
    }

    #[tokio::test]
    async fn lock_block_round_trips_and_releases_on_drop() {
        let store = fresh_store();
        let offset = {
            let buffer = store.shared.buffer.lock().unwrap();
            Superblock::decode(&buffer[..SUPERBLOCK_SIZE]).unwrap().metadata_offset
        };
        {
            let _guard = store.lock_block(offset).await.unwrap();
        }
        // Released: a second acquisition should succeed immediately.
        let _guard = store.lock_block(offset).await.unwrap();
    }
}
