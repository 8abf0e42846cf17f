//! Fixed-layout inode record with an extended-attributes tail.
//!
//! The on-disk shape is a stable prefix of scalar fields (byte offsets
//! fixed by spec.md §6) followed by a packed `Attributes` region. The
//! record is always exactly [`INODE_SIZE`] bytes so it can be addressed
//! as a single store key / buffer slot.

use byteorder::{ByteOrder, LittleEndian};
use bitflags::bitflags;

use crate::error::{eoverflow, Result};

/// Total on-disk size of an inode record.
pub const INODE_SIZE: usize = 4096;

/// Size of the fixed scalar header; the remainder is the attributes region.
pub const HEADER_SIZE: usize = 128;

/// Size of the dynamic attributes region.
pub const ATTRIBUTES_SIZE: usize = INODE_SIZE - HEADER_SIZE;

const OFFSET_DATA: usize = 0;
const OFFSET_SIZE: usize = 8;
const OFFSET_MODE: usize = 12;
const OFFSET_NLINK: usize = 14;
const OFFSET_UID: usize = 18;
const OFFSET_GID: usize = 22;
const OFFSET_ATIME: usize = 26;
const OFFSET_BIRTHTIME: usize = 34;
const OFFSET_MTIME: usize = 42;
const OFFSET_CTIME: usize = 50;
const OFFSET_INO: usize = 58;
const OFFSET_VERSION: usize = 62;
const OFFSET_FLAGS: usize = 66;

/// POSIX file-type bits carried in [`Inode::mode`]'s upper bits.
pub const S_IFREG: u16 = 0o100000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFMT: u16 = 0o170000;

pub const S_ISUID: u16 = 0o4000;
pub const S_ISGID: u16 = 0o2000;

pub const IRUSR: u16 = 0o400;
pub const IWUSR: u16 = 0o200;
pub const IXUSR: u16 = 0o100;
pub const IRGRP: u16 = 0o040;
pub const IWGRP: u16 = 0o020;
pub const IXGRP: u16 = 0o010;
pub const IROTH: u16 = 0o004;
pub const IWOTH: u16 = 0o002;
pub const IXOTH: u16 = 0o001;

bitflags! {
    /// Behavioral flags stored in [`Inode::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InodeFlags: u32 {
        /// Do not update `atime` on reads.
        const NO_ATIME = 1 << 0;
        /// Writes always append, ignoring the given offset.
        const APPEND = 1 << 1;
        /// File contents and metadata cannot be changed.
        const IMMUTABLE = 1 << 2;
        /// Writes must be synchronously persisted.
        const SYNC = 1 << 3;
    }
}

/// Caller identity used for access checks and ownership assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// Requested access mask, in the same bit space as [`Inode::mode`] permission bits.
pub type AccessMask = u16;

/// Patch applied via [`Inode::update`]. Fields left `None` are untouched.
/// `ino` and `data` are excluded: those are store-local identity and
/// are never mutated via a patch.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub size: Option<u32>,
    pub mode: Option<u16>,
    pub nlink: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<f64>,
    pub mtime: Option<f64>,
    pub ctime: Option<f64>,
    pub birthtime: Option<f64>,
    pub flags: Option<InodeFlags>,
}

/// Fixed 4 KiB inode record.
#[derive(Debug, Clone, PartialEq)]
pub struct Inode {
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
    pub flags: InodeFlags,
    pub attributes: Attributes,
}

impl Inode {
    /// Builds a fresh inode for a newly allocated `ino`/`data` key pair.
    pub fn new(ino: u32, data: u32, mode: u16, now: f64, cred: Credentials) -> Self {
        Inode {
            data,
            size: 0,
            mode,
            nlink: 1,
            uid: cred.uid,
            gid: cred.gid,
            atime: now,
            birthtime: now,
            mtime: now,
            ctime: now,
            ino,
            version: 0,
            flags: InodeFlags::empty(),
            attributes: Attributes::default(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Applies `patch`, skipping `atime` when [`InodeFlags::NO_ATIME`] is
    /// set, and bumping `ctime` iff any field actually changed.
    ///
    /// Returns whether anything changed.
    pub fn update(&mut self, patch: &MetadataPatch) -> bool {
        let mut changed = false;

        if let Some(size) = patch.size {
            if self.size != size {
                self.size = size;
                changed = true;
            }
        }
        if let Some(mode) = patch.mode {
            if self.mode != mode {
                self.mode = mode;
                changed = true;
            }
        }
        if let Some(nlink) = patch.nlink {
            if self.nlink != nlink {
                self.nlink = nlink;
                changed = true;
            }
        }
        if let Some(uid) = patch.uid {
            if self.uid != uid {
                self.uid = uid;
                changed = true;
            }
        }
        if let Some(gid) = patch.gid {
            if self.gid != gid {
                self.gid = gid;
                changed = true;
            }
        }
        if let Some(atime) = patch.atime {
            if !self.flags.contains(InodeFlags::NO_ATIME) && self.atime != atime {
                self.atime = atime;
                changed = true;
            }
        }
        if let Some(mtime) = patch.mtime {
            if self.mtime != mtime {
                self.mtime = mtime;
                changed = true;
            }
        }
        if let Some(birthtime) = patch.birthtime {
            if self.birthtime != birthtime {
                self.birthtime = birthtime;
                changed = true;
            }
        }
        if let Some(flags) = patch.flags {
            if self.flags != flags {
                self.flags = flags;
                changed = true;
            }
        }

        if changed {
            let bumped = patch.ctime.unwrap_or(self.ctime);
            self.ctime = bumped.max(self.ctime);
            self.version = self.version.wrapping_add(1);
        }

        changed
    }

    /// Evaluates access per spec.md §4.2: symlinks and root (uid or gid
    /// 0) are always allowed; otherwise the mask is chosen by ownership
    /// match and compared against `requested`.
    pub fn has_access(&self, requested: AccessMask, creds: Credentials) -> bool {
        if self.is_symlink() || creds.uid == 0 || creds.gid == 0 {
            return true;
        }

        // Normalize whichever bit triad applies down to the "other" positions
        // so it can be compared directly against `requested`.
        let perm = if creds.uid == self.uid {
            (self.mode & (IRUSR | IWUSR | IXUSR)) >> 6
        } else if creds.gid == self.gid {
            (self.mode & (IRGRP | IWGRP | IXGRP)) >> 3
        } else {
            self.mode & (IROTH | IWOTH | IXOTH)
        };

        let requested_bits = requested & (IROTH | IWOTH | IXOTH);
        (perm & requested_bits) == requested_bits
    }

    /// Serializes this inode into a fixed [`INODE_SIZE`]-byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; INODE_SIZE];
        LittleEndian::write_u32(&mut buf[OFFSET_DATA..], self.data);
        LittleEndian::write_u32(&mut buf[OFFSET_SIZE..], self.size);
        LittleEndian::write_u16(&mut buf[OFFSET_MODE..], self.mode);
        LittleEndian::write_u32(&mut buf[OFFSET_NLINK..], self.nlink);
        LittleEndian::write_u32(&mut buf[OFFSET_UID..], self.uid);
        LittleEndian::write_u32(&mut buf[OFFSET_GID..], self.gid);
        LittleEndian::write_f64(&mut buf[OFFSET_ATIME..], self.atime);
        LittleEndian::write_f64(&mut buf[OFFSET_BIRTHTIME..], self.birthtime);
        LittleEndian::write_f64(&mut buf[OFFSET_MTIME..], self.mtime);
        LittleEndian::write_f64(&mut buf[OFFSET_CTIME..], self.ctime);
        LittleEndian::write_u32(&mut buf[OFFSET_INO..], self.ino);
        LittleEndian::write_u32(&mut buf[OFFSET_VERSION..], self.version);
        LittleEndian::write_u32(&mut buf[OFFSET_FLAGS..], self.flags.bits());

        let attrs = self.attributes.encode()?;
        buf[HEADER_SIZE..HEADER_SIZE + attrs.len()].copy_from_slice(&attrs);
        Ok(buf)
    }

    /// Parses an inode from a buffer previously produced by [`Inode::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < INODE_SIZE {
            return Err(crate::error::einval("truncated inode record"));
        }
        let flags_bits = LittleEndian::read_u32(&buf[OFFSET_FLAGS..]);
        Ok(Inode {
            data: LittleEndian::read_u32(&buf[OFFSET_DATA..]),
            size: LittleEndian::read_u32(&buf[OFFSET_SIZE..]),
            mode: LittleEndian::read_u16(&buf[OFFSET_MODE..]),
            nlink: LittleEndian::read_u32(&buf[OFFSET_NLINK..]),
            uid: LittleEndian::read_u32(&buf[OFFSET_UID..]),
            gid: LittleEndian::read_u32(&buf[OFFSET_GID..]),
            atime: LittleEndian::read_f64(&buf[OFFSET_ATIME..]),
            birthtime: LittleEndian::read_f64(&buf[OFFSET_BIRTHTIME..]),
            mtime: LittleEndian::read_f64(&buf[OFFSET_MTIME..]),
            ctime: LittleEndian::read_f64(&buf[OFFSET_CTIME..]),
            ino: LittleEndian::read_u32(&buf[OFFSET_INO..]),
            version: LittleEndian::read_u32(&buf[OFFSET_VERSION..]),
            flags: InodeFlags::from_bits_truncate(flags_bits),
            attributes: Attributes::decode(&buf[HEADER_SIZE..])?,
        })
    }
}

/// Extended-attribute region: a linear sequence of `{key, value}` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Attributes {
    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_slice())
    }

    /// Removes any existing entry for `name`, then appends the new value.
    pub fn set(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        self.remove(name);
        self.entries.push((name.to_vec(), value.to_vec()));
        if self.encoded_len() > ATTRIBUTES_SIZE {
            self.entries.pop();
            return Err(eoverflow("attributes region exhausted"));
        }
        Ok(())
    }

    /// Compacts the entry list by dropping any matching entry.
    pub fn remove(&mut self, name: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != name);
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    fn encoded_len(&self) -> usize {
        4 + self.entries.iter().map(|(k, v)| 4 + k.len() + v.len()).sum::<usize>()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let total = self.encoded_len();
        if total > ATTRIBUTES_SIZE {
            return Err(eoverflow("attributes region exhausted"));
        }
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (k, v) in &self.entries {
            buf.extend_from_slice(&(k.len() as u16).to_le_bytes());
            buf.extend_from_slice(&(v.len() as u16).to_le_bytes());
            buf.extend_from_slice(k);
            buf.extend_from_slice(v);
        }
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Ok(Attributes::default());
        }
        let count = LittleEndian::read_u32(buf) as usize;
        let mut offset = 4;
        let mut entries = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            if offset + 4 > buf.len() {
                break;
            }
            let key_size = LittleEndian::read_u16(&buf[offset..]) as usize;
            let value_size = LittleEndian::read_u16(&buf[offset + 2..]) as usize;
            offset += 4;
            if offset + key_size + value_size > buf.len() {
                break;
            }
            let key = buf[offset..offset + key_size].to_vec();
            offset += key_size;
            let value = buf[offset..offset + value_size].to_vec();
            offset += value_size;
            entries.push((key, value));
        }
        Ok(Attributes { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Inode {
        Inode::new(1, 2, S_IFREG | 0o644, 1000.0, Credentials { uid: 0, gid: 0 })
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let mut inode = sample();
        inode.attributes.set(b"user.comment", b"hello").unwrap();
        let buf = inode.encode().unwrap();
        assert_eq!(buf.len(), INODE_SIZE);
        let decoded = Inode::decode(&buf).unwrap();
        assert_eq!(decoded, inode);
    }

    #[test]
    fn update_returns_false_when_nothing_changes() {
        let mut inode = sample();
        let ctime_before = inode.ctime;
        let changed = inode.update(&MetadataPatch { mode: Some(inode.mode), ..Default::default() });
        assert!(!changed);
        assert_eq!(inode.ctime, ctime_before);
    }

    #[test]
    fn update_bumps_ctime_when_something_changes() {
        let mut inode = sample();
        let ctime_before = inode.ctime;
        let changed =
            inode.update(&MetadataPatch { size: Some(42), ctime: Some(2000.0), ..Default::default() });
        assert!(changed);
        assert!(inode.ctime >= ctime_before);
        assert_eq!(inode.size, 42);
    }

    #[test]
    fn no_atime_flag_suppresses_atime_updates() {
        let mut inode = sample();
        inode.flags = InodeFlags::NO_ATIME;
        let atime_before = inode.atime;
        inode.update(&MetadataPatch { atime: Some(9999.0), ..Default::default() });
        assert_eq!(inode.atime, atime_before);
    }

    #[test]
    fn root_and_owner_always_pass_access_checks() {
        let inode = sample();
        assert!(inode.has_access(IROTH, Credentials { uid: 0, gid: 0 }));
    }

    #[test]
    fn attributes_set_replaces_existing_entry() {
        let mut attrs = Attributes::default();
        attrs.set(b"k", b"v1").unwrap();
        attrs.set(b"k", b"v2").unwrap();
        assert_eq!(attrs.get(b"k"), Some(b"v2".as_slice()));
        assert_eq!(attrs.iter().count(), 1);
    }

    #[test]
    fn attributes_overflow_is_rejected() {
        let mut attrs = Attributes::default();
        let big = vec![0u8; ATTRIBUTES_SIZE];
        assert!(attrs.set(b"k", &big).is_err());
    }
}
