//! ZenFS core: a user-space virtual file system that emulates POSIX/Node
//! file semantics over pluggable storage backends.
//!
//! This crate is the engine, not the facade: path resolution and mount
//! routing ([`mount`], [`path`]), the inode/transactional-store model
//! most backends share ([`inode`], [`store`], [`storefs`]), a
//! copy-on-write overlay ([`overlay`]), a self-describing single-buffer
//! on-disk layout ([`single_buffer`]), a remote-port backend
//! ([`port`]), bound contexts with credentials and descriptor tables
//! ([`context`]), and a per-path locking wrapper ([`locked`]).

pub mod context;
pub mod error;
pub mod fs;
pub mod inode;
pub mod locked;
pub mod mount;
pub mod overlay;
pub mod path;
pub mod port;
pub mod single_buffer;
pub mod store;
pub mod storefs;

pub use error::{ErrorCode, Result, ZenFsError};
pub use fs::FileSystem;
pub use inode::Inode;
