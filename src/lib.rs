//! In-memory storage engine of a cache server.
//!
//! [`MemAlloc`] is a fixed capacity heap: one arena is reserved up front and
//! every allocation is carved out of it. When the arena is full, instead of
//! failing, the allocator evicts previously allocated objects from the
//! coldest page and tells the owner about every evicted pointer:
//!
//! ```no_run
//! use std::collections::HashMap;
//! use memalloc::MemAlloc;
//!
//! let mut allocator = MemAlloc::new(4 * 1024 * 1024, 4096).unwrap();
//! let mut keys = HashMap::new();
//!
//! let ptr = allocator
//!     .allocate_or_evict(128, true, |evicted| {
//!         keys.retain(|_, ptr| *ptr != evicted);
//!     })
//!     .unwrap();
//! keys.insert("key", ptr);
//! allocator.touch(ptr);
//! ```
//!
//! Every block has an associated header with metadata that precedes the actual
//! memory block, the returned pointer is at the start of the memory block:
//!
//! ```text
//! +-------------------------------+
//! | Header   | Actual memory block |
//! +-------------------------------+
//! ```
//!
//! The allocator is single threaded and performs no I/O. Logging goes through
//! the [`log`] facade, no logger is installed by this crate.

pub mod arena;
pub mod block;
pub mod config;
pub mod error;
pub mod freelist;
pub mod io_buffer;
pub mod kernel;
mod list;
pub mod memalloc;
pub mod pages;
pub mod utils;

pub use crate::{
    config::Config,
    error::{ArenaError, BufferError, ConfigError, IntegrityError},
    io_buffer::IoBuffer,
    memalloc::{MemAlloc, Stats},
};
