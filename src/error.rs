//! Error types for the allocator and its collaborators.
//!
//! Only conditions a caller can react to live here. Running out of space is not
//! an error (allocation returns `None`), and broken contracts such as freeing a
//! pointer twice panic instead of being reported.

use thiserror::Error;

/// Errors raised while reserving the arena.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// The configuration handed to the allocator is not usable.
    #[error("invalid allocator configuration: {0}")]
    Config(#[from] ConfigError),
    /// The operating system refused to map `size` bytes.
    #[error("failed to reserve {size} bytes for the arena")]
    ReserveFailed { size: usize },
}

/// Errors found while validating or loading a [`crate::config::Config`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("page size {0} is not a power of two")]
    PageSizeNotPowerOfTwo(usize),
    #[error("page size {page_size} is smaller than the minimum of {min}")]
    PageSizeTooSmall { page_size: usize, min: usize },
    #[error("total size {total_size} is not a multiple of page size {page_size}")]
    TotalSizeNotPageMultiple { total_size: usize, page_size: usize },
    #[error("total size {total_size} cannot hold a single block of {min} bytes")]
    TotalSizeTooSmall { total_size: usize, min: usize },
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Errors raised by [`crate::io_buffer::IoBuffer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Growing the buffer up to its maximum still leaves less than `requested` bytes.
    #[error("maximal IO buffer capacity exceeded: requested {requested}, max size {max_size}")]
    CapacityExceeded { requested: usize, max_size: usize },
}

/// Structural corruption detected by [`crate::MemAlloc::verify`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("blocks cover {covered} bytes but the arena holds {total}")]
    TilingMismatch { covered: usize, total: usize },
    #[error("block at offset {offset} overruns the arena")]
    BlockOverrun { offset: usize },
    #[error("adjacent free blocks at offsets {left} and {right}")]
    AdjacentFree { left: usize, right: usize },
    #[error("block at offset {offset} records left size {recorded}, actual {actual}")]
    BoundaryTag { offset: usize, recorded: usize, actual: usize },
    #[error("free block at offset {offset} is not in the size class index")]
    FreeBlockNotIndexed { offset: usize },
    #[error("size class index holds {indexed} blocks but the arena has {free} free blocks")]
    IndexCountMismatch { indexed: usize, free: usize },
    #[error("page {page} counts {recorded} used blocks, actual {actual}")]
    PageUsedCount { page: usize, recorded: usize, actual: usize },
    #[error("page {page} records first header {recorded:?}, actual {actual:?}")]
    PageFirstHeader {
        page: usize,
        recorded: Option<usize>,
        actual: Option<usize>,
    },
}
