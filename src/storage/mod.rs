//! # Storage Layer
//!
//! Memory-mapped file storage for the radix-tree store. Two arenas back every
//! store directory:
//!
//! - the **index arena** (`radix.idx`) holds the process-shared header in its
//!   first [`INDEX_HEADER_SIZE`] bytes, followed by radix-tree nodes, edge
//!   records and spilled edge-label tails;
//! - the **data arena** (`radix.dat`) holds value payloads, each laid out as
//!   a little-endian `u16` length followed by the bytes, in buffers rounded
//!   up to [`DATA_BUFFER_ALIGNMENT`].
//!
//! Both are [`FileArena`] instances: append-mostly files grown in block-sized
//! units and addressed by absolute byte offset. All access is bounds-checked
//! against the current mapping; no raw mapped pointer crosses a module
//! boundary.
//!
//! ## Sharing model
//!
//! One writer process and any number of reader processes map the same files.
//! The header region is mapped separately by [`HeaderMap`] and never
//! remapped, so the atomics inside it stay valid for the life of the handle.
//! The arena mapping does get remapped when the file grows; an internal
//! rwlock makes the remap exclusive against in-process readers, and
//! cross-process readers remap lazily when a read lands beyond their current
//! mapping.
//!
//! ## Reclamation
//!
//! Freed buffers are never returned to the file; they go onto a size-classed
//! [`BufferFreeList`] and are handed out again before the high-water offset
//! grows. The writer dumps the free list to disk on clean shutdown and
//! reloads it on open.

mod arena;
mod freelist;
mod header;
mod lockfree;

pub use arena::FileArena;
pub use freelist::BufferFreeList;
pub use header::{
    ExcepStatus, HeaderMap, HeaderPrelude, SharedState, ShmRwLock, ShmWriteGuard, VERSION_MAJOR,
    VERSION_MINOR, VERSION_PATCH,
};
pub use lockfree::{LockFreeShm, LockFreeSnapshot};

/// Size of the mapped header region at the front of the index file.
pub const INDEX_HEADER_SIZE: usize = 4096;

/// First payload offset in the data arena; offset 0 is the "missing" sentinel.
pub const DATA_HEADER_SIZE: u64 = 64;

/// Growth unit for the data arena file.
pub const DATA_BLOCK_SIZE: u64 = 1 << 20;

/// Growth unit for the index arena file.
pub const INDEX_BLOCK_SIZE: u64 = 1 << 20;

/// Data buffers are allocated in multiples of this.
pub const DATA_BUFFER_ALIGNMENT: usize = 8;

/// Index buffers (nodes, edge-label tails) are allocated in multiples of this.
pub const INDEX_BUFFER_ALIGNMENT: usize = 8;

/// Largest data buffer tracked by the free list.
pub const MAX_DATA_BUFFER_SIZE: usize = 0xFFFF;

/// Number of data free-list size classes.
pub const NUM_DATA_BUFFER_BUCKETS: usize = MAX_DATA_BUFFER_SIZE / DATA_BUFFER_ALIGNMENT;

/// Largest index buffer tracked by the free list (covers the root node).
pub const MAX_INDEX_BUFFER_SIZE: usize = 0x2000;

/// Number of index free-list size classes.
pub const NUM_INDEX_BUFFER_BUCKETS: usize = MAX_INDEX_BUFFER_SIZE / INDEX_BUFFER_ALIGNMENT;

/// Depth of the writer's recently-modified-offset window used by reader
/// snapshot validation.
pub const MAX_OFFSET_CACHE: usize = 4;

/// Size of the in-header exception staging buffer.
pub const EXCEP_BUFF_SIZE: usize = 32;
