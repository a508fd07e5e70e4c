//! # radixkv - Embedded Memory-Mapped Radix-Tree Store
//!
//! radixkv is an embedded key-value store whose index is a compressed radix
//! tree (Patricia trie) living in disk-backed, memory-mapped files shared
//! between one writer process and many reader processes. This
//! implementation prioritizes:
//!
//! - **Zero-syscall reads**: lookups walk mapped bytes; the OS page cache
//!   is the only cache
//! - **Lock-free readers**: lookups never block on the writer; they
//!   validate each edge against the writer's publication state and re-walk
//!   on conflict
//! - **Crash safety**: every structural store is preceded by a write-ahead
//!   record in the shared header and replayed on the next writer open
//!
//! ## Quick Start
//!
//! ```ignore
//! use radixkv::{Db, DbConfig};
//!
//! let db = Db::open("./mystore", DbConfig::new().writer())?;
//!
//! db.add(b"apple", b"fruit", true)?;
//! assert_eq!(db.get(b"apple")?, Some(b"fruit".to_vec()));
//!
//! db.remove(b"apple")?;
//! assert_eq!(db.get(b"apple")?, None);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Public API (Db)              │
//! ├─────────────────────────────────────────┤
//! │     Dictionary Engine (trie::Dict)      │
//! │  add / find / find_prefix / remove      │
//! ├──────────────────┬──────────────────────┤
//! │  Tree Memory     │  Data Buffer Layer   │
//! │  (trie::TreeMem) │  (reserve/release)   │
//! ├──────────────────┴──────────────────────┤
//! │  Shared Header │ Lock-Free │ Free Lists │
//! ├─────────────────────────────────────────┤
//! │     Memory-Mapped Arenas (FileArena)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! store_dir/
//! ├── radix.idx     # shared header + radix nodes, edges, label tails
//! ├── radix.dat     # u16-length-prefixed value payloads
//! ├── radix.dfl     # data free-list dump (written on clean shutdown)
//! ├── radix.ifl     # index free-list dump (written on clean shutdown)
//! └── writer.lock   # advisory lock held by the live writer
//! ```
//!
//! ## Sharing Model
//!
//! Exactly one writer process mutates the tree, the payloads and the
//! header; any number of reader processes map the same files. Readers are
//! wait-free with bounded retries: a lookup that observes a concurrent
//! structural store restarts its walk. Cross-key atomicity is not
//! provided; a reader sees each entry at some point between its snapshot
//! and its final validation.
//!
//! ## Module Overview
//!
//! - [`storage`]: mapped arenas, shared header, free lists, lock-free
//!   protocol
//! - [`trie`]: the radix-tree engine and its tree-memory layer
//! - [`db`]: the store facade and configuration
//! - [`options`]: access-mode and query flags

pub mod db;
pub mod error;
pub mod options;
pub mod storage;
pub mod trie;

pub use db::{Db, DbConfig, DbStats, READER_RETRY_MAX};
pub use error::{DictError, Result};
pub use trie::{MatchData, MAX_DATA_SIZE, MAX_KEY_LENGTH};
