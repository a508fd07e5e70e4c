//! # Radix Tree Dictionary
//!
//! A compressed radix tree (Patricia trie) over byte-string keys, stored
//! entirely in the memory-mapped index arena. Payloads live in the data
//! arena; the tree holds 6-byte offsets to them.
//!
//! ## Shape
//!
//! ```text
//! root node (fixed 256 slots, one per first byte)
//!   └── edge "a…"  ── node ── edge "pp…" ── node(MATCH: "app")
//!                                 ├── edge "le"  (leaf: "apple")
//!                                 └── edge "s"   (leaf: "apps")
//! ```
//!
//! Each edge consumes one or more key bytes; the first byte of its label is
//! the discriminator stored in the parent node, the rest is inline in the
//! edge record or spilled into the arena. No two edges out of one node
//! share a discriminator, and no edge has an empty label.
//!
//! ## Module map
//!
//! - [`edge`]: the 13-byte edge record and offset encodings
//! - [`mem`]: node and edge manipulation over the index arena
//! - [`query`]: caller-owned lookup state
//! - [`dict`]: the operations: add, find, prefix find, remove, recovery

pub mod dict;
pub mod edge;
pub mod mem;
pub mod query;

pub use dict::Dict;
pub use edge::{EdgePtrs, EDGE_SIZE, MAX_DATA_SIZE, MAX_KEY_LENGTH, NODE_EDGE_KEY_FIRST, NUM_ALPHABET};
pub use mem::{TreeMem, ROOT_NODE_SIZE};
pub use query::MatchData;
