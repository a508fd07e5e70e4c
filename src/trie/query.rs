//! Caller-owned query state. A [`MatchData`] carries the output buffer, the
//! walking cursor and the option flags through a lookup, and doubles as the
//! resume point for all-prefix iteration. Reusing one instance across calls
//! avoids reallocating the output buffer.

use super::edge::EdgePtrs;
use crate::error::{DictError, Result};

/// Per-query state passed through the dictionary engine.
#[derive(Debug, Default)]
pub struct MatchData {
    /// Output buffer; the payload occupies `buff[..data_len]` after a
    /// successful read.
    pub buff: Vec<u8>,
    /// Length of the payload in `buff`.
    pub data_len: usize,
    /// Arena offset of the payload buffer.
    pub data_offset: u64,
    /// Number of key bytes consumed by the reported match.
    pub match_len: usize,
    /// Query option flags (`OPTION_*`).
    pub options: u32,
    /// All-prefix iteration: set when another call may yield a further
    /// match.
    pub next: bool,
    /// Walking cursor; holds parent pointers after a parent-storing find.
    pub edge_ptrs: EdgePtrs,
    /// All-prefix iteration: key bytes consumed by the walk so far.
    pub(crate) consumed: usize,
}

impl MatchData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: u32) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Resets everything except the options and the buffer capacity.
    pub fn clear(&mut self) {
        self.buff.clear();
        self.data_len = 0;
        self.data_offset = 0;
        self.match_len = 0;
        self.next = false;
        self.edge_ptrs = EdgePtrs::new();
        self.consumed = 0;
    }

    /// Grows the output buffer to hold `len` bytes, reporting `NoMemory`
    /// when the allocation fails instead of aborting.
    pub(crate) fn resize_buff(&mut self, len: usize) -> Result<()> {
        if len > self.buff.len() {
            self.buff
                .try_reserve(len - self.buff.len())
                .map_err(|_| DictError::NoMemory)?;
            self.buff.resize(len, 0);
        }
        Ok(())
    }
}
