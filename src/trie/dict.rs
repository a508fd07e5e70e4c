//! # Dictionary Engine
//!
//! `Dict` ties the radix tree over the index arena to the payload buffers in
//! the data arena and implements the public operations: add, find, prefix
//! find, remove, reset. It also owns the two crash-safety mechanisms:
//!
//! - the **data-buffer layer** (`reserve_data` / `release_buffer` /
//!   `update_data_buffer`), which places `u16`-length-prefixed payloads into
//!   recycled or fresh arena buffers before the tree ever points at them;
//! - **exception recovery**, which replays the single staged write-ahead
//!   mutation record found in the header when a writer reopens a store that
//!   did not shut down cleanly.
//!
//! ## Walk anatomy
//!
//! A key's first byte selects a root edge slot. From there every edge
//! consumes `label_len` key bytes (the first of which is the discriminator
//! held by the parent node) and either terminates (a leaf shortcut holding
//! a payload offset, or a node with its MATCH flag set) or descends into a
//! child node where the next key byte picks the next edge.
//!
//! Insertion resolves to one of four structural mutations, all built by the
//! tree-memory layer: fill an empty root slot, extend a node with a new
//! child (`update_node`), split an edge where the key diverges inside the
//! label (`add_link`), or split an edge where the key ends inside the label
//! (`insert_node`). An insert whose key ends exactly on an existing
//! terminator instead goes through `update_data_buffer`.
//!
//! ## Reader validation
//!
//! Lookups run without locks. Each walk snapshots the writer publication
//! state and re-validates after every edge it consumes; a conflict surfaces
//! as `TryAgain` and the caller re-walks. Mutating operations are assumed to
//! run in the single writer.

use std::sync::Arc;

use tracing::warn;

use super::edge::{
    get_6b, set_6b, EdgePtrs, DATA_SIZE_BYTE, EDGE_NODE_LEADING_POS, EDGE_SIZE, FLAG_NODE_MATCH,
    MAX_DATA_SIZE, MAX_KEY_LENGTH, NODE_EDGE_KEY_FIRST, NUM_ALPHABET, OFFSET_SIZE,
};
use super::mem::TreeMem;
use super::query::MatchData;
use crate::error::{DictError, Result};
use crate::options::{ACCESS_MODE_WRITER, OPTION_ALL_PREFIX, OPTION_FIND_AND_STORE_PARENT};
use crate::storage::{
    BufferFreeList, ExcepStatus, FileArena, HeaderMap, LockFreeSnapshot, SharedState,
    DATA_HEADER_SIZE,
};

pub struct Dict {
    mm: TreeMem,
    data_arena: FileArena,
    data_free_list: BufferFreeList,
    header: Arc<HeaderMap>,
    options: u32,
}

impl Dict {
    pub fn new(
        header: Arc<HeaderMap>,
        mm: TreeMem,
        data_arena: FileArena,
        data_free_list: BufferFreeList,
        options: u32,
    ) -> Self {
        Self {
            mm,
            data_arena,
            data_free_list,
            header,
            options,
        }
    }

    pub fn state(&self) -> &SharedState {
        self.header.state()
    }

    pub fn tree_mem(&self) -> &TreeMem {
        &self.mm
    }

    pub fn options(&self) -> u32 {
        self.options
    }

    fn is_writer(&self) -> bool {
        self.options & ACCESS_MODE_WRITER != 0
    }

    /// Writer-side initialization of a freshly created store.
    pub fn init(&mut self, data_size: u32) -> Result<()> {
        if !self.is_writer() {
            return Err(DictError::NotAllowed);
        }
        if data_size == 0 || data_size as usize > MAX_DATA_SIZE {
            return Err(DictError::InvalidSize);
        }

        let state = self.header.state();
        state.set_data_size(data_size);
        state.set_count(0);
        state.set_data_offset(DATA_HEADER_SIZE);
        self.mm.init_root(state)?;
        state.rw_lock().init()?;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.mm.is_valid(self.header.state())
    }

    pub fn count(&self) -> i64 {
        self.header.state().count().max(0)
    }

    /// Total bytes currently tracked by the data free list.
    pub fn data_free_list_size(&self) -> u64 {
        self.data_free_list.tot_size()
    }

    /// Loads the free lists dumped by the last clean shutdown. Failure means
    /// the dumps exist but are unusable, and the writer must not come up.
    pub fn load_free_lists(&mut self) -> Result<()> {
        self.mm.load_free_list().map_err(|e| {
            tracing::error!("index free-list load failed: {e:#}");
            DictError::NotInitialized
        })?;
        self.data_free_list.load_from_disk().map_err(|e| {
            tracing::error!("data free-list load failed: {e:#}");
            DictError::NotInitialized
        })?;
        Ok(())
    }

    /// Clean-shutdown bookkeeping: dump free lists, drop the writer's
    /// lock-free publication, flush both arenas.
    pub fn shutdown(&mut self) {
        if self.is_writer() {
            if let Err(e) = self.mm.store_free_list() {
                tracing::error!("failed to dump index free list: {e:#}");
            }
            if let Err(e) = self.data_free_list.store_to_disk() {
                tracing::error!("failed to dump data free list: {e:#}");
            }
            let state = self.header.state();
            state.lock_free.writer_reset();
            state.set_num_writer(0);
            if let Err(e) = self.mm.sync() {
                warn!("index arena sync failed on shutdown: {e:#}");
            }
            if let Err(e) = self.data_arena.sync() {
                warn!("data arena sync failed on shutdown: {e:#}");
            }
            if let Err(e) = self.header.sync() {
                warn!("header sync failed on shutdown: {e:#}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Adds a key-value pair. With `overwrite` false, an existing entry is
    /// left alone and `InDict` is returned.
    pub fn add(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        if !self.is_writer() {
            return Err(DictError::NotAllowed);
        }
        if key.is_empty() {
            return Err(DictError::InvalidArg);
        }
        if key.len() > MAX_KEY_LENGTH || value.len() > MAX_DATA_SIZE {
            return Err(DictError::OutOfBound);
        }

        let mut edge = EdgePtrs::new();
        self.mm.get_root_edge(key[0], &mut edge)?;

        if edge.is_empty() {
            let data_off = self.reserve_data(value)?;
            return self
                .mm
                .add_root_edge(self.header.state(), &mut edge, key, data_off);
        }

        let mut scratch = [0u8; NUM_ALPHABET];
        let edge_len = edge.label_len();
        let tail = self.mm.label_tail(&edge, &mut scratch)?;

        if edge_len < key.len() {
            let mut i = 1;
            while i < edge_len && tail[i - 1] == key[i] {
                i += 1;
            }
            if i < edge_len {
                // Key diverges inside the root edge label.
                let data_off = self.reserve_data(value)?;
                return self
                    .mm
                    .add_link(self.header.state(), &mut edge, i, &key[i..], data_off);
            }

            // Root edge fully consumed; descend.
            let mut consumed = edge_len;
            let mut last_match: Option<usize> = None;
            loop {
                match self.mm.find_next(&key[consumed..], &mut edge)? {
                    None => {
                        last_match = None;
                        break;
                    }
                    Some(m) => {
                        last_match = Some(m);
                        if m < edge.label_len() {
                            break;
                        }
                        consumed += m;
                        if consumed >= key.len() {
                            break;
                        }
                    }
                }
            }

            match last_match {
                None => {
                    // No edge for the next byte: extend the node (or turn a
                    // leaf shortcut into a matching node).
                    let data_off = self.reserve_data(value)?;
                    self.mm
                        .update_node(self.header.state(), &mut edge, &key[consumed..], data_off)
                }
                Some(m) if m < edge.label_len() => {
                    let remaining = key.len() - consumed;
                    if remaining > m {
                        let data_off = self.reserve_data(value)?;
                        self.mm.add_link(
                            self.header.state(),
                            &mut edge,
                            m,
                            &key[consumed + m..],
                            data_off,
                        )
                    } else {
                        let data_off = self.reserve_data(value)?;
                        self.mm
                            .insert_node(self.header.state(), &mut edge, m, data_off)
                    }
                }
                Some(_) => {
                    // Key exhausted on an existing terminator.
                    self.update_data_buffer(&mut edge, overwrite, value)
                }
            }
        } else {
            let mut i = 1;
            while i < key.len() && tail[i - 1] == key[i] {
                i += 1;
            }
            if i < key.len() {
                let data_off = self.reserve_data(value)?;
                self.mm
                    .add_link(self.header.state(), &mut edge, i, &key[i..], data_off)
            } else if edge_len > key.len() {
                let data_off = self.reserve_data(value)?;
                self.mm
                    .insert_node(self.header.state(), &mut edge, i, data_off)
            } else {
                self.update_data_buffer(&mut edge, overwrite, value)
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    fn verify(
        &self,
        snapshot: &mut LockFreeSnapshot,
        edge_offset: u64,
    ) -> Result<()> {
        if self
            .header
            .state()
            .lock_free
            .reader_verify(snapshot, edge_offset)
        {
            Ok(())
        } else {
            Err(DictError::TryAgain)
        }
    }

    /// Exact-match lookup. On success the payload is in
    /// `data.buff[..data_len]`. With `OPTION_FIND_AND_STORE_PARENT`, a match
    /// returns `InDict` and leaves the parent pointers in `data.edge_ptrs`
    /// instead of reading the payload.
    pub fn find(&self, key: &[u8], data: &mut MatchData) -> Result<()> {
        if key.is_empty() {
            return Err(DictError::InvalidArg);
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(DictError::NotExist);
        }

        let store_parent = data.options & OPTION_FIND_AND_STORE_PARENT != 0;
        let lock_free = &self.header.state().lock_free;
        let mut snapshot = lock_free.reader_start();

        let mut edge = EdgePtrs::new();
        self.mm.get_root_edge(key[0], &mut edge)?;
        if edge.is_empty() {
            self.verify(&mut snapshot, edge.offset)?;
            return Err(DictError::NotExist);
        }

        let mut scratch = [0u8; NUM_ALPHABET];
        let edge_len = edge.label_len();
        let rval: Result<()>;

        if edge_len < key.len() {
            {
                let tail = match self.mm.label_tail(&edge, &mut scratch) {
                    Ok(tail) => tail,
                    Err(e) => {
                        self.verify(&mut snapshot, edge.offset)?;
                        return Err(e);
                    }
                };
                if (edge_len > 1 && tail != &key[1..edge_len]) || edge.is_leaf() {
                    self.verify(&mut snapshot, edge.offset)?;
                    return Err(DictError::NotExist);
                }
            }

            let mut consumed = edge_len;
            rval = loop {
                let prev_offset = edge.offset;
                let mut node_head = [0u8; NODE_EDGE_KEY_FIRST];
                if let Err(e) =
                    self.mm
                        .next_edge(&key[consumed..], &mut edge, &mut node_head, store_parent)
                {
                    break Err(e);
                }
                self.verify(&mut snapshot, prev_offset)?;

                let edge_len = edge.label_len();
                let remaining = key.len() - consumed;
                if edge_len > remaining {
                    // The entry down this edge extends past the key.
                    break Err(DictError::NotExist);
                }
                let tail = match self.mm.label_tail(&edge, &mut scratch) {
                    Ok(tail) => tail,
                    Err(e) => break Err(e),
                };
                if edge_len > 1 && tail != &key[consumed + 1..consumed + edge_len] {
                    break Err(DictError::NotExist);
                }

                consumed += edge_len;
                if consumed == key.len() {
                    if store_parent {
                        data.edge_ptrs = edge.clone();
                        return Err(DictError::InDict);
                    }
                    break self.read_data_from_edge(data, &edge);
                }
                if edge.is_leaf() {
                    break Err(DictError::NotExist);
                }
            };
        } else if edge_len == key.len() {
            let matches = {
                let tail = match self.mm.label_tail(&edge, &mut scratch) {
                    Ok(tail) => tail,
                    Err(e) => {
                        self.verify(&mut snapshot, edge.offset)?;
                        return Err(e);
                    }
                };
                tail == &key[1..]
            };
            if !matches {
                rval = Err(DictError::NotExist);
            } else if store_parent {
                edge.curr_node_offset = self.mm.root_offset();
                edge.curr_nt = 1;
                edge.curr_edge_index = 0;
                edge.parent_offset = edge.offset;
                data.edge_ptrs = edge.clone();
                return Err(DictError::InDict);
            } else {
                rval = self.read_data_from_edge(data, &edge);
            }
        } else {
            rval = Err(DictError::NotExist);
        }

        self.verify(&mut snapshot, edge.offset)?;
        rval
    }

    /// Prefix lookup. Without `OPTION_ALL_PREFIX`, reports the longest
    /// entry that is a prefix of `key`. With it, each call yields the next
    /// shorter-to-longer prefix match and sets `data.next` while more of the
    /// tree remains; calling again resumes the walk.
    pub fn find_prefix(&self, key: &[u8], data: &mut MatchData) -> Result<()> {
        if key.is_empty() {
            return Err(DictError::InvalidArg);
        }

        let all_prefix = data.options & OPTION_ALL_PREFIX != 0;
        let resuming = all_prefix && data.next && data.match_len > 0;
        data.next = false;

        let lock_free = &self.header.state().lock_free;
        let mut snapshot = lock_free.reader_start();

        let mut edge;
        let mut consumed;
        if resuming {
            edge = data.edge_ptrs.clone();
            consumed = data.consumed;
        } else {
            edge = EdgePtrs::new();
            self.mm.get_root_edge(key[0], &mut edge)?;
            if edge.is_empty() {
                self.verify(&mut snapshot, edge.offset)?;
                return Err(DictError::NotExist);
            }
            consumed = 0;
        }

        let mut scratch = [0u8; NUM_ALPHABET];
        let mut last_node_head: Option<([u8; NODE_EDGE_KEY_FIRST], usize)> = None;

        let mut rval: Result<()> = Err(DictError::NotExist);
        loop {
            let edge_len = edge.label_len();
            let remaining = key.len() - consumed;

            if edge_len > remaining {
                break;
            }
            {
                let tail = match self.mm.label_tail(&edge, &mut scratch) {
                    Ok(tail) => tail,
                    Err(e) => {
                        rval = Err(e);
                        break;
                    }
                };
                if edge_len > 1 && tail != &key[consumed + 1..consumed + edge_len] {
                    break;
                }
            }

            consumed += edge_len;
            if consumed == key.len() || edge.is_leaf() {
                // Entry ends here, or a leaf shortcut whose full key is a
                // prefix of the search key.
                data.match_len = consumed;
                rval = self.read_data_from_edge(data, &edge);
                break;
            }

            let prev_offset = edge.offset;
            let mut node_head = [0u8; NODE_EDGE_KEY_FIRST];
            let next = self
                .mm
                .next_edge(&key[consumed..], &mut edge, &mut node_head, false);

            let node_readable = !matches!(next, Err(DictError::ReadError));
            if node_readable && node_head[0] & FLAG_NODE_MATCH != 0 {
                if all_prefix {
                    data.match_len = consumed;
                    rval = self.read_data_from_node(data, &node_head);
                    if next.is_ok() && rval.is_ok() {
                        // More tree below: remember where to pick up.
                        data.next = true;
                        data.consumed = consumed;
                        data.edge_ptrs = edge.clone();
                    }
                    break;
                }
                last_node_head = Some((node_head, consumed));
            }

            if let Err(e) = next {
                if !matches!(e, DictError::NotExist) {
                    rval = Err(e);
                }
                break;
            }
            self.verify(&mut snapshot, prev_offset)?;
        }

        if !all_prefix && matches!(rval, Err(DictError::NotExist)) {
            if let Some((head, match_len)) = last_node_head {
                data.match_len = match_len;
                rval = self.read_data_from_node(data, &head);
            }
        }

        self.verify(&mut snapshot, edge.offset)?;
        rval
    }

    /// Reads the payload reachable from `edge`: directly for a leaf
    /// shortcut, through the target node's MATCH offset otherwise.
    fn read_data_from_edge(&self, data: &mut MatchData, edge: &EdgePtrs) -> Result<()> {
        let data_off = if edge.is_leaf() {
            edge.target()
        } else {
            let mut node_head = [0u8; NODE_EDGE_KEY_FIRST];
            self.mm.read_exact(edge.target(), &mut node_head)?;
            if node_head[0] & FLAG_NODE_MATCH == 0 {
                return Err(DictError::NotExist);
            }
            get_6b(&node_head[2..NODE_EDGE_KEY_FIRST])
        };
        self.read_payload(data, data_off)
    }

    /// Reads the payload of a node already known to MATCH.
    fn read_data_from_node(&self, data: &mut MatchData, node_head: &[u8]) -> Result<()> {
        let data_off = get_6b(&node_head[2..NODE_EDGE_KEY_FIRST]);
        if data_off == 0 {
            return Err(DictError::NotExist);
        }
        self.read_payload(data, data_off)
    }

    fn read_payload(&self, data: &mut MatchData, data_off: u64) -> Result<()> {
        data.data_offset = data_off;

        let mut len_bytes = [0u8; DATA_SIZE_BYTE];
        if self.data_arena.read(data_off, &mut len_bytes) != DATA_SIZE_BYTE {
            return Err(DictError::ReadError);
        }
        let data_len = u16::from_le_bytes(len_bytes) as usize;

        data.resize_buff(data_len)?;
        if self
            .data_arena
            .read(data_off + DATA_SIZE_BYTE as u64, &mut data.buff[..data_len])
            != data_len
        {
            return Err(DictError::ReadError);
        }
        data.data_len = data_len;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Removes a key. `data` must carry `OPTION_FIND_AND_STORE_PARENT`.
    pub fn remove_with(&mut self, key: &[u8], data: &mut MatchData) -> Result<()> {
        if !self.is_writer() {
            return Err(DictError::NotAllowed);
        }
        if data.options & OPTION_FIND_AND_STORE_PARENT == 0 {
            return Err(DictError::InvalidArg);
        }

        match self.find(key, data) {
            Err(DictError::InDict) => {}
            Err(e) => return Err(e),
            Ok(()) => return Err(DictError::NotExist),
        }

        let mut edge = data.edge_ptrs.clone();
        let mut len = key.len();
        let mut rval = self.delete_data_from_edge(&edge);
        while matches!(rval, Err(DictError::TryAgain)) {
            // The edge's parent node died; re-walk to the edge pointing at
            // it and remove that one too.
            len -= edge.label_len();
            debug_assert!(len > 0);
            data.clear();
            match self.find(&key[..len], data) {
                Err(DictError::InDict) => {
                    edge = data.edge_ptrs.clone();
                    rval = self.mm.remove_edge_by_index(self.header.state(), &edge);
                }
                Err(e) => {
                    rval = Err(e);
                }
                Ok(()) => {
                    rval = Err(DictError::NotExist);
                }
            }
        }
        rval?;

        if self.header.state().count() <= 0 {
            self.remove_all()?;
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let mut data = MatchData::with_options(OPTION_FIND_AND_STORE_PARENT);
        self.remove_with(key, &mut data)
    }

    /// Payload release plus structural unlink for a found entry.
    fn delete_data_from_edge(&mut self, edge: &EdgePtrs) -> Result<()> {
        if edge.is_leaf() {
            self.release_buffer(edge.target())?;
            return self.mm.remove_edge_by_index(self.header.state(), edge);
        }

        let node_off = edge.target();
        let mut head = [0u8; NODE_EDGE_KEY_FIRST];
        self.mm.read_exact(node_off, &mut head)?;
        if head[0] & FLAG_NODE_MATCH == 0 {
            return Err(DictError::NotExist);
        }

        let data_off = get_6b(&head[2..NODE_EDGE_KEY_FIRST]);
        head[0] &= !FLAG_NODE_MATCH;
        set_6b(&mut head[2..NODE_EDGE_KEY_FIRST], 0);

        {
            let state = self.header.state();
            // The ADD_NODE replay carries no count delta for this record
            // (excep_buff[8] = 0), so the decrement belongs to staging.
            state.add_count(-1);
            let mut record = [0u8; NODE_EDGE_KEY_FIRST + 1];
            record[..NODE_EDGE_KEY_FIRST].copy_from_slice(&head);
            state.stage_exception(ExcepStatus::AddNode, &record, node_off, 0);
            state.lock_free.writer_start(edge.offset);
            self.mm.write(node_off, &head)?;
            state.lock_free.writer_stop();
            state.clear_exception(0);
        }

        self.release_buffer(data_off)
    }

    /// Clears every entry and resets both arenas to their initial state.
    pub fn remove_all(&mut self) -> Result<()> {
        if !self.is_writer() {
            return Err(DictError::NotAllowed);
        }

        for c in 0..NUM_ALPHABET {
            self.mm.clear_root_edge(self.header.state(), c as u8)?;
        }
        self.mm.clear_mem(self.header.state())?;

        let state = self.header.state();
        state.set_count(0);
        state.set_data_offset(DATA_HEADER_SIZE);
        state.set_pending_data(0);
        self.data_free_list.empty();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data buffer layer
    // ------------------------------------------------------------------

    /// Places `value` into a data buffer (recycled before fresh) and
    /// returns its offset. Arena reservation failure is fatal to the
    /// operation; any half-applied structural change is replayed away on
    /// the next writer open.
    pub fn reserve_data(&mut self, value: &[u8]) -> Result<u64> {
        debug_assert!(value.len() <= MAX_DATA_SIZE);

        let state = self.header.state();
        let buf_size = self
            .data_free_list
            .alignment_size(value.len() + DATA_SIZE_BYTE);
        let index = self.data_free_list.bucket_index(buf_size);
        let len_bytes = (value.len() as u16).to_le_bytes();

        let offset = if let Some(offset) = self.data_free_list.remove_buffer_by_index(index) {
            state.add_pending_data(-(buf_size as i64));
            offset
        } else {
            let old_offset = state.data_offset();
            let offset = self
                .data_arena
                .reserve(old_offset, buf_size)
                .map_err(|e| DictError::AllocationError(format!("{e:#}")))?;
            if offset > old_offset {
                self.data_free_list
                    .release_alignment_buffer(old_offset, offset);
                state.add_pending_data((offset - old_offset) as i64);
            }
            state.set_data_offset(offset + buf_size as u64);
            offset
        };

        self.data_arena
            .write(offset, &len_bytes)
            .and_then(|_| self.data_arena.write(offset + DATA_SIZE_BYTE as u64, value))
            .map_err(|e| DictError::AllocationError(format!("{e:#}")))?;
        Ok(offset)
    }

    /// Returns the buffer at `offset` to the free list, reading its stored
    /// length to find the size class.
    pub fn release_buffer(&mut self, offset: u64) -> Result<()> {
        let mut len_bytes = [0u8; DATA_SIZE_BYTE];
        if self.data_arena.read(offset, &mut len_bytes) != DATA_SIZE_BYTE {
            return Err(DictError::ReadError);
        }
        let data_len = u16::from_le_bytes(len_bytes) as usize;

        let rel_size = self
            .data_free_list
            .alignment_size(data_len + DATA_SIZE_BYTE);
        self.header.state().add_pending_data(rel_size as i64);
        self.data_free_list.release_buffer(offset, rel_size);
        Ok(())
    }

    /// Resolves an insert whose key ends on an existing terminator: replace
    /// the payload (overwrite) or report `InDict`.
    fn update_data_buffer(
        &mut self,
        edge: &mut EdgePtrs,
        overwrite: bool,
        value: &[u8],
    ) -> Result<()> {
        if edge.is_leaf() {
            if !overwrite {
                return Err(DictError::InDict);
            }

            if let Err(e) = self.release_buffer(edge.target()) {
                warn!("failed to release replaced data buffer: {e}");
            }
            let new_off = self.reserve_data(value)?;
            edge.set_target(new_off);

            let mut off_bytes = [0u8; OFFSET_SIZE];
            set_6b(&mut off_bytes, new_off);
            let state = self.header.state();
            state.stage_exception(ExcepStatus::AddDataOff, &off_bytes, 0, edge.offset);
            state.lock_free.writer_start(edge.offset);
            self.mm
                .write(edge.offset + EDGE_NODE_LEADING_POS as u64, &off_bytes)?;
            state.lock_free.writer_stop();
            state.clear_exception(0);
            Ok(())
        } else {
            let node_off = edge.target();
            let mut head = [0u8; NODE_EDGE_KEY_FIRST];
            self.mm.read_exact(node_off, &mut head)?;

            let inc_count = if head[0] & FLAG_NODE_MATCH != 0 {
                if !overwrite {
                    return Err(DictError::InDict);
                }
                let old_off = get_6b(&head[2..NODE_EDGE_KEY_FIRST]);
                if let Err(e) = self.release_buffer(old_off) {
                    warn!("failed to release replaced data buffer: {e}");
                }
                0u8
            } else {
                head[0] |= FLAG_NODE_MATCH;
                1u8
            };

            let new_off = self.reserve_data(value)?;
            set_6b(&mut head[2..NODE_EDGE_KEY_FIRST], new_off);

            let state = self.header.state();
            let mut record = [0u8; NODE_EDGE_KEY_FIRST + 1];
            record[..NODE_EDGE_KEY_FIRST].copy_from_slice(&head);
            record[NODE_EDGE_KEY_FIRST] = inc_count;
            state.stage_exception(ExcepStatus::AddNode, &record, node_off, 0);
            state.lock_free.writer_start(edge.offset);
            self.mm.write(node_off, &head)?;
            state.lock_free.writer_stop();
            state.clear_exception(inc_count as i64);
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Crash recovery
    // ------------------------------------------------------------------

    /// Replays the staged write-ahead mutation record, if any. Idempotent:
    /// a completed replay clears the record, and replaying a cleared record
    /// is a no-op.
    pub fn exception_recovery(&mut self) -> Result<()> {
        let status = self.header.state().exception_status();
        if status == ExcepStatus::None {
            return Ok(());
        }

        let (buff, offset, lf_offset) = self.header.state().exception_record();
        warn!("replaying interrupted mutation {status:?} at offset {lf_offset}");

        let count_delta: i64 = match status {
            ExcepStatus::None => 0,
            ExcepStatus::AddEdge => {
                self.mm.write(lf_offset, &buff[..EDGE_SIZE])?;
                1
            }
            ExcepStatus::AddDataOff => {
                self.mm.write(
                    lf_offset + EDGE_NODE_LEADING_POS as u64,
                    &buff[..OFFSET_SIZE],
                )?;
                0
            }
            ExcepStatus::AddNode => {
                self.mm.write(offset, &buff[..NODE_EDGE_KEY_FIRST])?;
                i64::from(buff[NODE_EDGE_KEY_FIRST] == 1)
            }
            ExcepStatus::RemoveEdge => {
                let mut off_bytes = [0u8; OFFSET_SIZE];
                set_6b(&mut off_bytes, offset);
                if buff[0] == 1 {
                    // Node-collapse records restore the leaf flag together
                    // with the payload offset.
                    let mut flag = [0u8; 1];
                    self.mm
                        .read_exact(lf_offset + super::edge::EDGE_FLAG_POS as u64, &mut flag)?;
                    let mut tail = [0u8; 1 + OFFSET_SIZE];
                    tail[0] = flag[0] | super::edge::EDGE_FLAG_DATA_OFF;
                    tail[1..].copy_from_slice(&off_bytes);
                    self.mm
                        .write(lf_offset + super::edge::EDGE_FLAG_POS as u64, &tail)?;
                } else {
                    self.mm.write(
                        lf_offset + EDGE_NODE_LEADING_POS as u64,
                        &off_bytes,
                    )?;
                }
                0
            }
            ExcepStatus::ClearEdge => {
                self.mm.write(lf_offset, &[0u8; EDGE_SIZE])?;
                -1
            }
        };

        self.header.state().clear_exception(count_delta);
        if let Err(e) = self.mm.sync() {
            warn!("index arena sync failed after recovery: {e:#}");
        }
        Ok(())
    }
}
