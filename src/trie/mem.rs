//! # Tree Memory
//!
//! `TreeMem` owns the index arena and performs every structural read and
//! write of the radix tree: root initialization, edge walks, node creation,
//! edge splitting and edge removal. The dictionary engine above it decides
//! *what* to mutate; this module decides *how* the bytes move.
//!
//! ## Publish-last discipline
//!
//! Every mutation builds its new nodes and spilled label tails in fresh (or
//! recycled) arena space first, while the tree still points at the old
//! structure. The final step, the "publish", is a single small write into
//! the live tree: a 13-byte edge record, a 6-byte offset field, or an
//! 8-byte node head. Only that final write is visible to readers, and it is
//! bracketed by:
//!
//! 1. staging the write-ahead exception record in the shared header, so a
//!    crash between stage and completion is replayed on the next writer
//!    open;
//! 2. the lock-free writer publication (`writer_start`/`writer_stop`), so a
//!    reader that consumed the edge mid-write re-walks.
//!
//! ## Allocation
//!
//! Nodes and label tails are variable-sized buffers carved from the index
//! arena at the `m_index_offset` high-water mark, recycled through a
//! size-classed free list. Replaced nodes are freed; spilled label tails are
//! not, because edge splits share tail storage between the split halves
//! (the prefix edge keeps the tail start, the suffix edge points into its
//! middle), so a tail may be referenced by edges this module can no longer
//! enumerate. `remove_all` reclaims everything at once.

use eyre::Result as EyreResult;

use super::edge::{
    get_6b, make_local_edge, make_remote_edge, set_6b, EdgePtrs, EDGE_FLAG_DATA_OFF,
    EDGE_FLAG_POS, EDGE_LEN_POS, EDGE_NODE_LEADING_POS, EDGE_SIZE, FLAG_NODE_MATCH,
    LOCAL_EDGE_LEN, NODE_EDGE_KEY_FIRST, NUM_ALPHABET, OFFSET_SIZE,
};
use crate::error::{DictError, Result};
use crate::storage::{
    BufferFreeList, ExcepStatus, FileArena, SharedState, INDEX_HEADER_SIZE,
};

/// Size of the root node: fixed fan-out of one edge slot per first byte.
pub const ROOT_NODE_SIZE: usize =
    NODE_EDGE_KEY_FIRST + NUM_ALPHABET + NUM_ALPHABET * EDGE_SIZE;

const _: () = assert!(ROOT_NODE_SIZE % 8 == 0);

/// Bytes occupied by a node with `nt` child edges.
#[inline]
fn node_size(nt: usize) -> usize {
    NODE_EDGE_KEY_FIRST + nt + nt * EDGE_SIZE
}

pub struct TreeMem {
    arena: FileArena,
    free_list: BufferFreeList,
    root_offset: u64,
}

impl TreeMem {
    pub fn new(arena: FileArena, free_list: BufferFreeList) -> Self {
        Self {
            arena,
            free_list,
            root_offset: INDEX_HEADER_SIZE as u64,
        }
    }

    pub fn root_offset(&self) -> u64 {
        self.root_offset
    }

    /// Arena offset of the root edge slot for a first byte.
    pub fn root_edge_offset(&self, first: u8) -> u64 {
        self.root_offset
            + (NODE_EDGE_KEY_FIRST + NUM_ALPHABET + first as usize * EDGE_SIZE) as u64
    }

    /// Writes a fresh root node and resets the index high-water mark.
    pub fn init_root(&self, header: &SharedState) -> Result<()> {
        let mut root = vec![0u8; ROOT_NODE_SIZE];
        root[1] = (NUM_ALPHABET - 1) as u8;
        for (i, key) in root[NODE_EDGE_KEY_FIRST..NODE_EDGE_KEY_FIRST + NUM_ALPHABET]
            .iter_mut()
            .enumerate()
        {
            *key = i as u8;
        }

        self.write(self.root_offset, &root)?;
        header.set_index_offset(self.root_offset + ROOT_NODE_SIZE as u64);
        Ok(())
    }

    /// A mapped index arena is usable when the high-water mark clears the
    /// root node.
    pub fn is_valid(&self, header: &SharedState) -> bool {
        header.index_offset() >= self.root_offset + ROOT_NODE_SIZE as u64
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_exact(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.arena.read(offset, buf) != buf.len() {
            return Err(DictError::ReadError);
        }
        Ok(())
    }

    /// Writes `data` at `offset`, growing the arena as needed.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.arena
            .write(offset, data)
            .map_err(|e| DictError::AllocationError(format!("{e:#}")))
    }

    pub fn sync(&self) -> EyreResult<()> {
        self.arena.sync()
    }

    pub fn load_free_list(&mut self) -> EyreResult<bool> {
        self.free_list.load_from_disk()
    }

    pub fn store_free_list(&self) -> EyreResult<()> {
        self.free_list.store_to_disk()
    }

    pub fn free_list_size(&self) -> u64 {
        self.free_list.tot_size()
    }

    /// Loads the root edge slot for `first` into `edge`.
    pub fn get_root_edge(&self, first: u8, edge: &mut EdgePtrs) -> Result<()> {
        edge.offset = self.root_edge_offset(first);
        self.read_exact(edge.offset, &mut edge.buff)
    }

    /// Copies the stored label tail of `edge` (`label_len - 1` bytes) into
    /// `scratch` and returns it as a slice. Inline tails are served from the
    /// record itself.
    pub fn label_tail<'a>(
        &self,
        edge: &'a EdgePtrs,
        scratch: &'a mut [u8; NUM_ALPHABET],
    ) -> Result<&'a [u8]> {
        let tail_len = edge.label_len().saturating_sub(1);
        if edge.has_local_label() {
            Ok(&edge.buff[..tail_len])
        } else {
            self.read_exact(edge.label_offset(), &mut scratch[..tail_len])?;
            Ok(&scratch[..tail_len])
        }
    }

    /// Insert-side descent: follows `edge` into its child node and looks for
    /// the edge whose discriminator is `key_rem[0]`.
    ///
    /// - `Ok(None)`: no such edge. Either `edge` is a leaf shortcut, or the
    ///   node has no child for that byte; `edge` is left pointing at the
    ///   parent edge and `curr_node_offset`/`curr_nt` identify the node, so
    ///   [`Self::update_node`] can extend it.
    /// - `Ok(Some(m))`: the edge was loaded into `edge`; `m` is the number
    ///   of leading `key_rem` bytes its label matches (at least 1, the
    ///   discriminator).
    pub fn find_next(&self, key_rem: &[u8], edge: &mut EdgePtrs) -> Result<Option<usize>> {
        debug_assert!(!key_rem.is_empty());

        if edge.is_leaf() {
            return Ok(None);
        }

        let node_off = edge.target();
        let mut head = [0u8; NODE_EDGE_KEY_FIRST];
        self.read_exact(node_off, &mut head)?;
        let nt = head[1] as usize + 1;

        let mut keys = [0u8; NUM_ALPHABET];
        self.read_exact(node_off + NODE_EDGE_KEY_FIRST as u64, &mut keys[..nt])?;

        edge.curr_node_offset = node_off;
        edge.curr_nt = nt;

        let Some(index) = keys[..nt].iter().position(|&k| k == key_rem[0]) else {
            return Ok(None);
        };

        edge.parent_offset = edge.offset;
        edge.curr_edge_index = index;
        edge.offset = node_off + (NODE_EDGE_KEY_FIRST + nt + index * EDGE_SIZE) as u64;
        self.read_exact(edge.offset, &mut edge.buff)?;

        let mut scratch = [0u8; NUM_ALPHABET];
        let max = edge.label_len().min(key_rem.len());
        let tail = self.label_tail(edge, &mut scratch)?;
        let mut m = 1;
        while m < max && tail[m - 1] == key_rem[m] {
            m += 1;
        }
        Ok(Some(m))
    }

    /// Lookup-side descent: follows `edge` into its child node, records the
    /// node head into `node_head` (the caller inspects the MATCH flag even
    /// when no edge matches), and loads the edge for `key_rem[0]`.
    /// `store_parent` records the coordinates removal needs.
    pub fn next_edge(
        &self,
        key_rem: &[u8],
        edge: &mut EdgePtrs,
        node_head: &mut [u8; NODE_EDGE_KEY_FIRST],
        store_parent: bool,
    ) -> Result<()> {
        debug_assert!(!key_rem.is_empty());

        let node_off = edge.target();
        self.read_exact(node_off, node_head)?;
        let nt = node_head[1] as usize + 1;

        let mut keys = [0u8; NUM_ALPHABET];
        self.read_exact(node_off + NODE_EDGE_KEY_FIRST as u64, &mut keys[..nt])?;

        let Some(index) = keys[..nt].iter().position(|&k| k == key_rem[0]) else {
            return Err(DictError::NotExist);
        };

        if store_parent {
            edge.curr_node_offset = node_off;
            edge.curr_nt = nt;
            edge.curr_edge_index = index;
            edge.parent_offset = edge.offset;
        }

        edge.offset = node_off + (NODE_EDGE_KEY_FIRST + nt + index * EDGE_SIZE) as u64;
        self.read_exact(edge.offset, &mut edge.buff)
    }

    /// Reserves an index buffer, recycling from the free list before growing
    /// the arena. Block-alignment gaps are recycled and charged to the
    /// pending counter.
    fn alloc(&mut self, header: &SharedState, size: usize) -> Result<u64> {
        let aligned = self.free_list.alignment_size(size);
        debug_assert!(aligned <= self.free_list.max_buffer_size());

        let index = self.free_list.bucket_index(aligned);
        if let Some(offset) = self.free_list.remove_buffer_by_index(index) {
            header.add_pending_index(-(aligned as i64));
            return Ok(offset);
        }

        let old_offset = header.index_offset();
        let offset = self
            .arena
            .reserve(old_offset, aligned)
            .map_err(|e| DictError::AllocationError(format!("{e:#}")))?;
        if offset > old_offset {
            self.free_list.release_alignment_buffer(old_offset, offset);
            header.add_pending_index((offset - old_offset) as i64);
        }
        header.set_index_offset(offset + aligned as u64);
        Ok(offset)
    }

    /// Returns a no-longer-referenced index buffer to the free list.
    fn free(&mut self, header: &SharedState, offset: u64, size: usize) {
        let aligned = self.free_list.alignment_size(size);
        self.free_list.release_buffer(offset, aligned);
        header.add_pending_index(aligned as i64);
    }

    /// Builds a leaf edge record for `label` (full label, discriminator
    /// included), spilling the tail to the arena when it does not fit
    /// inline.
    fn build_leaf_edge(
        &mut self,
        header: &SharedState,
        label: &[u8],
        data_off: u64,
    ) -> Result<[u8; EDGE_SIZE]> {
        if label.len() <= LOCAL_EDGE_LEN {
            Ok(make_local_edge(label, EDGE_FLAG_DATA_OFF, data_off))
        } else {
            let tail = &label[1..];
            let tail_off = self.alloc(header, tail.len())?;
            self.write(tail_off, tail)?;
            Ok(make_remote_edge(
                label.len(),
                tail_off,
                EDGE_FLAG_DATA_OFF,
                data_off,
            ))
        }
    }

    /// Writes a fresh node with the given child entries and returns its
    /// offset. `entries` pairs each discriminator byte with its edge record.
    fn write_new_node(
        &mut self,
        header: &SharedState,
        flags: u8,
        data_off: u64,
        entries: &[(u8, [u8; EDGE_SIZE])],
    ) -> Result<u64> {
        let nt = entries.len();
        debug_assert!(nt >= 1 && nt <= NUM_ALPHABET);

        let mut node = vec![0u8; node_size(nt)];
        node[0] = flags;
        node[1] = (nt - 1) as u8;
        set_6b(&mut node[2..NODE_EDGE_KEY_FIRST], data_off);
        for (i, (disc, record)) in entries.iter().enumerate() {
            node[NODE_EDGE_KEY_FIRST + i] = *disc;
            let edge_pos = NODE_EDGE_KEY_FIRST + nt + i * EDGE_SIZE;
            node[edge_pos..edge_pos + EDGE_SIZE].copy_from_slice(record);
        }

        let offset = self.alloc(header, node.len())?;
        self.write(offset, &node)?;
        Ok(offset)
    }

    /// Publishes a complete edge record at `offset`: stages the exception
    /// record, brackets the store with the lock-free publication, and
    /// commits the entry-count delta.
    fn publish_edge(
        &self,
        header: &SharedState,
        offset: u64,
        record: &[u8; EDGE_SIZE],
        count_delta: i64,
    ) -> Result<()> {
        header.stage_exception(ExcepStatus::AddEdge, record, 0, offset);
        header.lock_free.writer_start(offset);
        self.write(offset, record)?;
        header.lock_free.writer_stop();
        header.clear_exception(count_delta);
        Ok(())
    }

    /// Fills an empty root slot with a leaf edge carrying the whole key.
    pub fn add_root_edge(
        &mut self,
        header: &SharedState,
        edge: &mut EdgePtrs,
        key: &[u8],
        data_off: u64,
    ) -> Result<()> {
        let record = self.build_leaf_edge(header, key, data_off)?;
        self.publish_edge(header, edge.offset, &record, 1)?;
        edge.buff = record;
        Ok(())
    }

    /// Extends the tree below `edge` with a new leaf for `key_rem`:
    /// converts a leaf shortcut into a matching node with one child, or
    /// appends a child edge to the node `edge` points at (the one
    /// [`Self::find_next`] failed to descend from).
    pub fn update_node(
        &mut self,
        header: &SharedState,
        edge: &mut EdgePtrs,
        key_rem: &[u8],
        data_off: u64,
    ) -> Result<()> {
        debug_assert!(!key_rem.is_empty());

        let new_edge = self.build_leaf_edge(header, key_rem, data_off)?;

        let mut record = edge.buff;
        if edge.is_leaf() {
            // The existing entry ends exactly where the new key continues:
            // the leaf payload moves onto a MATCH node that also carries the
            // new edge.
            let old_data_off = edge.target();
            let node_off = self.write_new_node(
                header,
                FLAG_NODE_MATCH,
                old_data_off,
                &[(key_rem[0], new_edge)],
            )?;
            record[EDGE_FLAG_POS] &= !EDGE_FLAG_DATA_OFF;
            set_6b(&mut record[EDGE_NODE_LEADING_POS..], node_off);
        } else {
            // Rebuild the node with one more child and swing the parent
            // edge over to it.
            let node_off = edge.curr_node_offset;
            let nt = edge.curr_nt;
            let old_size = node_size(nt);
            let mut old_node = vec![0u8; old_size];
            self.read_exact(node_off, &mut old_node)?;

            let new_size = node_size(nt + 1);
            let mut node = vec![0u8; new_size];
            node[..2].copy_from_slice(&old_node[..2]);
            node[1] = nt as u8;
            node[2..NODE_EDGE_KEY_FIRST].copy_from_slice(&old_node[2..NODE_EDGE_KEY_FIRST]);
            node[NODE_EDGE_KEY_FIRST..NODE_EDGE_KEY_FIRST + nt]
                .copy_from_slice(&old_node[NODE_EDGE_KEY_FIRST..NODE_EDGE_KEY_FIRST + nt]);
            node[NODE_EDGE_KEY_FIRST + nt] = key_rem[0];
            let old_edges = &old_node[NODE_EDGE_KEY_FIRST + nt..NODE_EDGE_KEY_FIRST + nt + nt * EDGE_SIZE];
            let edges_pos = NODE_EDGE_KEY_FIRST + nt + 1;
            node[edges_pos..edges_pos + nt * EDGE_SIZE].copy_from_slice(old_edges);
            let new_pos = edges_pos + nt * EDGE_SIZE;
            node[new_pos..new_pos + EDGE_SIZE].copy_from_slice(&new_edge);

            let new_off = self.alloc(header, new_size)?;
            self.write(new_off, &node)?;

            set_6b(&mut record[EDGE_NODE_LEADING_POS..], new_off);
            self.publish_edge(header, edge.offset, &record, 1)?;
            edge.buff = record;
            self.free(header, node_off, old_size);
            return Ok(());
        }

        self.publish_edge(header, edge.offset, &record, 1)?;
        edge.buff = record;
        Ok(())
    }

    /// Splits `edge` at `match_len` and attaches a new sibling leaf for
    /// `key_tail` (the key bytes past the split point). The original edge
    /// content becomes the other child.
    pub fn add_link(
        &mut self,
        header: &SharedState,
        edge: &mut EdgePtrs,
        match_len: usize,
        key_tail: &[u8],
        data_off: u64,
    ) -> Result<()> {
        debug_assert!(match_len >= 1 && match_len < edge.label_len());
        debug_assert!(!key_tail.is_empty());

        let mut scratch = [0u8; NUM_ALPHABET];
        let (suffix_disc, suffix_edge) = self.split_suffix_edge(edge, match_len, &mut scratch)?;
        let new_leaf = self.build_leaf_edge(header, key_tail, data_off)?;

        let node_off = self.write_new_node(
            header,
            0,
            0,
            &[(suffix_disc, suffix_edge), (key_tail[0], new_leaf)],
        )?;

        let record = self.split_prefix_record(edge, match_len, node_off, &scratch);
        self.publish_edge(header, edge.offset, &record, 1)?;
        edge.buff = record;
        Ok(())
    }

    /// Splits `edge` at `match_len`, where the key ends exactly: the split
    /// point becomes a MATCH node holding `data_off`, with the original
    /// edge content as its only child.
    pub fn insert_node(
        &mut self,
        header: &SharedState,
        edge: &mut EdgePtrs,
        match_len: usize,
        data_off: u64,
    ) -> Result<()> {
        debug_assert!(match_len >= 1 && match_len < edge.label_len());

        let mut scratch = [0u8; NUM_ALPHABET];
        let (suffix_disc, suffix_edge) = self.split_suffix_edge(edge, match_len, &mut scratch)?;

        let node_off =
            self.write_new_node(header, FLAG_NODE_MATCH, data_off, &[(suffix_disc, suffix_edge)])?;

        let record = self.split_prefix_record(edge, match_len, node_off, &scratch);
        self.publish_edge(header, edge.offset, &record, 1)?;
        edge.buff = record;
        Ok(())
    }

    /// Builds the child edge carrying the label suffix past `match_len`,
    /// inheriting the original edge's flags and target. Spilled tails are
    /// shared by pointing into the original tail storage; no bytes move.
    /// Returns the suffix discriminator and the record; `scratch` ends up
    /// holding the original label tail.
    fn split_suffix_edge(
        &self,
        edge: &EdgePtrs,
        match_len: usize,
        scratch: &mut [u8; NUM_ALPHABET],
    ) -> Result<(u8, [u8; EDGE_SIZE])> {
        let label_len = edge.label_len();
        let tail_len = label_len - 1;
        if edge.has_local_label() {
            scratch[..tail_len].copy_from_slice(&edge.buff[..tail_len]);
        } else {
            self.read_exact(edge.label_offset(), &mut scratch[..tail_len])?;
        }

        let suffix_disc = scratch[match_len - 1];
        let suffix_len = label_len - match_len;
        let flag = edge.flag();
        let target = edge.target();

        let record = if suffix_len <= LOCAL_EDGE_LEN {
            let mut label = [0u8; LOCAL_EDGE_LEN];
            label[0] = suffix_disc;
            label[1..suffix_len].copy_from_slice(&scratch[match_len..match_len + suffix_len - 1]);
            make_local_edge(&label[..suffix_len], flag, target)
        } else {
            // suffix_len > LOCAL_EDGE_LEN forces label_len > LOCAL_EDGE_LEN,
            // so the original tail is spilled and its suffix is reusable in
            // place.
            make_remote_edge(
                suffix_len,
                edge.label_offset() + match_len as u64,
                flag,
                target,
            )
        };
        Ok((suffix_disc, record))
    }

    /// Builds the replacement record for the split edge itself: same label
    /// truncated to `match_len`, pointing at the new intermediate node.
    /// `scratch` holds the original label tail from
    /// [`Self::split_suffix_edge`].
    fn split_prefix_record(
        &self,
        edge: &EdgePtrs,
        match_len: usize,
        node_off: u64,
        scratch: &[u8; NUM_ALPHABET],
    ) -> [u8; EDGE_SIZE] {
        let flag = edge.flag() & !EDGE_FLAG_DATA_OFF;
        if match_len <= LOCAL_EDGE_LEN {
            let mut record = [0u8; EDGE_SIZE];
            record[..match_len - 1].copy_from_slice(&scratch[..match_len - 1]);
            record[EDGE_LEN_POS] = match_len as u8;
            record[EDGE_FLAG_POS] = flag;
            set_6b(&mut record[EDGE_NODE_LEADING_POS..], node_off);
            record
        } else {
            // match_len > LOCAL_EDGE_LEN implies the original tail is
            // spilled; its prefix stays valid at the same offset.
            make_remote_edge(match_len, edge.label_offset(), flag, node_off)
        }
    }

    /// Unlinks `edge` from the node containing it. Root slots are cleared
    /// in place; other nodes are rebuilt without the edge, collapse into a
    /// leaf shortcut when only their own match remains, or die entirely.
    /// A dead node means the caller must re-walk and remove the edge
    /// pointing at it (`TryAgain`).
    pub fn remove_edge_by_index(&mut self, header: &SharedState, edge: &EdgePtrs) -> Result<()> {
        if edge.curr_node_offset == self.root_offset {
            let zero = [0u8; EDGE_SIZE];
            header.stage_exception(ExcepStatus::ClearEdge, &[], 0, edge.offset);
            header.lock_free.writer_start(edge.offset);
            self.write(edge.offset, &zero)?;
            header.lock_free.writer_stop();
            header.clear_exception(-1);
            return Ok(());
        }

        let node_off = edge.curr_node_offset;
        let nt = edge.curr_nt;
        let index = edge.curr_edge_index;
        let old_size = node_size(nt);
        let mut old_node = vec![0u8; old_size];
        self.read_exact(node_off, &mut old_node)?;

        if nt > 1 {
            let new_size = node_size(nt - 1);
            let mut node = vec![0u8; new_size];
            node[..NODE_EDGE_KEY_FIRST].copy_from_slice(&old_node[..NODE_EDGE_KEY_FIRST]);
            node[1] = (nt - 2) as u8;
            let mut pos = NODE_EDGE_KEY_FIRST;
            for i in 0..nt {
                if i != index {
                    node[pos] = old_node[NODE_EDGE_KEY_FIRST + i];
                    pos += 1;
                }
            }
            let old_edges = NODE_EDGE_KEY_FIRST + nt;
            let new_edges = NODE_EDGE_KEY_FIRST + (nt - 1);
            let mut pos = new_edges;
            for i in 0..nt {
                if i != index {
                    let src = old_edges + i * EDGE_SIZE;
                    node[pos..pos + EDGE_SIZE].copy_from_slice(&old_node[src..src + EDGE_SIZE]);
                    pos += EDGE_SIZE;
                }
            }

            let new_off = self.alloc(header, new_size)?;
            self.write(new_off, &node)?;

            header.add_count(-1);
            header.stage_exception(ExcepStatus::RemoveEdge, &[0], new_off, edge.parent_offset);
            header.lock_free.writer_start(edge.parent_offset);
            let mut offset_bytes = [0u8; OFFSET_SIZE];
            set_6b(&mut offset_bytes, new_off);
            self.write(
                edge.parent_offset + EDGE_NODE_LEADING_POS as u64,
                &offset_bytes,
            )?;
            header.lock_free.writer_stop();
            header.clear_exception(0);
            self.free(header, node_off, old_size);
            return Ok(());
        }

        // Last child removed.
        if old_node[0] & FLAG_NODE_MATCH != 0 {
            // The node still terminates an entry: fold it back into a leaf
            // shortcut on the edge that pointed here.
            let node_data_off = get_6b(&old_node[2..NODE_EDGE_KEY_FIRST]);

            header.add_count(-1);
            header.stage_exception(
                ExcepStatus::RemoveEdge,
                &[1],
                node_data_off,
                edge.parent_offset,
            );
            header.lock_free.writer_start(edge.parent_offset);
            let mut flag_byte = [0u8; 1];
            self.read_exact(edge.parent_offset + EDGE_FLAG_POS as u64, &mut flag_byte)?;
            let mut tail = [0u8; 1 + OFFSET_SIZE];
            tail[0] = flag_byte[0] | EDGE_FLAG_DATA_OFF;
            set_6b(&mut tail[1..], node_data_off);
            self.write(edge.parent_offset + EDGE_FLAG_POS as u64, &tail)?;
            header.lock_free.writer_stop();
            header.clear_exception(0);
            self.free(header, node_off, old_size);
            return Ok(());
        }

        // Nothing terminates here anymore: the node dies and the edge that
        // pointed at it has to go too.
        self.free(header, node_off, old_size);
        Err(DictError::TryAgain)
    }

    /// Clears a root edge slot (store reset path).
    pub fn clear_root_edge(&self, header: &SharedState, first: u8) -> Result<()> {
        let offset = self.root_edge_offset(first);
        let zero = [0u8; EDGE_SIZE];
        header.stage_exception(ExcepStatus::ClearEdge, &[], 0, offset);
        header.lock_free.writer_start(offset);
        self.write(offset, &zero)?;
        header.lock_free.writer_stop();
        header.clear_exception(0);
        Ok(())
    }

    /// Resets the index side: fresh root, empty free list, zero pending.
    pub fn clear_mem(&mut self, header: &SharedState) -> Result<()> {
        self.init_root(header)?;
        self.free_list.empty();
        header.set_pending_index(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{HeaderMap, INDEX_BLOCK_SIZE, INDEX_BUFFER_ALIGNMENT, NUM_INDEX_BUFFER_BUCKETS};

    struct Fixture {
        header: HeaderMap,
        mem: TreeMem,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let idx_path = dir.path().join("radix.idx");
        let arena = FileArena::create(&idx_path, INDEX_BLOCK_SIZE).unwrap();
        let header = HeaderMap::open(&idx_path, true).unwrap();
        let free_list = BufferFreeList::new(
            dir.path().join("radix.ifl"),
            INDEX_BUFFER_ALIGNMENT,
            NUM_INDEX_BUFFER_BUCKETS,
        );
        let mem = TreeMem::new(arena, free_list);
        mem.init_root(header.state()).unwrap();
        Fixture {
            header,
            mem,
            _dir: dir,
        }
    }

    #[test]
    fn init_root_reserves_full_fanout() {
        let f = fixture();

        assert!(f.mem.is_valid(f.header.state()));
        assert_eq!(
            f.header.state().index_offset(),
            INDEX_HEADER_SIZE as u64 + ROOT_NODE_SIZE as u64
        );
    }

    #[test]
    fn root_edges_start_empty() {
        let f = fixture();
        let mut edge = EdgePtrs::new();

        f.mem.get_root_edge(b'a', &mut edge).unwrap();

        assert!(edge.is_empty());
        assert_eq!(edge.offset, f.mem.root_edge_offset(b'a'));
    }

    #[test]
    fn add_root_edge_publishes_leaf() {
        let f = fixture();
        let state = f.header.state();
        let mut edge = EdgePtrs::new();
        f.mem.get_root_edge(b'a', &mut edge).unwrap();

        let mut mem = f.mem;
        mem.add_root_edge(state, &mut edge, b"apple", 4096).unwrap();

        let mut reread = EdgePtrs::new();
        mem.get_root_edge(b'a', &mut reread).unwrap();
        assert_eq!(reread.label_len(), 5);
        assert!(reread.is_leaf());
        assert_eq!(reread.target(), 4096);
        assert_eq!(state.count(), 1);
        assert_eq!(state.exception_status(), ExcepStatus::None);
    }

    #[test]
    fn long_key_spills_label_tail() {
        let f = fixture();
        let state = f.header.state();
        let mut mem = f.mem;
        let key = b"supercalifragilistic";
        let mut edge = EdgePtrs::new();
        mem.get_root_edge(key[0], &mut edge).unwrap();

        mem.add_root_edge(state, &mut edge, key, 128).unwrap();

        let mut reread = EdgePtrs::new();
        mem.get_root_edge(key[0], &mut reread).unwrap();
        assert!(!reread.has_local_label());
        let mut scratch = [0u8; NUM_ALPHABET];
        let tail = mem.label_tail(&reread, &mut scratch).unwrap();
        assert_eq!(tail, &key[1..]);
    }

    #[test]
    fn find_next_on_leaf_edge_returns_none() {
        let f = fixture();
        let state = f.header.state();
        let mut mem = f.mem;
        let mut edge = EdgePtrs::new();
        mem.get_root_edge(b'a', &mut edge).unwrap();
        mem.add_root_edge(state, &mut edge, b"apple", 64).unwrap();

        assert_eq!(mem.find_next(b"x", &mut edge).unwrap(), None);
    }

    #[test]
    fn update_node_converts_leaf_to_match_node() {
        let f = fixture();
        let state = f.header.state();
        let mut mem = f.mem;
        let mut edge = EdgePtrs::new();
        mem.get_root_edge(b'a', &mut edge).unwrap();
        mem.add_root_edge(state, &mut edge, b"app", 64).unwrap();

        // Extend "app" with the remainder of "apple".
        mem.update_node(state, &mut edge, b"le", 128).unwrap();

        let mut root_edge = EdgePtrs::new();
        mem.get_root_edge(b'a', &mut root_edge).unwrap();
        assert!(!root_edge.is_leaf());

        let mut head = [0u8; NODE_EDGE_KEY_FIRST];
        mem.read_exact(root_edge.target(), &mut head).unwrap();
        assert_eq!(head[0] & FLAG_NODE_MATCH, FLAG_NODE_MATCH);
        assert_eq!(head[1], 0);
        assert_eq!(get_6b(&head[2..8]), 64);
        assert_eq!(state.count(), 2);
    }
}
