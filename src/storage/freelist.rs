//! # Buffer Free Lists
//!
//! Freed arena buffers are recycled through size-classed free lists instead
//! of being returned to the file. A buffer of aligned size `s` lives in
//! bucket `s / alignment - 1`; reservation pops from the exact bucket before
//! the arena's high-water offset is allowed to grow.
//!
//! Two instances exist per store: one over the data arena (payload buffers)
//! and one over the index arena (nodes and spilled edge-label tails). Both
//! are writer-private in memory; readers never consult them.
//!
//! ## Alignment gaps
//!
//! When the arena bumps a reservation past a block boundary, the skipped
//! span is handed to [`BufferFreeList::release_alignment_buffer`], which
//! carves it into the largest representable chunks and buckets them. The
//! same chunking covers oversized releases.
//!
//! ## Persistence
//!
//! The writer dumps its lists to disk on clean shutdown and reloads them on
//! the next open. The dump carries a CRC64 over the entry payload; a dump
//! that fails magic, version, alignment or checksum validation is an error
//! and the writer refuses to initialize. The file is unlinked right after a
//! successful load, so a crash can never resurrect a stale list: after an
//! unclean shutdown the writer simply starts with empty lists, leaking
//! reclaimable space but never handing out a live buffer.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const DUMP_MAGIC: &[u8; 8] = b"rkvfl\x00\x00\x01";
const DUMP_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DumpHeader {
    magic: [u8; 8],
    version: U32,
    alignment: U32,
    entry_count: U64,
    payload_crc: U64,
}

const DUMP_HEADER_SIZE: usize = std::mem::size_of::<DumpHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DumpEntry {
    offset: U64,
    size: U32,
    reserved: U32,
}

const DUMP_ENTRY_SIZE: usize = std::mem::size_of::<DumpEntry>();

pub struct BufferFreeList {
    path: PathBuf,
    alignment: usize,
    buckets: Vec<VecDeque<u64>>,
    count: u64,
    tot_size: u64,
}

impl BufferFreeList {
    pub fn new<P: AsRef<Path>>(path: P, alignment: usize, num_buckets: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            alignment,
            buckets: vec![VecDeque::new(); num_buckets],
            count: 0,
            tot_size: 0,
        }
    }

    /// Rounds a raw byte size up to the allocation alignment.
    pub fn alignment_size(&self, size: usize) -> usize {
        debug_assert!(size > 0);
        size.div_ceil(self.alignment) * self.alignment
    }

    /// Bucket index for an aligned size.
    pub fn bucket_index(&self, aligned_size: usize) -> usize {
        debug_assert!(aligned_size % self.alignment == 0);
        aligned_size / self.alignment - 1
    }

    /// Aligned buffer size served by a bucket.
    pub fn bucket_size(&self, index: usize) -> usize {
        (index + 1) * self.alignment
    }

    /// Largest buffer size the lists can track.
    pub fn max_buffer_size(&self) -> usize {
        self.buckets.len() * self.alignment
    }

    pub fn count_by_index(&self, index: usize) -> usize {
        self.buckets[index].len()
    }

    /// Pops a recycled buffer offset from `index`'s bucket.
    pub fn remove_buffer_by_index(&mut self, index: usize) -> Option<u64> {
        let offset = self.buckets[index].pop_front()?;
        self.count -= 1;
        self.tot_size -= self.bucket_size(index) as u64;
        Some(offset)
    }

    /// Returns a freed buffer of exactly `aligned_size` bytes at `offset` to
    /// its bucket. Oversized buffers are carved into the largest
    /// representable chunks.
    pub fn release_buffer(&mut self, mut offset: u64, mut aligned_size: usize) {
        debug_assert!(aligned_size % self.alignment == 0);

        let max = self.max_buffer_size();
        while aligned_size > max {
            self.push(offset, self.bucket_index(max));
            offset += max as u64;
            aligned_size -= max;
        }
        if aligned_size > 0 {
            let index = self.bucket_index(aligned_size);
            self.push(offset, index);
        }
    }

    /// Buckets the span `[old_offset, new_offset)` skipped by a block-aligned
    /// reservation.
    pub fn release_alignment_buffer(&mut self, old_offset: u64, new_offset: u64) {
        debug_assert!(new_offset >= old_offset);
        let span = (new_offset - old_offset) as usize;
        if span == 0 {
            return;
        }
        // The span is bounded below by the alignment because both offsets
        // come from aligned reservations.
        self.release_buffer(old_offset, span - span % self.alignment);
    }

    fn push(&mut self, offset: u64, index: usize) {
        self.buckets[index].push_back(offset);
        self.count += 1;
        self.tot_size += self.bucket_size(index) as u64;
    }

    /// Drops every tracked buffer (store reset).
    pub fn empty(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.count = 0;
        self.tot_size = 0;
    }

    /// Number of buffers currently tracked.
    pub fn buffer_count(&self) -> u64 {
        self.count
    }

    /// Total bytes currently tracked.
    pub fn tot_size(&self) -> u64 {
        self.tot_size
    }

    /// Serializes the lists to the dump file. Called on clean shutdown.
    pub fn store_to_disk(&self) -> Result<()> {
        let mut payload = Vec::with_capacity(self.count as usize * DUMP_ENTRY_SIZE);
        for (index, bucket) in self.buckets.iter().enumerate() {
            let size = self.bucket_size(index) as u32;
            for &offset in bucket {
                let entry = DumpEntry {
                    offset: U64::new(offset),
                    size: U32::new(size),
                    reserved: U32::new(0),
                };
                payload.extend_from_slice(entry.as_bytes());
            }
        }

        let header = DumpHeader {
            magic: *DUMP_MAGIC,
            version: U32::new(DUMP_VERSION),
            alignment: U32::new(self.alignment as u32),
            entry_count: U64::new(self.count),
            payload_crc: U64::new(CRC64.checksum(&payload)),
        };

        let mut file = fs::File::create(&self.path)
            .wrap_err_with(|| format!("failed to create free-list dump '{}'", self.path.display()))?;
        file.write_all(header.as_bytes())
            .and_then(|_| file.write_all(&payload))
            .and_then(|_| file.sync_all())
            .wrap_err_with(|| format!("failed to write free-list dump '{}'", self.path.display()))?;

        Ok(())
    }

    /// Loads the dump written by the last clean shutdown, then unlinks it.
    /// A missing file is not an error (fresh store, or unclean shutdown);
    /// a malformed one is, and the caller refuses to initialize.
    pub fn load_from_disk(&mut self) -> Result<bool> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).wrap_err_with(|| {
                    format!("failed to read free-list dump '{}'", self.path.display())
                })
            }
        };

        ensure!(
            bytes.len() >= DUMP_HEADER_SIZE,
            "free-list dump '{}' truncated: {} bytes",
            self.path.display(),
            bytes.len()
        );

        let header = DumpHeader::ref_from_bytes(&bytes[..DUMP_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse free-list dump header: {:?}", e))?;

        ensure!(
            &header.magic == DUMP_MAGIC,
            "free-list dump '{}' has invalid magic",
            self.path.display()
        );
        ensure!(
            header.version.get() == DUMP_VERSION,
            "free-list dump version {} unsupported",
            header.version.get()
        );
        ensure!(
            header.alignment.get() as usize == self.alignment,
            "free-list dump alignment {} does not match store alignment {}",
            header.alignment.get(),
            self.alignment
        );

        let payload = &bytes[DUMP_HEADER_SIZE..];
        let expected = header.entry_count.get() as usize * DUMP_ENTRY_SIZE;
        ensure!(
            payload.len() == expected,
            "free-list dump '{}' payload size {} does not match entry count {}",
            self.path.display(),
            payload.len(),
            header.entry_count.get()
        );
        ensure!(
            CRC64.checksum(payload) == header.payload_crc.get(),
            "free-list dump '{}' failed checksum validation",
            self.path.display()
        );

        for chunk in payload.chunks_exact(DUMP_ENTRY_SIZE) {
            let entry = DumpEntry::ref_from_bytes(chunk)
                .map_err(|e| eyre::eyre!("failed to parse free-list entry: {:?}", e))?;
            let size = entry.size.get() as usize;
            ensure!(
                size > 0 && size % self.alignment == 0 && size <= self.max_buffer_size(),
                "free-list dump '{}' contains invalid buffer size {}",
                self.path.display(),
                size
            );
            self.push(entry.offset.get(), self.bucket_index(size));
        }

        fs::remove_file(&self.path).wrap_err_with(|| {
            format!("failed to unlink free-list dump '{}'", self.path.display())
        })?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_in(dir: &tempfile::TempDir) -> BufferFreeList {
        BufferFreeList::new(dir.path().join("radix.dfl"), 8, 64)
    }

    #[test]
    fn alignment_size_rounds_up() {
        let dir = tempfile::tempdir().unwrap();
        let list = list_in(&dir);

        assert_eq!(list.alignment_size(1), 8);
        assert_eq!(list.alignment_size(8), 8);
        assert_eq!(list.alignment_size(9), 16);
    }

    #[test]
    fn bucket_index_maps_size_classes() {
        let dir = tempfile::tempdir().unwrap();
        let list = list_in(&dir);

        assert_eq!(list.bucket_index(8), 0);
        assert_eq!(list.bucket_index(16), 1);
        assert_eq!(list.bucket_size(0), 8);
        assert_eq!(list.bucket_size(1), 16);
    }

    #[test]
    fn release_then_remove_is_fifo_per_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);

        list.release_buffer(100, 16);
        list.release_buffer(200, 16);

        let index = list.bucket_index(16);
        assert_eq!(list.count_by_index(index), 2);
        assert_eq!(list.remove_buffer_by_index(index), Some(100));
        assert_eq!(list.remove_buffer_by_index(index), Some(200));
        assert_eq!(list.remove_buffer_by_index(index), None);
    }

    #[test]
    fn oversized_release_is_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);
        let max = list.max_buffer_size();

        list.release_buffer(0, max + 24);

        assert_eq!(list.count_by_index(list.bucket_index(max)), 1);
        assert_eq!(list.count_by_index(list.bucket_index(24)), 1);
        assert_eq!(list.tot_size(), (max + 24) as u64);
    }

    #[test]
    fn alignment_gap_release_tracks_span() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);

        list.release_alignment_buffer(1000, 1040);

        assert_eq!(list.tot_size(), 40);
        assert_eq!(list.count_by_index(list.bucket_index(40)), 1);
    }

    #[test]
    fn empty_drops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);
        list.release_buffer(64, 32);

        list.empty();

        assert_eq!(list.buffer_count(), 0);
        assert_eq!(list.tot_size(), 0);
    }

    #[test]
    fn dump_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut list = list_in(&dir);
            list.release_buffer(128, 8);
            list.release_buffer(256, 32);
            list.release_buffer(512, 32);
            list.store_to_disk().unwrap();
        }

        let mut list = list_in(&dir);
        assert!(list.load_from_disk().unwrap());

        assert_eq!(list.buffer_count(), 3);
        assert_eq!(list.tot_size(), 72);
        assert_eq!(list.remove_buffer_by_index(list.bucket_index(32)), Some(256));

        // The dump is consumed on load.
        let mut again = list_in(&dir);
        assert!(!again.load_from_disk().unwrap());
    }

    #[test]
    fn load_missing_file_is_empty_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = list_in(&dir);

        assert!(!list.load_from_disk().unwrap());
        assert_eq!(list.buffer_count(), 0);
    }

    #[test]
    fn load_rejects_corrupted_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("radix.dfl");
        {
            let mut list = list_in(&dir);
            list.release_buffer(128, 16);
            list.store_to_disk().unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let mut list = list_in(&dir);
        assert!(list.load_from_disk().is_err());
    }

    #[test]
    fn load_rejects_alignment_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        {
            let list = list_in(&dir);
            list.store_to_disk().unwrap();
        }

        let mut list = BufferFreeList::new(dir.path().join("radix.dfl"), 16, 64);
        assert!(list.load_from_disk().is_err());
    }
}
