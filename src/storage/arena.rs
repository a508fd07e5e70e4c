//! # Mapped File Arena
//!
//! `FileArena` is the low-level building block for the index and data files:
//! a memory-mapped file grown in block-sized units and addressed by absolute
//! byte offset. It deliberately exposes only copying accessors:
//!
//! ```text
//! read(offset, buf)        -> bytes copied (short when past EOF)
//! write(offset, data)      -> grows the file as needed, then copies in
//! reserve(offset, size)    -> offset where a buffer of `size` may be placed
//! ```
//!
//! ## Remap Safety
//!
//! A memory-mapped region becomes invalid when the file grows and is
//! remapped. Rather than hand out slices tied to the mapping, every accessor
//! copies through an internal `parking_lot::RwLock`: reads share the lock,
//! while remapping (and writing) takes it exclusively. Nothing borrowed from
//! the mapping ever escapes this module, so a remap can never invalidate a
//! caller-held reference.
//!
//! Reader processes map the file at whatever size it had when they opened
//! it. When a read lands beyond that size the arena remaps to the current
//! file size and retries once; a read past the real end of file reports a
//! short count, which callers treat as a read error.
//!
//! ## Reservation
//!
//! `reserve` implements the placement rule for variable-sized buffers: a
//! buffer never straddles a block boundary. When rounding the offset up to
//! the next block is required, the caller sees the bumped offset and is
//! responsible for recycling the skipped span through its free list.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;

struct MapState {
    mmap: MmapMut,
    size: u64,
}

pub struct FileArena {
    file: File,
    map: RwLock<MapState>,
    block_size: u64,
    writable: bool,
    path: PathBuf,
}

impl FileArena {
    /// Opens an existing arena file, mapping its current contents.
    pub fn open<P: AsRef<Path>>(path: P, block_size: u64, writable: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open arena file '{}'", path.display()))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(size > 0, "arena file '{}' is empty", path.display());
        ensure!(
            size % block_size == 0,
            "arena file '{}' size {} is not a multiple of block size {}",
            path.display(),
            size,
            block_size
        );

        let mmap = Self::map(&file, path)?;

        Ok(Self {
            file,
            map: RwLock::new(MapState { mmap, size }),
            block_size,
            writable,
            path: path.to_path_buf(),
        })
    }

    /// Creates a new arena file of exactly one block, zero-filled.
    pub fn create<P: AsRef<Path>>(path: P, block_size: u64) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create arena file '{}'", path.display()))?;

        file.set_len(block_size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), block_size))?;

        let mmap = Self::map(&file, path)?;

        Ok(Self {
            file,
            map: RwLock::new(MapState {
                mmap,
                size: block_size,
            }),
            block_size,
            writable: true,
            path: path.to_path_buf(),
        })
    }

    fn map(file: &File, path: &Path) -> Result<MmapMut> {
        // SAFETY: MmapMut::map_mut is unsafe because the file could be
        // truncated or modified externally. This is safe here because:
        // 1. Store files are only ever mutated through this crate, which
        //    never truncates them below the mapped size.
        // 2. The mapping is private to FileArena; all access copies through
        //    read()/write(), which bounds-check against the mapped size.
        // 3. Remapping takes the internal rwlock exclusively, so no borrow
        //    of the old mapping can outlive it.
        unsafe {
            MmapMut::map_mut(file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))
        }
    }

    /// Copies up to `buf.len()` bytes at `offset` into `buf`, returning the
    /// number of bytes copied. Remaps once if the read lands beyond the
    /// current mapping (the file may have been grown by the writer process).
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        let Some(end) = offset.checked_add(buf.len() as u64) else {
            return 0;
        };

        {
            let state = self.map.read();
            if end <= state.size {
                let start = offset as usize;
                buf.copy_from_slice(&state.mmap[start..start + buf.len()]);
                return buf.len();
            }
        }

        if self.refresh().is_err() {
            return 0;
        }

        let state = self.map.read();
        if offset >= state.size {
            return 0;
        }
        let avail = ((state.size - offset) as usize).min(buf.len());
        let start = offset as usize;
        buf[..avail].copy_from_slice(&state.mmap[start..start + avail]);
        avail
    }

    /// Writes `data` at `offset`, growing the file first when needed.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(
            self.writable,
            "arena '{}' opened read-only",
            self.path.display()
        );

        let end = offset + data.len() as u64;
        self.ensure_capacity(end)?;

        let mut state = self.map.write();
        let start = offset as usize;
        state.mmap[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Returns the offset at which a buffer of `size` bytes may be placed,
    /// starting from `offset`. The buffer is never allowed to straddle a
    /// block boundary; when that would happen the offset is bumped to the
    /// next block start and the caller recycles the skipped span. The file
    /// is grown so that the returned range is writable.
    pub fn reserve(&self, offset: u64, size: usize) -> Result<u64> {
        ensure!(
            self.writable,
            "arena '{}' opened read-only",
            self.path.display()
        );
        ensure!(
            (size as u64) <= self.block_size,
            "reservation of {} bytes exceeds block size {}",
            size,
            self.block_size
        );

        let mut offset = offset;
        let end = offset + size as u64 - 1;
        if offset / self.block_size != end / self.block_size {
            offset = (offset / self.block_size + 1) * self.block_size;
        }

        self.ensure_capacity(offset + size as u64)?;
        Ok(offset)
    }

    /// Grows the file (in block units) and remaps so that `end` bytes are
    /// addressable. No-op when already large enough.
    fn ensure_capacity(&self, end: u64) -> Result<()> {
        {
            let state = self.map.read();
            if end <= state.size {
                return Ok(());
            }
        }

        let mut state = self.map.write();
        if end <= state.size {
            return Ok(());
        }

        let new_size = end.div_ceil(self.block_size) * self.block_size;

        state
            .mmap
            .flush()
            .wrap_err("failed to flush mapping before grow")?;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend '{}' to {}", self.path.display(), new_size))?;

        state.mmap = Self::map(&self.file, &self.path)?;
        state.size = new_size;
        Ok(())
    }

    /// Remaps to the file's current size. Used by reader handles when the
    /// writer process has grown the file underneath them.
    fn refresh(&self) -> Result<()> {
        let file_size = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?
            .len();

        let mut state = self.map.write();
        if file_size == state.size {
            return Ok(());
        }
        state.mmap = Self::map(&self.file, &self.path)?;
        state.size = file_size;
        Ok(())
    }

    /// Flushes dirty pages to disk.
    pub fn sync(&self) -> Result<()> {
        self.map
            .read()
            .mmap
            .flush()
            .wrap_err("failed to sync arena to disk")
    }

    /// Currently mapped size in bytes.
    pub fn size(&self) -> u64 {
        self.map.read().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
