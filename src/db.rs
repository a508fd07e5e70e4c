//! # Store Facade
//!
//! `Db` is the public entry point: it assembles the mapped arenas, the
//! shared header and the free lists into a [`Dict`], enforces the
//! single-writer rule, and wraps the raw dictionary status codes into a
//! retry-aware API.
//!
//! ## Directory layout
//!
//! ```text
//! store_dir/
//! ├── radix.idx     # shared header + index arena (nodes, edges, tails)
//! ├── radix.dat     # data arena (length-prefixed payloads)
//! ├── radix.dfl     # data free-list dump (clean shutdown only)
//! ├── radix.ifl     # index free-list dump (clean shutdown only)
//! └── writer.lock   # flock'd while a writer is live
//! ```
//!
//! ## Single writer, many readers
//!
//! Writer liveness is decided by an advisory `flock` on `writer.lock`: the
//! OS drops the lock when the process dies, so a crashed writer never
//! wedges the store. The header's `num_writer` field mirrors the state for
//! inspection and yields [`DictError::WriterExist`] when a second live
//! writer tries to open. Reader handles only bump `num_reader`.
//!
//! A writer that opens an existing store replays the staged write-ahead
//! mutation record (crash recovery) and reloads the free lists dumped by
//! the last clean shutdown before serving requests. A free-list dump that
//! exists but fails validation refuses the open.
//!
//! ## Concurrency inside a process
//!
//! The dictionary sits behind a `parking_lot::RwLock`: lookups share it,
//! mutations take it exclusively. Across processes, mutations additionally
//! hold the header's process-shared rwlock in write mode so cooperating
//! writer tooling can serialize; readers rely on the lock-free protocol
//! and retry `TryAgain` a bounded number of times.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{DictError, Result};
use crate::options::{ACCESS_MODE_READER, ACCESS_MODE_WRITER, OPTION_ALL_PREFIX};
use crate::storage::{
    BufferFreeList, FileArena, HeaderMap, DATA_BLOCK_SIZE, DATA_BUFFER_ALIGNMENT,
    INDEX_BLOCK_SIZE, INDEX_BUFFER_ALIGNMENT, NUM_DATA_BUFFER_BUCKETS, NUM_INDEX_BUFFER_BUCKETS,
};
use crate::trie::{Dict, MatchData, TreeMem, MAX_DATA_SIZE};

pub const INDEX_FILE_NAME: &str = "radix.idx";
pub const DATA_FILE_NAME: &str = "radix.dat";
pub const DATA_FREELIST_FILE_NAME: &str = "radix.dfl";
pub const INDEX_FREELIST_FILE_NAME: &str = "radix.ifl";
pub const WRITER_LOCK_FILE_NAME: &str = "writer.lock";

/// Lookups retry this many times before surfacing `TryAgain`.
pub const READER_RETRY_MAX: usize = 5;

/// Open-time configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    access_mode: u32,
    data_size: u32,
}

impl DbConfig {
    pub fn new() -> Self {
        Self {
            access_mode: ACCESS_MODE_READER,
            data_size: MAX_DATA_SIZE as u32,
        }
    }

    /// Opens as the sole writer, creating the store when absent.
    pub fn writer(mut self) -> Self {
        self.access_mode |= ACCESS_MODE_WRITER;
        self
    }

    pub fn access_mode(mut self, mode: u32) -> Self {
        self.access_mode = mode;
        self
    }

    /// Largest value accepted by this store; fixed at creation.
    pub fn data_size(mut self, data_size: u32) -> Self {
        self.data_size = data_size;
        self
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub num_writer: i32,
    pub num_reader: i32,
    pub count: i64,
    pub data_arena_size: u64,
    pub index_arena_size: u64,
    pub pending_data_buff_size: i64,
    pub pending_index_buff_size: i64,
    pub trackable_data_buff_size: u64,
    pub residual_data_buff_size: u64,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "store stats:")?;
        writeln!(f, "\tnumber of writers: {}", self.num_writer)?;
        writeln!(f, "\tnumber of readers: {}", self.num_reader)?;
        writeln!(f, "\tentry count: {}", self.count)?;
        writeln!(f, "\tdata arena size: {}", self.data_arena_size)?;
        writeln!(f, "\tindex arena size: {}", self.index_arena_size)?;
        writeln!(f, "\tpending buffer size: {}", self.pending_data_buff_size)?;
        writeln!(
            f,
            "\ttrackable buffer size: {}",
            self.trackable_data_buff_size
        )?;
        writeln!(
            f,
            "\tresidual buffer size: {}",
            self.residual_data_buff_size
        )
    }
}

pub struct Db {
    dict: RwLock<Dict>,
    header: Arc<HeaderMap>,
    options: u32,
    dir: PathBuf,
    _writer_lock: Option<File>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("options", &self.options)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or, in writer mode, creates) the store at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, config: DbConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let is_writer = config.access_mode & ACCESS_MODE_WRITER != 0;

        if is_writer {
            Self::open_writer(dir, config)
        } else {
            Self::open_reader(dir, config)
        }
    }

    fn open_writer(dir: PathBuf, config: DbConfig) -> Result<Self> {
        if config.data_size == 0 || config.data_size as usize > MAX_DATA_SIZE {
            return Err(DictError::InvalidSize);
        }

        fs::create_dir_all(&dir).map_err(|e| DictError::MmapFailed(e.to_string()))?;
        let writer_lock = acquire_writer_lock(&dir)?;

        let idx_path = dir.join(INDEX_FILE_NAME);
        let dat_path = dir.join(DATA_FILE_NAME);
        let fresh = !idx_path.exists();

        let (index_arena, data_arena, header) = if fresh {
            let index_arena = FileArena::create(&idx_path, INDEX_BLOCK_SIZE)
                .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?;
            let data_arena = FileArena::create(&dat_path, DATA_BLOCK_SIZE)
                .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?;
            let header = HeaderMap::open(&idx_path, true)
                .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?;
            (index_arena, data_arena, header)
        } else {
            let index_arena = FileArena::open(&idx_path, INDEX_BLOCK_SIZE, true)
                .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?;
            let data_arena = FileArena::open(&dat_path, DATA_BLOCK_SIZE, true)
                .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?;
            let header = HeaderMap::open(&idx_path, false)
                .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?;
            (index_arena, data_arena, header)
        };

        let header = Arc::new(header);
        let mut dict = Dict::new(
            Arc::clone(&header),
            TreeMem::new(
                index_arena,
                BufferFreeList::new(
                    dir.join(INDEX_FREELIST_FILE_NAME),
                    INDEX_BUFFER_ALIGNMENT,
                    NUM_INDEX_BUFFER_BUCKETS,
                ),
            ),
            data_arena,
            BufferFreeList::new(
                dir.join(DATA_FREELIST_FILE_NAME),
                DATA_BUFFER_ALIGNMENT,
                NUM_DATA_BUFFER_BUCKETS,
            ),
            config.access_mode,
        );

        if fresh {
            dict.init(config.data_size)?;
            info!("created store at '{}'", dir.display());
        }

        {
            let state = dict.state();
            if state.num_writer() > 0 {
                // The flock is the liveness authority; a stale counter means
                // the previous writer died without cleanup.
                warn!("stale writer counter found; previous writer did not shut down cleanly");
            }
            state.set_num_writer(1);
            state.reset_sliding_start();
            state.lock_free.writer_reset();
            if !fresh {
                // A writer that died holding the process-shared lock must
                // not wedge the store; the flock guarantees no other writer
                // is live, so re-initialization is safe here.
                state.rw_lock().init()?;
            }
        }

        dict.exception_recovery()?;
        dict.load_free_lists()?;

        if !dict.is_valid() {
            return Err(DictError::NotInitialized);
        }
        info!("opened store at '{}' as writer", dir.display());

        Ok(Self {
            dict: RwLock::new(dict),
            header,
            options: config.access_mode,
            dir,
            _writer_lock: Some(writer_lock),
        })
    }

    fn open_reader(dir: PathBuf, config: DbConfig) -> Result<Self> {
        let idx_path = dir.join(INDEX_FILE_NAME);
        let dat_path = dir.join(DATA_FILE_NAME);
        if !idx_path.exists() || !dat_path.exists() {
            return Err(DictError::NotInitialized);
        }

        let index_arena = FileArena::open(&idx_path, INDEX_BLOCK_SIZE, false)
            .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?;
        let data_arena = FileArena::open(&dat_path, DATA_BLOCK_SIZE, false)
            .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?;
        let header = Arc::new(
            HeaderMap::open(&idx_path, false)
                .map_err(|e| DictError::MmapFailed(format!("{e:#}")))?,
        );

        let dict = Dict::new(
            Arc::clone(&header),
            TreeMem::new(
                index_arena,
                BufferFreeList::new(
                    dir.join(INDEX_FREELIST_FILE_NAME),
                    INDEX_BUFFER_ALIGNMENT,
                    NUM_INDEX_BUFFER_BUCKETS,
                ),
            ),
            data_arena,
            BufferFreeList::new(
                dir.join(DATA_FREELIST_FILE_NAME),
                DATA_BUFFER_ALIGNMENT,
                NUM_DATA_BUFFER_BUCKETS,
            ),
            config.access_mode,
        );

        if !dict.is_valid() {
            return Err(DictError::NotInitialized);
        }

        dict.state().update_num_reader(1);
        Ok(Self {
            dict: RwLock::new(dict),
            header,
            options: config.access_mode,
            dir,
            _writer_lock: None,
        })
    }

    pub fn is_writer(&self) -> bool {
        self.options & ACCESS_MODE_WRITER != 0
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Adds a key-value pair; `overwrite` selects replace-vs-`InDict` for
    /// existing entries.
    pub fn add(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        if !self.is_writer() {
            return Err(DictError::NotAllowed);
        }
        let _shm = self.header.state().rw_lock().write_lock()?;
        self.dict.write().add(key, value, overwrite)
    }

    /// Looks up a key, retrying bounded writer interference internally.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let dict = self.dict.read();
        let mut data = MatchData::new();

        for _ in 0..READER_RETRY_MAX {
            match dict.find(key, &mut data) {
                Ok(()) => return Ok(Some(data.buff[..data.data_len].to_vec())),
                Err(DictError::NotExist) => return Ok(None),
                Err(DictError::TryAgain) => {
                    data.clear();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DictError::TryAgain)
    }

    /// Longest entry whose key is a prefix of `key`, as
    /// `(matched_len, value)`.
    pub fn find_prefix(&self, key: &[u8]) -> Result<Option<(usize, Vec<u8>)>> {
        let dict = self.dict.read();
        let mut data = MatchData::new();

        for _ in 0..READER_RETRY_MAX {
            match dict.find_prefix(key, &mut data) {
                Ok(()) => {
                    return Ok(Some((data.match_len, data.buff[..data.data_len].to_vec())))
                }
                Err(DictError::NotExist) => return Ok(None),
                Err(DictError::TryAgain) => {
                    data.clear();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DictError::TryAgain)
    }

    /// Every entry whose key is a prefix of `key`, shortest first.
    pub fn prefix_matches(&self, key: &[u8]) -> Result<Vec<(usize, Vec<u8>)>> {
        let dict = self.dict.read();

        'retry: for _ in 0..READER_RETRY_MAX {
            let mut matches = Vec::new();
            let mut data = MatchData::with_options(OPTION_ALL_PREFIX);
            loop {
                match dict.find_prefix(key, &mut data) {
                    Ok(()) => {
                        matches.push((data.match_len, data.buff[..data.data_len].to_vec()));
                        if !data.next {
                            return Ok(matches);
                        }
                    }
                    Err(DictError::NotExist) => return Ok(matches),
                    Err(DictError::TryAgain) => continue 'retry,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(DictError::TryAgain)
    }

    /// Removes a key.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        if !self.is_writer() {
            return Err(DictError::NotAllowed);
        }
        let _shm = self.header.state().rw_lock().write_lock()?;
        self.dict.write().remove(key)
    }

    /// Clears every entry and resets both arenas.
    pub fn remove_all(&self) -> Result<()> {
        if !self.is_writer() {
            return Err(DictError::NotAllowed);
        }
        let _shm = self.header.state().rw_lock().write_lock()?;
        self.dict.write().remove_all()
    }

    pub fn count(&self) -> i64 {
        self.dict.read().count()
    }

    /// Re-initializes the process-shared rwlock. Writer-only; use after a
    /// cooperating process died while holding it.
    pub fn init_shm_mutex(&self) -> Result<()> {
        if !self.is_writer() {
            return Err(DictError::NotAllowed);
        }
        self.header.state().rw_lock().init()
    }

    pub fn stats(&self) -> DbStats {
        let dict = self.dict.read();
        let state = dict.state();

        let data_arena_size = state.data_offset();
        let pending = state.pending_data_buff_size();
        let used_span = data_arena_size.saturating_sub(crate::storage::DATA_HEADER_SIZE);
        let residual = used_span.saturating_sub(pending.max(0) as u64);

        DbStats {
            num_writer: state.num_writer(),
            num_reader: state.num_reader(),
            count: state.count(),
            data_arena_size,
            index_arena_size: state.index_offset(),
            pending_data_buff_size: pending,
            pending_index_buff_size: state.pending_index_buff_size(),
            trackable_data_buff_size: dict.data_free_list_size(),
            residual_data_buff_size: residual,
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let mut dict = self.dict.write();
        if self.is_writer() {
            dict.shutdown();
            info!("closed writer on '{}'", self.dir.display());
        } else {
            dict.state().update_num_reader(-1);
        }
    }
}

fn acquire_writer_lock(dir: &Path) -> Result<File> {
    let path = dir.join(WRITER_LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| DictError::MmapFailed(e.to_string()))?;

    // SAFETY: flock on an owned, open descriptor; the lock is released by
    // the OS when the descriptor closes (including process death).
    let rval = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rval != 0 {
        return Err(DictError::WriterExist);
    }
    Ok(file)
}
