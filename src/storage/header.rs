//! # Shared Store Header
//!
//! The first [`INDEX_HEADER_SIZE`] bytes of the index file form the header
//! region shared by the writer and all readers. [`HeaderMap`] maps it once
//! and never remaps, so references into it stay valid for the life of the
//! handle. The region splits into:
//!
//! - [`HeaderPrelude`]: magic bytes and the version triple, written at
//!   creation and immutable afterwards. Parsed with zerocopy.
//! - [`SharedState`]: every process-visible mutable field, each an atomic.
//!   The writer owns all of them except `num_reader`, which readers bump.
//!
//! ## Why atomics everywhere
//!
//! The original layout in this family of stores keeps plain integers in the
//! header and lets readers race on them. In Rust a racy non-atomic read of
//! shared memory is undefined behavior, so every mutable field is an atomic
//! accessed through typed getters/setters. Single-writer fields use relaxed
//! ordering; the lock-free triple and the exception status carry
//! acquire/release edges because they order other memory.
//!
//! ## Exception record
//!
//! The write-ahead mutation record (`excep_*` fields) describes the one
//! structural store the writer is about to perform. The writer fully
//! populates buffer and offsets before publishing the status with a release
//! store, and clears the status only after the structural store is done.
//! A writer that reopens the store replays whatever record it finds.
//!
//! ## Process-shared rwlock
//!
//! [`ShmRwLock`] embeds a `pthread_rwlock_t` initialized with
//! `PTHREAD_PROCESS_SHARED` so cooperating writer tooling in other processes
//! can serialize against the writer. Readers never take it.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::lockfree::LockFreeShm;
use super::{EXCEP_BUFF_SIZE, INDEX_HEADER_SIZE};
use crate::error::DictError;

pub const STORE_MAGIC: &[u8; 16] = b"radixkv store\x00\x00\x00";

pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const VERSION_PATCH: u16 = 0;

/// Immutable identification block at offset 0 of the index file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeaderPrelude {
    magic: [u8; 16],
    version_major: U16,
    version_minor: U16,
    version_patch: U16,
    reserved: U16,
}

pub const PRELUDE_SIZE: usize = std::mem::size_of::<HeaderPrelude>();

const _: () = assert!(PRELUDE_SIZE == 24);
const _: () = assert!(PRELUDE_SIZE % 8 == 0);

impl HeaderPrelude {
    pub fn new() -> Self {
        Self {
            magic: *STORE_MAGIC,
            version_major: U16::new(VERSION_MAJOR),
            version_minor: U16::new(VERSION_MINOR),
            version_patch: U16::new(VERSION_PATCH),
            reserved: U16::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= PRELUDE_SIZE,
            "buffer too small for HeaderPrelude: {} < {}",
            bytes.len(),
            PRELUDE_SIZE
        );

        let prelude = Self::ref_from_bytes(&bytes[..PRELUDE_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse HeaderPrelude: {:?}", e))?;

        ensure!(
            &prelude.magic == STORE_MAGIC,
            "invalid magic bytes in store header"
        );
        ensure!(
            prelude.version_major.get() == VERSION_MAJOR,
            "unsupported store version {}.{}.{} (expected major {})",
            prelude.version_major.get(),
            prelude.version_minor.get(),
            prelude.version_patch.get(),
            VERSION_MAJOR
        );

        Ok(prelude)
    }

    pub fn version(&self) -> (u16, u16, u16) {
        (
            self.version_major.get(),
            self.version_minor.get(),
            self.version_patch.get(),
        )
    }
}

impl Default for HeaderPrelude {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-ahead mutation record statuses. The numeric values are part of the
/// on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExcepStatus {
    None = 0,
    AddEdge = 1,
    AddDataOff = 2,
    AddNode = 3,
    RemoveEdge = 4,
    ClearEdge = 5,
}

impl ExcepStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::AddEdge),
            2 => Some(Self::AddDataOff),
            3 => Some(Self::AddNode),
            4 => Some(Self::RemoveEdge),
            5 => Some(Self::ClearEdge),
            _ => None,
        }
    }
}

/// Process-shared rwlock embedded in the header.
#[repr(C)]
pub struct ShmRwLock {
    lock: UnsafeCell<libc::pthread_rwlock_t>,
}

// SAFETY: pthread rwlocks initialized with PTHREAD_PROCESS_SHARED are
// explicitly designed for concurrent use from multiple threads and
// processes; all access goes through the pthread API.
unsafe impl Send for ShmRwLock {}
unsafe impl Sync for ShmRwLock {}

impl ShmRwLock {
    /// Initializes the rwlock for cross-process use. Called once by the
    /// writer that creates the store.
    pub fn init(&self) -> Result<(), DictError> {
        // SAFETY: attr is a local pthread_rwlockattr_t used only for this
        // init sequence; the lock storage lives in the mapped header and
        // outlives every process that maps it.
        unsafe {
            let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
            if libc::pthread_rwlockattr_init(&mut attr) != 0 {
                return Err(DictError::MutexError);
            }
            if libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
                libc::pthread_rwlockattr_destroy(&mut attr);
                return Err(DictError::MutexError);
            }
            let rval = libc::pthread_rwlock_init(self.lock.get(), &attr);
            libc::pthread_rwlockattr_destroy(&mut attr);
            if rval != 0 {
                return Err(DictError::MutexError);
            }
        }
        Ok(())
    }

    /// Acquires the lock in write mode; released when the guard drops.
    pub fn write_lock(&self) -> Result<ShmWriteGuard<'_>, DictError> {
        // SAFETY: the lock was initialized by ShmRwLock::init at store
        // creation and its storage is pinned in the header mapping.
        let rval = unsafe { libc::pthread_rwlock_wrlock(self.lock.get()) };
        if rval != 0 {
            return Err(DictError::MutexError);
        }
        Ok(ShmWriteGuard { lock: self })
    }
}

/// RAII guard for [`ShmRwLock::write_lock`].
pub struct ShmWriteGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmWriteGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard proves the calling thread holds the lock.
        unsafe {
            libc::pthread_rwlock_unlock(self.lock.lock.get());
        }
    }
}

/// Mutable process-shared state, at offset [`PRELUDE_SIZE`] in the header
/// region. Field order is part of the on-disk format.
#[repr(C)]
pub struct SharedState {
    count: AtomicI64,
    m_data_offset: AtomicU64,
    m_index_offset: AtomicU64,
    pending_data_buff_size: AtomicI64,
    pending_index_buff_size: AtomicI64,
    shm_data_sliding_start: AtomicU64,
    shm_index_sliding_start: AtomicU64,
    data_size: AtomicU32,
    num_reader: AtomicI32,
    num_writer: AtomicI32,
    excep_updating_status: AtomicU32,
    pub lock_free: LockFreeShm,
    excep_offset: AtomicU64,
    excep_lf_offset: AtomicU64,
    excep_buff: [AtomicU8; EXCEP_BUFF_SIZE],
    rw_lock: ShmRwLock,
}

const _: () = assert!(std::mem::size_of::<SharedState>() + PRELUDE_SIZE <= INDEX_HEADER_SIZE);
const _: () = assert!(std::mem::align_of::<SharedState>() <= 8);

impl SharedState {
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn set_count(&self, count: i64) {
        self.count.store(count, Ordering::Relaxed);
    }

    pub fn add_count(&self, delta: i64) {
        self.count.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn data_offset(&self) -> u64 {
        self.m_data_offset.load(Ordering::Relaxed)
    }

    pub fn set_data_offset(&self, offset: u64) {
        self.m_data_offset.store(offset, Ordering::Relaxed);
    }

    pub fn index_offset(&self) -> u64 {
        self.m_index_offset.load(Ordering::Relaxed)
    }

    pub fn set_index_offset(&self, offset: u64) {
        self.m_index_offset.store(offset, Ordering::Relaxed);
    }

    pub fn pending_data_buff_size(&self) -> i64 {
        self.pending_data_buff_size.load(Ordering::Relaxed)
    }

    pub fn add_pending_data(&self, delta: i64) {
        self.pending_data_buff_size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_pending_data(&self, v: i64) {
        self.pending_data_buff_size.store(v, Ordering::Relaxed);
    }

    pub fn pending_index_buff_size(&self) -> i64 {
        self.pending_index_buff_size.load(Ordering::Relaxed)
    }

    pub fn add_pending_index(&self, delta: i64) {
        self.pending_index_buff_size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_pending_index(&self, v: i64) {
        self.pending_index_buff_size.store(v, Ordering::Relaxed);
    }

    pub fn data_size(&self) -> u32 {
        self.data_size.load(Ordering::Relaxed)
    }

    pub fn set_data_size(&self, v: u32) {
        self.data_size.store(v, Ordering::Relaxed);
    }

    pub fn num_reader(&self) -> i32 {
        self.num_reader.load(Ordering::Relaxed)
    }

    /// Adjusts the reader count, clamped at zero.
    pub fn update_num_reader(&self, delta: i32) -> i32 {
        let mut n = self.num_reader.fetch_add(delta, Ordering::Relaxed) + delta;
        if n < 0 {
            self.num_reader.store(0, Ordering::Relaxed);
            n = 0;
        }
        n
    }

    pub fn num_writer(&self) -> i32 {
        self.num_writer.load(Ordering::Relaxed)
    }

    pub fn set_num_writer(&self, n: i32) {
        self.num_writer.store(n, Ordering::Relaxed);
    }

    pub fn sliding_start(&self) -> (u64, u64) {
        (
            self.shm_data_sliding_start.load(Ordering::Relaxed),
            self.shm_index_sliding_start.load(Ordering::Relaxed),
        )
    }

    pub fn reset_sliding_start(&self) {
        self.shm_data_sliding_start.store(0, Ordering::Relaxed);
        self.shm_index_sliding_start.store(0, Ordering::Relaxed);
    }

    pub fn rw_lock(&self) -> &ShmRwLock {
        &self.rw_lock
    }

    /// Stages the write-ahead mutation record: buffer and offsets first,
    /// status last with a release store.
    pub fn stage_exception(&self, status: ExcepStatus, buff: &[u8], offset: u64, lf_offset: u64) {
        debug_assert!(buff.len() <= EXCEP_BUFF_SIZE);

        for (slot, &b) in self.excep_buff.iter().zip(buff.iter()) {
            slot.store(b, Ordering::Relaxed);
        }
        for slot in self.excep_buff.iter().skip(buff.len()) {
            slot.store(0, Ordering::Relaxed);
        }
        self.excep_offset.store(offset, Ordering::Relaxed);
        self.excep_lf_offset.store(lf_offset, Ordering::Relaxed);
        self.excep_updating_status
            .store(status as u32, Ordering::Release);
    }

    /// Clears the record after the structural store completed, applying the
    /// mutation's entry-count delta exactly once.
    pub fn clear_exception(&self, count_delta: i64) {
        if count_delta != 0 {
            self.add_count(count_delta);
        }
        self.excep_updating_status
            .store(ExcepStatus::None as u32, Ordering::Release);
    }

    pub fn exception_status(&self) -> ExcepStatus {
        let raw = self.excep_updating_status.load(Ordering::Acquire);
        ExcepStatus::from_u32(raw).unwrap_or(ExcepStatus::None)
    }

    pub fn exception_record(&self) -> ([u8; EXCEP_BUFF_SIZE], u64, u64) {
        let mut buff = [0u8; EXCEP_BUFF_SIZE];
        for (b, slot) in buff.iter_mut().zip(self.excep_buff.iter()) {
            *b = slot.load(Ordering::Relaxed);
        }
        (
            buff,
            self.excep_offset.load(Ordering::Relaxed),
            self.excep_lf_offset.load(Ordering::Relaxed),
        )
    }
}

/// Fixed mapping of the header region. Never remapped, so `&SharedState`
/// stays valid for the life of the handle.
pub struct HeaderMap {
    _file: File,
    mmap: MmapMut,
}

// SAFETY: the mapping is pinned for the lifetime of HeaderMap and all
// mutable state behind it is atomic (SharedState) or pthread-managed
// (ShmRwLock).
unsafe impl Send for HeaderMap {}
unsafe impl Sync for HeaderMap {}

impl HeaderMap {
    /// Maps the header region of `path`. With `init`, writes a fresh
    /// prelude (the underlying file must be newly created and zero-filled);
    /// otherwise validates the existing one.
    pub fn open<P: AsRef<Path>>(path: P, init: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open header file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            len >= INDEX_HEADER_SIZE as u64,
            "'{}' too small to hold the store header: {} < {}",
            path.display(),
            len,
            INDEX_HEADER_SIZE
        );

        // SAFETY: the mapping covers a fixed prefix of the file that is
        // never truncated; HeaderMap never remaps, so references handed out
        // by prelude()/state() remain valid until the handle drops.
        let mut mmap = unsafe {
            MmapOptions::new()
                .len(INDEX_HEADER_SIZE)
                .map_mut(&file)
                .wrap_err_with(|| format!("failed to map header of '{}'", path.display()))?
        };

        if init {
            mmap[..PRELUDE_SIZE].copy_from_slice(HeaderPrelude::new().as_bytes());
        } else {
            HeaderPrelude::from_bytes(&mmap[..PRELUDE_SIZE])?;
        }

        Ok(Self { _file: file, mmap })
    }

    pub fn prelude(&self) -> &HeaderPrelude {
        HeaderPrelude::ref_from_bytes(&self.mmap[..PRELUDE_SIZE])
            .expect("header prelude validated at open")
    }

    pub fn state(&self) -> &SharedState {
        // SAFETY: the region at PRELUDE_SIZE is within the fixed mapping,
        // 8-aligned (mappings are page-aligned and PRELUDE_SIZE is a
        // multiple of 8), large enough per the const size assert, and all
        // interior mutability goes through atomics or the pthread lock.
        unsafe { &*(self.mmap.as_ptr().add(PRELUDE_SIZE) as *const SharedState) }
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync header to disk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_in(dir: &tempfile::TempDir) -> HeaderMap {
        let path = dir.path().join("radix.idx");
        let file = File::create(&path).unwrap();
        file.set_len(INDEX_HEADER_SIZE as u64).unwrap();
        HeaderMap::open(&path, true).unwrap()
    }

    #[test]
    fn prelude_roundtrip() {
        let prelude = HeaderPrelude::new();
        let parsed = HeaderPrelude::from_bytes(prelude.as_bytes()).unwrap();

        assert_eq!(parsed.version(), (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH));
    }

    #[test]
    fn prelude_rejects_bad_magic() {
        let mut bytes = [0u8; PRELUDE_SIZE];
        bytes[..16].copy_from_slice(b"not a store hdr!");

        assert!(HeaderPrelude::from_bytes(&bytes).is_err());
    }

    #[test]
    fn open_validates_existing_prelude() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("radix.idx");
        {
            let file = File::create(&path).unwrap();
            file.set_len(INDEX_HEADER_SIZE as u64).unwrap();
            HeaderMap::open(&path, true).unwrap();
        }

        assert!(HeaderMap::open(&path, false).is_ok());
    }

    #[test]
    fn open_rejects_unformatted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("radix.idx");
        let file = File::create(&path).unwrap();
        file.set_len(INDEX_HEADER_SIZE as u64).unwrap();

        assert!(HeaderMap::open(&path, false).is_err());
    }

    #[test]
    fn state_fields_start_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let header = header_in(&dir);
        let state = header.state();

        assert_eq!(state.count(), 0);
        assert_eq!(state.data_offset(), 0);
        assert_eq!(state.num_reader(), 0);
        assert_eq!(state.exception_status(), ExcepStatus::None);
    }

    #[test]
    fn reader_count_clamps_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let header = header_in(&dir);
        let state = header.state();

        state.update_num_reader(1);
        state.update_num_reader(-1);
        state.update_num_reader(-1);

        assert_eq!(state.num_reader(), 0);
    }

    #[test]
    fn exception_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let header = header_in(&dir);
        let state = header.state();

        state.stage_exception(ExcepStatus::AddEdge, &[1, 2, 3], 77, 88);

        assert_eq!(state.exception_status(), ExcepStatus::AddEdge);
        let (buff, offset, lf_offset) = state.exception_record();
        assert_eq!(&buff[..3], &[1, 2, 3]);
        assert_eq!(buff[3], 0);
        assert_eq!(offset, 77);
        assert_eq!(lf_offset, 88);

        state.clear_exception(1);
        assert_eq!(state.exception_status(), ExcepStatus::None);
        assert_eq!(state.count(), 1);
    }

    #[test]
    fn shm_rwlock_init_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let header = header_in(&dir);
        let state = header.state();

        state.rw_lock().init().unwrap();
        let guard = state.rw_lock().write_lock().unwrap();
        drop(guard);
        let _again = state.rw_lock().write_lock().unwrap();
    }
}
