// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Persistent memory region
//!
//! A [`PmemRegion`] is a word-addressable span of byte-addressable persistent
//! memory, mapped either anonymously (volatile simulation) or from a file.
//! All durable state of the engine lives inside one region: the allocation
//! watermark, the redo-log directory, the redo logs themselves and any user
//! words handed out by the region's allocator.
//!
//! The module also exposes the three durability primitives the engine is
//! built on: non-temporal stores, store fences and cache-line write-back.

use std::{
    fs::{File, OpenOptions},
    path::Path,
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use lazy_static::lazy_static;
use thiserror::Error as DeriveError;

/// Machine word, the unit of transactional access.
pub type Word = usize;

/// The library only supports machine words of 64 bit.
const _: () = assert!(core::mem::size_of::<Word>() == 8);

pub(crate) const WORD_BYTES: usize = core::mem::size_of::<Word>();
pub(crate) const WORD_SHIFT: u32 = 3;

/// Size of one cache block, the granularity of write-back flushes.
pub const CACHE_LINE: usize = 64;
pub(crate) const CACHE_LINE_WORDS: usize = CACHE_LINE / WORD_BYTES;

const REGION_MAGIC: Word = 0x70_77_62_5f_73_74_6d_31; // "pwb_stm1"

/// Words reserved at the start of every region: magic and the allocation
/// watermark. Allocations start at the next cache-line boundary.
pub(crate) const REGION_HEADER_WORDS: usize = 2;

#[cfg(unix)]
lazy_static! {
    static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

#[derive(DeriveError, Debug)]
pub enum MemoryError {
    #[error("Out of memory ({0})")]
    OutOfMemory(String),

    #[error("Mapping failed ({0})")]
    Map(String),

    #[error("Region corrupted ({0})")]
    Corrupted(String),
}

/// The address of one transactional word.
///
/// An `Addr` is a plain machine address; the engine never takes ownership of
/// the memory behind it. Addresses allocated from a [`PmemRegion`] are
/// durable, any other word-aligned address participates in concurrency
/// control only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Addr(*mut Word);

// An `Addr` is a capability to perform atomic word accesses and is shared
// freely between the threads of the engine.
unsafe impl Send for Addr {}
unsafe impl Sync for Addr {}

impl Addr {
    /// Wraps a word-aligned pointer. The pointed-to word must stay valid for
    /// as long as transactions may access it.
    pub fn new(ptr: *mut Word) -> Self {
        debug_assert!(ptr as usize % WORD_BYTES == 0, "unaligned word address");
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut Word {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The address `words` machine words further up.
    pub fn add(self, words: usize) -> Self {
        Self(unsafe { self.0.add(words) })
    }

    /// Base address of the cache block containing this word.
    pub(crate) fn block(self) -> usize {
        self.as_usize() & !(CACHE_LINE - 1)
    }

    fn atomic(&self) -> &AtomicUsize {
        unsafe { &*(self.0 as *const AtomicUsize) }
    }

    /// Unordered atomic load, outside of any transaction.
    pub fn load(self) -> Word {
        self.atomic().load(Ordering::Relaxed)
    }

    pub(crate) fn load_acquire(self) -> Word {
        self.atomic().load(Ordering::Acquire)
    }

    /// Unordered atomic store, outside of any transaction.
    pub fn store(self, value: Word) {
        self.atomic().store(value, Ordering::Relaxed)
    }
}

/// Streams `value` to persistent memory, bypassing the cache.
#[inline]
pub(crate) fn stream_store(dst: Addr, value: Word) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_stream_si64(dst.as_ptr() as *mut i64, value as i64);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        dst.store(value);
    }
}

/// Orders all preceding (streamed) stores before all following ones.
#[inline]
pub(crate) fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Writes the cache block containing `addr` back to memory.
#[inline]
pub(crate) fn flush_block(addr: Addr) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_clflush(addr.block() as *const u8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

enum Backing {
    Anonymous,
    File(File),
}

/// A mapped span of persistent words with a persistent bump allocator.
pub struct PmemRegion {
    base: *mut Word,
    words: usize,
    next: AtomicUsize,
    alloc_gate: Mutex<()>,
    backing: Backing,
}

unsafe impl Send for PmemRegion {}
unsafe impl Sync for PmemRegion {}

impl PmemRegion {
    /// Maps an anonymous region of `words` machine words. The region behaves
    /// like persistent memory for the lifetime of the process; useful for
    /// tests and volatile deployments.
    pub fn anonymous(words: usize) -> Result<Self, MemoryError> {
        let base = Self::map(words, None)?;
        let region = Self::from_raw(base, words, Backing::Anonymous);
        region.format();
        Ok(region)
    }

    /// Maps `words` machine words from a file, creating and formatting it if
    /// it does not exist yet. Re-opening an existing region preserves every
    /// allocation made before.
    pub fn open<P: AsRef<Path>>(path: P, words: usize) -> Result<Self, MemoryError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .map_err(|e| MemoryError::Map(e.to_string()))?;
        let fresh = file
            .metadata()
            .map_err(|e| MemoryError::Map(e.to_string()))?
            .len()
            == 0;
        file.set_len((words * WORD_BYTES) as u64)
            .map_err(|e| MemoryError::Map(e.to_string()))?;

        let base = Self::map(words, Some(&file))?;
        let region = Self::from_raw(base, words, Backing::File(file));

        if fresh {
            region.format();
        } else {
            let magic = region.word(0).load();
            if magic != REGION_MAGIC {
                return Err(MemoryError::Corrupted(format!(
                    "bad region magic {:#x}",
                    magic
                )));
            }
            let watermark = region.word(1).load();
            if watermark < REGION_HEADER_WORDS || watermark > words {
                return Err(MemoryError::Corrupted(format!(
                    "bad allocation watermark {}",
                    watermark
                )));
            }
            region.next.store(watermark, Ordering::Relaxed);
        }
        Ok(region)
    }

    fn from_raw(base: *mut Word, words: usize, backing: Backing) -> Self {
        Self {
            base,
            words,
            next: AtomicUsize::new(REGION_HEADER_WORDS),
            alloc_gate: Mutex::new(()),
            backing,
        }
    }

    fn map(words: usize, file: Option<&File>) -> Result<*mut Word, MemoryError> {
        if words < REGION_HEADER_WORDS {
            return Err(MemoryError::Map("region too small".to_string()));
        }
        let len = words * WORD_BYTES;
        unsafe {
            let (flags, fd) = match file {
                Some(f) => {
                    use std::os::unix::io::AsRawFd;
                    (libc::MAP_SHARED, f.as_raw_fd())
                }
                None => (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1),
            };
            let base = libc::mmap(
                ptr::null_mut::<u8>() as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(MemoryError::Map("mmap".to_string()));
            }
            debug_assert!(base as usize % *PAGE_SIZE == 0);
            Ok(base as *mut Word)
        }
    }

    fn format(&self) {
        stream_store(self.word(0), REGION_MAGIC);
        stream_store(self.word(1), REGION_HEADER_WORDS);
        store_fence();
    }

    pub fn len_words(&self) -> usize {
        self.words
    }

    /// The word at `offset` words from the region base. Offsets are stable
    /// across re-mappings of the same backing file, addresses are not.
    pub fn word(&self, offset: usize) -> Addr {
        debug_assert!(offset < self.words);
        Addr::new(unsafe { self.base.add(offset) })
    }

    pub fn contains(&self, addr: Addr) -> bool {
        let a = addr.as_usize();
        let base = self.base as usize;
        a >= base && a < base + self.words * WORD_BYTES
    }

    /// Word offset of `addr` inside the region, if resident.
    pub fn offset_of(&self, addr: Addr) -> Option<usize> {
        if self.contains(addr) {
            Some((addr.as_usize() - self.base as usize) >> WORD_SHIFT)
        } else {
            None
        }
    }

    /// Carves `words` machine words out of the region, aligned to a cache
    /// line. The watermark is made durable before the span is handed out, so
    /// a crash can leak the span but never hand it out twice.
    pub(crate) fn alloc_raw(&self, words: usize) -> Result<Addr, MemoryError> {
        let _gate = self.alloc_gate.lock().expect("allocation gate poisoned");
        let cur = self.next.load(Ordering::Relaxed);
        let start = (cur + CACHE_LINE_WORDS - 1) & !(CACHE_LINE_WORDS - 1);
        let end = start
            .checked_add(words)
            .ok_or_else(|| MemoryError::OutOfMemory("allocation overflow".to_string()))?;
        if end > self.words {
            return Err(MemoryError::OutOfMemory(format!(
                "{} words requested, {} free",
                words,
                self.words - cur
            )));
        }
        stream_store(self.word(1), end);
        store_fence();
        self.next.store(end, Ordering::Relaxed);
        Ok(self.word(start))
    }

    /// Current allocation watermark in words.
    pub(crate) fn watermark(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    /// Flushes the whole mapping to its backing file, if any.
    pub fn sync(&self) -> Result<(), MemoryError> {
        if let Backing::File(_) = self.backing {
            let r = unsafe {
                libc::msync(
                    self.base as *mut libc::c_void,
                    self.words * WORD_BYTES,
                    libc::MS_SYNC,
                )
            };
            if r != 0 {
                return Err(MemoryError::Map("msync".to_string()));
            }
        }
        Ok(())
    }
}

impl Drop for PmemRegion {
    fn drop(&mut self) {
        let _ = self.sync();
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.words * WORD_BYTES);
        }
    }
}
