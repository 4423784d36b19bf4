// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Crash recovery.
//!
//! The region carries a directory of redo-log arenas, one slot per live
//! transaction descriptor. A log whose header carries a non-zero commit
//! timestamp is *sealed*: its transaction reached the durability point and
//! is replayed, in commit order when several logs survived. An unsealed log
//! is a torn commit and is discarded wholesale; the owning transaction never
//! published, so no trace of it may survive.

use std::sync::Mutex;

use log::{info, warn};

use crate::errors::TransactionError;
use crate::pmem::{self, Addr, MemoryError, PmemRegion, Word, CACHE_LINE_WORDS, REGION_HEADER_WORDS};
use crate::wset::{NV_HEADER_WORDS, NV_NOT_RESIDENT, NV_RECORD_WORDS};

const DIR_MAGIC: Word = 0x6c_6f_67_5f_64_69_72_31; // "log_dir1"
const DIR_HEADER_WORDS: usize = 2;

/// The directory is the first allocation of a fresh region and therefore
/// always lives at the first cache-line boundary.
const DIR_OFFSET: usize = CACHE_LINE_WORDS;

#[derive(Clone, Copy, Default)]
struct SlotState {
    claimed: bool,
    /// Arena already carved out for this slot: `(offset, capacity)`.
    arena: Option<(usize, usize)>,
}

/// Region-resident table of redo-log arena offsets, plus the volatile claim
/// state of the current process.
pub(crate) struct LogDirectory {
    base: Addr,
    slots: usize,
    state: Mutex<Vec<SlotState>>,
}

impl LogDirectory {
    /// Formats the directory in a fresh region, or re-attaches to the one an
    /// earlier life of the region left behind.
    pub fn attach(region: &PmemRegion, slots: usize) -> Result<Self, MemoryError> {
        if region.watermark() == REGION_HEADER_WORDS {
            let base = region.alloc_raw(DIR_HEADER_WORDS + slots)?;
            debug_assert_eq!(region.offset_of(base), Some(DIR_OFFSET));
            pmem::stream_store(base, DIR_MAGIC);
            pmem::stream_store(base.add(1), slots as Word);
            for i in 0..slots {
                pmem::stream_store(base.add(DIR_HEADER_WORDS + i), 0);
            }
            pmem::store_fence();
            return Ok(Self::with_base(base, slots));
        }

        let base = region.word(DIR_OFFSET);
        if base.load() != DIR_MAGIC {
            return Err(MemoryError::Corrupted("bad log directory magic".to_string()));
        }
        let stored = base.add(1).load();
        if stored == 0 || stored > region.len_words() as Word {
            return Err(MemoryError::Corrupted(format!(
                "implausible log directory size {}",
                stored
            )));
        }
        if stored as usize != slots {
            warn!(
                "log directory holds {} slots, configuration asked for {}",
                stored, slots
            );
        }
        Ok(Self::with_base(base, stored as usize))
    }

    fn with_base(base: Addr, slots: usize) -> Self {
        Self {
            base,
            slots,
            state: Mutex::new(vec![SlotState::default(); slots]),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn slot_word(&self, slot: usize) -> Addr {
        debug_assert!(slot < self.slots);
        self.base.add(DIR_HEADER_WORDS + slot)
    }

    /// First word after the directory; replayed records must never target
    /// anything below this.
    fn data_floor(&self, region: &PmemRegion) -> usize {
        region
            .offset_of(self.base)
            .map(|o| o + DIR_HEADER_WORDS + self.slots)
            .unwrap_or(REGION_HEADER_WORDS)
    }

    /// Claims a free slot, preferring one whose arena can already hold
    /// `capacity` entries. Returns the slot and the reusable arena, if any.
    pub fn claim(&self, capacity: usize) -> Result<(usize, Option<(usize, usize)>), TransactionError> {
        let mut state = self.state.lock().expect("log directory poisoned");
        let fitting = state
            .iter()
            .position(|s| !s.claimed && matches!(s.arena, Some((_, cap)) if cap >= capacity));
        let slot = fitting
            .or_else(|| state.iter().position(|s| !s.claimed))
            .ok_or_else(|| {
                TransactionError::Inner("all redo-log slots are claimed".to_string())
            })?;
        state[slot].claimed = true;
        Ok((slot, state[slot].arena))
    }

    /// Makes `slot` point at the arena at `offset` durably.
    pub fn install(&self, slot: usize, offset: usize, capacity: usize) {
        {
            let mut state = self.state.lock().expect("log directory poisoned");
            state[slot].arena = Some((offset, capacity));
        }
        pmem::stream_store(self.slot_word(slot), offset as Word);
        pmem::store_fence();
    }

    pub fn release(&self, slot: usize) {
        pmem::stream_store(self.slot_word(slot), 0);
        pmem::store_fence();
        let mut state = self.state.lock().expect("log directory poisoned");
        state[slot].claimed = false;
    }
}

/// What a recovery pass found in a region.
#[derive(Clone, Copy, Default, Debug)]
pub struct RecoveryReport {
    /// Sealed logs whose effects were replayed.
    pub replayed_logs: usize,
    /// Words written back while replaying.
    pub replayed_words: usize,
    /// Torn or implausible logs that were discarded.
    pub discarded_logs: usize,
}

/// Replays every sealed redo log in the region, oldest commit first, and
/// discards the rest. Records are bounds-checked: a corrupted log can lose
/// its own effects but cannot clobber engine metadata or crash recovery.
pub(crate) fn recover(region: &PmemRegion, dir: &LogDirectory) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let floor = dir.data_floor(region);
    let len = region.len_words();

    let mut sealed: Vec<(usize, usize, usize, Word)> = Vec::new();
    for slot in 0..dir.slots() {
        let offset = dir.slot_word(slot).load() as usize;
        if offset == 0 {
            continue;
        }
        if offset < floor || offset + NV_HEADER_WORDS > len {
            report.discarded_logs += 1;
            dir.release(slot);
            continue;
        }
        let header = region.word(offset);
        let nb = header.load() as usize;
        let commit_ts = header.add(1).load();
        if commit_ts == 0 {
            // torn commit: the owner never reached the durability point
            report.discarded_logs += 1;
            dir.release(slot);
            continue;
        }
        if nb > (len - offset - NV_HEADER_WORDS) / NV_RECORD_WORDS {
            report.discarded_logs += 1;
            dir.release(slot);
            continue;
        }
        sealed.push((slot, offset, nb, commit_ts));
    }

    sealed.sort_by_key(|&(_, _, _, ts)| ts);

    for (slot, offset, nb, commit_ts) in sealed {
        let header = region.word(offset);
        for i in 0..nb {
            let rec = header.add(NV_HEADER_WORDS + i * NV_RECORD_WORDS);
            let addr_off = rec.load();
            let value = rec.add(1).load();
            if addr_off == NV_NOT_RESIDENT {
                continue;
            }
            let addr_off = addr_off as usize;
            if addr_off < floor || addr_off >= len {
                continue;
            }
            let home = region.word(addr_off);
            home.store(value);
            pmem::flush_block(home);
            report.replayed_words += 1;
        }
        pmem::store_fence();
        // retire the log only after its effects are durable
        pmem::stream_store(header.add(1), 0);
        pmem::store_fence();
        dir.release(slot);
        report.replayed_logs += 1;
        info!("replayed redo log @{} (commit {})", offset, commit_ts);
    }

    report
}
