// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The write set, which doubles as the transaction's redo log.
//!
//! Entries live in an array whose capacity is fixed for one incarnation of
//! the transaction, so entry addresses are stable and can be stolen into
//! owned-form lock words; ownership tests are pure pointer arithmetic over
//! the array span. Entries are chained two ways, both as indices:
//!
//! * per lock bucket (`next`), rooted at the entry the lock word points to,
//!   so a barrier can find an earlier write to the same or an aliasing
//!   address;
//! * per cache block (`next_line`), across buckets, so the commit path can
//!   stream and flush each dirty line exactly once.
//!
//! Every entry has a persistent twin in an [`NvLog`] arena; the twins plus
//! the arena header are the crash-recovery contract.

use std::collections::HashMap;

use crate::locks::LockSlot;
use crate::pmem::{self, Addr, PmemRegion, Word};

pub(crate) const NO_ENTRY: usize = usize::MAX;

/// Words in a persistent log arena header: entry count and commit marker.
pub(crate) const NV_HEADER_WORDS: usize = 2;
/// Words per persistent record: home offset, value, cache-line neighbor.
pub(crate) const NV_RECORD_WORDS: usize = 3;
/// Neighbor link terminator inside a persistent record.
pub(crate) const NV_NO_NEIGHBOR: Word = Word::MAX;
/// Home-offset sentinel for words living outside the persistent region.
pub(crate) const NV_NOT_RESIDENT: Word = Word::MAX;

pub(crate) fn masked(seed: Word, value: Word, mask: Word) -> Word {
    (seed & !mask) | (value & mask)
}

#[derive(Debug)]
pub(crate) struct WEntry {
    pub addr: Addr,
    /// Pending new value with the unmodified bits of the pre-image masked in.
    pub value: Word,
    /// Bits of `value` actually being written; zero for an entry that only
    /// acquired its address without a payload yet.
    pub mask: Word,
    /// Lock timestamp the address was acquired with.
    pub version: Word,
    pub lock: LockSlot,
    /// Bucket chain successor, [`NO_ENTRY`]-terminated.
    pub next: usize,
    /// Cache-line neighbor chain successor, [`NO_ENTRY`]-terminated.
    pub next_line: usize,
    /// First entry of its cache block in this write set.
    pub line_head: bool,
    /// This entry performed the lock acquisition and is the release point.
    pub lock_owner: bool,
    /// Index of the persistent twin record.
    pub nv: usize,
}

/// Handle to a persistent redo-log arena inside the region:
/// `[nb_entries, commit_ts, (addr_off, value, next_cache_neighbor)*]`,
/// written exclusively through non-temporal stores.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NvLog {
    base: Addr,
    cap: usize,
}

impl NvLog {
    pub fn new(base: Addr, cap: usize) -> Self {
        Self { base, cap }
    }

    pub fn words_for(cap: usize) -> usize {
        NV_HEADER_WORDS + cap * NV_RECORD_WORDS
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    fn record(&self, i: usize) -> Addr {
        debug_assert!(i < self.cap);
        self.base.add(NV_HEADER_WORDS + i * NV_RECORD_WORDS)
    }

    /// Clears the header so a torn previous life cannot be mistaken for a
    /// sealed log.
    pub fn initialise(&self) {
        pmem::stream_store(self.base, 0);
        pmem::stream_store(self.base.add(1), 0);
        pmem::store_fence();
    }

    pub fn stream_record(&self, i: usize, addr_off: Word, value: Word, neighbor: Word) {
        let rec = self.record(i);
        pmem::stream_store(rec, addr_off);
        pmem::stream_store(rec.add(1), value);
        pmem::stream_store(rec.add(2), neighbor);
    }

    pub fn stream_payload(&self, i: usize, addr_off: Word, value: Word) {
        let rec = self.record(i);
        pmem::stream_store(rec, addr_off);
        pmem::stream_store(rec.add(1), value);
    }

    pub fn stream_neighbor(&self, i: usize, neighbor: Word) {
        pmem::stream_store(self.record(i).add(2), neighbor);
    }

    pub fn stream_nb_entries(&self, nb: Word) {
        pmem::stream_store(self.base, nb);
    }

    /// Stamps the durable commit marker. The caller fences on both sides;
    /// once the marker is durable the transaction survives any crash.
    pub fn seal(&self, commit_ts: Word) {
        pmem::stream_store(self.base.add(1), commit_ts);
    }

    pub fn retire(&self) {
        pmem::stream_store(self.base.add(1), 0);
        pmem::store_fence();
    }
}

pub(crate) struct WriteSet {
    entries: Vec<WEntry>,
    /// Capacity target; doubled when an incarnation runs out of slots.
    size: usize,
    pub reallocate: bool,
    /// Cache block -> index of the last entry written to that block.
    lines: HashMap<usize, usize>,
    nv: NvLog,
}

impl WriteSet {
    pub fn new(size: usize, nv: NvLog) -> Self {
        debug_assert!(nv.capacity() >= size);
        Self {
            entries: Vec::with_capacity(size),
            size,
            reallocate: false,
            lines: HashMap::new(),
            nv,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nv(&self) -> &NvLog {
        &self.nv
    }

    /// Doubles the capacity target. Entry addresses of the current array are
    /// published in lock words, so the transaction must restart before the
    /// larger array can be installed with [`WriteSet::reincarnate`].
    pub fn grow(&mut self) {
        self.size *= 2;
        self.reallocate = true;
    }

    pub fn reincarnate(&mut self, nv: NvLog) {
        debug_assert!(nv.capacity() >= self.size);
        self.entries = Vec::with_capacity(self.size);
        self.lines.clear();
        self.nv = nv;
        self.reallocate = false;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lines.clear();
    }

    fn base_ptr(&self) -> usize {
        self.entries.as_ptr() as usize
    }

    /// Address of the entry slot at `idx`; valid for the slot about to be
    /// filled as well. Pure arithmetic, never dereferenced here.
    pub fn slot_ptr(&self, idx: usize) -> usize {
        self.base_ptr() + idx * core::mem::size_of::<WEntry>()
    }

    /// Does this owned-form lock payload point into our live entries? The
    /// non-faulting membership test: foreign pointers are never dereferenced.
    pub fn owns_ptr(&self, entry_ptr: usize) -> bool {
        let base = self.base_ptr();
        entry_ptr >= base && entry_ptr < base + self.entries.len() * core::mem::size_of::<WEntry>()
    }

    pub fn index_of(&self, entry_ptr: usize) -> usize {
        debug_assert!(self.owns_ptr(entry_ptr));
        (entry_ptr - self.base_ptr()) / core::mem::size_of::<WEntry>()
    }

    pub fn entry(&self, idx: usize) -> &WEntry {
        &self.entries[idx]
    }

    /// Walks the bucket chain rooted at `head` looking for `addr`. Returns
    /// the matching index, or the chain tail to append after.
    pub fn find(&self, head: usize, addr: Addr) -> (Option<usize>, usize) {
        let mut idx = head;
        loop {
            let e = &self.entries[idx];
            if e.addr == addr {
                return (Some(idx), idx);
            }
            if e.next == NO_ENTRY {
                return (None, idx);
            }
            idx = e.next;
        }
    }

    /// Folds another masked write into an existing entry. An entry that so
    /// far only acquired its address (empty mask) takes its pre-image from
    /// the memory value at this first payload write, not from acquisition
    /// time.
    pub fn merge(&mut self, idx: usize, value: Word, mask: Word) {
        let e = &mut self.entries[idx];
        if e.mask == 0 {
            e.value = masked(e.addr.load(), value, mask);
        } else {
            e.value = masked(e.value, value, mask);
        }
        e.mask |= mask;
    }

    /// Appends a fresh entry: seeds the redo image from memory, threads the
    /// bucket chain after `tail`, threads the cache-line chain after the last
    /// entry of the same block, and streams the persistent twin.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        addr: Addr,
        value: Word,
        mask: Word,
        version: Word,
        lock: LockSlot,
        tail: Option<usize>,
        lock_owner: bool,
        region: &PmemRegion,
    ) -> usize {
        debug_assert!(!self.is_full());
        let idx = self.entries.len();
        let seed = if mask == Word::MAX {
            value
        } else {
            masked(addr.load(), value, mask)
        };

        let (neighbor, line_head) = match self.lines.insert(addr.block(), idx) {
            Some(prev) => (Some(prev), false),
            None => (None, true),
        };

        self.entries.push(WEntry {
            addr,
            value: seed,
            mask,
            version,
            lock,
            next: NO_ENTRY,
            next_line: NO_ENTRY,
            line_head,
            lock_owner,
            nv: idx,
        });

        if let Some(t) = tail {
            let sequel = self.entries[t].next;
            self.entries[idx].next = sequel;
            self.entries[t].next = idx;
        }
        if let Some(n) = neighbor {
            let sequel = self.entries[n].next_line;
            self.entries[idx].next_line = sequel;
            self.entries[n].next_line = idx;
            self.nv.stream_neighbor(self.entries[n].nv, idx as Word);
        }

        let addr_off = region
            .offset_of(addr)
            .map(|o| o as Word)
            .unwrap_or(NV_NOT_RESIDENT);
        self.nv.stream_record(idx, addr_off, seed, NV_NO_NEIGHBOR);
        self.nv.stream_nb_entries(self.entries.len() as Word);

        idx
    }

    pub fn iter(&self) -> impl Iterator<Item = &WEntry> {
        self.entries.iter()
    }

    /// All entries in the cache-line chain starting at `head`, head first.
    pub fn line_chain(&self, head: usize) -> impl Iterator<Item = &WEntry> + '_ {
        let mut next = Some(head);
        core::iter::from_fn(move || {
            let i = next?;
            let e = &self.entries[i];
            next = (e.next_line != NO_ENTRY).then(|| e.next_line);
            Some(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockTable;

    fn fixture(size: usize) -> (PmemRegion, LockTable) {
        let region = PmemRegion::anonymous(1024 + NvLog::words_for(size)).expect("mapping failed");
        (region, LockTable::new(8, 2, false))
    }

    fn fresh_wset(region: &PmemRegion, size: usize) -> WriteSet {
        let base = region
            .alloc_raw(NvLog::words_for(size))
            .expect("arena alloc failed");
        let nv = NvLog::new(base, size);
        nv.initialise();
        WriteSet::new(size, nv)
    }

    #[test]
    fn test_masked_merge_laws() {
        let (region, table) = fixture(8);
        let word = region.alloc_raw(1).expect("alloc failed");
        word.store(0xAABB_CCDD);
        let mut wset = fresh_wset(&region, 8);

        let idx = wset.append(
            word,
            0xFF,
            0x0F,
            0,
            table.slot(word),
            None,
            true,
            &region,
        );
        // first write seeds the unmodified bits from memory
        assert_eq!(wset.entry(idx).value, 0xAABB_CCDF);

        wset.merge(idx, 0x1100, 0xFF00);
        assert_eq!(wset.entry(idx).value, 0xAABB_11DF);
        assert_eq!(wset.entry(idx).mask, 0xFF0F);
    }

    #[test]
    fn test_acquired_only_entry_reseeds_from_memory() {
        let (region, table) = fixture(8);
        let word = region.alloc_raw(1).expect("alloc failed");
        word.store(0x1111);
        let mut wset = fresh_wset(&region, 8);

        // acquisition without payload
        let idx = wset.append(word, 0, 0, 0, table.slot(word), None, true, &region);
        assert_eq!(wset.entry(idx).mask, 0);

        // memory moves before the first payload write
        word.store(0x2222);
        wset.merge(idx, 0xFF, 0xFF);
        assert_eq!(wset.entry(idx).value, 0x22FF);
    }

    #[test]
    fn test_cache_line_chain_threads_across_buckets() {
        let (region, table) = fixture(8);
        let line = region.alloc_raw(8).expect("alloc failed");
        let mut wset = fresh_wset(&region, 8);

        // three words in one cache block
        let a = wset.append(line, 1, Word::MAX, 0, table.slot(line), None, true, &region);
        let b = wset.append(
            line.add(1),
            2,
            Word::MAX,
            0,
            table.slot(line.add(1)),
            None,
            true,
            &region,
        );
        let _c = wset.append(
            line.add(7),
            3,
            Word::MAX,
            0,
            table.slot(line.add(7)),
            None,
            true,
            &region,
        );

        assert!(wset.entry(a).line_head);
        assert!(!wset.entry(b).line_head);
        let chain: Vec<Word> = wset.line_chain(a).map(|e| e.value).collect();
        assert_eq!(chain, vec![1, 2, 3]);
        assert_eq!(wset.iter().filter(|e| e.line_head).count(), 1);
    }

    #[test]
    fn test_bucket_chain_and_membership() {
        let (region, table) = fixture(4);
        let base = region.alloc_raw(64).expect("alloc failed");
        let mut wset = fresh_wset(&region, 4);

        // two addresses far enough apart to live on different cache lines
        let head = wset.append(base, 1, Word::MAX, 5, table.slot(base), None, true, &region);
        let second = wset.append(
            base.add(32),
            2,
            Word::MAX,
            5,
            table.slot(base.add(32)),
            Some(head),
            false,
            &region,
        );

        assert_eq!(wset.entry(head).next, second);
        let (found, _) = wset.find(head, base.add(32));
        assert_eq!(found, Some(second));
        let (missing, tail) = wset.find(head, base.add(48));
        assert!(missing.is_none());
        assert_eq!(tail, second);

        assert!(wset.owns_ptr(wset.slot_ptr(head)));
        assert!(wset.owns_ptr(wset.slot_ptr(second)));
        // the next free slot is not yet owned
        assert!(!wset.owns_ptr(wset.slot_ptr(2)));
        assert_eq!(wset.index_of(wset.slot_ptr(second)), second);
    }

    #[test]
    fn test_grow_flags_reallocation() {
        let (region, table) = fixture(2);
        let base = region.alloc_raw(64).expect("alloc failed");
        let mut wset = fresh_wset(&region, 1);

        wset.append(base, 1, Word::MAX, 0, table.slot(base), None, true, &region);
        assert!(wset.is_full());
        wset.grow();
        assert!(wset.reallocate);
        assert_eq!(wset.size(), 2);

        let arena = region
            .alloc_raw(NvLog::words_for(2))
            .expect("arena alloc failed");
        wset.reincarnate(NvLog::new(arena, 2));
        assert!(!wset.reallocate);
        assert!(wset.is_empty());
    }
}
