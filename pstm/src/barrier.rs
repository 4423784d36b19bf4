// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The load and store barriers.
//!
//! A transactional access hashes its address to a lock word and then runs a
//! small state machine over the observed word: consult the own write set,
//! defer to the contention manager on a foreign owner, or — for free words —
//! read under the lock/value/lock protocol and keep the snapshot window
//! consistent, extending it when the observed version is too new.
//!
//! Word barriers are the primitive; the typed scalar wrappers and the byte
//! copies decompose into masked word accesses.

use log::trace;

use crate::cm::Conflict;
use crate::errors::{RestartReason, Result};
use crate::locks::LockWord;
use crate::pmem::{Addr, Word, WORD_BYTES};
use crate::tx::Transaction;
use crate::wset::{masked, NO_ENTRY};

impl<'stm> Transaction<'stm> {
    /// Transactional load of one machine word.
    pub fn load(&mut self, addr: Addr) -> Result<Word> {
        debug_assert!(self.is_active());

        // stack words are transaction-local, no concurrency control applies
        if self.in_stack(addr) {
            return Ok(addr.load());
        }

        let stm = self.stm;
        let isolation = stm.config.isolation;

        if isolation && stm.cm.upgrade_lock(&self.cm) {
            // visible-read mode: acquire the address with an empty payload
            if let Some(idx) = self.write_word(addr, 0, 0)? {
                let e = self.wset.entry(idx);
                return Ok(if e.mask == 0 { addr.load() } else { e.value });
            }
        }

        let lock = self.lock_slot(addr);
        let mut l = lock.load_acquire();
        loop {
            if l.is_owned() {
                let entry_ptr = l.entry();
                if self.wset.owns_ptr(entry_ptr) {
                    // walk our bucket chain; an aliasing address falls back
                    // to memory, which stays valid while we own the lock
                    let mut idx = self.wset.index_of(entry_ptr);
                    loop {
                        let e = self.wset.entry(idx);
                        if e.addr == addr {
                            trace!("load {:p} from write set", addr.as_ptr());
                            return Ok(if e.mask == 0 { addr.load() } else { e.value });
                        }
                        if e.next == NO_ENTRY {
                            return Ok(addr.load());
                        }
                        idx = e.next;
                    }
                }
                // a private pseudo-lock can only ever be owned by us
                debug_assert!(isolation);
                match stm.cm.conflict(&mut self.cm, lock, &mut l) {
                    Conflict::Restart => l = lock.load_acquire(),
                    Conflict::RestartNoLoad => {}
                    Conflict::RestartLocked => {
                        return Err(self.restart(RestartReason::LockedRead))
                    }
                }
                continue;
            }

            // free form: value first, then re-check the lock word to detect
            // an owner slipping in between
            let value = addr.load_acquire();
            if !isolation {
                return Ok(value);
            }
            let l2 = lock.load_acquire();
            if l != l2 {
                l = l2;
                continue;
            }
            let version = l.timestamp();
            if version > self.end {
                if !self.can_extend || !self.try_extend() {
                    stm.cm.visible_read(&mut self.cm);
                    return Err(self.restart(RestartReason::ValidateRead));
                }
                // the version may have been overwritten while extending: the
                // value read above is not yet covered by the read set
                let l3 = lock.load_acquire();
                if l3 != l {
                    l = l3;
                    continue;
                }
            }
            if self.can_extend {
                self.rset.push(lock, version);
            }
            return Ok(value);
        }
    }

    /// Transactional store of one machine word.
    pub fn store(&mut self, addr: Addr, value: Word) -> Result<()> {
        self.write_word(addr, value, Word::MAX).map(|_| ())
    }

    /// Transactional store of the bits of `value` selected by `mask`.
    pub fn store2(&mut self, addr: Addr, value: Word, mask: Word) -> Result<()> {
        self.write_word(addr, value, mask).map(|_| ())
    }

    /// Records a masked write, acquiring the address on first touch.
    /// Returns the write-set entry index, or `None` for stack writes, which
    /// are applied in place under a local undo record.
    pub(crate) fn write_word(
        &mut self,
        addr: Addr,
        value: Word,
        mask: Word,
    ) -> Result<Option<usize>> {
        debug_assert!(self.is_active());

        if self.in_stack(addr) {
            let previous = addr.load();
            if mask == 0 {
                return Ok(None);
            }
            let value = if mask != Word::MAX {
                masked(previous, value, mask)
            } else {
                value
            };
            self.record_local_undo(addr, previous);
            addr.store(value);
            return Ok(None);
        }

        if self.read_only {
            return Err(self.restart(RestartReason::NotReadonly));
        }

        let stm = self.stm;
        let isolation = stm.config.isolation;
        let lock = self.lock_slot(addr);
        let mut l = lock.load_acquire();
        loop {
            if l.is_owned() {
                let entry_ptr = l.entry();
                if self.wset.owns_ptr(entry_ptr) {
                    // the address hashes into our write set already
                    let head = self.wset.index_of(entry_ptr);
                    let (found, tail) = self.wset.find(head, addr);
                    if let Some(idx) = found {
                        self.wset.merge(idx, value, mask);
                        return Ok(Some(idx));
                    }
                    if self.wset.is_full() {
                        // entry addresses are about to be invalidated
                        self.wset.grow();
                        return Err(self.restart(RestartReason::Reallocate));
                    }
                    // chained entries share the version of their bucket
                    let version = self.wset.entry(tail).version;
                    let idx = self.wset.append(
                        addr,
                        value,
                        mask,
                        version,
                        lock,
                        Some(tail),
                        false,
                        &stm.region,
                    );
                    return Ok(Some(idx));
                }
                debug_assert!(isolation);
                match stm.cm.conflict(&mut self.cm, lock, &mut l) {
                    Conflict::Restart => l = lock.load_acquire(),
                    Conflict::RestartNoLoad => {}
                    Conflict::RestartLocked => {
                        return Err(self.restart(RestartReason::LockedWrite))
                    }
                }
                continue;
            }

            let version = l.timestamp();
            if isolation && version > self.end {
                // a location this new may already have been read at an older
                // version; only an extendable, unread location survives the
                // acquisition
                if !self.can_extend || self.rset.find(lock).is_some() {
                    stm.cm.visible_read(&mut self.cm);
                    return Err(self.restart(RestartReason::ValidateWrite));
                }
            }

            if self.wset.is_full() {
                self.wset.grow();
                return Err(self.restart(RestartReason::Reallocate));
            }

            let slot_ptr = self.wset.slot_ptr(self.wset.len());
            if isolation {
                let owned = LockWord::owned(slot_ptr, self.cm.priority);
                if !lock.acquire(l, owned) {
                    l = lock.load_acquire();
                    continue;
                }
            } else {
                // no competition on a private pseudo-lock, a plain store
                // marks the entry as live
                lock.set(LockWord::owned(slot_ptr, 0));
            }
            trace!("acquired {:p} @{}", addr.as_ptr(), version);
            let idx = self
                .wset
                .append(addr, value, mask, version, lock, None, true, &stm.region);
            return Ok(Some(idx));
        }
    }

    /// Transactional read of `dst.len()` bytes starting at `src`, decomposed
    /// into word-aligned loads.
    pub fn load_bytes(&mut self, src: *const u8, dst: &mut [u8]) -> Result<()> {
        let mut a = src as usize;
        let mut i = 0;
        while i < dst.len() {
            let word_base = a & !(WORD_BYTES - 1);
            let off = a - word_base;
            let take = (WORD_BYTES - off).min(dst.len() - i);
            let w = self.load(Addr::new(word_base as *mut Word))?;
            dst[i..i + take].copy_from_slice(&w.to_ne_bytes()[off..off + take]);
            i += take;
            a += take;
        }
        Ok(())
    }

    /// Transactional write of `src` to the bytes starting at `dst`,
    /// decomposed into masked word-aligned stores.
    pub fn store_bytes(&mut self, dst: *mut u8, src: &[u8]) -> Result<()> {
        let mut a = dst as usize;
        let mut i = 0;
        while i < src.len() {
            let word_base = a & !(WORD_BYTES - 1);
            let off = a - word_base;
            let take = (WORD_BYTES - off).min(src.len() - i);

            let mut value = [0u8; WORD_BYTES];
            let mut mask = [0u8; WORD_BYTES];
            value[off..off + take].copy_from_slice(&src[i..i + take]);
            for m in mask[off..off + take].iter_mut() {
                *m = 0xFF;
            }
            self.store2(
                Addr::new(word_base as *mut Word),
                Word::from_ne_bytes(value),
                Word::from_ne_bytes(mask),
            )?;
            i += take;
            a += take;
        }
        Ok(())
    }
}

/// Generates the strongly-typed scalar barriers on top of the byte copies.
macro_rules! scalar_barriers {
    ($(#[$doc:meta])* $load:ident, $store:ident, $ty:ty) => {
        impl<'stm> Transaction<'stm> {
            $(#[$doc])*
            pub fn $load(&mut self, addr: *const $ty) -> Result<$ty> {
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                self.load_bytes(addr as *const u8, &mut raw)?;
                Ok(<$ty>::from_ne_bytes(raw))
            }

            pub fn $store(&mut self, addr: *mut $ty, value: $ty) -> Result<()> {
                self.store_bytes(addr as *mut u8, &value.to_ne_bytes())
            }
        }
    };
}

scalar_barriers!(
    /// Transactional load of a `u8`.
    load_u8, store_u8, u8
);
scalar_barriers!(load_u16, store_u16, u16);
scalar_barriers!(load_u32, store_u32, u32);
scalar_barriers!(load_u64, store_u64, u64);
scalar_barriers!(load_i8, store_i8, i8);
scalar_barriers!(load_i16, store_i16, i16);
scalar_barriers!(load_i32, store_i32, i32);
scalar_barriers!(load_i64, store_i64, i64);
scalar_barriers!(load_usize, store_usize, usize);
