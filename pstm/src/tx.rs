// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transaction descriptors and their lifecycle.
//!
//! A [`Transaction`] is handed to the closure run by
//! [`Pstm::execute`](crate::Pstm::execute). The descriptor owns the read and
//! write set, the snapshot window `[start, end]` and the contention state;
//! barriers live in the neighbouring `barrier` module. Every recoverable
//! conflict leaves the descriptor through [`TransactionError::Restart`], the
//! engine rolls it back and re-enters the closure.

use log::{debug, trace};

use crate::cm::CmState;
use crate::errors::{RestartReason, Result, TransactionError};
use crate::locks::{LockSlot, LockWord, PrivateLockTable, VERSION_MAX};
use crate::pmem::{self, Addr, Word};
use crate::rset::ReadSet;
use crate::stm::StmInner;
use crate::wset::{masked, NvLog, WriteSet, NV_NOT_RESIDENT};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxStatus {
    Idle,
    Active,
    Committed,
    Aborted,
    /// Serial and guaranteed to commit; restarts are impossible.
    Irrevocable,
    /// Running alone under the engine's serial gate.
    Serial,
}

/// Static properties of a transaction, decided before the first attempt.
#[derive(Clone, Copy, Default, Debug)]
pub struct TxProps {
    /// The body performs no transactional stores. Loads skip the read set
    /// and snapshot extension; a store restarts the transaction as an
    /// update transaction.
    pub read_only: bool,
    /// Run serially from the first attempt.
    pub irrevocable: bool,
}

/// Per-descriptor counters, readable from the transaction body.
#[derive(Clone, Default, Debug)]
pub struct TxStats {
    commits: usize,
    retries: usize,
    restarts: [usize; RestartReason::COUNT],
}

impl TxStats {
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Total number of abandoned attempts.
    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn restarts(&self, reason: RestartReason) -> usize {
        self.restarts[reason.index()]
    }

    fn note(&mut self, reason: RestartReason) {
        self.retries += 1;
        self.restarts[reason.index()] += 1;
    }
}

struct LocalUndo {
    addr: Addr,
    value: Word,
}

pub struct Transaction<'stm> {
    pub(crate) stm: &'stm StmInner,
    pub(crate) status: TxStatus,
    /// Snapshot window: all observations are consistent for every version in
    /// `[start, end]`.
    pub(crate) start: Word,
    pub(crate) end: Word,
    pub(crate) read_only: bool,
    pub(crate) irrevocable: bool,
    pub(crate) can_extend: bool,
    pub(crate) rset: ReadSet,
    pub(crate) wset: WriteSet,
    pub(crate) private_locks: Option<PrivateLockTable>,
    local_undo: Vec<LocalUndo>,
    pub(crate) stack_base: usize,
    pub(crate) stack_size: usize,
    pub(crate) cm: CmState,
    /// Redo-log directory slot backing this descriptor.
    pub(crate) slot: usize,
    stats: TxStats,
}

impl<'stm> Transaction<'stm> {
    pub(crate) fn new(
        stm: &'stm StmInner,
        props: TxProps,
        stack_base: usize,
        slot: usize,
        nv: NvLog,
    ) -> Self {
        let private_locks = (!stm.config.isolation).then(|| {
            PrivateLockTable::new(stm.config.private_lock_bits, stm.config.lock_shift_extra)
        });
        Self {
            stm,
            status: TxStatus::Idle,
            start: 0,
            end: 0,
            read_only: props.read_only,
            irrevocable: props.irrevocable,
            can_extend: !props.read_only,
            rset: ReadSet::with_capacity(stm.config.read_set_size),
            wset: WriteSet::new(stm.config.write_set_size, nv),
            private_locks,
            local_undo: Vec::new(),
            stack_base,
            stack_size: stm.config.stack_size,
            cm: CmState::new(),
            slot,
            stats: TxStats::default(),
        }
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    /// Abandon the current attempt and run the body again.
    ///
    /// Use as `return Err(tx.retry())`.
    pub fn retry(&mut self) -> TransactionError {
        self.restart(RestartReason::UserRetry)
    }

    /// Definitively abort; the engine returns [`TransactionError::Abort`]
    /// without re-running the body.
    pub fn abort(&self) -> TransactionError {
        TransactionError::Abort
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self.status,
            TxStatus::Active | TxStatus::Serial | TxStatus::Irrevocable
        )
    }

    pub(crate) fn in_stack(&self, addr: Addr) -> bool {
        let a = addr.as_usize();
        a <= self.stack_base && a > self.stack_base.saturating_sub(self.stack_size)
    }

    pub(crate) fn lock_slot(&self, addr: Addr) -> LockSlot {
        match &self.private_locks {
            None => self.stm.locks.slot(addr),
            Some(private) => private.slot(addr),
        }
    }

    pub(crate) fn restart(&mut self, reason: RestartReason) -> TransactionError {
        debug!("tx restart ({})", reason);
        self.stats.note(reason);
        TransactionError::Restart(reason)
    }

    /// Promotion after a `NotReadonly` restart.
    pub(crate) fn promote(&mut self) {
        self.read_only = false;
    }

    pub(crate) fn begin(&mut self, serial: bool) -> Result<()> {
        let stm = self.stm;
        if let Some(private) = &self.private_locks {
            private.reset();
        }
        if self.wset.reallocate {
            let nv = stm.new_log(self.slot, self.wset.size())?;
            self.wset.reincarnate(nv);
        } else {
            self.wset.clear();
        }
        self.rset.clear();
        self.local_undo.clear();

        loop {
            let now = stm.clock.get();
            if stm.config.rollover && now >= VERSION_MAX {
                stm.clock.overflow(&stm.locks);
                continue;
            }
            self.start = now;
            self.end = now;
            break;
        }
        self.can_extend = !self.read_only;
        self.status = if self.irrevocable {
            TxStatus::Irrevocable
        } else if serial {
            TxStatus::Serial
        } else {
            TxStatus::Active
        };
        trace!("tx begin [{}-{}]", self.start, self.end);
        Ok(())
    }

    /// Checks every read-set observation against the current lock state:
    /// a lock passes when it is free with a timestamp inside the snapshot
    /// window, or owned by this very transaction.
    pub(crate) fn validate(&self) -> bool {
        for r in self.rset.iter() {
            let l = r.lock.load_acquire();
            if l.is_owned() {
                if !self.wset.owns_ptr(l.entry()) {
                    return false;
                }
            } else if l.timestamp() > self.end {
                return false;
            }
        }
        true
    }

    /// Tries to advance the snapshot window to the current clock value.
    pub(crate) fn try_extend(&mut self) -> bool {
        let stm = self.stm;
        let now = stm.clock.get();
        if stm.config.rollover && now >= VERSION_MAX {
            // timestamp space exhausted; give up and quiesce on the way in
            return false;
        }
        if self.validate() {
            trace!("tx extend [{}-{}] -> {}", self.start, self.end, now);
            self.end = now;
            true
        } else {
            false
        }
    }

    pub(crate) fn record_local_undo(&mut self, addr: Addr, value: Word) {
        self.local_undo.push(LocalUndo { addr, value });
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        let stm = self.stm;
        debug_assert!(self.is_active());

        if self.wset.is_empty() {
            // nothing acquired, nothing to persist
            self.local_undo.clear();
            self.status = TxStatus::Committed;
            self.stats.commits += 1;
            return Ok(());
        }

        let new_ts = stm.clock.fetch_inc();
        if stm.config.rollover && new_ts >= VERSION_MAX {
            // roll everything back; the next begin parks in the quiesce gate
            return Err(self.restart(RestartReason::ValidateCommit));
        }
        if stm.config.isolation && new_ts != self.end + 1 {
            // other writers committed since the snapshot was taken
            self.end = new_ts - 1;
            if !self.validate() {
                return Err(self.restart(RestartReason::ValidateCommit));
            }
        }

        // persist the redo log, one streaming pass per dirty cache line,
        // then seal it with the commit timestamp: the durability point
        let region = &stm.region;
        let nv = self.wset.nv();
        for (head, e) in self.wset.iter().enumerate() {
            if !e.line_head {
                continue;
            }
            for w in self.wset.line_chain(head) {
                let addr_off = region
                    .offset_of(w.addr)
                    .map(|o| o as Word)
                    .unwrap_or(NV_NOT_RESIDENT);
                nv.stream_payload(w.nv, addr_off, w.value);
            }
        }
        nv.stream_nb_entries(self.wset.len() as Word);
        pmem::store_fence();
        nv.seal(new_ts);
        pmem::store_fence();

        // write through to the home locations
        for e in self.wset.iter() {
            if e.mask == 0 {
                continue;
            }
            if e.mask == Word::MAX {
                e.addr.store(e.value);
            } else {
                let current = e.addr.load();
                e.addr.store(masked(current, e.value, e.mask));
            }
        }
        // each dirty line is written back exactly once
        for e in self.wset.iter().filter(|e| e.line_head) {
            pmem::flush_block(e.addr);
        }
        pmem::store_fence();

        // release ownership, making the new versions visible
        for e in self.wset.iter().filter(|e| e.lock_owner) {
            match &self.private_locks {
                None => e.lock.publish(new_ts),
                Some(_) => e.lock.set(LockWord::free(new_ts)),
            }
        }
        self.wset.nv().retire();

        debug!(
            "tx commit @{} ({} entries, {} reads)",
            new_ts,
            self.wset.len(),
            self.rset.len()
        );
        self.local_undo.clear();
        self.status = TxStatus::Committed;
        self.stats.commits += 1;
        Ok(())
    }

    /// Releases everything the attempt acquired and discards its buffered
    /// state. The unsealed persistent log needs no treatment: recovery
    /// ignores it.
    pub(crate) fn rollback(&mut self) {
        for e in self.wset.iter().filter(|e| e.lock_owner) {
            match &self.private_locks {
                None => e.lock.publish(e.version),
                Some(_) => e.lock.set(LockWord::free(e.version)),
            }
        }
        for u in self.local_undo.drain(..).rev() {
            u.addr.store(u.value);
        }
        self.wset.clear();
        self.rset.clear();
        self.status = TxStatus::Aborted;
    }
}
