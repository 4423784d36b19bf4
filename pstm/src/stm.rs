// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The engine: configuration, shared state and the transaction loop.

use std::sync::{Arc, RwLock};

use log::{debug, info};

use crate::clock::GlobalClock;
use crate::cm::{Cm, CmStrategy};
use crate::errors::{RestartReason, Result, TransactionError};
use crate::locks::LockTable;
use crate::pmem::{Addr, PmemRegion, Word};
use crate::recovery::{self, LogDirectory, RecoveryReport};
use crate::tx::{Transaction, TxProps};
use crate::wset::NvLog;

/// Tuning knobs of the engine. The defaults mirror a contended, isolated
/// deployment; tests shrink the sizes.
#[derive(Clone, Copy, Debug)]
pub struct StmConfig {
    /// With isolation off, the global lock table is replaced by a private
    /// pseudo-lock table per transaction and plain stores replace the
    /// compare-and-swap.
    pub isolation: bool,
    /// Quiesce and reset the clock on timestamp exhaustion instead of
    /// treating it as unreachable.
    pub rollover: bool,
    pub cm: CmStrategy,
    /// log2 of the global lock table size.
    pub lock_bits: u32,
    /// Extra address bits shifted away before lock hashing: one lock word
    /// then covers `2^lock_shift_extra` consecutive words.
    pub lock_shift_extra: u32,
    /// Swap index bytes so neighboring addresses spread over the table.
    pub lock_idx_swap: bool,
    /// log2 of the private pseudo-lock table size.
    pub private_lock_bits: u32,
    /// Initial write-set capacity; doubled on exhaustion.
    pub write_set_size: usize,
    /// Initial read-set capacity.
    pub read_set_size: usize,
    /// Consecutive aborts before an attempt runs under the serial gate.
    pub serial_threshold: usize,
    /// Invisible-read aborts before the priority manager turns loads into
    /// visible reads.
    pub vr_threshold: usize,
    /// Conflict re-reads the priority manager grants against a
    /// lower-priority owner.
    pub cm_threshold: usize,
    /// Span below the descriptor's stack probe treated as stack memory.
    pub stack_size: usize,
    /// Redo-log directory slots, bounding concurrent descriptors.
    pub log_slots: usize,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            isolation: true,
            rollover: false,
            cm: CmStrategy::Delay,
            lock_bits: 20,
            lock_shift_extra: 2,
            lock_idx_swap: false,
            private_lock_bits: 12,
            write_set_size: 1024,
            read_set_size: 4096,
            serial_threshold: 8,
            vr_threshold: 3,
            cm_threshold: 4,
            stack_size: 1 << 20,
            log_slots: 64,
        }
    }
}

pub(crate) struct StmInner {
    pub config: StmConfig,
    pub clock: GlobalClock,
    pub locks: LockTable,
    pub region: PmemRegion,
    pub cm: Cm,
    /// Normal transactions hold the read side for one attempt; a serial
    /// attempt takes the write side and runs alone.
    serial: RwLock<()>,
    directory: LogDirectory,
    recovered: RecoveryReport,
}

impl StmInner {
    /// Carves a fresh redo-log arena for `slot` out of the region and makes
    /// the directory point at it.
    pub fn new_log(&self, slot: usize, capacity: usize) -> Result<NvLog> {
        let base = self.region.alloc_raw(NvLog::words_for(capacity))?;
        let nv = NvLog::new(base, capacity);
        nv.initialise();
        let offset = self
            .region
            .offset_of(base)
            .expect("allocations are region-resident");
        self.directory.install(slot, offset, capacity);
        Ok(nv)
    }
}

/// The persistent transactional memory engine.
///
/// Cloning is cheap and yields a handle to the same engine; handles are
/// shared freely between threads.
pub struct Pstm {
    inner: Arc<StmInner>,
}

impl Clone for Pstm {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Pstm {
    /// Opens the engine over `region` with default configuration, replaying
    /// whatever a previous life of the region left behind.
    pub fn new(region: PmemRegion) -> Result<Self> {
        Self::with_config(region, StmConfig::default())
    }

    pub fn with_config(region: PmemRegion, config: StmConfig) -> Result<Self> {
        let directory = LogDirectory::attach(&region, config.log_slots)?;
        let recovered = recovery::recover(&region, &directory);
        if recovered.replayed_logs + recovered.discarded_logs > 0 {
            info!(
                "recovery: {} logs replayed ({} words), {} discarded",
                recovered.replayed_logs, recovered.replayed_words, recovered.discarded_logs
            );
        }
        Ok(Self {
            inner: Arc::new(StmInner {
                clock: GlobalClock::new(config.rollover),
                locks: LockTable::new(config.lock_bits, config.lock_shift_extra, config.lock_idx_swap),
                cm: Cm::new(config.cm, config.vr_threshold, config.cm_threshold),
                serial: RwLock::new(()),
                directory,
                recovered,
                region,
                config,
            }),
        })
    }

    /// What recovery found when the engine opened its region.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovered
    }

    pub fn region(&self) -> &PmemRegion {
        &self.inner.region
    }

    /// Hands out `words` fresh durable words from the region.
    pub fn alloc_words(&self, words: usize) -> Result<Addr> {
        Ok(self.inner.region.alloc_raw(words)?)
    }

    /// Current value of the global clock.
    pub fn clock(&self) -> Word {
        self.inner.clock.get()
    }

    /// Runs `body` as a transaction and returns its result once an attempt
    /// commits.
    ///
    /// The body is re-entered after every recoverable conflict, so it must
    /// tolerate re-execution; all transactional state is rolled back in
    /// between, anything else is the body's business. Errors other than
    /// restarts abort the transaction and surface unchanged.
    pub fn execute<U, F>(&self, body: F) -> Result<U>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<U>,
    {
        self.execute_props(TxProps::default(), body)
    }

    pub fn execute_props<U, F>(&self, props: TxProps, mut body: F) -> Result<U>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<U>,
    {
        let inner = &*self.inner;
        inner.clock.enter();

        let result = (|| {
            let (slot, reusable) = inner.directory.claim(inner.config.write_set_size)?;
            let nv = match reusable {
                Some((offset, capacity)) if capacity >= inner.config.write_set_size => {
                    let nv = NvLog::new(inner.region.word(offset), capacity);
                    nv.initialise();
                    inner.directory.install(slot, offset, capacity);
                    nv
                }
                _ => match inner.new_log(slot, inner.config.write_set_size) {
                    Ok(nv) => nv,
                    Err(e) => {
                        inner.directory.release(slot);
                        return Err(e);
                    }
                },
            };

            // approximate stack ceiling: everything the body touches lives in
            // deeper frames
            let probe = 0u8;
            let stack_base = &probe as *const u8 as usize;

            let mut tx = Transaction::new(inner, props, stack_base, slot, nv);
            let mut attempts = 0usize;

            let outcome = loop {
                inner.cm.before_begin(&mut tx.cm);
                let serial = props.irrevocable || attempts >= inner.config.serial_threshold;
                let _gate = if serial {
                    SerialGate::Exclusive(inner.serial.write().expect("serial gate poisoned"))
                } else {
                    SerialGate::Shared(inner.serial.read().expect("serial gate poisoned"))
                };
                if let Err(e) = tx.begin(serial) {
                    break Err(e);
                }

                let attempt = match body(&mut tx) {
                    Ok(value) => tx.commit().map(|_| value),
                    Err(e) => Err(e),
                };
                match attempt {
                    Ok(value) => {
                        inner.cm.on_commit(&mut tx.cm);
                        break Ok(value);
                    }
                    Err(TransactionError::Restart(reason)) => {
                        tx.rollback();
                        if reason == RestartReason::NotReadonly {
                            tx.promote();
                        }
                        inner.cm.on_abort(&mut tx.cm);
                        attempts += 1;
                        debug!("tx attempt {} restarted ({})", attempts, reason);
                    }
                    Err(e) => {
                        tx.rollback();
                        break Err(e);
                    }
                }
            };

            inner.directory.release(slot);
            outcome
        })();

        inner.clock.exit(&inner.locks);
        result
    }
}

#[allow(dead_code)]
enum SerialGate<'a> {
    Shared(std::sync::RwLockReadGuard<'a, ()>),
    Exclusive(std::sync::RwLockWriteGuard<'a, ()>),
}
