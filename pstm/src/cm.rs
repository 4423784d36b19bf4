// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Contention management.
//!
//! The barriers consult the contention manager whenever they meet a lock
//! owned by another transaction. Its verdict is binding: re-read the lock,
//! retry with the already observed word, or give up the attempt. The
//! strategies are interchangeable; the engine only consumes this interface.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::errors::TransactionError;
use crate::locks::{LockSlot, LockWord, PRIORITY_CEILING};
use crate::pmem::Word;

/// Verdict on a foreign-owned lock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Conflict {
    /// Re-read the lock word and take the barrier from the top.
    Restart,
    /// Take the barrier from the top with the updated observation.
    RestartNoLoad,
    /// Abandon the attempt; the transaction restarts.
    RestartLocked,
}

/// Selects how conflicting transactions are arbitrated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmStrategy {
    /// Abort on conflict, then wait at the next start until the contended
    /// lock has been released.
    Delay,
    /// Abort on conflict, then back off for a randomized, exponentially
    /// growing delay before retrying.
    Backoff,
    /// Encode a priority (grown with consecutive aborts) into owned lock
    /// words; spin briefly against lower-priority owners and switch loads to
    /// visible mode after repeated invisible-read aborts.
    Priority,
}

const BACKOFF_MIN: usize = 1 << 6;
const BACKOFF_MAX: usize = 1 << 16;

/// Per-transaction contention state.
pub(crate) struct CmState {
    /// Priority advertised in owned lock words (priority strategy).
    pub priority: Word,
    /// Consecutive aborts of this descriptor.
    retries: usize,
    /// Aborts attributed to invisible reads.
    visible_reads: usize,
    /// Conflict re-reads spent in the current attempt.
    spins: usize,
    /// Lock that caused the last abort (delay strategy).
    contended: Option<LockSlot>,
    backoff: usize,
    rng: SmallRng,
}

impl CmState {
    pub fn new() -> Self {
        Self {
            priority: 0,
            retries: 0,
            visible_reads: 0,
            spins: 0,
            contended: None,
            backoff: BACKOFF_MIN,
            rng: SmallRng::from_entropy(),
        }
    }
}

pub(crate) struct Cm {
    strategy: CmStrategy,
    /// Invisible-read aborts before loads are upgraded to visible mode.
    vr_threshold: usize,
    /// Conflict re-reads granted against a lower-priority owner.
    cm_threshold: usize,
}

impl Cm {
    pub fn new(strategy: CmStrategy, vr_threshold: usize, cm_threshold: usize) -> Self {
        Self {
            strategy,
            vr_threshold,
            cm_threshold,
        }
    }

    pub fn conflict(&self, state: &mut CmState, lock: LockSlot, observed: &mut LockWord) -> Conflict {
        // the owner may have released or changed the word since the barrier
        // looked; in that case retry with the fresh observation
        let current = lock.load_acquire();
        if current != *observed {
            *observed = current;
            return Conflict::RestartNoLoad;
        }

        match self.strategy {
            CmStrategy::Delay => {
                state.contended = Some(lock);
                Conflict::RestartLocked
            }
            CmStrategy::Backoff => Conflict::RestartLocked,
            CmStrategy::Priority => {
                if observed.priority() < state.priority && state.spins < self.cm_threshold {
                    state.spins += 1;
                    core::hint::spin_loop();
                    Conflict::Restart
                } else {
                    Conflict::RestartLocked
                }
            }
        }
    }

    /// Should this load acquire its address instead of reading invisibly?
    pub fn upgrade_lock(&self, state: &CmState) -> bool {
        self.strategy == CmStrategy::Priority && state.visible_reads >= self.vr_threshold
    }

    /// An abort was caused by an invisible read.
    pub fn visible_read(&self, state: &mut CmState) {
        state.visible_reads += 1;
    }

    pub fn on_abort(&self, state: &mut CmState) {
        state.retries += 1;
        state.spins = 0;
        state.priority = (state.retries as Word).min(PRIORITY_CEILING);
        if self.strategy == CmStrategy::Backoff {
            let ceiling = state.backoff;
            let spins = state.rng.gen_range(ceiling / 2..=ceiling);
            for _ in 0..spins {
                core::hint::spin_loop();
            }
            state.backoff = (ceiling * 2).min(BACKOFF_MAX);
        }
    }

    pub fn on_commit(&self, state: &mut CmState) {
        state.retries = 0;
        state.spins = 0;
        state.priority = 0;
        state.backoff = BACKOFF_MIN;
        state.contended = None;
        state.visible_reads = 0;
    }

    /// Called right before a restarted attempt begins. The delay strategy
    /// parks here until the lock that killed the previous attempt is free.
    pub fn before_begin(&self, state: &mut CmState) {
        if let Some(lock) = state.contended.take() {
            let breaker = BusyBreaker::default();
            while lock.load_acquire().is_owned() {
                if breaker.spin().is_err() {
                    break;
                }
            }
        }
    }
}

const MAX_WAIT_UNITS: usize = 7;

/// Kind of a circuit-breaker and busy keeper for short delays on spin loops.
/// Each call burns exponentially more cycles until the internal limit trips.
#[derive(Default)]
pub struct BusyBreaker {
    unit: AtomicUsize,
}

impl BusyBreaker {
    /// Keeps the CPU busy while hinting it to reschedule.
    pub fn spin(&self) -> Result<(), TransactionError> {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= MAX_WAIT_UNITS => {
                for _ in 0..(1 << unit) {
                    core::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);
                Ok(())
            }
            _ => Err(TransactionError::Inner(
                "reached maximum wait units".to_string(),
            )),
        }
    }

    /// Resets the breaker to zero
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}
