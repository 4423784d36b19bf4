// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The global version clock.
//!
//! Every transaction samples the clock when it starts and every committing
//! writer bumps it. With rollover enabled the clock additionally carries a
//! quiesce gate: when the timestamp space is exhausted, every thread parks
//! at its next transaction boundary, the last one to arrive resets the clock
//! and the lock table, and everybody resumes with fresh versions.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Condvar, Mutex,
};

use crate::locks::LockTable;
use crate::pmem::Word;

struct GateState {
    active: usize,
    overflow: bool,
}

struct QuiesceGate {
    state: Mutex<GateState>,
    parked: Condvar,
}

pub(crate) struct GlobalClock {
    clock: AtomicUsize,
    gate: Option<QuiesceGate>,
}

impl GlobalClock {
    pub fn new(rollover: bool) -> Self {
        Self {
            clock: AtomicUsize::new(0),
            gate: rollover.then(|| QuiesceGate {
                state: Mutex::new(GateState {
                    active: 0,
                    overflow: false,
                }),
                parked: Condvar::new(),
            }),
        }
    }

    pub fn get(&self) -> Word {
        self.clock.load(Ordering::Acquire)
    }

    /// Bumps the clock and returns the new value.
    pub fn fetch_inc(&self) -> Word {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// One more live transaction descriptor. Blocks while a reset is in
    /// flight.
    pub fn enter(&self) {
        if let Some(gate) = &self.gate {
            let mut state = gate.state.lock().expect("rollover gate poisoned");
            while state.overflow {
                state = gate.parked.wait(state).expect("rollover gate poisoned");
            }
            state.active += 1;
        }
    }

    /// One less live transaction descriptor; performs a pending reset when
    /// this was the last one.
    pub fn exit(&self, locks: &LockTable) {
        if let Some(gate) = &self.gate {
            let mut state = gate.state.lock().expect("rollover gate poisoned");
            state.active -= 1;
            if state.overflow && state.active == 0 {
                self.reset(locks);
                state.overflow = false;
                gate.parked.notify_all();
            }
        }
    }

    /// Called by a descriptor that observed the overflow sentinel. Parks
    /// until all other descriptors have reached a transaction boundary, then
    /// resumes with a reset clock.
    pub fn overflow(&self, locks: &LockTable) {
        let gate = match &self.gate {
            Some(gate) => gate,
            // Without the rollover gate the sentinel is unreachable in any
            // realistic execution; there is nothing to quiesce.
            None => return,
        };
        let mut state = gate.state.lock().expect("rollover gate poisoned");
        state.overflow = true;
        state.active -= 1;
        if state.active == 0 {
            self.reset(locks);
            state.overflow = false;
            gate.parked.notify_all();
        } else {
            while state.overflow {
                state = gate.parked.wait(state).expect("rollover gate poisoned");
            }
        }
        state.active += 1;
    }

    fn reset(&self, locks: &LockTable) {
        log::info!("version clock rollover, resetting clock and lock table");
        locks.reset();
        self.clock.store(0, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn set(&self, value: Word) {
        self.clock.store(value, Ordering::SeqCst);
    }
}
