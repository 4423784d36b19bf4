// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The read set: an append-only log of the lock observations a transaction
//! made, replayed during validation and snapshot extension.

use crate::locks::LockSlot;
use crate::pmem::Word;

#[derive(Clone, Copy, Debug)]
pub(crate) struct REntry {
    pub lock: LockSlot,
    pub version: Word,
}

pub(crate) struct ReadSet {
    entries: Vec<REntry>,
}

impl ReadSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, lock: LockSlot, version: Word) {
        self.entries.push(REntry { lock, version });
    }

    /// Was this lock observed by an earlier load of this transaction?
    pub fn find(&self, lock: LockSlot) -> Option<&REntry> {
        self.entries.iter().find(|r| r.lock == lock)
    }

    pub fn iter(&self) -> impl Iterator<Item = &REntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
