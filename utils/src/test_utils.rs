// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Damage injection for crash-recovery tests.
//!
//! Regions, redo-log arenas and their directories are all arrays of machine
//! words, and a torn or misdirected non-temporal store clobbers exactly one
//! of them. The helpers here reproduce that failure shape: whole random
//! words replaced by garbage, in memory or in a region file on disk.

use crate::random;
use std::{
    fs::OpenOptions,
    io::{Read, Seek, Write},
    path::Path,
};

const WORD_BYTES: usize = core::mem::size_of::<usize>();

/// Replaces one random word of `words` with garbage, retrying until the
/// stored value actually changed. Returns the damaged index.
pub fn corrupt_words(words: &mut [usize]) -> usize {
    assert!(!words.is_empty());
    loop {
        let i = random::index(words.len());
        let garbage = random::word();
        if words[i] != garbage {
            words[i] = garbage;
            return i;
        }
    }
}

/// Word-granular damage to a region file on disk, the state a crash in the
/// middle of a streamed write leaves behind. Returns the damaged word
/// offset.
pub fn corrupt_region_file(path: &Path) -> usize {
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("cannot open region file");
    let mut bytes = Vec::new();
    f.read_to_end(&mut bytes).expect("cannot read region file");
    assert!(bytes.len() >= WORD_BYTES, "region file too small");

    let offset = random::index(bytes.len() / WORD_BYTES);
    let garbage = random::word().to_ne_bytes();
    bytes[offset * WORD_BYTES..(offset + 1) * WORD_BYTES].copy_from_slice(&garbage);

    f.rewind().expect("cannot rewind region file");
    f.write_all(&bytes).expect("cannot write region file");
    offset
}
