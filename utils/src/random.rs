// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Randomness helpers for the transactional memory test suites.

use rand::distributions::{Distribution, Standard};

/// Random value for `T`.
pub fn random<T>() -> T
where
    Standard: Distribution<T>,
{
    rand::random()
}

/// Random machine word.
pub fn word() -> usize {
    random()
}

/// Random `(value, mask)` pair for a masked word store; any subset of bits
/// may be selected, including none and all of them.
pub fn masked_store() -> (usize, usize) {
    (random(), random())
}

/// Random index in range 0..upper_bound (excluding the upper bound).
pub fn index(upper_bound: usize) -> usize {
    random::<usize>() % upper_bound
}
