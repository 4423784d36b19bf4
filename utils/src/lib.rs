// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the workspace test suites.

pub mod random;
pub mod test_utils;
