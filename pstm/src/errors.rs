// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::pmem::MemoryError;
use thiserror::Error as DeriveError;

/// Global return type
pub type Result<T> = core::result::Result<T, TransactionError>;

/// Why a running transaction had to abandon its current attempt. The reason
/// is consumed by the retry loop to pick the next strategy (plain retry,
/// write-set reallocation, promotion to an update transaction, serial mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, DeriveError)]
pub enum RestartReason {
    #[error("write set exhausted, reallocation required")]
    Reallocate,

    #[error("load target is locked by another transaction")]
    LockedRead,

    #[error("store target is locked by another transaction")]
    LockedWrite,

    #[error("snapshot extension failed on load")]
    ValidateRead,

    #[error("stale version encountered on store")]
    ValidateWrite,

    #[error("read set validation failed at commit")]
    ValidateCommit,

    #[error("store attempted inside a read-only transaction")]
    NotReadonly,

    #[error("retry requested by the transaction body")]
    UserRetry,
}

impl RestartReason {
    pub(crate) const COUNT: usize = 8;

    pub(crate) fn index(self) -> usize {
        match self {
            RestartReason::Reallocate => 0,
            RestartReason::LockedRead => 1,
            RestartReason::LockedWrite => 2,
            RestartReason::ValidateRead => 3,
            RestartReason::ValidateWrite => 4,
            RestartReason::ValidateCommit => 5,
            RestartReason::NotReadonly => 6,
            RestartReason::UserRetry => 7,
        }
    }
}

#[derive(Debug, DeriveError)]
pub enum TransactionError {
    /// The current attempt cannot produce a consistent outcome and the
    /// transaction must be re-executed from the top.
    #[error("transaction restarted ({0})")]
    Restart(RestartReason),

    /// The transaction body requested a definitive abort.
    #[error("operation aborted")]
    Abort,

    #[error("memory error occured ({0})")]
    Memory(#[from] MemoryError),

    #[error("inner error occured ({0})")]
    Inner(String),
}
