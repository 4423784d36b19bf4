// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Persistent Software Transactional Memory
//!
//! A word-granular software transactional memory over byte-addressable
//! persistent memory, running in persistent write-back mode with
//! encounter-time locking: writers acquire an address on first touch and
//! buffer their updates in a redo log that lives both in RAM and, as a
//! streamed twin, in the persistent region. Committed transactions survive
//! crashes; everything else is invisible to other threads and to recovery.
//!
//! Reads are invisible and validated against a global version clock. Every
//! transactional word hashes into a table of versioned locks; a transaction
//! keeps a snapshot window of clock values for which its reads are known
//! consistent and extends the window on demand. Conflicts are arbitrated by
//! a pluggable contention manager and surface as transparent restarts of the
//! transaction body.
//!
//! ## Example
//!
//! ```
//! use stronghold_pstm::{PmemRegion, Pstm};
//!
//! let region = PmemRegion::anonymous(8192).expect("mapping failed");
//! let stm = Pstm::new(region).expect("engine failed");
//!
//! let counter = stm.alloc_words(1).expect("out of persistent memory");
//!
//! stm.execute(|tx| {
//!     let value = tx.load(counter)?;
//!     tx.store(counter, value + 1)
//! })
//! .expect("transaction failed");
//!
//! assert_eq!(counter.load(), 1);
//! ```
//!
//! Opening the region from a file instead of anonymously makes the same
//! program durable: committed stores are replayed from the redo logs the
//! next time an engine attaches to the file, whatever happened in between.

mod barrier;
mod clock;
mod locks;
mod rset;
mod wset;

pub mod cm;
pub mod errors;
pub mod pmem;
pub mod recovery;
pub mod stm;
pub mod tx;

pub use cm::{BusyBreaker, CmStrategy};
pub use errors::{RestartReason, Result, TransactionError};
pub use pmem::{Addr, MemoryError, PmemRegion, Word, CACHE_LINE};
pub use recovery::RecoveryReport;
pub use stm::{Pstm, StmConfig};
pub use tx::{Transaction, TxProps, TxStats, TxStatus};
