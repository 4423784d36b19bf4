// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc, Arc,
};

use stronghold_pstm::{
    Addr, CmStrategy, PmemRegion, Pstm, RestartReason, StmConfig, TransactionError, TxProps, Word,
};
use threadpool::ThreadPool;

#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

fn small_config() -> StmConfig {
    StmConfig {
        lock_bits: 12,
        write_set_size: 32,
        log_slots: 16,
        ..StmConfig::default()
    }
}

fn engine(config: StmConfig) -> Pstm {
    let region = PmemRegion::anonymous(1 << 16).expect("mapping failed");
    Pstm::with_config(region, config).expect("engine failed")
}

#[test]
fn test_store_then_load_returns_buffered_value() {
    let stm = engine(small_config());
    let x = stm.alloc_words(1).expect("alloc failed");
    x.store(0);

    let seen = stm
        .execute(|tx| {
            tx.store(x, 42)?;
            tx.load(x)
        })
        .expect("transaction failed");

    assert_eq!(seen, 42);
    assert_eq!(x.load(), 42);
}

#[test]
fn test_masked_store_seeds_unmodified_bits() {
    let stm = engine(small_config());
    let x = stm.alloc_words(1).expect("alloc failed");
    x.store(0x0000);

    let seen = stm
        .execute(|tx| {
            tx.store2(x, 0xFF, 0x0F)?;
            tx.load(x)
        })
        .expect("transaction failed");

    assert_eq!(seen, 0x0F);
    assert_eq!(x.load(), 0x0F);
}

#[test]
fn test_overlapping_masked_stores_compose() {
    let stm = engine(small_config());
    let x = stm.alloc_words(1).expect("alloc failed");
    x.store(0xAABB_CCDD);

    let seen = stm
        .execute(|tx| {
            tx.store2(x, 0x1111, 0x00FF)?;
            tx.store2(x, 0x2222, 0xFF00)?;
            tx.load(x)
        })
        .expect("transaction failed");

    // (mem & !(m1|m2)) | (v1 & m1 & !m2) | (v2 & m2)
    assert_eq!(seen, 0xAABB_2211);
    assert_eq!(x.load(), 0xAABB_2211);
}

#[test]
fn test_committed_update_is_visible_to_later_transactions() {
    let stm = engine(small_config());
    let y = stm.alloc_words(1).expect("alloc failed");
    y.store(0xAABB);

    stm.execute(|tx| tx.store(y, 0x1234)).expect("writer failed");

    let seen = stm
        .execute_props(TxProps { read_only: true, ..TxProps::default() }, |tx| tx.load(y))
        .expect("reader failed");
    assert_eq!(seen, 0x1234);
}

#[test]
fn test_update_commits_bump_the_clock_and_read_only_ones_do_not() {
    let stm = engine(small_config());
    let x = stm.alloc_words(1).expect("alloc failed");

    for i in 0..5 {
        stm.execute(|tx| tx.store(x, i)).expect("writer failed");
    }
    assert_eq!(stm.clock(), 5);

    stm.execute(|tx| tx.load(x)).expect("reader failed");
    assert_eq!(stm.clock(), 5);
}

fn lost_update_hammer(cm: CmStrategy) {
    let config = StmConfig {
        cm,
        ..small_config()
    };
    let stm = engine(config);
    let counter = stm.alloc_words(1).expect("alloc failed");
    counter.store(0);

    const THREADS: usize = 8;
    const INCREMENTS: usize = 200;

    let pool = ThreadPool::new(THREADS);
    for _ in 0..THREADS {
        let stm = stm.clone();
        pool.execute(move || {
            for _ in 0..INCREMENTS {
                stm.execute(|tx| {
                    let v = tx.load(counter)?;
                    tx.store(counter, v + 1)
                })
                .expect("increment failed");
            }
        });
    }
    pool.join();

    assert_eq!(pool.panic_count(), 0);
    assert_eq!(counter.load(), THREADS * INCREMENTS);
}

#[test]
fn test_no_lost_updates_under_delay_manager() {
    lost_update_hammer(CmStrategy::Delay);
}

#[test]
fn test_no_lost_updates_under_backoff_manager() {
    lost_update_hammer(CmStrategy::Backoff);
}

#[test]
fn test_no_lost_updates_under_priority_manager() {
    lost_update_hammer(CmStrategy::Priority);
}

#[test]
fn test_readers_always_observe_a_consistent_pair() {
    let stm = engine(small_config());
    let x = stm.alloc_words(1).expect("alloc failed");
    // a second word far enough away to hash to another lock
    let y = stm.alloc_words(1).expect("alloc failed");
    x.store(0);
    y.store(0);

    let torn = Arc::new(AtomicUsize::new(0));
    let pool = ThreadPool::new(6);

    for _ in 0..2 {
        let stm = stm.clone();
        pool.execute(move || {
            for _ in 0..300 {
                stm.execute(|tx| {
                    let v = tx.load(x)?;
                    tx.store(x, v + 1)?;
                    tx.store(y, v + 1)
                })
                .expect("writer failed");
            }
        });
    }
    for _ in 0..4 {
        let stm = stm.clone();
        let torn = torn.clone();
        pool.execute(move || {
            for _ in 0..500 {
                let (a, b) = stm
                    .execute(|tx| Ok((tx.load(x)?, tx.load(y)?)))
                    .expect("reader failed");
                if a != b {
                    torn.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }
    pool.join();

    assert_eq!(pool.panic_count(), 0);
    assert_eq!(torn.load(Ordering::SeqCst), 0);
    assert_eq!(x.load(), y.load());
}

#[test]
fn test_write_set_reallocation_restarts_and_completes() {
    let config = StmConfig {
        write_set_size: 4,
        ..small_config()
    };
    let stm = engine(config);
    // 64-byte strides: every store takes a distinct lock and cache line
    let base = stm.alloc_words(64).expect("alloc failed");

    let reallocs = std::cell::Cell::new(0);
    stm.execute(|tx| {
        for i in 0..8 {
            tx.store(base.add(i * 8), i as Word)?;
        }
        reallocs.set(tx.stats().restarts(RestartReason::Reallocate));
        Ok(())
    })
    .expect("transaction failed");

    assert_eq!(reallocs.get(), 1);
    for i in 0..8 {
        assert_eq!(base.add(i * 8).load(), i as Word);
    }
}

#[test]
fn test_read_only_transaction_is_promoted_on_store() {
    let stm = engine(small_config());
    let x = stm.alloc_words(1).expect("alloc failed");
    x.store(7);

    let promoted = std::cell::Cell::new(0);
    stm.execute_props(TxProps { read_only: true, ..TxProps::default() }, |tx| {
        let v = tx.load(x)?;
        tx.store(x, v + 1)?;
        promoted.set(tx.stats().restarts(RestartReason::NotReadonly));
        Ok(())
    })
    .expect("transaction failed");

    assert_eq!(promoted.get(), 1);
    assert_eq!(x.load(), 8);
}

#[test]
fn test_snapshot_extension_succeeds_when_reads_are_untouched() {
    let stm = engine(small_config());
    let a = stm.alloc_words(1).expect("alloc failed");
    let b = stm.alloc_words(1).expect("alloc failed");
    a.store(10);
    b.store(20);

    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let writer = {
        let stm = stm.clone();
        std::thread::spawn(move || {
            started_rx.recv().expect("reader never started");
            stm.execute(|tx| {
                let v = tx.load(b)?;
                tx.store(b, v + 1)
            })
            .expect("writer failed");
            done_tx.send(()).expect("reader went away");
        })
    };

    let attempts = AtomicUsize::new(0);
    let (va, vb) = stm
        .execute(|tx| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            let va = tx.load(a)?;
            if n == 0 {
                started_tx.send(()).ok();
                done_rx.recv().ok();
            }
            // b moved past our snapshot; the window extends because a is
            // still unchanged
            let vb = tx.load(b)?;
            Ok((va, vb))
        })
        .expect("reader failed");
    writer.join().expect("writer panicked");

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!((va, vb), (10, 21));
}

#[test]
fn test_snapshot_extension_fails_when_a_read_was_overwritten() {
    let stm = engine(small_config());
    let a = stm.alloc_words(1).expect("alloc failed");
    let b = stm.alloc_words(1).expect("alloc failed");
    a.store(10);
    b.store(20);

    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let writer = {
        let stm = stm.clone();
        std::thread::spawn(move || {
            started_rx.recv().expect("reader never started");
            stm.execute(|tx| {
                let va = tx.load(a)?;
                tx.store(a, va + 1)?;
                let vb = tx.load(b)?;
                tx.store(b, vb + 1)
            })
            .expect("writer failed");
            done_tx.send(()).expect("reader went away");
        })
    };

    let attempts = AtomicUsize::new(0);
    let validate_aborts = std::cell::Cell::new(0);
    let (va, vb) = stm
        .execute(|tx| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            let va = tx.load(a)?;
            if n == 0 {
                started_tx.send(()).ok();
                done_rx.recv().ok();
            }
            let vb = tx.load(b)?;
            validate_aborts.set(tx.stats().restarts(RestartReason::ValidateRead));
            Ok((va, vb))
        })
        .expect("reader failed");
    writer.join().expect("writer panicked");

    // the first attempt read a pre-update a, so it could not extend
    assert!(attempts.load(Ordering::SeqCst) >= 2);
    assert!(validate_aborts.get() >= 1);
    assert_eq!((va, vb), (11, 21));
}

#[test]
fn test_isolation_disabled_uses_private_pseudo_locks() {
    let config = StmConfig {
        isolation: false,
        ..small_config()
    };
    let stm = engine(config);
    let x = stm.alloc_words(1).expect("alloc failed");
    x.store(0xFF00);

    let seen = stm
        .execute(|tx| {
            tx.store2(x, 0x00AA, 0x00FF)?;
            let first = tx.load(x)?;
            tx.store(x, first + 1)?;
            tx.load(x)
        })
        .expect("transaction failed");

    assert_eq!(seen, 0xFFAB);
    assert_eq!(x.load(), 0xFFAB);
}

#[test]
fn test_stack_writes_bypass_the_engine() {
    let stm = engine(small_config());

    let out = stm
        .execute(|tx| {
            let mut local: Word = 5;
            let a = Addr::new(&mut local as *mut Word);
            tx.store(a, 9)?;
            // zero-mask stack stores are no-ops
            tx.store2(a, 0xFFFF, 0)?;
            tx.load(a)
        })
        .expect("transaction failed");

    assert_eq!(out, 9);
}

#[test]
fn test_random_masked_stores_match_a_sequential_model() {
    let stm = engine(small_config());
    let w = stm.alloc_words(1).expect("alloc failed");
    let seed: Word = rand_utils::random::word();
    w.store(seed);
    let mut model = seed;

    for _ in 0..64 {
        let ops: Vec<(Word, Word)> = (0..4).map(|_| rand_utils::random::masked_store()).collect();

        let ops_in_tx = ops.clone();
        stm.execute(move |tx| {
            for (value, mask) in &ops_in_tx {
                tx.store2(w, *value, *mask)?;
            }
            Ok(())
        })
        .expect("transaction failed");

        for (value, mask) in ops {
            model = (model & !mask) | (value & mask);
        }
        assert_eq!(w.load(), model);
    }
}

#[test]
fn test_typed_wrappers_and_byte_copies() {
    let stm = engine(small_config());
    let buf = stm.alloc_words(4).expect("alloc failed");
    for i in 0..4 {
        buf.add(i).store(0);
    }
    let bytes = buf.as_ptr() as *mut u8;

    stm.execute(|tx| {
        tx.store_u8(unsafe { bytes.add(3) }, 0xAB)?;
        // crosses the first word boundary
        tx.store_u32(unsafe { bytes.add(6) } as *mut u32, 0xDEAD_BEEF)?;
        tx.store_bytes(unsafe { bytes.add(16) }, b"redo")?;
        Ok(())
    })
    .expect("transaction failed");

    let read_back = stm
        .execute(|tx| {
            let byte = tx.load_u8(unsafe { bytes.add(3) })?;
            let wide = tx.load_u32(unsafe { bytes.add(6) } as *const u32)?;
            let mut tail = [0u8; 4];
            tx.load_bytes(unsafe { bytes.add(16) }, &mut tail)?;
            Ok((byte, wide, tail))
        })
        .expect("transaction failed");

    assert_eq!(read_back, (0xAB, 0xDEAD_BEEF, *b"redo"));
}

#[test]
fn test_user_retry_reruns_the_body() {
    let stm = engine(small_config());
    let x = stm.alloc_words(1).expect("alloc failed");
    x.store(0);

    let attempts = AtomicUsize::new(0);
    stm.execute(|tx| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        tx.store(x, n as Word)?;
        if n < 2 {
            return Err(tx.retry());
        }
        Ok(())
    })
    .expect("transaction failed");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(x.load(), 2);
}

#[test]
fn test_user_abort_rolls_back_and_surfaces() {
    let stm = engine(small_config());
    let x = stm.alloc_words(1).expect("alloc failed");
    x.store(77);

    let result: Result<(), _> = stm.execute(|tx| {
        tx.store(x, 0)?;
        Err(tx.abort())
    });

    assert!(matches!(result, Err(TransactionError::Abort)));
    assert_eq!(x.load(), 77);
}
