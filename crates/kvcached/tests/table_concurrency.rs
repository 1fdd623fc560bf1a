//! Multi-threaded correctness tests for the cache table: concurrent
//! readers must never observe a torn write, and concurrent writers to
//! disjoint keys must not lose updates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use kvcached::table::{Table, UpsertOp};
use kvcached::types::Value;

fn bytes_of(n: usize) -> Vec<u8> {
    vec![n as u8; 64]
}

/// Readers racing a writer updating the same key in place must always see
/// either the old value or the new one in full, never a mix of the two.
#[test]
fn test_concurrent_readers_never_see_a_torn_value() {
    let table = Arc::new(Table::new(256, 24, 128));
    table
        .upsert(b"hot", UpsertOp::Set { value: Value::Bytes(bytes_of(0)), flags: 0, expiration: 0, cas: None })
        .expect("seed insert");

    let writer_table = Arc::clone(&table);
    let writer = thread::Builder::new()
        .name("concurrency-test-writer".into())
        .spawn(move || {
            for i in 1..2000usize {
                writer_table
                    .upsert(b"hot", UpsertOp::Set { value: Value::Bytes(bytes_of(i)), flags: 0, expiration: 0, cas: None })
                    .expect("update succeeds");
            }
        })
        .expect("spawn writer");

    let mut readers = Vec::new();
    for _ in 0..4 {
        let reader_table = Arc::clone(&table);
        readers.push(
            thread::Builder::new()
                .name("concurrency-test-reader".into())
                .spawn(move || {
                    for _ in 0..2000 {
                        if let Some(got) = reader_table.get(b"hot") {
                            if let Value::Bytes(bytes) = got.value {
                                let first = bytes[0];
                                assert!(
                                    bytes.iter().all(|&b| b == first),
                                    "observed a torn value: {bytes:?}"
                                );
                            }
                        }
                    }
                })
                .expect("spawn reader"),
        );
    }

    writer.join().expect("writer thread panicked");
    for reader in readers {
        reader.join().expect("reader thread panicked");
    }
}

/// Concurrent writers to disjoint keys must not clobber each other's
/// inserts or corrupt the table's occupancy accounting.
#[test]
fn test_concurrent_disjoint_inserts_all_land() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;

    let table = Arc::new(Table::new((THREADS * PER_THREAD * 2) as usize, 24, 128));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::Builder::new()
                .name(format!("concurrency-test-writer-{t}"))
                .spawn(move || {
                    barrier.wait();
                    for i in 0..PER_THREAD {
                        let key = format!("t{t}-k{i}").into_bytes();
                        table
                            .upsert(&key, UpsertOp::Set { value: Value::Bytes(bytes_of(i)), flags: 0, expiration: 0, cas: None })
                            .unwrap_or_else(|e| panic!("insert of {key:?} failed: {e:?}"));
                    }
                })
                .expect("spawn writer")
        })
        .collect();

    for h in handles {
        h.join().expect("writer thread panicked");
    }

    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let key = format!("t{t}-k{i}").into_bytes();
            let got = table.get(&key).unwrap_or_else(|| panic!("missing key {key:?} after concurrent insert"));
            assert_eq!(got.value, Value::Bytes(bytes_of(i)));
        }
    }
    assert_eq!(table.objcnt(), THREADS * PER_THREAD);
}

/// Concurrent `incr` on one key must account for every increment: no
/// lost updates under contention.
#[test]
fn test_concurrent_incr_loses_no_updates() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let table = Arc::new(Table::new(64, 24, 48));
    table
        .upsert(b"counter", UpsertOp::Set { value: Value::Bytes(b"0".to_vec()), flags: 0, expiration: 0, cas: None })
        .expect("seed insert");

    let successes = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let successes = Arc::clone(&successes);
            thread::Builder::new()
                .name(format!("concurrency-test-incr-{t}"))
                .spawn(move || {
                    for _ in 0..PER_THREAD {
                        if table
                            .upsert(b"counter", UpsertOp::IncrDecr { addition: 1, initial: None, expiration: 0 })
                            .is_ok()
                        {
                            successes.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
                .expect("spawn incrementer")
        })
        .collect();

    for h in handles {
        h.join().expect("incrementer thread panicked");
    }

    let got = table.get(b"counter").expect("counter key present");
    let expected = successes.load(Ordering::Relaxed) as u64;
    assert_eq!(got.value, Value::Numeric(expected), "lost updates under concurrent incr");
}
