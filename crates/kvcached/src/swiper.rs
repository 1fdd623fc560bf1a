//! The swiper: a single-threaded background routine enforcing expiration
//! and 70%-capacity eviction.
//!
//! Runs as one dedicated, named OS thread doing periodic work, rather
//! than a pool of slots, since the swiper is explicitly single-threaded
//! by design.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::table::Table;

/// Current wall-clock second since the Unix epoch. All expiration math in
/// [`crate::table`] is relative to this.
pub fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

/// `(txid, idx)`, ordered by txid so a `BinaryHeap` can be used as a
/// bounded *min*-heap via `Reverse`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    txid: u64,
    idx: usize,
}

/// One pass of the swiper over `table`. Exposed standalone (not only via
/// [`Swiper::spawn`]'s loop) so tests and the CLI's shutdown path can
/// drive a deterministic pass without waiting on a timer.
pub fn sweep_once(table: &Table, pqueue_size: usize) {
    let now = now_epoch();

    // Pass 1: expire, and collect the `pqueue_size` least-recently-touched
    // survivors into a bounded max-heap (largest txid on top, evicted when
    // a smaller candidate arrives) so only the smallest-txid entries
    // remain — those are the eviction candidates for pass 2.
    let mut retained: BinaryHeap<Candidate> = BinaryHeap::with_capacity(pqueue_size);

    table.for_each_occupied(|idx, txid, expiration_epoch| {
        if expiration_epoch < now {
            table.delete_bucket_for_expiration(idx);
            return;
        }
        let candidate = Candidate { txid, idx };
        if retained.len() < pqueue_size {
            retained.push(candidate);
        } else if let Some(max) = retained.peek().copied() {
            if candidate.txid < max.txid {
                retained.pop();
                retained.push(candidate);
            }
        }
    });

    // Pass 2: if over 70% capacity, evict ascending by txid until under
    // the threshold or the heap is drained.
    let threshold = (table.capacity() as f64 * 0.7) as usize;
    if table.objcnt() > threshold {
        let candidates: Vec<Candidate> = retained.into_sorted_vec();
        for candidate in candidates {
            if table.objcnt() <= threshold {
                break;
            }
            table.delete_bucket_if_txid_unchanged(candidate.idx, candidate.txid);
        }
    }

    // Pass 3: only the swiper may decrease `longest_probes`.
    table.recompute_longest_probes();
}

/// Handle to the background swiper thread.
pub struct Swiper {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Swiper {
    /// Spawns the swiper thread, sweeping `table` every `interval` until
    /// [`Swiper::stop`] is called or the handle is dropped.
    pub fn spawn(table: Arc<Table>, interval: Duration, pqueue_size: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("kvcached-swiper".to_string())
            .spawn(move || {
                while !stop_for_thread.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if stop_for_thread.load(Ordering::Relaxed) {
                        break;
                    }
                    log::debug!(
                        "swiper pass: objcnt={} longest_probes={}",
                        table.objcnt(),
                        table.longest_probes()
                    );
                    sweep_once(&table, pqueue_size);
                }
            })
            .expect("failed to spawn swiper thread");

        Swiper { stop, handle: Some(handle) }
    }

    /// Signals the swiper thread to stop and joins it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Swiper {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
