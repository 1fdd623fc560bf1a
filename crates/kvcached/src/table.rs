//! The concurrent cache table: an open-addressed, quadratic-probing hash
//! table with a per-bucket atomic state machine and RCU-style read-side
//! quiescence.
//!
//! Grounded on the atomics-heavy on-disk `ValueTable` in the reference
//! parity-db implementation (`AtomicU64`/`AtomicBool` fields guarding a
//! shared body) for the *shape* of a lock-free table, and on
//! `crossbeam_epoch` for the quiescence mechanism itself. Where the source
//! implementation stashes an in-place update's pre-image into one of 64
//! shared scratch slots so concurrent readers can still see it, this
//! table instead swaps an `epoch::Atomic<BucketBody>` pointer: a reader
//! that loaded the old pointer under its own pin keeps a perfectly valid
//! view of the pre-image for as long as it holds the guard, and the
//! writer defers reclaiming the old body until no such reader can still
//! be pinned to it. The reference implementation's scratch pool exists to
//! avoid allocator pressure on the hot path; with a lock-free allocator
//! available, a per-update heap allocation is a sound substitute, and
//! `crossbeam_epoch::Owned` is that allocator.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

use crate::types::{Extras, GetResult, Value};

// ── Bucket state machine ─────────────────────────────────────────────────────

const MAGIC_EMPTY: u8 = 0x00;
const MAGIC_OCCUPIED: u8 = 0x01;
const MAGIC_TOMBSTONE: u8 = 0x02;
const MAGIC_INSERTING: u8 = 0x80;
const MAGIC_DELETING: u8 = 0x82;
const MAGIC_UPDATING: u8 = 0x83;

/// A successful cache write's outcome: the new cas token and whatever the
/// response needs to echo back (e.g. the post-incr numeric value).
#[derive(Clone, Debug)]
pub struct WriteOutcome {
    pub cas: u64,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheError {
    KeyNotFound,
    KeyExists,
    NotStored,
    NonNumeric,
    Busy,
}

struct BucketBody {
    key: Vec<u8>,
    value: Value,
    flags: u32,
    expiration_epoch: u64,
    cas: u64,
    probe: usize,
}

struct Bucket {
    magic: std::sync::atomic::AtomicU8,
    /// Stamped on every read or write that touches the entry; the
    /// swiper's tie-break for choosing evictees.
    txid: AtomicU64,
    body: Atomic<BucketBody>,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            magic: std::sync::atomic::AtomicU8::new(MAGIC_EMPTY),
            txid: AtomicU64::new(0),
            body: Atomic::null(),
        }
    }
}

// ── Capacity encoding ──────────────────────────────

/// Computes `(capacity_clz, capacity_ms4b, capacity)` such that
/// `capacity = (1 << (64 - capacity_clz - 4)) * capacity_ms4b` and
/// `capacity >= target`. `capacity_ms4b` is the table's top 4 significant
/// bits (kept in `8..=15` so the mantissa is always normalized).
fn encode_capacity(target: u64) -> (u32, u64, u64) {
    let target = target.max(16);
    let highest_bit = 63 - target.leading_zeros();
    let shift = highest_bit.saturating_sub(3);
    let mut ms4b = (target + (1u64 << shift) - 1) >> shift;
    if ms4b > 15 {
        return encode_capacity_with_shift(target, shift + 1);
    }
    if ms4b < 8 {
        ms4b = 8;
    }
    let capacity = ms4b << shift;
    let clz = 64 - (shift + 4);
    (clz, ms4b, capacity)
}

fn encode_capacity_with_shift(target: u64, shift: u32) -> (u32, u64, u64) {
    let mut ms4b = (target + (1u64 << shift) - 1) >> shift;
    if ms4b > 15 {
        ms4b = 15;
    }
    if ms4b < 8 {
        ms4b = 8;
    }
    let capacity = ms4b << shift;
    let clz = 64 - (shift + 4);
    (clz, ms4b, capacity)
}

/// `fast_scale(x) = ((x & mask) * ms4b) >> 4`.
#[inline]
fn fast_scale(x: u64, mask: u64, ms4b: u64) -> usize {
    (((x & mask) * ms4b) >> 4) as usize
}

/// Lazily produces the probe sequence for a hash `h`: groups of 4 linear
/// slots per outer step, the next group's base index derived by folding
/// the upper 32 bits of `h` into the probing key.
struct ProbeSequence {
    probing_key: u64,
    high_bits: u64,
    mask: u64,
    ms4b: u64,
    capacity: usize,
    step_base: usize,
    within_step: usize,
    probe: usize,
}

impl ProbeSequence {
    fn new(h: u64, mask: u64, ms4b: u64, capacity: usize) -> Self {
        let step_base = fast_scale(h, mask, ms4b);
        ProbeSequence {
            probing_key: h,
            high_bits: h >> 32,
            mask,
            ms4b,
            capacity,
            step_base,
            within_step: 0,
            probe: 0,
        }
    }
}

impl Iterator for ProbeSequence {
    /// `(table index, probe distance)`.
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.within_step == 4 {
            self.probing_key = self.probing_key.wrapping_add(self.high_bits);
            self.step_base = fast_scale(self.probing_key, self.mask, self.ms4b);
            self.within_step = 0;
        }
        let idx = (self.step_base + self.within_step) % self.capacity;
        let probe = self.probe;
        self.within_step += 1;
        self.probe += 1;
        Some((idx, probe))
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

pub struct Table {
    buckets: Vec<Bucket>,
    capacity: usize,
    mask: u64,
    ms4b: u64,
    inline_keylen: usize,
    inline_vallen: usize,
    probe_stats_size: usize,

    longest_probes: AtomicUsize,
    probe_stats: Vec<AtomicUsize>,
    objcnt: AtomicUsize,
    inline_acc_keylen: AtomicUsize,
    inline_acc_vallen: AtomicUsize,
    ninline_keycnt: AtomicUsize,
    ninline_valcnt: AtomicUsize,
    ninline_keylen: AtomicUsize,
    ninline_vallen: AtomicUsize,
    txid: AtomicU64,
}

impl Table {
    /// `capacity = round_up(num_objects * 10 / 7)`.
    pub fn new(num_objects: usize, inline_keylen: usize, inline_vallen: usize) -> Self {
        let target = (num_objects as u64).saturating_mul(10) / 7;
        let (clz, ms4b, capacity_u64) = encode_capacity(target.max(16));
        let capacity = capacity_u64 as usize;
        let mask = if clz >= 64 { 0 } else { (1u64 << (64 - clz)).wrapping_sub(1) };

        let mut buckets = Vec::with_capacity(capacity);
        buckets.resize_with(capacity, Bucket::new);

        let probe_stats_size = 512;
        let mut probe_stats = Vec::with_capacity(probe_stats_size);
        probe_stats.resize_with(probe_stats_size, || AtomicUsize::new(0));

        Table {
            buckets,
            capacity,
            mask,
            ms4b,
            inline_keylen,
            inline_vallen,
            probe_stats_size,
            longest_probes: AtomicUsize::new(0),
            probe_stats,
            objcnt: AtomicUsize::new(0),
            inline_acc_keylen: AtomicUsize::new(0),
            inline_acc_vallen: AtomicUsize::new(0),
            ninline_keycnt: AtomicUsize::new(0),
            ninline_valcnt: AtomicUsize::new(0),
            ninline_keylen: AtomicUsize::new(0),
            ninline_vallen: AtomicUsize::new(0),
            txid: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn objcnt(&self) -> usize {
        self.objcnt.load(Ordering::Relaxed)
    }

    pub fn longest_probes(&self) -> usize {
        self.longest_probes.load(Ordering::Relaxed)
    }

    fn next_txid(&self) -> u64 {
        self.txid.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn hash(key: &[u8]) -> u64 {
        use std::hash::{BuildHasher, Hasher};
        let state = ahash::RandomState::with_seeds(0x517c_c1b7, 0x2745_a3d4, 0x1234_5678, 0xabcd_ef01);
        let mut hasher = state.build_hasher();
        hasher.write(key);
        hasher.finish()
    }

    fn probe_limit(&self) -> usize {
        self.probe_stats_size
    }

    fn record_probe(&self, probe: usize) {
        if probe < self.probe_stats.len() {
            self.probe_stats[probe].fetch_add(1, Ordering::Relaxed);
        }
        let mut cur = self.longest_probes.load(Ordering::Relaxed);
        while probe > cur {
            match self.longest_probes.compare_exchange_weak(
                cur,
                probe,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    fn unrecord_probe(&self, probe: usize) {
        if probe < self.probe_stats.len() {
            self.probe_stats[probe].fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Recomputes `longest_probes` by scanning `probe_stats` downward for
    /// the highest non-zero slot. Only the
    /// swiper calls this; it is the only path allowed to *decrease*
    /// `longest_probes`.
    pub(crate) fn recompute_longest_probes(&self) {
        for i in (0..self.probe_stats.len()).rev() {
            if self.probe_stats[i].load(Ordering::Relaxed) > 0 {
                self.longest_probes.store(i, Ordering::Relaxed);
                return;
            }
        }
        self.longest_probes.store(0, Ordering::Relaxed);
    }

    fn account_store(&self, key_len: usize, value_len: usize, is_numeric: bool) {
        if key_len <= self.inline_keylen {
            self.inline_acc_keylen.fetch_add(key_len, Ordering::Relaxed);
        } else {
            self.ninline_keycnt.fetch_add(1, Ordering::Relaxed);
            self.ninline_keylen.fetch_add(key_len, Ordering::Relaxed);
        }
        if !is_numeric {
            if value_len <= self.inline_vallen {
                self.inline_acc_vallen.fetch_add(value_len, Ordering::Relaxed);
            } else {
                self.ninline_valcnt.fetch_add(1, Ordering::Relaxed);
                self.ninline_vallen.fetch_add(value_len, Ordering::Relaxed);
            }
        }
    }

    fn unaccount_store(&self, key_len: usize, value_len: usize, is_numeric: bool) {
        if key_len <= self.inline_keylen {
            self.inline_acc_keylen.fetch_sub(key_len, Ordering::Relaxed);
        } else {
            self.ninline_keycnt.fetch_sub(1, Ordering::Relaxed);
            self.ninline_keylen.fetch_sub(key_len, Ordering::Relaxed);
        }
        if !is_numeric {
            if value_len <= self.inline_vallen {
                self.inline_acc_vallen.fetch_sub(value_len, Ordering::Relaxed);
            } else {
                self.ninline_valcnt.fetch_sub(1, Ordering::Relaxed);
                self.ninline_vallen.fetch_sub(value_len, Ordering::Relaxed);
            }
        }
    }

    fn probe_seq(&self, key: &[u8]) -> ProbeSequence {
        let h = Self::hash(key);
        ProbeSequence::new(h, self.mask, self.ms4b, self.capacity)
    }

    // ── get ──────────────────────────────────────────────────────────────────

    /// Walks the probe sequence up to `longest_probes`. Readers pin a single epoch guard for the probe and
    /// never allocate or block.
    pub fn get(&self, key: &[u8]) -> Option<GetResult> {
        let guard = &epoch::pin();
        let limit = self.longest_probes();
        for (idx, probe) in self.probe_seq(key) {
            if probe > limit {
                break;
            }
            let bucket = &self.buckets[idx];
            let magic = bucket.magic.load(Ordering::Acquire);
            match magic {
                MAGIC_EMPTY => break,
                MAGIC_TOMBSTONE | MAGIC_INSERTING | MAGIC_DELETING => continue,
                MAGIC_OCCUPIED | MAGIC_UPDATING => {
                    let shared = bucket.body.load(Ordering::Acquire, guard);
                    if shared.is_null() {
                        continue;
                    }
                    // Safety: the body pointer is only ever installed by a
                    // writer holding a valid `Owned<BucketBody>`, and this
                    // guard is pinned for the read, so the pointee is kept
                    // alive at least until the guard is dropped.
                    let body = unsafe { shared.deref() };
                    if body.key == key {
                        bucket.txid.store(self.next_txid(), Ordering::Release);
                        return Some(GetResult {
                            value: body.value.clone(),
                            flags: body.flags,
                            cas: body.cas,
                        });
                    }
                }
                _ => continue,
            }
        }
        None
    }

    // ── delete ───────────────────────────────────────────────────────────────

    pub fn delete(&self, key: &[u8]) -> Result<(), CacheError> {
        let guard = &epoch::pin();
        let limit = self.probe_limit();
        for (idx, probe) in self.probe_seq(key) {
            if probe >= limit {
                return Err(CacheError::KeyNotFound);
            }
            let bucket = &self.buckets[idx];
            let magic = bucket.magic.load(Ordering::Acquire);
            match magic {
                MAGIC_EMPTY => return Err(CacheError::KeyNotFound),
                MAGIC_TOMBSTONE | MAGIC_INSERTING | MAGIC_DELETING | MAGIC_UPDATING => continue,
                MAGIC_OCCUPIED => {
                    let shared = bucket.body.load(Ordering::Acquire, guard);
                    if shared.is_null() {
                        continue;
                    }
                    let body = unsafe { shared.deref() };
                    if body.key != key {
                        continue;
                    }
                    if bucket
                        .magic
                        .compare_exchange(
                            MAGIC_OCCUPIED,
                            MAGIC_DELETING,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_err()
                    {
                        // Lost the race; caller can retry the whole probe walk.
                        continue;
                    }
                    self.quiesce_and_retire(bucket, guard);
                    let probe_recorded = body.probe;
                    let key_len = body.key.len();
                    let value_len = body.value.len();
                    let is_numeric = body.value.is_numeric();
                    self.unrecord_probe(probe_recorded);
                    self.unaccount_store(key_len, value_len, is_numeric);
                    self.objcnt.fetch_sub(1, Ordering::Relaxed);
                    bucket.magic.store(MAGIC_TOMBSTONE, Ordering::Release);
                    return Ok(());
                }
                _ => continue,
            }
        }
        Err(CacheError::KeyNotFound)
    }

    /// Same CAS-to-deleting discipline as [`Table::delete`] but refuses to
    /// act if the bucket's txid moved since `observed_txid` was sampled,
    /// i.e. the bucket was mutated again between scan and evict.
    pub(crate) fn delete_bucket_if_txid_unchanged(&self, idx: usize, observed_txid: u64) -> bool {
        let guard = &epoch::pin();
        let bucket = &self.buckets[idx];
        if bucket.txid.load(Ordering::Acquire) != observed_txid {
            return false;
        }
        if bucket
            .magic
            .compare_exchange(MAGIC_OCCUPIED, MAGIC_DELETING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        if bucket.txid.load(Ordering::Acquire) != observed_txid {
            // Touched between the state CAS and this check; undo and bail.
            bucket.magic.store(MAGIC_OCCUPIED, Ordering::Release);
            return false;
        }
        let shared = bucket.body.load(Ordering::Acquire, guard);
        if !shared.is_null() {
            let body = unsafe { shared.deref() };
            self.unrecord_probe(body.probe);
            self.unaccount_store(body.key.len(), body.value.len(), body.value.is_numeric());
            self.objcnt.fetch_sub(1, Ordering::Relaxed);
        }
        self.quiesce_and_retire(bucket, guard);
        bucket.magic.store(MAGIC_TOMBSTONE, Ordering::Release);
        true
    }

    /// Forcibly deletes an occupied bucket regardless of txid, bypassing
    /// the tie-break.
    pub(crate) fn delete_bucket_for_expiration(&self, idx: usize) {
        let guard = &epoch::pin();
        let bucket = &self.buckets[idx];
        if bucket
            .magic
            .compare_exchange(MAGIC_OCCUPIED, MAGIC_DELETING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let shared = bucket.body.load(Ordering::Acquire, guard);
        if !shared.is_null() {
            let body = unsafe { shared.deref() };
            self.unrecord_probe(body.probe);
            self.unaccount_store(body.key.len(), body.value.len(), body.value.is_numeric());
            self.objcnt.fetch_sub(1, Ordering::Relaxed);
        }
        self.quiesce_and_retire(bucket, guard);
        bucket.magic.store(MAGIC_TOMBSTONE, Ordering::Release);
    }

    fn quiesce_and_retire(&self, bucket: &Bucket, guard: &epoch::Guard) {
        let old = bucket.body.swap(Shared::null(), Ordering::AcqRel, guard);
        if !old.is_null() {
            // Safety: `old` was installed by a prior writer and is no
            // longer reachable from `bucket.body`; deferring its
            // destruction to the epoch collector is exactly
            // `synchronize_rcu` for this blob.
            unsafe {
                guard.defer_destroy(old);
            }
        }
    }

    // ── upsert ───────────────────────────────────────────────────────────────

    /// Inserts or updates an entry. `op` decides whether a missing key may
    /// be inserted and how an existing value is transformed; see
    /// [`crate::command`] for the per-verb glue.
    pub fn upsert(&self, key: &[u8], op: UpsertOp) -> Result<WriteOutcome, CacheError> {
        let guard = &epoch::pin();
        let limit = self.probe_limit();

        // A claim attempt below can lose a race to another writer for the
        // same empty/tombstone slot; on that loss the slot's state has
        // moved out from under us, so the whole probe sequence is re-walked
        // from scratch rather than failing or clobbering whoever won.
        loop {
            let mut first_empty_or_tombstone: Option<(usize, usize, u8)> = None;

            for (idx, probe) in self.probe_seq(key) {
                if probe >= limit {
                    return Err(CacheError::Busy);
                }
                let bucket = &self.buckets[idx];
                let magic = bucket.magic.load(Ordering::Acquire);
                match magic {
                    MAGIC_EMPTY => {
                        if first_empty_or_tombstone.is_none() {
                            first_empty_or_tombstone = Some((idx, probe, MAGIC_EMPTY));
                        }
                        break;
                    }
                    MAGIC_TOMBSTONE => {
                        if first_empty_or_tombstone.is_none() {
                            first_empty_or_tombstone = Some((idx, probe, MAGIC_TOMBSTONE));
                        }
                        continue;
                    }
                    MAGIC_INSERTING | MAGIC_DELETING | MAGIC_UPDATING => continue,
                    MAGIC_OCCUPIED => {
                        let shared = bucket.body.load(Ordering::Acquire, guard);
                        if shared.is_null() {
                            continue;
                        }
                        let body = unsafe { shared.deref() };
                        if body.key == key {
                            return self.apply_update(bucket, body, key, op, guard);
                        }
                    }
                    _ => continue,
                }
            }

            match (first_empty_or_tombstone, op.allows_insert()) {
                (Some((idx, probe, expected_magic)), true) => {
                    match self.apply_insert(idx, probe, expected_magic, key, op, guard) {
                        Err(CacheError::Busy) => continue,
                        other => return other,
                    }
                }
                (Some(_), false) => return Err(op.missing_key_error()),
                (None, _) => return Err(CacheError::Busy),
            }
        }
    }

    fn apply_insert(
        &self,
        idx: usize,
        probe: usize,
        expected_magic: u8,
        key: &[u8],
        op: UpsertOp,
        guard: &epoch::Guard,
    ) -> Result<WriteOutcome, CacheError> {
        let bucket = &self.buckets[idx];
        if bucket
            .magic
            .compare_exchange(expected_magic, MAGIC_INSERTING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(CacheError::Busy);
        }

        let (value, flags) = op.initial_value()?;
        let cas = self.next_txid();
        let expiration_epoch = op.expiration_epoch();
        let body = BucketBody {
            key: key.to_vec(),
            value,
            flags,
            expiration_epoch,
            cas,
            probe,
        };
        let key_len = body.key.len();
        let value_len = body.value.len();
        let is_numeric = body.value.is_numeric();
        let outcome = WriteOutcome { cas, value: body.value.clone() };

        bucket.body.store(Owned::new(body), Ordering::Release);
        bucket.txid.store(cas, Ordering::Release);
        bucket.magic.store(MAGIC_OCCUPIED, Ordering::Release);

        self.record_probe(probe);
        self.account_store(key_len, value_len, is_numeric);
        self.objcnt.fetch_add(1, Ordering::Relaxed);
        let _ = guard;
        Ok(outcome)
    }

    fn apply_update(
        &self,
        bucket: &Bucket,
        current: &BucketBody,
        key: &[u8],
        op: UpsertOp,
        guard: &epoch::Guard,
    ) -> Result<WriteOutcome, CacheError> {
        if let UpsertOp::Add { .. } = op {
            return Err(CacheError::NotStored);
        }
        if let UpsertOp::Set { cas: Some(expected), .. } = op {
            if expected != current.cas {
                return Err(CacheError::KeyExists);
            }
        }

        if bucket
            .magic
            .compare_exchange(MAGIC_OCCUPIED, MAGIC_UPDATING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(CacheError::Busy);
        }

        let cas = self.next_txid();
        let new_body = op.apply_to(current, key, cas)?;
        let key_len = new_body.key.len();
        let value_len = new_body.value.len();
        let is_numeric = new_body.value.is_numeric();
        let cas = new_body.cas;
        let outcome = WriteOutcome { cas, value: new_body.value.clone() };

        self.unaccount_store(current.key.len(), current.value.len(), current.value.is_numeric());
        let old = bucket.body.swap(Owned::new(new_body), Ordering::AcqRel, guard);
        self.account_store(key_len, value_len, is_numeric);
        bucket.txid.store(cas, Ordering::Release);
        bucket.magic.store(MAGIC_OCCUPIED, Ordering::Release);

        if !old.is_null() {
            // Safety: see `quiesce_and_retire` — same RCU contract applies
            // to an in-place update's pre-image.
            unsafe {
                guard.defer_destroy(old);
            }
        }
        Ok(outcome)
    }

    /// Full-table scan setting every occupied bucket's expiration to
    /// `now`.
    pub fn flush_all(&self, now: u64) {
        let guard = &epoch::pin();
        for bucket in &self.buckets {
            if bucket.magic.load(Ordering::Acquire) != MAGIC_OCCUPIED {
                continue;
            }
            if bucket
                .magic
                .compare_exchange(MAGIC_OCCUPIED, MAGIC_UPDATING, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let shared = bucket.body.load(Ordering::Acquire, guard);
            if shared.is_null() {
                bucket.magic.store(MAGIC_OCCUPIED, Ordering::Release);
                continue;
            }
            let current = unsafe { shared.deref() };
            let new_body = BucketBody {
                key: current.key.clone(),
                value: current.value.clone(),
                flags: current.flags,
                expiration_epoch: now,
                cas: current.cas,
                probe: current.probe,
            };
            let old = bucket.body.swap(Owned::new(new_body), Ordering::AcqRel, guard);
            bucket.magic.store(MAGIC_OCCUPIED, Ordering::Release);
            if !old.is_null() {
                unsafe {
                    guard.defer_destroy(old);
                }
            }
        }
    }

    // ── swiper support ───────────────────────────────────────────────────────

    /// Invokes `f(idx, txid, expiration_epoch)` for every occupied bucket;
    /// used by [`crate::swiper`] pass 1 without exposing bucket internals.
    pub(crate) fn for_each_occupied(&self, mut f: impl FnMut(usize, u64, u64)) {
        let guard = &epoch::pin();
        for (idx, bucket) in self.buckets.iter().enumerate() {
            if bucket.magic.load(Ordering::Acquire) != MAGIC_OCCUPIED {
                continue;
            }
            let shared = bucket.body.load(Ordering::Acquire, guard);
            if shared.is_null() {
                continue;
            }
            let body = unsafe { shared.deref() };
            f(idx, bucket.txid.load(Ordering::Acquire), body.expiration_epoch);
        }
    }
}

// ── Upsert operation descriptor ──────────────────────────────────────────────

/// Which op drove a `upsert` call, carrying the per-op extras needed by
/// [`Table::apply_insert`]/[`Table::apply_update`]. Constructed by [`crate::command`].
pub enum UpsertOp {
    Set { value: Value, flags: u32, expiration: u32, cas: Option<u64> },
    Add { value: Value, flags: u32, expiration: u32 },
    Replace { value: Value, flags: u32, expiration: u32 },
    Append { delta: Vec<u8>, expiration: u32 },
    Prepend { delta: Vec<u8>, expiration: u32 },
    IncrDecr { addition: i64, initial: Option<u64>, expiration: u32 },
    Touch { expiration: u32 },
}

impl UpsertOp {
    fn allows_insert(&self) -> bool {
        matches!(
            self,
            UpsertOp::Set { .. } | UpsertOp::Add { .. } | UpsertOp::IncrDecr { initial: Some(_), .. }
        )
    }

    fn missing_key_error(&self) -> CacheError {
        match self {
            UpsertOp::IncrDecr { .. } => CacheError::KeyNotFound,
            UpsertOp::Touch { .. } => CacheError::KeyNotFound,
            _ => CacheError::NotStored,
        }
    }

    fn expiration_epoch(&self) -> u64 {
        let ttl = match self {
            UpsertOp::Set { expiration, .. }
            | UpsertOp::Add { expiration, .. }
            | UpsertOp::Replace { expiration, .. }
            | UpsertOp::Append { expiration, .. }
            | UpsertOp::Prepend { expiration, .. }
            | UpsertOp::IncrDecr { expiration, .. }
            | UpsertOp::Touch { expiration } => *expiration,
        };
        crate::swiper::now_epoch() + ttl as u64
    }

    fn initial_value(&self) -> Result<(Value, u32), CacheError> {
        match self {
            UpsertOp::Set { value, flags, .. } => Ok((value.clone(), *flags)),
            UpsertOp::Add { value, flags, .. } => Ok((value.clone(), *flags)),
            UpsertOp::IncrDecr { addition, initial, .. } => {
                let seed = initial.ok_or(CacheError::KeyNotFound)?;
                let seeded = if *addition >= 0 {
                    seed.saturating_add(*addition as u64)
                } else {
                    seed.saturating_sub((-*addition) as u64)
                };
                Ok((Value::Numeric(seeded), 0))
            }
            _ => Err(CacheError::NotStored),
        }
    }

    fn apply_to(&self, current: &BucketBody, key: &[u8], cas: u64) -> Result<BucketBody, CacheError> {
        match self {
            UpsertOp::Set { value, flags, expiration, .. } => Ok(BucketBody {
                key: key.to_vec(),
                value: value.clone(),
                flags: *flags,
                expiration_epoch: crate::swiper::now_epoch() + *expiration as u64,
                cas,
                probe: current.probe,
            }),
            UpsertOp::Replace { value, flags, expiration } => Ok(BucketBody {
                key: key.to_vec(),
                value: value.clone(),
                flags: *flags,
                expiration_epoch: crate::swiper::now_epoch() + *expiration as u64,
                cas,
                probe: current.probe,
            }),
            UpsertOp::Append { delta, expiration } | UpsertOp::Prepend { delta, expiration } => {
                let prepend = matches!(self, UpsertOp::Prepend { .. });
                let new_value = concat_value(&current.value, delta, prepend);
                Ok(BucketBody {
                    key: key.to_vec(),
                    value: new_value,
                    flags: current.flags,
                    expiration_epoch: crate::swiper::now_epoch() + *expiration as u64,
                    cas,
                    probe: current.probe,
                })
            }
            UpsertOp::IncrDecr { addition, initial, expiration } => {
                let n = match &current.value {
                    Value::Numeric(n) => *n,
                    Value::Bytes(b) => parse_decimal_u64(b).ok_or(CacheError::NonNumeric)?,
                };
                let new_n = if *addition >= 0 {
                    n.saturating_add(*addition as u64)
                } else {
                    n.saturating_sub((-*addition) as u64)
                };
                let expiration_epoch = if initial.is_some() {
                    crate::swiper::now_epoch() + *expiration as u64
                } else {
                    current.expiration_epoch
                };
                Ok(BucketBody {
                    key: key.to_vec(),
                    value: Value::Numeric(new_n),
                    flags: current.flags,
                    expiration_epoch,
                    cas,
                    probe: current.probe,
                })
            }
            UpsertOp::Touch { expiration } => Ok(BucketBody {
                key: key.to_vec(),
                value: current.value.clone(),
                flags: current.flags,
                expiration_epoch: crate::swiper::now_epoch() + *expiration as u64,
                cas,
                probe: current.probe,
            }),
            UpsertOp::Add { .. } => Err(CacheError::NotStored),
        }
    }
}

/// `append`/`prepend` against either a numeric or byte-string current
/// value: a numeric value is first materialized
/// to decimal ASCII, then the concat proceeds as bytes and the bucket
/// becomes non-numeric.
fn concat_value(current: &Value, delta: &[u8], prepend: bool) -> Value {
    let base = current.to_wire_bytes();
    let mut out = Vec::with_capacity(base.len() + delta.len());
    if prepend {
        out.extend_from_slice(delta);
        out.extend_from_slice(&base);
    } else {
        out.extend_from_slice(&base);
        out.extend_from_slice(delta);
    }
    Value::Bytes(out)
}

fn parse_decimal_u64(b: &[u8]) -> Option<u64> {
    if b.is_empty() {
        return None;
    }
    let s = std::str::from_utf8(b).ok()?;
    s.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::new(64, 24, 48)
    }

    #[test]
    fn test_encode_capacity_meets_target() {
        for target in [16u64, 100, 1000, 1 << 20] {
            let (clz, ms4b, capacity) = encode_capacity(target);
            assert!(capacity >= target, "capacity {capacity} < target {target}");
            assert!((8..=15).contains(&ms4b));
            assert!(clz < 64);
        }
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let t = table();
        let outcome = t
            .upsert(
                b"k",
                UpsertOp::Set { value: Value::Bytes(b"v".to_vec()), flags: 7, expiration: 0, cas: None },
            )
            .expect("set succeeds");
        let got = t.get(b"k").expect("get hits");
        assert_eq!(got.value, Value::Bytes(b"v".to_vec()));
        assert_eq!(got.flags, 7);
        assert_eq!(got.cas, outcome.cas);
    }

    #[test]
    fn test_cas_mismatch_rejected() {
        let t = table();
        t.upsert(b"k", UpsertOp::Set { value: Value::Bytes(b"v".to_vec()), flags: 0, expiration: 0, cas: None })
            .unwrap();
        let result = t.upsert(
            b"k",
            UpsertOp::Set { value: Value::Bytes(b"x".to_vec()), flags: 0, expiration: 0, cas: Some(999) },
        );
        assert_eq!(result.unwrap_err(), CacheError::KeyExists);
        assert_eq!(t.get(b"k").unwrap().value, Value::Bytes(b"v".to_vec()));
    }

    #[test]
    fn test_append_prepend_associativity() {
        let t = table();
        t.upsert(b"k", UpsertOp::Set { value: Value::Bytes(b"a".to_vec()), flags: 0, expiration: 0, cas: None })
            .unwrap();
        t.upsert(b"k", UpsertOp::Append { delta: b"b".to_vec(), expiration: 0 }).unwrap();
        t.upsert(b"k", UpsertOp::Prepend { delta: b"c".to_vec(), expiration: 0 }).unwrap();
        assert_eq!(t.get(b"k").unwrap().value, Value::Bytes(b"cab".to_vec()));
    }

    #[test]
    fn test_add_on_existing_fails_not_stored() {
        let t = table();
        t.upsert(b"k", UpsertOp::Set { value: Value::Bytes(b"a".to_vec()), flags: 0, expiration: 0, cas: None })
            .unwrap();
        let result = t.upsert(b"k", UpsertOp::Add { value: Value::Bytes(b"x".to_vec()), flags: 0, expiration: 0 });
        assert_eq!(result.unwrap_err(), CacheError::NotStored);
    }

    #[test]
    fn test_replace_on_missing_fails_not_stored() {
        let t = table();
        let result =
            t.upsert(b"missing", UpsertOp::Replace { value: Value::Bytes(b"x".to_vec()), flags: 0, expiration: 0 });
        assert_eq!(result.unwrap_err(), CacheError::NotStored);
    }

    #[test]
    fn test_incr_without_initial_on_missing_fails_key_not_found() {
        let t = table();
        let result = t.upsert(b"missing", UpsertOp::IncrDecr { addition: 5, initial: None, expiration: 0 });
        assert_eq!(result.unwrap_err(), CacheError::KeyNotFound);
    }

    #[test]
    fn test_numeric_transitions() {
        let t = table();
        t.upsert(
            b"k",
            UpsertOp::Set { value: Value::Bytes(b"10".to_vec()), flags: 0, expiration: 0, cas: None },
        )
        .unwrap();
        t.upsert(b"k", UpsertOp::IncrDecr { addition: 5, initial: None, expiration: 0 }).unwrap();
        let got = t.get(b"k").unwrap();
        assert_eq!(got.value, Value::Numeric(15));

        t.upsert(b"k", UpsertOp::Prepend { delta: b"x".to_vec(), expiration: 0 }).unwrap();
        let got = t.get(b"k").unwrap();
        assert_eq!(got.value, Value::Bytes(b"x15".to_vec()));

        t.upsert(b"k", UpsertOp::IncrDecr { addition: 1, initial: None, expiration: 0 })
            .expect_err("non-numeric \"x15\" cannot be incremented");
    }

    #[test]
    fn test_delete_then_get_misses_and_accounting_zeroes() {
        let t = table();
        t.upsert(b"k", UpsertOp::Set { value: Value::Bytes(b"v".to_vec()), flags: 0, expiration: 0, cas: None })
            .unwrap();
        assert_eq!(t.objcnt(), 1);
        t.delete(b"k").expect("delete succeeds");
        assert!(t.get(b"k").is_none());
        assert_eq!(t.objcnt(), 0);
        assert_eq!(t.inline_acc_keylen.load(Ordering::Relaxed), 0);
        assert_eq!(t.inline_acc_vallen.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_delete_missing_returns_key_not_found() {
        let t = table();
        assert_eq!(t.delete(b"nope").unwrap_err(), CacheError::KeyNotFound);
    }

    #[test]
    fn test_accepts_at_least_70_percent_capacity_before_busy() {
        let t = table();
        let target = (t.capacity() * 7) / 10;
        let mut inserted = 0usize;
        for i in 0..t.capacity() * 2 {
            let key = format!("cap-key-{i}").into_bytes();
            let op = UpsertOp::Set { value: Value::Bytes(b"v".to_vec()), flags: 0, expiration: 0, cas: None };
            match t.upsert(&key, op) {
                Ok(_) => inserted += 1,
                Err(CacheError::Busy) => break,
                Err(e) => panic!("unexpected error filling table: {e:?}"),
            }
        }
        assert!(
            inserted >= target,
            "table went BUSY after only {inserted} inserts, wanted at least {target} of capacity {}",
            t.capacity()
        );
    }
}
