//! Per-connection response writer: a singly-linked chain of fixed-capacity
//! byte buffers with partial-write backpressure.
//!
//! The accumulator is a chain of bounded segments rather than one
//! unbounded `Vec`, and draining writes to a real (possibly non-blocking)
//! `fd` instead of being read back wholesale at the end. A connection's
//! writer is only ever touched by the one worker thread servicing that
//! connection, so there is no `Arc<Mutex<_>>` here.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};

/// Default segment size: 64 KiB.
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

struct Segment {
    buf: Vec<u8>,
    send_idx: usize,
    fill_idx: usize,
}

impl Segment {
    fn with_capacity(cap: usize) -> Self {
        Segment { buf: vec![0u8; cap], send_idx: 0, fill_idx: 0 }
    }

    fn free(&self) -> usize {
        self.buf.len() - self.fill_idx
    }

    fn unsent(&self) -> &[u8] {
        &self.buf[self.send_idx..self.fill_idx]
    }

    fn is_drained(&self) -> bool {
        self.send_idx >= self.fill_idx
    }
}

/// Per-connection append-only buffer chain.
pub struct Writer {
    segments: VecDeque<Segment>,
    default_segment_size: usize,
    /// `true` iff the most recent `reserve` call had to spawn a new
    /// segment.
    last_reserve_spawned: bool,
}

impl Writer {
    /// Establishes one empty segment.
    pub fn new(default_segment_size: usize) -> Self {
        let mut segments = VecDeque::with_capacity(1);
        segments.push_back(Segment::with_capacity(default_segment_size));
        Writer { segments, default_segment_size, last_reserve_spawned: false }
    }

    /// Re-initializes an active writer: frees all but the head segment and
    /// resets the head. Idempotent.
    pub fn reset(&mut self) {
        self.segments.truncate(1);
        if let Some(head) = self.segments.front_mut() {
            head.send_idx = 0;
            head.fill_idx = 0;
        } else {
            self.segments.push_back(Segment::with_capacity(self.default_segment_size));
        }
        self.last_reserve_spawned = false;
    }

    /// Ensures the tail segment has `nbyte` contiguous free bytes,
    /// appending a new segment sized `max(nbyte, default_segment_size)` if
    /// not. Returns `true` iff the caller's next `append` will land in the
    /// *same* segment this reservation started in.
    pub fn reserve(&mut self, nbyte: usize) -> bool {
        let started_in_tail_with_room = self
            .segments
            .back()
            .map(|tail| tail.free() >= nbyte)
            .unwrap_or(false);

        if started_in_tail_with_room {
            self.last_reserve_spawned = false;
            return true;
        }

        let size = nbyte.max(self.default_segment_size);
        self.segments.push_back(Segment::with_capacity(size));
        self.last_reserve_spawned = true;
        false
    }

    /// Copies `bytes` into the tail segment. Fails (returns `false`,
    /// buffer unmodified) if the tail segment doesn't have `bytes.len()`
    /// contiguous free bytes — callers must pair `append` with a
    /// preceding `reserve`.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let tail = match self.segments.back_mut() {
            Some(t) => t,
            None => return false,
        };
        if tail.free() < bytes.len() {
            return false;
        }
        let start = tail.fill_idx;
        tail.buf[start..start + bytes.len()].copy_from_slice(bytes);
        tail.fill_idx += bytes.len();
        true
    }

    /// `reserve` then `append`, the common case for callers that don't
    /// need the segment-spawned signal.
    pub fn reserve_and_append(&mut self, bytes: &[u8]) -> bool {
        self.reserve(bytes.len());
        self.append(bytes)
    }

    /// Whether the most recent `reserve` spawned a new segment (the
    /// retry-loop signal used by multi-frame formatters such as the ASCII
    /// multi-get streamer in [`crate::protocol`]).
    pub fn reserve_spawned_segment(&self) -> bool {
        self.last_reserve_spawned
    }

    /// Total unsent bytes across all segments.
    pub fn pending_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.unsent().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_bytes() == 0
    }

    /// Repeatedly writes from the head segment's `send_idx` to `fill_idx`,
    /// advancing on success and freeing fully-drained non-tail segments.
    ///
    /// Returns `Ok(true)` if everything queued so far was flushed,
    /// `Ok(false)` if a write returned `EWOULDBLOCK` with buffered bytes
    /// still remaining (state is preserved; the caller is responsible for
    /// arranging a writeability notification — out of scope here). Any
    /// other I/O error is propagated and the connection should be torn
    /// down.
    pub fn flush<W: Write>(&mut self, fd: &mut W) -> io::Result<bool> {
        loop {
            // Drop fully-drained segments, but always keep the head so
            // `reset` has somewhere to land.
            while self.segments.len() > 1 {
                let drained = self.segments.front().map(Segment::is_drained).unwrap_or(false);
                if drained {
                    self.segments.pop_front();
                } else {
                    break;
                }
            }

            let head = match self.segments.front_mut() {
                Some(h) => h,
                None => return Ok(true),
            };

            if head.is_drained() {
                if self.segments.len() == 1 {
                    head.send_idx = 0;
                    head.fill_idx = 0;
                }
                return Ok(true);
            }

            let chunk = head.unsent();
            match fd.write(chunk) {
                Ok(0) => {
                    return Err(io::Error::new(ErrorKind::WriteZero, "writer: write returned 0"))
                }
                Ok(n) => {
                    head.send_idx += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new(DEFAULT_SEGMENT_SIZE)
    }
}
