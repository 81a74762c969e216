//! Cross-thread audio ring buffer.
//!
//! Bridges the push-style decode context to the pull-style, deadline-
//! bound device callback. Single producer, single consumer, fixed
//! capacity, drop-on-full and silence-on-underrun policies. The
//! consumer path never locks and never blocks.
//!
//! ```text
//! ┌────────────┐  push (whole chunks)  ┌───────────┐  drain (gain)  ┌──────────┐
//! │ Decode     │──────────────────────►│ AudioRing │───────────────►│ Device   │
//! │ context    │                       │           │                │ callback │
//! └────────────┘                       └───────────┘                └──────────┘
//! ```
//!
//! Synchronization: sample bytes are written before `filled` is
//! published with Release, and every reader of `filled` uses Acquire,
//! so the consumer can never observe a fill count without the bytes
//! behind it. `read` is owned by the consumer, `write` by the
//! producer; compaction is the one exception and excludes the
//! producer via the `pushing`/`compacting` flag pair (both sides bail
//! out instead of spinning, so neither path ever waits).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Bytes per interleaved f32 sample.
pub const BYTES_PER_SAMPLE: usize = 4;

/// Iterations a push will wait out a concurrent compaction before
/// giving up. Compaction moves fewer than `compact_watermark` bytes,
/// so the wait is normally a handful of iterations; the cap only
/// guards against a consumer stalled mid-compaction.
const COMPACTION_WAIT_ITERS: usize = 1 << 16;

/// Ring sizing and watermarks. The half-capacity "full" and
/// quarter-capacity compaction points trade latency against drop
/// rate; they are tunable because the right values depend on target
/// latency, not on correctness.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    pub capacity: usize,
    /// `is_full()` reports true at or above this fill level, leaving
    /// headroom so one in-flight decode burst is never rejected
    /// mid-burst.
    pub full_watermark: usize,
    /// `compact_if_low()` fires below this fill level.
    pub compact_watermark: usize,
}

impl RingConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            full_watermark: capacity / 2,
            compact_watermark: capacity / 4,
        }
    }

    /// Roughly one second of interleaved f32 audio at the given
    /// output format.
    pub fn for_output(sample_rate: u32, channels: u16) -> Self {
        Self::new(sample_rate as usize * channels as usize * BYTES_PER_SAMPLE)
    }
}

/// Outcome of a producer push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Accepted,
    /// The whole chunk was rejected because it does not fit in the
    /// remaining capacity; a partial write would shear the channel
    /// interleaving. (Also returned in the pathological case of a
    /// consumer stalled mid-compaction past the wait cap.)
    Dropped,
}

/// Outcome of a consumer drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    /// Bytes copied from buffered audio (the rest of `out` is
    /// silence).
    pub bytes_written: usize,
    /// The request could not be fully satisfied - the audible-glitch
    /// signal, surfaced as a counter, not an error.
    pub underran: bool,
}

struct Shared {
    storage: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    full_watermark: usize,
    compact_watermark: usize,

    /// First valid byte. Consumer-owned outside compaction.
    read: AtomicUsize,
    /// One past the last valid byte. Producer-owned outside
    /// compaction.
    write: AtomicUsize,
    /// Valid byte count. Invariant: `0 <= filled <= capacity`, and
    /// `[read, read + filled)` (mod capacity) holds unplayed samples.
    filled: AtomicUsize,

    /// Producer-in-push / consumer-in-compaction exclusion flags.
    pushing: AtomicBool,
    compacting: AtomicBool,

    dropped_chunks: AtomicU64,
    dropped_bytes: AtomicU64,
    underruns: AtomicU64,
}

// SPSC discipline: storage bytes are only touched inside the regions
// each side owns at that moment, sequenced by the atomics above.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    /// Copy `data` into the ring starting at `offset`, wrapping once.
    ///
    /// Safety: the caller must own `[offset, offset + data.len())`
    /// (mod capacity) and `data.len() <= capacity`.
    unsafe fn copy_in(&self, offset: usize, data: &[u8]) {
        let storage = &mut *self.storage.get();
        let first = data.len().min(self.capacity - offset);
        storage[offset..offset + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            storage[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    /// Copy `out.len()` bytes out of the ring starting at `offset`,
    /// wrapping once. Same ownership contract as [`Self::copy_in`].
    unsafe fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let storage = &*self.storage.get();
        let first = out.len().min(self.capacity - offset);
        out[..first].copy_from_slice(&storage[offset..offset + first]);
        if first < out.len() {
            let rest = out.len() - first;
            out[first..].copy_from_slice(&storage[..rest]);
        }
    }
}

/// Fixed-capacity SPSC byte ring for decoded audio. Split into the
/// two halves before use; each half moves to its own context.
pub struct AudioRing {
    shared: Arc<Shared>,
}

impl AudioRing {
    pub fn new(config: RingConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                storage: UnsafeCell::new(vec![0u8; config.capacity].into_boxed_slice()),
                capacity: config.capacity,
                full_watermark: config.full_watermark,
                compact_watermark: config.compact_watermark,
                read: AtomicUsize::new(0),
                write: AtomicUsize::new(0),
                filled: AtomicUsize::new(0),
                pushing: AtomicBool::new(false),
                compacting: AtomicBool::new(false),
                dropped_chunks: AtomicU64::new(0),
                dropped_bytes: AtomicU64::new(0),
                underruns: AtomicU64::new(0),
            }),
        }
    }

    pub fn split(self) -> (RingProducer, RingConsumer) {
        (
            RingProducer {
                shared: self.shared.clone(),
            },
            RingConsumer {
                shared: self.shared,
            },
        )
    }
}

/// Shared read-only view of the ring's degradation counters.
#[derive(Clone)]
pub struct RingCounters {
    shared: Arc<Shared>,
}

impl RingCounters {
    /// Whole chunks rejected by the drop-on-full policy.
    pub fn dropped_chunks(&self) -> u64 {
        self.shared.dropped_chunks.load(Ordering::Relaxed)
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.shared.dropped_bytes.load(Ordering::Relaxed)
    }

    /// Device callbacks that got less data than they asked for.
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Producer (decode context)
// ============================================================================

pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Append one whole chunk. All or nothing: a chunk that does not
    /// fit in the remaining capacity is dropped and counted, never
    /// partially written.
    pub fn push(&mut self, data: &[u8]) -> PushResult {
        if data.is_empty() {
            return PushResult::Accepted;
        }
        let s = &*self.shared;

        // Dekker-style handshake with compaction; SeqCst keeps the
        // flag store ordered before the other side's flag load. A
        // compaction in flight is a short bounded copy, so the
        // producer (decode context, not the device callback) waits
        // it out rather than dropping a chunk the ring has room for.
        s.pushing.store(true, Ordering::SeqCst);
        let mut waited = 0;
        while s.compacting.load(Ordering::SeqCst) {
            s.pushing.store(false, Ordering::Release);
            if waited == COMPACTION_WAIT_ITERS {
                s.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                s.dropped_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                return PushResult::Dropped;
            }
            waited += 1;
            std::thread::yield_now();
            s.pushing.store(true, Ordering::SeqCst);
        }

        let filled = s.filled.load(Ordering::Acquire);
        if filled + data.len() > s.capacity {
            s.pushing.store(false, Ordering::Release);
            s.dropped_chunks.fetch_add(1, Ordering::Relaxed);
            s.dropped_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
            return PushResult::Dropped;
        }

        let write = s.write.load(Ordering::Relaxed);
        // Owned region: [write, write + len) is free because
        // filled + len <= capacity and the consumer only releases
        // space behind `read`.
        unsafe { s.copy_in(write, data) };
        s.write
            .store((write + data.len()) % s.capacity, Ordering::Relaxed);
        // Publish the bytes before the length so the consumer never
        // sees a fill count ahead of the data.
        s.filled.fetch_add(data.len(), Ordering::Release);
        s.pushing.store(false, Ordering::Release);
        PushResult::Accepted
    }

    /// Backpressure query: true at or above the full watermark
    /// (half capacity by default), not at literal 100% fill.
    pub fn is_full(&self) -> bool {
        self.shared.filled.load(Ordering::Acquire) >= self.shared.full_watermark
    }

    pub fn len(&self) -> usize {
        self.shared.filled.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Discard all buffered audio. Only valid while the consumer is
    /// quiescent (output device paused); stop and seek both pause the
    /// device first, which is what establishes the happens-before
    /// edge here.
    pub fn reset(&mut self) {
        let s = &*self.shared;
        s.read.store(0, Ordering::Relaxed);
        s.write.store(0, Ordering::Relaxed);
        s.filled.store(0, Ordering::Release);
    }

    pub fn counters(&self) -> RingCounters {
        RingCounters {
            shared: self.shared.clone(),
        }
    }
}

// ============================================================================
// Consumer (device callback context)
// ============================================================================

pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Fill `out` from buffered audio, scaling every f32 sample by
    /// `gain` on the way out (stored bytes are never mutated, so gain
    /// changes apply to already-buffered audio too). Any shortfall is
    /// zero-filled silence and counted as an underrun. Wait-free.
    pub fn drain(&mut self, out: &mut [u8], gain: f32) -> DrainResult {
        let s = &*self.shared;
        let filled = s.filled.load(Ordering::Acquire);
        let take = out.len().min(filled);

        if take > 0 {
            let read = s.read.load(Ordering::Relaxed);
            unsafe { s.copy_out(read, &mut out[..take]) };
            apply_gain(&mut out[..take], gain);
            s.read.store((read + take) % s.capacity, Ordering::Relaxed);
            // Release the space only after the bytes are copied out.
            s.filled.fetch_sub(take, Ordering::Release);
        }

        let underran = take < out.len();
        if underran {
            out[take..].fill(0);
            s.underruns.fetch_add(1, Ordering::Relaxed);
        }

        DrainResult {
            bytes_written: take,
            underran,
        }
    }

    /// When the buffer is mostly empty, move the live bytes back to
    /// offset zero so the common drain is a single straight copy.
    /// O(filled) only below the compact watermark, so the move is
    /// cheap when it happens. Skipped entirely if a push is in
    /// flight.
    pub fn compact_if_low(&mut self) {
        let s = &*self.shared;
        let read = s.read.load(Ordering::Relaxed);
        if read == 0 || s.filled.load(Ordering::Acquire) >= s.compact_watermark {
            return;
        }

        s.compacting.store(true, Ordering::SeqCst);
        if s.pushing.load(Ordering::SeqCst) {
            s.compacting.store(false, Ordering::Release);
            return;
        }

        // A push may have landed between the gate above and winning
        // the handshake, so the fill level must be re-checked now
        // that the producer is excluded. The wrapped move below
        // writes the tail into `[first, filled)` before the head
        // leaves `[read, capacity)`; that is collision-free only
        // while `filled <= read`, which the watermark bound implies
        // for the default config but a grown fill does not.
        let filled = s.filled.load(Ordering::Acquire);
        if filled >= s.compact_watermark || filled > read {
            s.compacting.store(false, Ordering::Release);
            return;
        }

        // Producer is excluded: both cursors are safe to rewrite. The
        // move is done in place (no allocation on the callback path).
        if filled > 0 {
            let storage = unsafe { &mut *s.storage.get() };
            let first = filled.min(s.capacity - read);
            let rest = filled - first;
            if rest > 0 {
                // Wrapped region: shift the tail segment right to
                // make room, then bring the head segment down. The
                // tail lands in `[first, filled)`, disjoint from the
                // head's `[read, capacity)` because `filled <= read`
                // was checked above.
                storage.copy_within(0..rest, first);
            }
            storage.copy_within(read..read + first, 0);
        }
        s.read.store(0, Ordering::Relaxed);
        s.write.store(filled % s.capacity, Ordering::Relaxed);
        s.compacting.store(false, Ordering::Release);
        debug!(filled, "ring compacted");
    }

    pub fn len(&self) -> usize {
        self.shared.filled.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn counters(&self) -> RingCounters {
        RingCounters {
            shared: self.shared.clone(),
        }
    }
}

/// Scale interleaved f32 samples in place. Operates on whole 4-byte
/// groups; drain lengths are sample-aligned because pushes are whole
/// chunks of complete frames.
fn apply_gain(bytes: &mut [u8], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for group in bytes.chunks_exact_mut(BYTES_PER_SAMPLE) {
        let sample = f32::from_ne_bytes([group[0], group[1], group[2], group[3]]);
        group.copy_from_slice(&(sample * gain).to_ne_bytes());
    }
}

// ============================================================================
// Tests
// ============================================================================
