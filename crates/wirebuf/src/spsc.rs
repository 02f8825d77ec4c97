use crate::invariants::debug_assert_bounded_count;
use crate::ResizeError;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Classic SPSC protocol over a byte ring of `effective_capacity + 1` slots
// (the spare slot disambiguates full from empty):
//
// **Producer (try_write):**
// 1. Load `write` with Relaxed (only the producer stores it)
// 2. Load `read` with Acquire (synchronizes with the consumer's Release)
// 3. Copy bytes into the free region, wrapping in two phases if needed
// 4. Store `write` with Release (publishes the bytes to the consumer)
//
// **Consumer (try_read / try_peek):**
// 1. Load `read` with Relaxed (only the consumer stores it)
// 2. Load `write` with Acquire (synchronizes with the producer's Release)
// 3. Copy bytes out of the readable region, two-phase across the wrap
// 4. On read (not peek), store `read` with Release (frees the region)
//
// A successful read therefore observes every byte of every write committed
// up to the `write` publication it acquired.
//
// `read` and `write` live in separate `CachePadded` cells so the producer's
// stores never invalidate the consumer's hot line and vice versa.
//
// Indices stay in `[0, slots)`; occupancy is `(write - read) mod slots` with
// the usual add-the-modulus normalization so the subtraction never goes
// negative in unsigned arithmetic.
// =============================================================================

/// Lock-free single-producer / single-consumer byte ring.
///
/// Exactly one thread may call the producer methods (`try_write`,
/// `available_write`) and exactly one thread the consumer methods
/// (`try_read`, `try_peek`, `available_read`) at any time. The `monitor_*`
/// snapshots are safe from any thread but carry no synchronization.
/// [`clear`](Self::clear) and [`try_resize`](Self::try_resize) take
/// `&mut self`: exclusive access, no concurrent producer or consumer — which
/// also makes moving the ring a quiescent-only operation, enforced by the
/// borrow checker.
pub struct SpscRing {
    /// Read cursor; stored only by the consumer.
    read: CachePadded<AtomicUsize>,
    /// Write cursor; stored only by the producer.
    write: CachePadded<AtomicUsize>,
    /// `effective_capacity + 1` bytes.
    buf: UnsafeCell<Box<[u8]>>,
}

// Safety: cross-thread access is governed by the release/acquire cursor
// protocol above; each byte region is touched by at most one side at a time.
unsafe impl Send for SpscRing {}
unsafe impl Sync for SpscRing {}

impl SpscRing {
    /// Creates a ring that can hold `effective_capacity` bytes.
    pub fn with_capacity(effective_capacity: usize) -> Self {
        Self {
            read: CachePadded::new(AtomicUsize::new(0)),
            write: CachePadded::new(AtomicUsize::new(0)),
            buf: UnsafeCell::new(vec![0u8; effective_capacity + 1].into_boxed_slice()),
        }
    }

    /// Underlying slot count, `effective_capacity + 1`.
    #[inline]
    fn slots(&self) -> usize {
        // SAFETY: the box itself (pointer + length) is only mutated under
        // `&mut self` (try_resize); shared-access paths just read its length.
        unsafe { (&*self.buf.get()).len() }
    }

    /// Number of bytes the ring can usefully hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots() - 1
    }

    #[inline]
    fn occupancy(&self, read: usize, write: usize) -> usize {
        (write + self.slots() - read) % self.slots()
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Appends all of `src`, or nothing. Producer-side only.
    pub fn try_write(&self, src: &[u8]) -> bool {
        let slots = self.slots();
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);

        let used = self.occupancy(read, write);
        debug_assert_bounded_count!(used, self.capacity());
        if src.len() > self.capacity() - used {
            return false;
        }

        // Two-phase copy: the stretch up to the end of the buffer, then the
        // wrapped remainder from offset 0.
        let consecutive = src.len().min(slots - write);
        // SAFETY:
        // 1. The free region [write, write + src.len()) mod slots is not
        //    touched by the consumer (it only reads [read, read + used)).
        // 2. Both copy ranges are in bounds: consecutive <= slots - write,
        //    and the remainder starts at 0 with len < write <= slots.
        // 3. The Release store below publishes the bytes before the consumer
        //    can observe the advanced cursor.
        unsafe {
            let base = (*self.buf.get()).as_mut_ptr();
            ptr::copy_nonoverlapping(src.as_ptr(), base.add(write), consecutive);
            ptr::copy_nonoverlapping(
                src.as_ptr().add(consecutive),
                base,
                src.len() - consecutive,
            );
        }

        self.write
            .store((write + src.len()) % slots, Ordering::Release);
        true
    }

    /// Free bytes from the producer's perspective.
    pub fn available_write(&self) -> usize {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        self.capacity() - self.occupancy(read, write)
    }

    /// True when no byte can be written. Producer-side view.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.available_write() == 0
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Fills all of `dst` and advances the read cursor, or moves nothing.
    /// Consumer-side only.
    pub fn try_read(&self, dst: &mut [u8]) -> bool {
        let read = self.read.load(Ordering::Relaxed);
        if !self.copy_out(read, dst) {
            return false;
        }
        self.read
            .store((read + dst.len()) % self.slots(), Ordering::Release);
        true
    }

    /// Fills all of `dst` without consuming. Consumer-side only.
    pub fn try_peek(&self, dst: &mut [u8]) -> bool {
        let read = self.read.load(Ordering::Relaxed);
        self.copy_out(read, dst)
    }

    fn copy_out(&self, read: usize, dst: &mut [u8]) -> bool {
        let slots = self.slots();
        let write = self.write.load(Ordering::Acquire);

        let avail = self.occupancy(read, write);
        debug_assert_bounded_count!(avail, self.capacity());
        if dst.len() > avail {
            return false;
        }

        let consecutive = dst.len().min(slots - read);
        // SAFETY:
        // 1. Bytes in [read, read + avail) mod slots were published by the
        //    producer's Release store; the Acquire load above synchronizes
        //    with it.
        // 2. The producer will not overwrite this region until the consumer
        //    advances `read`, which happens only after this copy.
        // 3. Both ranges are in bounds by the same argument as try_write.
        unsafe {
            let base = (*self.buf.get()).as_ptr();
            ptr::copy_nonoverlapping(base.add(read), dst.as_mut_ptr(), consecutive);
            ptr::copy_nonoverlapping(
                base,
                dst.as_mut_ptr().add(consecutive),
                dst.len() - consecutive,
            );
        }
        true
    }

    /// Readable bytes from the consumer's perspective.
    pub fn available_read(&self) -> usize {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        self.occupancy(read, write)
    }

    /// True when nothing is readable. Consumer-side view.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available_read() == 0
    }

    // ---------------------------------------------------------------------
    // MONITORING
    // ---------------------------------------------------------------------
    //
    // Snapshots for observer threads (metrics, debug displays). A full fence
    // flushes this thread's view, then both cursors are read Relaxed. The
    // values may be mutually inconsistent by the time the caller looks at
    // them — they must not be used to justify an unsynchronized access.
    // ---------------------------------------------------------------------

    /// Snapshot of the readable byte count. Not a synchronization point.
    pub fn monitor_read(&self) -> usize {
        fence(Ordering::SeqCst);
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Relaxed);
        self.occupancy(read, write)
    }

    /// Snapshot of the free byte count. Not a synchronization point.
    pub fn monitor_write(&self) -> usize {
        self.capacity() - self.monitor_read()
    }

    // ---------------------------------------------------------------------
    // EXCLUSIVE-ACCESS LIFECYCLE
    // ---------------------------------------------------------------------

    /// Discards all readable bytes. Exclusive access — no concurrent
    /// producer or consumer.
    pub fn clear(&mut self) {
        *self.read.get_mut() = 0;
        *self.write.get_mut() = 0;
    }

    /// Reallocates to `new_effective_capacity`, compacting readable bytes to
    /// offset 0 (`read = 0`, `write = used`). Exclusive access.
    pub fn try_resize(&mut self, new_effective_capacity: usize) -> Result<(), ResizeError> {
        let read = *self.read.get_mut();
        let write = *self.write.get_mut();
        let slots = self.buf.get_mut().len();
        let used = (write + slots - read) % slots;

        if new_effective_capacity < used {
            return Err(ResizeError::BelowUsed {
                used,
                requested: new_effective_capacity,
            });
        }
        if new_effective_capacity == slots - 1 {
            return Err(ResizeError::SameCapacity);
        }

        let mut fresh = vec![0u8; new_effective_capacity + 1].into_boxed_slice();
        let old = self.buf.get_mut();
        let consecutive = used.min(slots - read);
        fresh[..consecutive].copy_from_slice(&old[read..read + consecutive]);
        fresh[consecutive..used].copy_from_slice(&old[..used - consecutive]);

        *old = fresh;
        *self.read.get_mut() = 0;
        *self.write.get_mut() = used;
        Ok(())
    }
}

impl std::fmt::Debug for SpscRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscRing")
            .field("capacity", &self.capacity())
            .field("readable", &self.monitor_read())
            .finish()
    }
}
