//! Property-based tests for the container contracts.
//!
//! Each block verifies one property family over arbitrary operation
//! sequences:
//! - round-trip identity of the serialization buffer
//! - FIFO order of both rings
//! - capacity invariants (used + free = capacity)
//! - resize preserving content
//! - pool construct/destroy accounting
//! - tagged-pointer tag algebra

use proptest::prelude::*;
use wirebuf::{ObjectPool, RingQueue, SerialBuf, SpscRing, TaggedPtr};

// =============================================================================
// Round-trip identity: reading back a written sequence returns the values
// byte-for-byte, leaves the buffer empty, and never trips the fail flag.
// =============================================================================

#[derive(Debug, Clone)]
enum WireOp {
    U8(u8),
    U32(u32),
    I64(i64),
    F64(f64),
    Str(String),
    Utf16(Vec<u16>),
}

fn wire_op() -> impl Strategy<Value = WireOp> {
    prop_oneof![
        any::<u8>().prop_map(WireOp::U8),
        any::<u32>().prop_map(WireOp::U32),
        any::<i64>().prop_map(WireOp::I64),
        (-1.0e12f64..1.0e12).prop_map(WireOp::F64),
        ".{0,24}".prop_map(WireOp::Str),
        prop::collection::vec(any::<u16>(), 0..16).prop_map(WireOp::Utf16),
    ]
}

proptest! {
    #[test]
    fn prop_serial_roundtrip_identity(ops in prop::collection::vec(wire_op(), 0..64)) {
        let mut buf = SerialBuf::with_capacity(64 * 1024);

        for op in &ops {
            let ok = match op {
                WireOp::U8(v) => buf.write(*v),
                WireOp::U32(v) => buf.write(*v),
                WireOp::I64(v) => buf.write(*v),
                WireOp::F64(v) => buf.write(*v),
                WireOp::Str(v) => buf.write_str(v),
                WireOp::Utf16(v) => buf.write_utf16(v),
            };
            prop_assert!(ok);
        }
        prop_assert!(!buf.failed());

        for op in &ops {
            match op {
                WireOp::U8(v) => prop_assert_eq!(buf.read::<u8>(), Some(*v)),
                WireOp::U32(v) => prop_assert_eq!(buf.read::<u32>(), Some(*v)),
                WireOp::I64(v) => prop_assert_eq!(buf.read::<i64>(), Some(*v)),
                WireOp::F64(v) => prop_assert_eq!(buf.read::<f64>(), Some(*v)),
                WireOp::Str(v) => {
                    let got = buf.read_string();
                    prop_assert_eq!(got.as_ref(), Some(v));
                }
                WireOp::Utf16(v) => {
                    let got = buf.read_utf16();
                    prop_assert_eq!(got.as_ref(), Some(v));
                }
            }
        }
        prop_assert!(buf.is_empty());
        prop_assert!(!buf.failed());
    }
}

// =============================================================================
// FIFO order: for any interleaving of chunked writes and reads that respects
// capacity, the consumer's byte stream equals the producer's.
// =============================================================================

proptest! {
    #[test]
    fn prop_spsc_fifo_order(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 1..40),
        read_sizes in prop::collection::vec(1usize..16, 1..80),
    ) {
        let ring = SpscRing::with_capacity(32);
        let sent: Vec<u8> = chunks.iter().flatten().copied().collect();
        let mut received = Vec::new();

        let mut pending = chunks.iter();
        let mut reads = read_sizes.iter().cycle();
        let mut next_chunk = pending.next();

        while received.len() < sent.len() {
            if let Some(chunk) = next_chunk {
                if ring.try_write(chunk) {
                    next_chunk = pending.next();
                }
            }
            let want = (*reads.next().unwrap()).min(ring.available_read());
            let mut out = vec![0u8; want];
            if ring.try_read(&mut out) {
                received.extend_from_slice(&out);
            }
        }

        prop_assert_eq!(received, sent);
        prop_assert!(ring.is_empty());
    }

    #[test]
    fn prop_ring_queue_fifo_order(values in prop::collection::vec(any::<u64>(), 0..64)) {
        let mut queue = RingQueue::with_capacity(values.len());
        for &v in &values {
            prop_assert!(queue.try_push(v));
        }
        let mut drained = Vec::new();
        while let Some(v) = queue.pop() {
            drained.push(v);
        }
        prop_assert_eq!(drained, values);
    }
}

// =============================================================================
// Capacity invariants: used + free = capacity, empty <=> used == 0,
// full <=> free == 0, size <= capacity.
// =============================================================================

proptest! {
    #[test]
    fn prop_spsc_capacity_invariants(
        capacity in 1usize..64,
        ops in prop::collection::vec((prop::bool::ANY, 1usize..8), 1..100),
    ) {
        let ring = SpscRing::with_capacity(capacity);
        let mut scratch = [0u8; 8];

        for (is_write, n) in ops {
            if is_write {
                let _ = ring.try_write(&scratch[..n.min(capacity)]);
            } else {
                let _ = ring.try_read(&mut scratch[..n.min(capacity)]);
            }

            let used = ring.available_read();
            let free = ring.available_write();
            prop_assert_eq!(used + free, capacity);
            prop_assert_eq!(ring.is_empty(), used == 0);
            prop_assert_eq!(ring.is_full(), free == 0);
        }
    }

    #[test]
    fn prop_queue_capacity_invariants(
        capacity in 0usize..32,
        ops in prop::collection::vec(prop::bool::ANY, 1..100),
    ) {
        let mut queue = RingQueue::with_capacity(capacity);
        let mut expected_len = 0usize;

        for is_push in ops {
            if is_push {
                if queue.try_push(7u32) {
                    expected_len += 1;
                }
            } else if queue.pop().is_some() {
                expected_len -= 1;
            }

            prop_assert_eq!(queue.len(), expected_len);
            prop_assert!(queue.len() <= queue.capacity());
            prop_assert_eq!(queue.is_empty(), expected_len == 0);
            prop_assert_eq!(queue.is_full(), expected_len == capacity);
        }
    }
}

// =============================================================================
// Resize preserves content: after a successful resize, the stored sequence
// is unchanged.
// =============================================================================

proptest! {
    #[test]
    fn prop_queue_resize_preserves_content(
        values in prop::collection::vec(any::<u32>(), 0..32),
        pops in 0usize..32,
        extra in 1usize..32,
    ) {
        let mut queue = RingQueue::with_capacity(values.len());
        for &v in &values {
            prop_assert!(queue.try_push(v));
        }
        for _ in 0..pops.min(values.len()) {
            queue.pop();
        }

        let before: Vec<u32> = queue.iter().copied().collect();
        let target = queue.capacity() + extra;
        prop_assert!(queue.try_resize(target).is_ok());
        prop_assert_eq!(queue.capacity(), target);

        let after: Vec<u32> = queue.iter().copied().collect();
        prop_assert_eq!(before, after);
    }

    #[test]
    fn prop_spsc_resize_preserves_content(
        bytes in prop::collection::vec(any::<u8>(), 1..48),
        consumed in 0usize..48,
        extra in 1usize..32,
    ) {
        let mut ring = SpscRing::with_capacity(64);
        prop_assert!(ring.try_write(&bytes));

        let consumed = consumed.min(bytes.len());
        let mut skip = vec![0u8; consumed];
        prop_assert!(ring.try_read(&mut skip));

        let unread = bytes.len() - consumed;
        prop_assert!(ring.try_resize(unread + extra).is_ok());
        prop_assert_eq!(ring.available_read(), unread);

        let mut rest = vec![0u8; unread];
        prop_assert!(ring.try_read(&mut rest));
        prop_assert_eq!(&rest[..], &bytes[consumed..]);
    }
}

// =============================================================================
// Pool round-trip: every constructed slot is returned exactly once and the
// ledger (used + unused = capacity) holds through any schedule.
// =============================================================================

proptest! {
    #[test]
    fn prop_pool_construct_destroy_schedule(
        ops in prop::collection::vec(prop::bool::ANY, 1..200),
    ) {
        let pool = ObjectPool::<u64>::new();
        let mut live = Vec::new();
        let mut counter = 0u64;

        for construct in ops {
            if construct {
                counter += 1;
                live.push((pool.construct_raw(counter), counter));
            } else if let Some((handle, value)) = live.pop() {
                // SAFETY: handle came from this pool and is dropped once.
                unsafe {
                    prop_assert_eq!(*handle.as_ref(), value);
                    pool.destroy(handle);
                }
            }

            prop_assert_eq!(pool.used_slots(), live.len());
            prop_assert_eq!(pool.used_slots() + pool.unused_slots(), pool.capacity());
        }

        for (handle, value) in live.drain(..) {
            // SAFETY: as above.
            unsafe {
                prop_assert_eq!(*handle.as_ref(), value);
                pool.destroy(handle);
            }
        }
        prop_assert_eq!(pool.used_slots(), 0);
    }
}

// =============================================================================
// Tagged-pointer algebra: set_tag(get_tag()) is the identity, the pointer is
// invariant under tag changes, bump_tag cycles with period 2^TAG_BITS.
// =============================================================================

#[repr(align(16))]
struct Al16(#[allow(dead_code)] u128);

proptest! {
    #[test]
    fn prop_tagged_ptr_algebra(tag in any::<u64>(), bumps in 0usize..300) {
        let mut slot = Al16(0);
        let ptr: *mut Al16 = &mut slot;
        let mut tp = TaggedPtr::<Al16>::new(ptr);

        tp.set_tag(tag);
        let seen = tp.tag();
        // Identity on the stored (truncated) tag.
        tp.set_tag(seen);
        prop_assert_eq!(tp.tag(), seen);
        prop_assert_eq!(tp.ptr(), ptr);

        let period = 1u64 << TaggedPtr::<Al16>::TAG_BITS;
        for _ in 0..bumps {
            tp.bump_tag();
        }
        prop_assert_eq!(tp.tag(), (seen + bumps as u64) % period);
        prop_assert_eq!(tp.ptr(), ptr);
    }
}
