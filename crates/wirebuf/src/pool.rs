use crate::invariants::debug_assert_slot_ledger;
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};
use crossbeam_utils::Backoff;
use std::cell::UnsafeCell;
use std::io::Write;
use std::mem::{offset_of, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

// =============================================================================
// FREELIST PROTOCOL
// =============================================================================
//
// The pool keeps its unused slots on a Treiber-style lock-free stack threaded
// through the slots themselves. The head is a single 64-bit word packing
// (slot pointer, tag) — see `tagged.rs`.
//
// **Pop (construct):**
//   1. Load head with Acquire
//   2. If null: grow by a block (mutex-serialized) and retry
//   3. Read the head slot's `next` link
//   4. CAS head -> (next, tag + 1); on failure reload and retry with backoff
//
// **Push (destroy):**
//   1. Load head with Acquire
//   2. Store our slot's `next` = head pointer
//   3. CAS head -> (slot, tag); Release on success publishes the link
//
// The tag bump on pop is the ABA defense: a popper that stalls between steps
// 3 and 4 while other threads pop and re-push the same slot returns to find
// the pointer unchanged but the tag advanced, so its CAS fails and it
// retries against the fresh link graph.
//
// In this pool (destructor runs on destroy) a free slot's `next` link and an
// owned slot's `T` share storage. A racing popper may therefore load `next`
// from a slot the CAS winner is already filling with data; the stale value
// is never dereferenced — the tag mismatch kills the loser's CAS first.
// =============================================================================

const MIN_BLOCK_SLOTS: usize = 16;

/// Storage for one pooled object, doubling as a freelist link while unused.
#[repr(C)]
struct Slot<T> {
    /// The pool this slot belongs to; checked on destroy.
    #[cfg(feature = "integrity-check")]
    owner: *const (),
    body: UnsafeCell<Body<T>>,
}

/// While a slot is on the freelist its storage holds the `next` link; while
/// it is handed out the same bytes hold the `T`. Destruction restores the
/// storage to raw, which is what makes the overlap legal.
#[repr(C)]
union Body<T> {
    next: ManuallyDrop<AtomicPtr<Slot<T>>>,
    data: ManuallyDrop<T>,
}

impl<T> Slot<T> {
    fn new(owner: *const ()) -> Self {
        #[cfg(not(feature = "integrity-check"))]
        let _ = owner;
        Self {
            #[cfg(feature = "integrity-check")]
            owner,
            body: UnsafeCell::new(Body {
                next: ManuallyDrop::new(AtomicPtr::new(ptr::null_mut())),
            }),
        }
    }

    /// Atomic view of the `next` link.
    ///
    /// Reading it is only meaningful while the slot is free; the pop loop
    /// may load a stale value from a just-claimed slot, which the tagged CAS
    /// then discards.
    fn next_link(&self) -> &AtomicPtr<Slot<T>> {
        // SAFETY: `ManuallyDrop<AtomicPtr<_>>` is transparent over the
        // atomic; projecting the union field through a raw pointer does not
        // assert which variant is live.
        unsafe { &*ptr::addr_of!((*self.body.get()).next).cast::<AtomicPtr<Slot<T>>>() }
    }

    fn data_ptr(&self) -> *mut T {
        // SAFETY: union projection as above; callers only dereference while
        // they own the slot.
        unsafe { ptr::addr_of_mut!((*self.body.get()).data).cast::<T>() }
    }
}

/// Lock-free object pool that runs `T`'s destructor when an object is
/// returned.
///
/// Slots are allocated in blocks that grow geometrically (each new block
/// matches the total capacity so far, minimum 16) and are never individually
/// freed. Any number of threads may [`construct`](Self::construct) and
/// [`destroy`](Self::destroy) concurrently; only block growth takes a mutex,
/// so pre-sizing with [`with_capacity`](Self::with_capacity) keeps the hot
/// path wait-free in practice.
///
/// `VA_BITS` is the platform's virtual-address width used for tag packing;
/// the default 56 fits current x86-64 and AArch64.
pub struct ObjectPool<T, const VA_BITS: u32 = 56> {
    head: AtomicTaggedPtr<Slot<T>, VA_BITS>,
    used: AtomicUsize,
    total_slots: AtomicUsize,
    /// Blocks are boxed slices, so slot addresses stay put as the list grows.
    blocks: Mutex<Vec<Box<[Slot<T>]>>>,
    leak_sink: Option<Mutex<Box<dyn Write + Send>>>,
}

// Safety: slots only hand out exclusive access to one thread at a time via
// the freelist CAS; everything else is atomics and a mutex.
unsafe impl<T: Send, const VA_BITS: u32> Send for ObjectPool<T, VA_BITS> {}
unsafe impl<T: Send, const VA_BITS: u32> Sync for ObjectPool<T, VA_BITS> {}

impl<T, const VA_BITS: u32> ObjectPool<T, VA_BITS> {
    const DATA_OFFSET: usize = offset_of!(Slot<T>, body);

    /// Creates an empty pool. The first `construct` allocates the first
    /// block.
    pub fn new() -> Self {
        Self {
            head: AtomicTaggedPtr::new(TaggedPtr::null()),
            used: AtomicUsize::new(0),
            total_slots: AtomicUsize::new(0),
            blocks: Mutex::new(Vec::new()),
            leak_sink: None,
        }
    }

    /// Creates a pool pre-sized to at least `min_slots`, for callers that
    /// cannot afford the growth mutex on their hot path.
    pub fn with_capacity(min_slots: usize) -> Self {
        let pool = Self::new();
        while pool.capacity() < min_slots {
            let mut blocks = match pool.blocks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            pool.grow(&mut blocks);
        }
        pool
    }

    /// Redirects the leak diagnostic emitted when the pool is dropped with
    /// live slots. Without a sink the diagnostic goes to `tracing`.
    pub fn set_leak_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.leak_sink = Some(Mutex::new(sink));
    }

    // ---------------------------------------------------------------------
    // COUNTERS
    // ---------------------------------------------------------------------

    /// Slots currently handed out.
    #[inline]
    pub fn used_slots(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Slots sitting on the freelist.
    #[inline]
    pub fn unused_slots(&self) -> usize {
        self.capacity() - self.used_slots()
    }

    /// Total slots across all blocks.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.total_slots.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // CONSTRUCT / DESTROY
    // ---------------------------------------------------------------------

    /// Moves `value` into a pooled slot and returns an RAII guard that
    /// destroys it (destructor included) on drop.
    pub fn construct(&self, value: T) -> PoolGuard<'_, T, VA_BITS> {
        PoolGuard {
            obj: self.construct_raw(value),
            pool: self,
        }
    }

    /// Moves `value` into a pooled slot and returns the raw handle. The
    /// caller must eventually pass it to [`destroy`](Self::destroy).
    pub fn construct_raw(&self, value: T) -> NonNull<T> {
        let slot = self.pop_slot();
        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert_slot_ledger!(used, self.capacity());

        // SAFETY: the CAS in pop_slot made this thread the slot's sole
        // owner; its storage is raw (the previous occupant was destroyed
        // before the slot was pushed).
        unsafe {
            let slot_ref = &*slot;
            slot_ref.data_ptr().write(value);
            NonNull::new_unchecked(slot_ref.data_ptr())
        }
    }

    /// Runs the destructor of `obj` and returns its slot to the freelist.
    ///
    /// # Safety
    ///
    /// `obj` must have come from [`construct_raw`](Self::construct_raw) (or
    /// [`PoolGuard::leak`]) on this pool, and must not be used afterwards.
    /// With the `integrity-check` feature an object from a different pool
    /// panics instead of corrupting the freelist.
    ///
    /// # Panics
    ///
    /// When `integrity-check` is enabled and `obj` belongs to another pool.
    pub unsafe fn destroy(&self, obj: NonNull<T>) {
        // Recover the slot from the object address: the payload lives at a
        // fixed offset inside its slot.
        let slot = unsafe {
            obj.as_ptr()
                .cast::<u8>()
                .sub(Self::DATA_OFFSET)
                .cast::<Slot<T>>()
        };

        #[cfg(feature = "integrity-check")]
        {
            // SAFETY: slot recovered above points into one of our blocks iff
            // the caller upheld the contract; the owner word is immutable
            // after block initialization, so reading it is safe even for a
            // foreign (but valid) slot.
            let owner = unsafe { (*slot).owner };
            assert!(
                ptr::eq(owner, (self as *const Self).cast()),
                "destroy() called with an object from a different pool"
            );
        }

        // SAFETY: the caller owns obj; dropping it returns the storage to
        // raw, after which the slot may carry a freelist link again.
        unsafe { ptr::drop_in_place(obj.as_ptr()) };

        self.push_slot(slot);
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    // ---------------------------------------------------------------------
    // FREELIST
    // ---------------------------------------------------------------------

    /// Pops a slot, growing the pool when the freelist runs dry.
    fn pop_slot(&self) -> *mut Slot<T> {
        let backoff = Backoff::new();
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            while cur.is_null() {
                self.add_block();
                cur = self.head.load(Ordering::Acquire);
            }

            let slot = cur.ptr();
            // SAFETY: a non-null head pointed at a free slot when loaded. If
            // another thread claims it concurrently this load returns a
            // stale link (possibly payload bytes), which the tag comparison
            // below rejects before the value is ever dereferenced — hence
            // the lossy `compose` rather than the asserting constructor.
            let next = unsafe { (*slot).next_link().load(Ordering::Relaxed) };
            let proposed = TaggedPtr::compose(next, cur.tag().wrapping_add(1));

            match self
                .head
                .compare_exchange_weak(cur, proposed, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return slot,
                Err(actual) => {
                    cur = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Pushes a (raw-storage) slot back onto the freelist.
    fn push_slot(&self, slot: *mut Slot<T>) {
        let backoff = Backoff::new();
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: this thread owns the slot until the CAS succeeds.
            unsafe { (*slot).next_link().store(old.ptr(), Ordering::Relaxed) };
            let proposed = TaggedPtr::with_tag(slot, old.tag());

            match self
                .head
                .compare_exchange_weak(old, proposed, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => {
                    old = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Grows the pool by one block. Serialized by the block mutex; re-checks
    /// the freelist under the lock so racing threads do not each add one.
    fn add_block(&self) {
        let mut blocks = match self.blocks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !self.head.load(Ordering::Acquire).is_null() {
            return;
        }

        self.grow(&mut blocks);
    }

    /// Allocates and splices one block. Caller holds the block mutex.
    fn grow(&self, blocks: &mut Vec<Box<[Slot<T>]>>) {
        // Geometric growth: the new block matches everything allocated so
        // far, starting at the fixed minimum.
        let count = self.capacity().max(MIN_BLOCK_SLOTS);
        let owner = (self as *const Self).cast::<()>();
        let block: Box<[Slot<T>]> = (0..count).map(|_| Slot::new(owner)).collect();

        // Thread the fresh slots into a chain before anyone can see them.
        for window in block.windows(2) {
            window[0].next_link().store(
                (&window[1] as *const Slot<T>).cast_mut(),
                Ordering::Relaxed,
            );
        }

        let first = (&block[0] as *const Slot<T>).cast_mut();
        let last = (&block[count - 1] as *const Slot<T>).cast_mut();

        // Boxed slices keep their address when the box moves into the vec,
        // so the chain pointers taken above stay valid.
        self.total_slots.fetch_add(count, Ordering::Relaxed);
        blocks.push(block);

        // Splice the chain in: tail -> current head, then CAS the head to
        // the chain's first slot, tag carried over like any push.
        let backoff = Backoff::new();
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `last` points into the block now owned by `blocks`;
            // no other thread can reach these slots before the CAS below.
            unsafe { (*last).next_link().store(old.ptr(), Ordering::Relaxed) };
            let proposed = TaggedPtr::with_tag(first, old.tag());
            match self
                .head
                .compare_exchange_weak(old, proposed, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => {
                    old = actual;
                    backoff.spin();
                }
            }
        }

        tracing::debug!(
            added = count,
            capacity = self.capacity(),
            "object pool grew by a block"
        );
    }
}

impl<T, const VA_BITS: u32> Default for ObjectPool<T, VA_BITS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const VA_BITS: u32> Drop for ObjectPool<T, VA_BITS> {
    fn drop(&mut self) {
        let used = *self.used.get_mut();
        if used > 0 {
            let self_ptr = (self as *const Self).cast();
            crate::report_leak(&mut self.leak_sink, self_ptr, used);
        }
        // Live objects cannot be told apart from freelist links in this
        // layout, so their destructors do not run; the diagnostic above is
        // the contract. Block memory itself is released normally.
    }
}

impl<T, const VA_BITS: u32> std::fmt::Debug for ObjectPool<T, VA_BITS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &self.capacity())
            .field("used", &self.used_slots())
            .finish()
    }
}

/// RAII handle to an object in an [`ObjectPool`]. Destroys the object (slot
/// returned, destructor run) on drop.
pub struct PoolGuard<'a, T, const VA_BITS: u32 = 56> {
    obj: NonNull<T>,
    pool: &'a ObjectPool<T, VA_BITS>,
}

// Safety: the guard is an exclusive handle to one slot.
unsafe impl<T: Send, const VA_BITS: u32> Send for PoolGuard<'_, T, VA_BITS> {}
unsafe impl<T: Sync, const VA_BITS: u32> Sync for PoolGuard<'_, T, VA_BITS> {}

impl<T, const VA_BITS: u32> PoolGuard<'_, T, VA_BITS> {
    /// Releases the guard without returning the slot, handing back the raw
    /// pointer. The object then stays live until
    /// [`destroy`](ObjectPool::destroy) is called — or the pool reports it
    /// as leaked.
    pub fn leak(self) -> NonNull<T> {
        let obj = self.obj;
        std::mem::forget(self);
        obj
    }
}

impl<T, const VA_BITS: u32> Deref for PoolGuard<'_, T, VA_BITS> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard owns the slot for its whole lifetime.
        unsafe { self.obj.as_ref() }
    }
}

impl<T, const VA_BITS: u32> DerefMut for PoolGuard<'_, T, VA_BITS> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` makes the access exclusive.
        unsafe { self.obj.as_mut() }
    }
}

impl<T, const VA_BITS: u32> Drop for PoolGuard<'_, T, VA_BITS> {
    fn drop(&mut self) {
        // SAFETY: the pointer came from construct_raw on this pool and the
        // guard is the sole handle.
        unsafe { self.pool.destroy(self.obj) };
    }
}
