use crate::invariants::debug_assert_slot_ledger;
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};
use crossbeam_utils::Backoff;
use std::cell::UnsafeCell;
use std::io::Write;
use std::mem::{offset_of, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

const MIN_BLOCK_SLOTS: usize = 16;

/// Storage for one recyclable object.
///
/// Unlike [`ObjectPool`](crate::ObjectPool)'s slots, the freelist link and
/// the payload are separate fields: the object stays constructed while the
/// slot sits on the freelist, so the link must not overwrite it. The
/// `constructed` flag tells first-time hand-outs from re-issues, and tells
/// pool drop which slots still owe a destructor.
#[repr(C)]
struct Slot<T> {
    /// The pool this slot belongs to; checked on destroy.
    #[cfg(feature = "integrity-check")]
    owner: *const (),
    next: AtomicPtr<Slot<T>>,
    constructed: AtomicBool,
    data: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new(owner: *const ()) -> Self {
        #[cfg(not(feature = "integrity-check"))]
        let _ = owner;
        Self {
            #[cfg(feature = "integrity-check")]
            owner,
            next: AtomicPtr::new(ptr::null_mut()),
            constructed: AtomicBool::new(false),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn data_ptr(&self) -> *mut T {
        self.data.get().cast::<T>()
    }
}

/// Lock-free object pool that keeps objects alive across returns.
///
/// The destructor does **not** run when a slot is handed back: the object
/// persists, and the next `construct_with` that draws the same slot skips
/// the initializer entirely. That makes this variant the right tool for
/// payloads that are expensive to set up (pre-reserved byte buffers,
/// pre-grown maps) — callers reset per-use state through the handle instead
/// of reconstructing. Destructors for every slot ever initialized run when
/// the pool itself is dropped.
///
/// Freelist protocol, block growth, tagging, and the integrity check are
/// shared contracts with [`ObjectPool`](crate::ObjectPool); see `pool.rs`
/// for the CAS discipline.
pub struct RecyclePool<T, const VA_BITS: u32 = 56> {
    head: AtomicTaggedPtr<Slot<T>, VA_BITS>,
    used: AtomicUsize,
    total_slots: AtomicUsize,
    blocks: Mutex<Vec<Box<[Slot<T>]>>>,
    leak_sink: Option<Mutex<Box<dyn Write + Send>>>,
}

// Safety: as for ObjectPool — slot hand-out is exclusive via the CAS, the
// rest is atomics and a mutex.
unsafe impl<T: Send, const VA_BITS: u32> Send for RecyclePool<T, VA_BITS> {}
unsafe impl<T: Send, const VA_BITS: u32> Sync for RecyclePool<T, VA_BITS> {}

impl<T, const VA_BITS: u32> RecyclePool<T, VA_BITS> {
    const DATA_OFFSET: usize = offset_of!(Slot<T>, data);

    /// Creates an empty pool; the first hand-out allocates the first block.
    pub fn new() -> Self {
        Self {
            head: AtomicTaggedPtr::new(TaggedPtr::null()),
            used: AtomicUsize::new(0),
            total_slots: AtomicUsize::new(0),
            blocks: Mutex::new(Vec::new()),
            leak_sink: None,
        }
    }

    /// Creates a pool pre-sized to at least `min_slots`.
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

    /// Draws a slot and returns an RAII guard. `init` runs only if the slot
    /// has never held an object; a recycled slot comes back exactly as its
    /// previous user left it.
    pub fn construct_with(&self, init: impl FnOnce() -> T) -> RecycleGuard<'_, T, VA_BITS> {
        RecycleGuard {
            obj: self.construct_raw_with(init),
            pool: self,
        }
    }

    /// As [`construct_with`](Self::construct_with), returning the raw
    /// handle. The caller must eventually pass it to
    /// [`destroy`](Self::destroy).
    pub fn construct_raw_with(&self, init: impl FnOnce() -> T) -> NonNull<T> {
        let slot = self.pop_slot();
        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert_slot_ledger!(used, self.capacity());

        // SAFETY: the CAS in pop_slot made this thread the slot's sole
        // owner. The constructed flag is only flipped by the owner, and the
        // freelist CAS pair orders the previous owner's writes before ours.
        unsafe {
            let slot_ref = &*slot;
            if !slot_ref.constructed.load(Ordering::Relaxed) {
                slot_ref.data_ptr().write(init());
                slot_ref.constructed.store(true, Ordering::Relaxed);
            }
            NonNull::new_unchecked(slot_ref.data_ptr())
        }
    }

    /// Returns `obj`'s slot to the freelist **without** running the
    /// destructor; the object stays constructed in place.
    ///
    /// # Safety
    ///
    /// `obj` must have come from `construct_raw_with` (or
    /// [`RecycleGuard::leak`]) on this pool, and must not be used after this
    /// call.
    ///
    /// # Panics
    ///
    /// When `integrity-check` is enabled and `obj` belongs to another pool.
    pub unsafe fn destroy(&self, obj: NonNull<T>) {
        let slot = unsafe {
            obj.as_ptr()
                .cast::<u8>()
                .sub(Self::DATA_OFFSET)
                .cast::<Slot<T>>()
        };

        #[cfg(feature = "integrity-check")]
        {
            // SAFETY: valid-slot reasoning as in ObjectPool::destroy.
            let owner = unsafe { (*slot).owner };
            assert!(
                ptr::eq(owner, (self as *const Self).cast()),
                "destroy() called with an object from a different pool"
            );
        }

        self.push_slot(slot);
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    // ---------------------------------------------------------------------
    // FREELIST
    // ---------------------------------------------------------------------

    fn pop_slot(&self) -> *mut Slot<T> {
        let backoff = Backoff::new();
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            while cur.is_null() {
                self.add_block();
                cur = self.head.load(Ordering::Acquire);
            }

            let slot = cur.ptr();
            // The link is a dedicated field here, so this load stays valid
            // even if another thread wins the slot first; the tag mismatch
            // still rejects the stale proposal.
            let next = unsafe { (*slot).next.load(Ordering::Relaxed) };
            let proposed = TaggedPtr::with_tag(next, cur.tag().wrapping_add(1));

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

    fn push_slot(&self, slot: *mut Slot<T>) {
        let backoff = Backoff::new();
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: this thread owns the slot until the CAS succeeds.
            unsafe { (*slot).next.store(old.ptr(), Ordering::Relaxed) };
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
        let count = self.capacity().max(MIN_BLOCK_SLOTS);
        let owner = (self as *const Self).cast::<()>();
        let block: Box<[Slot<T>]> = (0..count).map(|_| Slot::new(owner)).collect();

        for window in block.windows(2) {
            window[0].next.store(
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

        let backoff = Backoff::new();
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `last` points into the block now owned by `blocks`;
            // no other thread can reach these slots before the CAS below.
            unsafe { (*last).next.store(old.ptr(), Ordering::Relaxed) };
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
            "recycle pool grew by a block"
        );
    }
}

impl<T, const VA_BITS: u32> Default for RecyclePool<T, VA_BITS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const VA_BITS: u32> Drop for RecyclePool<T, VA_BITS> {
    fn drop(&mut self) {
        let used = *self.used.get_mut();
        if used > 0 {
            let self_ptr = (self as *const Self).cast();
            crate::report_leak(&mut self.leak_sink, self_ptr, used);
        }

        // The constructed flags record exactly which slots hold a live
        // object (on the freelist or leaked); destroy each one once.
        let blocks = match self.blocks.get_mut() {
            Ok(blocks) => blocks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for block in blocks.iter_mut() {
            for slot in block.iter_mut() {
                if *slot.constructed.get_mut() {
                    // SAFETY: `&mut self` means no thread holds a handle;
                    // the flag marks initialized storage.
                    unsafe { ptr::drop_in_place(slot.data_ptr()) };
                }
            }
        }
    }
}

impl<T, const VA_BITS: u32> std::fmt::Debug for RecyclePool<T, VA_BITS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecyclePool")
            .field("capacity", &self.capacity())
            .field("used", &self.used_slots())
            .finish()
    }
}

/// RAII handle to an object in a [`RecyclePool`]. Returns the slot on drop;
/// the object itself stays constructed for the next user.
pub struct RecycleGuard<'a, T, const VA_BITS: u32 = 56> {
    obj: NonNull<T>,
    pool: &'a RecyclePool<T, VA_BITS>,
}

unsafe impl<T: Send, const VA_BITS: u32> Send for RecycleGuard<'_, T, VA_BITS> {}
unsafe impl<T: Sync, const VA_BITS: u32> Sync for RecycleGuard<'_, T, VA_BITS> {}

impl<T, const VA_BITS: u32> RecycleGuard<'_, T, VA_BITS> {
    /// Releases the guard without returning the slot, handing back the raw
    /// pointer for a later [`destroy`](RecyclePool::destroy).
    pub fn leak(self) -> NonNull<T> {
        let obj = self.obj;
        std::mem::forget(self);
        obj
    }
}

impl<T, const VA_BITS: u32> Deref for RecycleGuard<'_, T, VA_BITS> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard owns the slot for its whole lifetime.
        unsafe { self.obj.as_ref() }
    }
}

impl<T, const VA_BITS: u32> DerefMut for RecycleGuard<'_, T, VA_BITS> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` makes the access exclusive.
        unsafe { self.obj.as_mut() }
    }
}

impl<T, const VA_BITS: u32> Drop for RecycleGuard<'_, T, VA_BITS> {
    fn drop(&mut self) {
        // SAFETY: the pointer came from construct_raw_with on this pool and
        // the guard is the sole handle.
        unsafe { self.pool.destroy(self.obj) };
    }
}
