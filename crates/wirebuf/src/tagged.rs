use std::marker::PhantomData;
use std::mem::align_of;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// TAG PACKING SCHEME
// =============================================================================
//
// A `TaggedPtr<T, VA_BITS>` packs a `*mut T` and an integer tag into one u64:
//
//   bit 63 ........ VA_BITS | VA_BITS-1 ........ ALIGN_BITS | ALIGN_BITS-1 .. 0
//   [ high tag bits        ] [ pointer address bits         ] [ low tag bits  ]
//
// - The high range exists because user-space virtual addresses only occupy
//   the low `VA_BITS` bits of the word (56 on current x86-64/AArch64 with
//   5-level paging disabled).
// - The low range exists because a pointer to `T` always has its
//   `log2(align_of::<T>())` low bits clear.
//
// The tag is the concatenation of both ranges (high bits above low bits), so
// its width is `(64 - VA_BITS) + log2(align_of::<T>())` and it wraps at
// 2^width. A single CAS on the packed word therefore updates pointer and tag
// together, which is what defeats ABA in the pool freelist.
// =============================================================================

/// A 64-bit word packing a `*mut T` and an integer tag.
///
/// The tag lives in the bits a canonical pointer cannot use: above the
/// virtual-address range and below the pointee's alignment. Equality is
/// bitwise on the packed word, so two values with the same pointer but
/// different tags compare unequal — the property the pool's CAS relies on.
pub struct TaggedPtr<T, const VA_BITS: u32 = 56> {
    word: u64,
    _marker: PhantomData<*mut T>,
}

impl<T, const VA_BITS: u32> TaggedPtr<T, VA_BITS> {
    /// Number of low bits guaranteed clear in any `*mut T`.
    const ALIGN_BITS: u32 = align_of::<T>().trailing_zeros();
    /// Number of bits above the virtual-address range.
    const HIGH_BITS: u32 = 64 - VA_BITS;

    const LOW_MASK: u64 = (align_of::<T>() as u64) - 1;
    const HIGH_MASK: u64 = if VA_BITS == 64 { 0 } else { !0u64 << VA_BITS };
    const TAG_MASK: u64 = Self::HIGH_MASK | Self::LOW_MASK;
    const PTR_MASK: u64 = !Self::TAG_MASK;

    /// Total tag width in bits. `bump_tag` wraps with period `2^TAG_BITS`.
    pub const TAG_BITS: u32 = Self::HIGH_BITS + Self::ALIGN_BITS;

    // Evaluated at monomorphization time; referenced from every constructor
    // so an invalid instantiation fails the build rather than misbehaving.
    const LAYOUT_OK: () = {
        assert!(
            align_of::<T>() >= 2,
            "TaggedPtr requires align_of::<T>() >= 2 (at least one low tag bit)"
        );
        assert!(
            VA_BITS >= 8 && VA_BITS <= 64,
            "TaggedPtr requires 8 <= VA_BITS <= 64"
        );
        assert!(
            align_of::<T>().trailing_zeros() <= VA_BITS,
            "TaggedPtr low tag bits overlap the high tag range"
        );
    };

    /// Creates a null tagged pointer with tag 0.
    #[inline]
    pub const fn null() -> Self {
        let () = Self::LAYOUT_OK;
        Self {
            word: 0,
            _marker: PhantomData,
        }
    }

    /// Packs `ptr` with tag 0.
    ///
    /// # Panics
    ///
    /// Panics if any address bit of `ptr` intersects the tag mask. That only
    /// happens when `VA_BITS` understates the platform's address width or the
    /// pointer is misaligned for `T` — both programmer errors.
    #[inline]
    pub fn new(ptr: *mut T) -> Self {
        Self::with_tag(ptr, 0)
    }

    /// Packs `ptr` together with `tag` (truncated to [`Self::TAG_BITS`]).
    ///
    /// # Panics
    ///
    /// Same contract as [`new`](Self::new).
    pub fn with_tag(ptr: *mut T, tag: u64) -> Self {
        let () = Self::LAYOUT_OK;
        let addr = ptr as u64;
        assert!(
            addr & Self::TAG_MASK == 0,
            "pointer {addr:#x} has bits in the tag mask {:#x} (misaligned, or VA_BITS too small)",
            Self::TAG_MASK,
        );
        let mut this = Self {
            word: addr,
            _marker: PhantomData,
        };
        this.set_tag(tag);
        this
    }

    /// Packs without the address check, masking any tag-range bits out of
    /// `ptr` instead of panicking.
    ///
    /// For CAS proposals built from a possibly-stale link: if the snapshot
    /// the link came from is stale, the CAS rejects the proposal anyway, so
    /// a garbage pointer must not take the process down first.
    #[inline]
    pub(crate) fn compose(ptr: *mut T, tag: u64) -> Self {
        let () = Self::LAYOUT_OK;
        let mut this = Self {
            word: (ptr as u64) & Self::PTR_MASK,
            _marker: PhantomData,
        };
        this.set_tag(tag);
        this
    }

    /// Reassembles a value from a raw packed word (e.g. out of an atomic).
    #[inline]
    pub(crate) const fn from_word(word: u64) -> Self {
        Self {
            word,
            _marker: PhantomData,
        }
    }

    /// The raw packed word.
    #[inline]
    pub(crate) const fn into_word(self) -> u64 {
        self.word
    }

    /// Extracts the pointer half, with all tag bits cleared.
    #[inline]
    pub fn ptr(self) -> *mut T {
        (self.word & Self::PTR_MASK) as *mut T
    }

    /// True when the pointer half is null (any tag value).
    #[inline]
    pub fn is_null(self) -> bool {
        self.word & Self::PTR_MASK == 0
    }

    /// Reassembles the tag from its high and low halves.
    #[inline]
    pub fn tag(self) -> u64 {
        let low = self.word & Self::LOW_MASK;
        if Self::HIGH_BITS == 0 {
            low
        } else {
            ((self.word >> VA_BITS) << Self::ALIGN_BITS) | low
        }
    }

    /// Masks `tag` into the tag bits. Bits beyond [`Self::TAG_BITS`] are
    /// silently discarded.
    #[inline]
    pub fn set_tag(&mut self, tag: u64) {
        let low = tag & Self::LOW_MASK;
        let high = if Self::HIGH_BITS == 0 {
            0
        } else {
            // Left shift past bit 63 discards the excess, which is exactly
            // the truncation-to-width the contract asks for.
            (tag >> Self::ALIGN_BITS) << VA_BITS
        };
        self.word = (self.word & Self::PTR_MASK) | high | low;
    }

    /// Increments the tag, wrapping at `2^TAG_BITS`. The pointer half is
    /// untouched.
    #[inline]
    pub fn bump_tag(&mut self) {
        self.set_tag(self.tag().wrapping_add(1));
    }
}

impl<T, const VA_BITS: u32> Clone for TaggedPtr<T, VA_BITS> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const VA_BITS: u32> Copy for TaggedPtr<T, VA_BITS> {}

impl<T, const VA_BITS: u32> PartialEq for TaggedPtr<T, VA_BITS> {
    /// Bitwise equality on the packed word: pointer AND tag must match.
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.word == other.word
    }
}

impl<T, const VA_BITS: u32> Eq for TaggedPtr<T, VA_BITS> {}

impl<T, const VA_BITS: u32> std::fmt::Debug for TaggedPtr<T, VA_BITS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedPtr")
            .field("ptr", &self.ptr())
            .field("tag", &self.tag())
            .finish()
    }
}

/// An atomic cell holding a [`TaggedPtr`].
///
/// Thin wrapper over `AtomicU64`; callers pick the orderings. The freelist
/// protocol uses Acquire loads, Release on successful CAS, Relaxed on failure.
pub struct AtomicTaggedPtr<T, const VA_BITS: u32 = 56> {
    word: AtomicU64,
    _marker: PhantomData<*mut T>,
}

// Safety: the cell itself is just a word; dereferencing the contained pointer
// is a separate unsafe step governed by the owning data structure.
unsafe impl<T: Send, const VA_BITS: u32> Send for AtomicTaggedPtr<T, VA_BITS> {}
unsafe impl<T: Send, const VA_BITS: u32> Sync for AtomicTaggedPtr<T, VA_BITS> {}

impl<T, const VA_BITS: u32> AtomicTaggedPtr<T, VA_BITS> {
    /// Creates the cell holding `value`.
    pub const fn new(value: TaggedPtr<T, VA_BITS>) -> Self {
        Self {
            word: AtomicU64::new(value.into_word()),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedPtr<T, VA_BITS> {
        TaggedPtr::from_word(self.word.load(order))
    }

    #[inline]
    pub fn store(&self, value: TaggedPtr<T, VA_BITS>, order: Ordering) {
        self.word.store(value.into_word(), order);
    }

    /// Single-word CAS on the packed (pointer, tag) pair. Never fails
    /// spuriously; prefer [`compare_exchange_weak`](Self::compare_exchange_weak)
    /// inside retry loops.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedPtr<T, VA_BITS>,
        new: TaggedPtr<T, VA_BITS>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<T, VA_BITS>, TaggedPtr<T, VA_BITS>> {
        self.word
            .compare_exchange(current.into_word(), new.into_word(), success, failure)
            .map(TaggedPtr::from_word)
            .map_err(TaggedPtr::from_word)
    }

    /// As [`compare_exchange`](Self::compare_exchange), but may fail
    /// spuriously — the form CAS retry loops want.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: TaggedPtr<T, VA_BITS>,
        new: TaggedPtr<T, VA_BITS>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<T, VA_BITS>, TaggedPtr<T, VA_BITS>> {
        self.word
            .compare_exchange_weak(current.into_word(), new.into_word(), success, failure)
            .map(TaggedPtr::from_word)
            .map_err(TaggedPtr::from_word)
    }
}

impl<T, const VA_BITS: u32> std::fmt::Debug for AtomicTaggedPtr<T, VA_BITS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}
