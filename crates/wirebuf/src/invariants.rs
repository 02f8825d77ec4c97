//! Debug assertion macros for container invariants.
//!
//! Active only in debug builds, so the release fast paths carry zero
//! overhead. Shared by the serialization buffer, both rings, and the pools.

// =============================================================================
// Cursor ordering: 0 <= r <= w <= capacity (serialization buffer)
// =============================================================================

/// Assert the linear-buffer cursor ordering after any cursor update.
macro_rules! debug_assert_cursor_order {
    ($read:expr, $write:expr, $capacity:expr) => {
        debug_assert!(
            $read <= $write && $write <= $capacity,
            "cursor order violated: read {} write {} capacity {}",
            $read,
            $write,
            $capacity
        )
    };
}

// =============================================================================
// Bounded count: used never exceeds effective capacity (rings)
// =============================================================================

/// Assert that a ring's occupancy stays within its effective capacity.
macro_rules! debug_assert_bounded_count {
    ($used:expr, $capacity:expr) => {
        debug_assert!(
            $used <= $capacity,
            "bounded count violated: used {} exceeds capacity {}",
            $used,
            $capacity
        )
    };
}

// =============================================================================
// Ring index range: cursor < slot count (typed ring queue, SPSC ring)
// =============================================================================

/// Assert that a wrap-around index stays inside the slot array.
macro_rules! debug_assert_index_in_range {
    ($name:literal, $index:expr, $slots:expr) => {
        debug_assert!(
            $index < $slots,
            "{} index {} outside slot range {}",
            $name,
            $index,
            $slots
        )
    };
}

// =============================================================================
// Freelist accounting: used + free = capacity (pools)
// =============================================================================

/// Assert the pool slot ledger after a construct/destroy.
macro_rules! debug_assert_slot_ledger {
    ($used:expr, $capacity:expr) => {
        debug_assert!(
            $used <= $capacity,
            "slot ledger violated: {} slots in use out of {}",
            $used,
            $capacity
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_cursor_order;
pub(crate) use debug_assert_index_in_range;
pub(crate) use debug_assert_slot_ledger;
