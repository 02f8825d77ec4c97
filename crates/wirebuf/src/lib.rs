//! Wirebuf - Buffer & Pool Primitives for Network Messaging
//!
//! The low-level substrate of a messaging pipeline: bytes arrive on an I/O
//! thread, cross to application logic through a lock-free ring, get framed
//! and unframed by a serialization buffer, and the parsed messages cycle
//! through object pools instead of the allocator.
//!
//! Five independent containers share an implementation vocabulary (aligned
//! raw storage, wrap-around indexing, in-place construction) but never
//! reference each other at runtime:
//!
//! - [`TaggedPtr`] / [`AtomicTaggedPtr`]: a pointer and an ABA tag packed
//!   into one CAS-able word
//! - [`SerialBuf`]: heterogeneous values in and out of a linear byte region,
//!   little-endian wire format, sticky fail flag
//! - [`RingQueue`]: single-threaded bounded FIFO of typed values
//! - [`SpscRing`]: lock-free byte ring, one producer and one consumer
//! - [`ObjectPool`] / [`RecyclePool`]: lock-free block-growing object pools,
//!   with and without destructor-on-return
//!
//! # Example
//!
//! ```
//! use wirebuf::{SerialBuf, SpscRing};
//!
//! // I/O thread frames a message...
//! let mut frame = SerialBuf::with_capacity(64);
//! frame.write(0xBEEFu16);
//! frame.write_str("ping");
//!
//! let mut wire = vec![0u8; frame.len()];
//! frame.read_bytes(&mut wire);
//!
//! // ...ships it through the ring...
//! let ring = SpscRing::with_capacity(256);
//! assert!(ring.try_write(&wire));
//!
//! // ...and the application side unframes it.
//! let mut incoming = SerialBuf::with_capacity(64);
//! let mut chunk = vec![0u8; ring.available_read()];
//! ring.try_read(&mut chunk);
//! incoming.write_bytes(&chunk);
//!
//! assert_eq!(incoming.read::<u16>(), Some(0xBEEF));
//! assert_eq!(incoming.read_string().as_deref(), Some("ping"));
//! assert!(!incoming.failed());
//! ```

mod error;
mod invariants;
mod pool;
mod queue;
mod recycle;
mod serial;
mod spsc;
mod tagged;

pub use error::ResizeError;
pub use pool::{ObjectPool, PoolGuard};
pub use queue::RingQueue;
pub use recycle::{RecycleGuard, RecyclePool};
pub use serial::{LenPrefix, SerialBuf, Wire};
pub use spsc::SpscRing;
pub use tagged::{AtomicTaggedPtr, TaggedPtr};

use std::io::Write;
use std::sync::Mutex;

/// Emits the one-line leak diagnostic for a pool dropped with live slots:
/// to the user-installed sink when present, otherwise through `tracing`.
pub(crate) fn report_leak(
    sink: &mut Option<Mutex<Box<dyn Write + Send>>>,
    pool: *const (),
    used: usize,
) {
    match sink {
        Some(sink) => {
            let sink = match sink.get_mut() {
                Ok(sink) => sink,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Diagnostics must not turn a leak into a panic-in-drop.
            let _ = writeln!(sink, "pool {pool:p} dropped with {used} live slot(s)");
            let _ = sink.flush();
        }
        None => {
            tracing::error!(pool = ?pool, used, "pool dropped with live slot(s)");
        }
    }
}
