use crate::invariants::debug_assert_cursor_order;
use crate::ResizeError;
use std::ffi::{CStr, CString};

// =============================================================================
// WIRE FORMAT
// =============================================================================
//
// Everything on the wire is little-endian:
//
// - Arithmetic values of width k occupy k bytes, LE.
// - Strings are a length prefix (code-unit count, u32 LE by default, other
//   widths via the *_with variants) followed by the code units. Units wider
//   than one byte are themselves LE, so mixed-endian hosts agree on the
//   code-unit values rather than on a raw byte order.
// - C strings use the identical framing; the terminator never travels.
//
// `to_le_bytes` / `from_le_bytes` perform the byteswap on big-endian hosts
// and compile to plain loads/stores on little-endian ones.
// =============================================================================

mod sealed {
    pub trait Sealed {}
}

/// Arithmetic types with a fixed little-endian wire encoding.
///
/// Sealed; implemented for the fixed-width integers and floats. `usize` and
/// `isize` are deliberately absent — their width is not part of the wire
/// contract.
pub trait Wire: sealed::Sealed + Copy {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Encodes `self` into `dst[..Self::SIZE]`, little-endian.
    fn put_le(self, dst: &mut [u8]);

    /// Decodes from `src[..Self::SIZE]`, little-endian.
    fn get_le(src: &[u8]) -> Self;
}

macro_rules! impl_wire {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Wire for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn put_le(self, dst: &mut [u8]) {
                    dst[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn get_le(src: &[u8]) -> Self {
                    let mut raw = [0u8; Self::SIZE];
                    raw.copy_from_slice(&src[..Self::SIZE]);
                    Self::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_wire!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

/// Unsigned types usable as a string length prefix.
///
/// Sealed; implemented for `u8`, `u16`, `u32` (the default), and `u64`.
pub trait LenPrefix: Wire {
    /// Converts a code-unit count into the prefix, `None` on overflow.
    fn from_len(len: usize) -> Option<Self>;

    /// Converts the decoded prefix back into a count.
    fn to_len(self) -> usize;
}

macro_rules! impl_len_prefix {
    ($($ty:ty),* $(,)?) => {
        $(
            impl LenPrefix for $ty {
                #[inline]
                fn from_len(len: usize) -> Option<Self> {
                    Self::try_from(len).ok()
                }

                #[inline]
                fn to_len(self) -> usize {
                    // Lossless: prefixes are at most 64 bits and lengths that
                    // large never fit a real buffer anyway.
                    self as usize
                }
            }
        )*
    };
}

impl_len_prefix!(u8, u16, u32, u64);

/// A linear serialization buffer with a read cursor, a write cursor, and a
/// sticky fail flag.
///
/// Bytes in `[read, write)` are unread payload, `[write, capacity)` is free.
/// The discipline is write-then-read (or read-then-write) — there is no
/// wrap-around; for back-and-forth streaming use [`SpscRing`](crate::SpscRing).
///
/// Every operation is non-panicking: a short read or write returns
/// `false`/`None`, commits nothing, and latches the fail flag so a pipeline
/// of operations can be checked once at the end. Only [`clear`](Self::clear)
/// resets the flag.
pub struct SerialBuf {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    failed: bool,
}

impl SerialBuf {
    /// Creates a buffer with the given capacity. Capacity 0 performs no
    /// allocation.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            failed: false,
        }
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unread payload bytes (`write - read`).
    #[inline]
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    /// True when no unread payload remains.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Free bytes remaining for writes (`capacity - write`).
    #[inline]
    pub fn free(&self) -> usize {
        self.buf.len() - self.write
    }

    /// The sticky fail flag. Set by any short read or write, cleared only by
    /// [`clear`](Self::clear).
    #[inline]
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Resets both cursors to 0 and clears the fail flag. The allocation is
    /// kept.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.failed = false;
    }

    #[inline]
    fn fail(&mut self) {
        self.failed = true;
    }

    // ---------------------------------------------------------------------
    // RAW BYTES
    // ---------------------------------------------------------------------

    /// Appends `src` to the payload. On insufficient free space, writes
    /// nothing, latches the fail flag, and returns `false`.
    pub fn write_bytes(&mut self, src: &[u8]) -> bool {
        if src.len() > self.free() {
            self.fail();
            return false;
        }
        self.buf[self.write..self.write + src.len()].copy_from_slice(src);
        self.write += src.len();
        debug_assert_cursor_order!(self.read, self.write, self.buf.len());
        true
    }

    /// Consumes `dst.len()` payload bytes into `dst`, advancing the read
    /// cursor. On insufficient payload, reads nothing, latches the fail
    /// flag, and returns `false`.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
        if !self.peek_bytes(dst) {
            return false;
        }
        self.read += dst.len();
        debug_assert_cursor_order!(self.read, self.write, self.buf.len());
        true
    }

    /// Copies `dst.len()` payload bytes into `dst` without advancing the
    /// read cursor. Takes `&mut self` because a shortage latches the fail
    /// flag.
    pub fn peek_bytes(&mut self, dst: &mut [u8]) -> bool {
        if dst.len() > self.len() {
            self.fail();
            return false;
        }
        dst.copy_from_slice(&self.buf[self.read..self.read + dst.len()]);
        true
    }

    // ---------------------------------------------------------------------
    // ARITHMETIC VALUES
    // ---------------------------------------------------------------------

    /// Appends an arithmetic value, little-endian.
    pub fn write<T: Wire>(&mut self, value: T) -> bool {
        if T::SIZE > self.free() {
            self.fail();
            return false;
        }
        value.put_le(&mut self.buf[self.write..]);
        self.write += T::SIZE;
        true
    }

    /// Consumes an arithmetic value, little-endian.
    pub fn read<T: Wire>(&mut self) -> Option<T> {
        let value = self.peek::<T>()?;
        self.read += T::SIZE;
        Some(value)
    }

    /// Decodes an arithmetic value without advancing the read cursor.
    pub fn peek<T: Wire>(&mut self) -> Option<T> {
        if T::SIZE > self.len() {
            self.fail();
            return None;
        }
        Some(T::get_le(&self.buf[self.read..]))
    }

    // ---------------------------------------------------------------------
    // STRINGS
    //
    // All string forms share the same frame: a length prefix counting code
    // units, then the units themselves. The write is all-or-nothing — the
    // total frame size is checked up front so a shortage commits no prefix.
    // Reads peek the prefix first and only advance once the whole frame
    // (and any validation) succeeds.
    // ---------------------------------------------------------------------

    /// Appends a UTF-8 string with the default `u32` length prefix counting
    /// bytes.
    pub fn write_str(&mut self, s: &str) -> bool {
        self.write_str_with::<u32>(s)
    }

    /// Appends a UTF-8 string with a caller-chosen prefix width.
    pub fn write_str_with<P: LenPrefix>(&mut self, s: &str) -> bool {
        self.write_units_with::<P, u8>(s.as_bytes())
    }

    /// Consumes a UTF-8 string framed with the default `u32` prefix.
    pub fn read_string(&mut self) -> Option<String> {
        self.read_string_with::<u32>()
    }

    /// Consumes a UTF-8 string with a caller-chosen prefix width.
    ///
    /// Invalid UTF-8 in the payload latches the fail flag and leaves the
    /// read cursor in place, like a shortage.
    pub fn read_string_with<P: LenPrefix>(&mut self) -> Option<String> {
        let (payload_at, len) = self.peek_frame::<P>(1)?;
        let bytes = &self.buf[payload_at..payload_at + len];
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                let s = s.to_owned();
                self.read = payload_at + len;
                Some(s)
            }
            Err(_) => {
                self.fail();
                None
            }
        }
    }

    /// Appends UTF-16 code units (`u32` prefix counting units, each unit LE).
    pub fn write_utf16(&mut self, units: &[u16]) -> bool {
        self.write_units_with::<u32, u16>(units)
    }

    /// UTF-16 write with a caller-chosen prefix width.
    pub fn write_utf16_with<P: LenPrefix>(&mut self, units: &[u16]) -> bool {
        self.write_units_with::<P, u16>(units)
    }

    /// Consumes UTF-16 code units framed with the default `u32` prefix.
    pub fn read_utf16(&mut self) -> Option<Vec<u16>> {
        self.read_utf16_with::<u32>()
    }

    /// UTF-16 read with a caller-chosen prefix width.
    pub fn read_utf16_with<P: LenPrefix>(&mut self) -> Option<Vec<u16>> {
        let (payload_at, size) = self.peek_frame::<P>(2)?;
        let units = self.buf[payload_at..payload_at + size]
            .chunks_exact(2)
            .map(u16::get_le)
            .collect();
        self.read = payload_at + size;
        Some(units)
    }

    /// Appends UTF-32 code units (`u32` prefix counting units, each unit LE).
    pub fn write_utf32(&mut self, units: &[char]) -> bool {
        self.write_utf32_with::<u32>(units)
    }

    /// UTF-32 write with a caller-chosen prefix width.
    pub fn write_utf32_with<P: LenPrefix>(&mut self, units: &[char]) -> bool {
        let Some(prefix) = P::from_len(units.len()) else {
            self.fail();
            return false;
        };
        let total = P::SIZE + units.len() * 4;
        if total > self.free() {
            self.fail();
            return false;
        }
        prefix.put_le(&mut self.buf[self.write..]);
        let mut at = self.write + P::SIZE;
        for &unit in units {
            (unit as u32).put_le(&mut self.buf[at..]);
            at += 4;
        }
        self.write = at;
        true
    }

    /// Consumes UTF-32 code units framed with the default `u32` prefix.
    pub fn read_utf32(&mut self) -> Option<Vec<char>> {
        self.read_utf32_with::<u32>()
    }

    /// UTF-32 read with a caller-chosen prefix width.
    ///
    /// A unit outside the Unicode scalar range latches the fail flag and
    /// leaves the read cursor in place.
    pub fn read_utf32_with<P: LenPrefix>(&mut self) -> Option<Vec<char>> {
        let (payload_at, size) = self.peek_frame::<P>(4)?;
        let decoded: Option<Vec<char>> = self.buf[payload_at..payload_at + size]
            .chunks_exact(4)
            .map(|raw| char::from_u32(u32::get_le(raw)))
            .collect();
        match decoded {
            Some(units) => {
                self.read = payload_at + size;
                Some(units)
            }
            None => {
                self.fail();
                None
            }
        }
    }

    /// Appends a C string: the same frame as [`write_str`](Self::write_str),
    /// counting the bytes before the terminator. The NUL itself never
    /// travels.
    pub fn write_cstr(&mut self, s: &CStr) -> bool {
        self.write_cstr_with::<u32>(s)
    }

    /// C-string write with a caller-chosen prefix width.
    pub fn write_cstr_with<P: LenPrefix>(&mut self, s: &CStr) -> bool {
        self.write_units_with::<P, u8>(s.to_bytes())
    }

    /// Consumes a C string, returning it with the terminator restored.
    pub fn read_cstring(&mut self) -> Option<CString> {
        self.read_cstring_with::<u32>()
    }

    /// C-string read with a caller-chosen prefix width.
    ///
    /// An interior NUL in the payload latches the fail flag and leaves the
    /// read cursor in place.
    pub fn read_cstring_with<P: LenPrefix>(&mut self) -> Option<CString> {
        let (payload_at, len) = self.peek_frame::<P>(1)?;
        match CString::new(&self.buf[payload_at..payload_at + len]) {
            Ok(s) => {
                self.read = payload_at + len;
                Some(s)
            }
            Err(_) => {
                self.fail();
                None
            }
        }
    }

    /// Shared write path: prefix + raw code units of width 1 or 2.
    fn write_units_with<P: LenPrefix, U: Wire>(&mut self, units: &[U]) -> bool {
        let Some(prefix) = P::from_len(units.len()) else {
            self.fail();
            return false;
        };
        let total = P::SIZE + units.len() * U::SIZE;
        if total > self.free() {
            self.fail();
            return false;
        }
        prefix.put_le(&mut self.buf[self.write..]);
        let mut at = self.write + P::SIZE;
        for &unit in units {
            unit.put_le(&mut self.buf[at..]);
            at += U::SIZE;
        }
        self.write = at;
        true
    }

    /// Peeks a length prefix and verifies the whole frame is present.
    ///
    /// Returns `(payload_offset, payload_size_bytes)` without moving the
    /// read cursor; the caller advances only after its own validation.
    fn peek_frame<P: LenPrefix>(&mut self, unit_size: usize) -> Option<(usize, usize)> {
        if P::SIZE > self.len() {
            self.fail();
            return None;
        }
        let count = P::get_le(&self.buf[self.read..]).to_len();
        let Some(size) = count.checked_mul(unit_size) else {
            self.fail();
            return None;
        };
        if size > usize::MAX - P::SIZE || P::SIZE + size > self.len() {
            self.fail();
            return None;
        }
        Some((self.read + P::SIZE, size))
    }

    // ---------------------------------------------------------------------
    // RESIZE
    // ---------------------------------------------------------------------

    /// Reallocates to `new_capacity`, compacting unread payload to offset 0.
    ///
    /// Fails without touching the buffer when the unread payload would not
    /// fit or when `new_capacity` equals the current capacity. The fail flag
    /// is not affected either way.
    pub fn try_resize(&mut self, new_capacity: usize) -> Result<(), ResizeError> {
        let unread = self.len();
        if new_capacity < unread {
            return Err(ResizeError::BelowUsed {
                used: unread,
                requested: new_capacity,
            });
        }
        if new_capacity == self.buf.len() {
            return Err(ResizeError::SameCapacity);
        }

        let mut fresh = vec![0u8; new_capacity].into_boxed_slice();
        fresh[..unread].copy_from_slice(&self.buf[self.read..self.write]);
        self.buf = fresh;
        self.read = 0;
        self.write = unread;
        Ok(())
    }
}

impl Default for SerialBuf {
    /// A zero-capacity buffer; no allocation until [`try_resize`](Self::try_resize).
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl std::fmt::Debug for SerialBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBuf")
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_roundtrip() {
        let mut buf = SerialBuf::with_capacity(64);

        assert!(buf.write(-7i8));
        assert!(buf.write(0xDEAD_BEEFu32));
        assert!(buf.write(3.125f64));
        assert!(buf.write_str("hi"));
        assert!(!buf.failed());

        assert_eq!(buf.read::<i8>(), Some(-7));
        assert_eq!(buf.read::<u32>(), Some(0xDEAD_BEEF));
        assert_eq!(buf.read::<f64>(), Some(3.125));
        assert_eq!(buf.read_string().as_deref(), Some("hi"));
        assert!(buf.is_empty());
        assert!(!buf.failed());
    }

    #[test]
    fn test_little_endian_on_the_wire() {
        let mut buf = SerialBuf::with_capacity(8);
        assert!(buf.write(0x1122_3344u32));

        let mut raw = [0u8; 4];
        assert!(buf.peek_bytes(&mut raw));
        assert_eq!(raw, [0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_short_write_commits_nothing() {
        let mut buf = SerialBuf::with_capacity(3);

        assert!(!buf.write(0x0102_0304u32));
        assert!(buf.failed());
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.free(), 3);
    }

    #[test]
    fn test_short_read_does_not_advance() {
        let mut buf = SerialBuf::with_capacity(8);
        assert!(buf.write(7u16));

        assert_eq!(buf.read::<u64>(), None);
        assert!(buf.failed());
        // The u16 is still readable.
        assert_eq!(buf.read::<u16>(), Some(7));
    }

    #[test]
    fn test_fail_flag_is_sticky() {
        let mut buf = SerialBuf::with_capacity(4);

        assert_eq!(buf.read::<u8>(), None);
        assert!(buf.failed());

        // Subsequent successes do not clear it.
        assert!(buf.write(1u8));
        assert_eq!(buf.read::<u8>(), Some(1));
        assert!(buf.failed());

        buf.clear();
        assert!(!buf.failed());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut buf = SerialBuf::with_capacity(8);
        assert!(buf.write(42u32));

        assert_eq!(buf.peek::<u32>(), Some(42));
        assert_eq!(buf.peek::<u32>(), Some(42));
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.read::<u32>(), Some(42));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_string_frame_shortage_keeps_cursor() {
        let mut buf = SerialBuf::with_capacity(16);
        // Prefix claims 100 bytes but only 2 follow.
        assert!(buf.write(100u32));
        assert!(buf.write(0x6868u16));

        assert_eq!(buf.read_string(), None);
        assert!(buf.failed());
        // Cursor untouched: the prefix is still the next readable value.
        assert_eq!(buf.peek::<u32>(), Some(100));
    }

    #[test]
    fn test_string_prefix_widths() {
        let mut buf = SerialBuf::with_capacity(32);

        assert!(buf.write_str_with::<u8>("ab"));
        assert!(buf.write_str_with::<u16>("cd"));
        assert!(buf.write_str_with::<u64>("ef"));

        assert_eq!(buf.read_string_with::<u8>().as_deref(), Some("ab"));
        assert_eq!(buf.read_string_with::<u16>().as_deref(), Some("cd"));
        assert_eq!(buf.read_string_with::<u64>().as_deref(), Some("ef"));
        assert!(!buf.failed());
    }

    #[test]
    fn test_prefix_overflow_fails_cleanly() {
        let mut buf = SerialBuf::with_capacity(512);
        let long = "x".repeat(300);

        // 300 code units do not fit a u8 prefix.
        assert!(!buf.write_str_with::<u8>(&long));
        assert!(buf.failed());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_utf16_roundtrip() {
        let mut buf = SerialBuf::with_capacity(64);
        let units: Vec<u16> = "héllo".encode_utf16().collect();

        assert!(buf.write_utf16(&units));
        assert_eq!(buf.read_utf16(), Some(units));
        assert!(buf.is_empty());
        assert!(!buf.failed());
    }

    #[test]
    fn test_utf16_unit_layout() {
        let mut buf = SerialBuf::with_capacity(16);
        assert!(buf.write_utf16(&[0x0102]));

        let mut raw = [0u8; 6];
        assert!(buf.peek_bytes(&mut raw));
        // u32 prefix = 1, then the unit itself LE.
        assert_eq!(raw, [1, 0, 0, 0, 0x02, 0x01]);
    }

    #[test]
    fn test_utf32_roundtrip() {
        let mut buf = SerialBuf::with_capacity(64);
        let units: Vec<char> = "nuß🦀".chars().collect();

        assert!(buf.write_utf32(&units));
        assert_eq!(buf.read_utf32(), Some(units));
        assert!(!buf.failed());
    }

    #[test]
    fn test_utf32_rejects_non_scalar() {
        let mut buf = SerialBuf::with_capacity(16);
        assert!(buf.write(1u32)); // one unit
        assert!(buf.write(0xD800u32)); // surrogate: not a scalar value

        assert_eq!(buf.read_utf32(), None);
        assert!(buf.failed());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_cstring_roundtrip() {
        let mut buf = SerialBuf::with_capacity(32);
        let s = CString::new("net").unwrap();

        assert!(buf.write_cstr(&s));
        // Identical frame as the plain string form.
        let mut raw = [0u8; 7];
        assert!(buf.peek_bytes(&mut raw));
        assert_eq!(raw, [3, 0, 0, 0, b'n', b'e', b't']);

        assert_eq!(buf.read_cstring(), Some(s));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_cstring_rejects_interior_nul() {
        let mut buf = SerialBuf::with_capacity(16);
        assert!(buf.write(2u32));
        assert!(buf.write_bytes(&[b'a', 0]));

        assert_eq!(buf.read_cstring(), None);
        assert!(buf.failed());
        assert_eq!(buf.peek::<u32>(), Some(2));
    }

    #[test]
    fn test_resize_compacts_unread() {
        let mut buf = SerialBuf::with_capacity(8);
        assert!(buf.write(0xAABBu16));
        assert!(buf.write(0xCCDDu16));
        assert_eq!(buf.read::<u16>(), Some(0xAABB));

        buf.try_resize(4).unwrap();
        assert_eq!(buf.capacity(), 4);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.read::<u16>(), Some(0xCCDD));
        assert!(!buf.failed());
    }

    #[test]
    fn test_resize_rejections() {
        let mut buf = SerialBuf::with_capacity(8);
        assert!(buf.write_bytes(&[1, 2, 3, 4]));

        assert_eq!(
            buf.try_resize(3),
            Err(ResizeError::BelowUsed {
                used: 4,
                requested: 3
            })
        );
        assert_eq!(buf.try_resize(8), Err(ResizeError::SameCapacity));
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn test_zero_capacity() {
        let mut buf = SerialBuf::default();
        assert_eq!(buf.capacity(), 0);
        assert!(buf.is_empty());

        assert!(!buf.write(1u8));
        assert!(buf.failed());

        buf.clear();
        buf.try_resize(4).unwrap();
        assert!(buf.write(1u8));
        assert_eq!(buf.read::<u8>(), Some(1));
    }
}
