//! Bitfield with set-count tracking and range scans
//!
//! Piece and block progress all over the engine is tracked with this type.
//! Bits are numbered from the high bit of the first byte (the wire layout
//! of the BITFIELD message). A running popcount is maintained on every
//! mutation, and mutation is internally synchronized so a bitfield can be
//! shared across peer tasks behind an `Arc` without external locking.
//!
//! Scans walk whole bytes and skip runs that cannot contain a match,
//! dropping to bit-at-a-time only at range boundaries.
//!
//! Index arguments are validated against the fixed size; an out-of-range
//! index is a caller bug and panics rather than silently truncating.

use parking_lot::Mutex;

struct Inner {
    bits: Vec<u8>,
    popcount: usize,
}

/// Fixed-size bit vector with a synchronized popcount.
pub struct Bitfield {
    size: usize,
    inner: Mutex<Inner>,
}

impl Bitfield {
    /// Creates an all-clear bitfield of the given size.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            inner: Mutex::new(Inner {
                bits: vec![0; size.div_ceil(8)],
                popcount: 0,
            }),
        }
    }

    /// Creates a bitfield with every bit set.
    pub fn full(size: usize) -> Self {
        let field = Self::new(size);
        field.set_range(0, size);
        field
    }

    /// Creates a bitfield from wire bytes, masking spare bits in the last
    /// byte. Short input is padded with zeros.
    pub fn from_bytes(bytes: &[u8], size: usize) -> Self {
        let byte_count = size.div_ceil(8);
        let mut bits = bytes.to_vec();
        bits.resize(byte_count, 0);

        let spare = byte_count * 8 - size;
        if spare > 0 {
            if let Some(last) = bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }

        let popcount = bits.iter().map(|b| b.count_ones() as usize).sum();
        Self {
            size,
            inner: Mutex::new(Inner { bits, popcount }),
        }
    }

    /// Returns the raw wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.lock().bits.clone()
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True for a zero-size bitfield.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of set bits. Always equals a full scan of the bits.
    pub fn count(&self) -> usize {
        self.inner.lock().popcount
    }

    /// True when every bit is set.
    pub fn is_full(&self) -> bool {
        self.count() == self.size
    }

    fn check(&self, index: usize) {
        assert!(
            index < self.size,
            "bitfield index {} out of range (size {})",
            index,
            self.size
        );
    }

    fn check_range(&self, from: usize, to: usize) {
        assert!(
            from <= to && to <= self.size,
            "bitfield range {}..{} out of range (size {})",
            from,
            to,
            self.size
        );
    }

    /// Returns the bit at `index`.
    pub fn get(&self, index: usize) -> bool {
        self.check(index);
        let inner = self.inner.lock();
        inner.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Sets the bit at `index`. Returns true if the bit changed.
    pub fn set(&self, index: usize) -> bool {
        self.check(index);
        let mut inner = self.inner.lock();
        let mask = 0x80u8 >> (index % 8);
        let byte = &mut inner.bits[index / 8];
        if *byte & mask != 0 {
            return false;
        }
        *byte |= mask;
        inner.popcount += 1;
        true
    }

    /// Clears the bit at `index`. Returns true if the bit changed.
    pub fn unset(&self, index: usize) -> bool {
        self.check(index);
        let mut inner = self.inner.lock();
        let mask = 0x80u8 >> (index % 8);
        let byte = &mut inner.bits[index / 8];
        if *byte & mask == 0 {
            return false;
        }
        *byte &= !mask;
        inner.popcount -= 1;
        true
    }

    /// Sets every bit in `[from, to)`.
    pub fn set_range(&self, from: usize, to: usize) {
        self.check_range(from, to);
        let mut inner = self.inner.lock();
        for index in from..to {
            let mask = 0x80u8 >> (index % 8);
            let byte = &mut inner.bits[index / 8];
            if *byte & mask == 0 {
                *byte |= mask;
                inner.popcount += 1;
            }
        }
    }

    /// Clears every bit in `[from, to)`.
    pub fn unset_range(&self, from: usize, to: usize) {
        self.check_range(from, to);
        let mut inner = self.inner.lock();
        for index in from..to {
            let mask = 0x80u8 >> (index % 8);
            let byte = &mut inner.bits[index / 8];
            if *byte & mask != 0 {
                *byte &= !mask;
                inner.popcount -= 1;
            }
        }
    }

    /// Copies `other`'s bits in `[from, to)` into this bitfield.
    pub fn copy_from(&self, other: &Bitfield, from: usize, to: usize) {
        self.check_range(from, to);
        other.check_range(from, to);
        let theirs = other.inner.lock().bits.clone();
        let mut inner = self.inner.lock();
        for index in from..to {
            let mask = 0x80u8 >> (index % 8);
            let have = theirs[index / 8] & mask != 0;
            let byte = &mut inner.bits[index / 8];
            let had = *byte & mask != 0;
            if have && !had {
                *byte |= mask;
                inner.popcount += 1;
            } else if !have && had {
                *byte &= !mask;
                inner.popcount -= 1;
            }
        }
    }

    /// Lowest unset index in the whole range.
    pub fn first_unset(&self) -> Option<usize> {
        self.first_unset_in(0, self.size)
    }

    /// Lowest unset index in `[from, to)`, skipping all-set bytes.
    pub fn first_unset_in(&self, from: usize, to: usize) -> Option<usize> {
        self.check_range(from, to);
        let inner = self.inner.lock();
        scan(&inner.bits, from, to, false, |byte| byte != 0xFF)
    }

    /// Highest unset index in `[from, to)`.
    pub fn last_unset_in(&self, from: usize, to: usize) -> Option<usize> {
        self.check_range(from, to);
        let inner = self.inner.lock();
        scan(&inner.bits, from, to, true, |byte| byte != 0xFF)
    }

    /// Lowest index in `[from, to)` that is unset here but set in `other`.
    ///
    /// This is the piece-selection scan: `other` is a remote peer's
    /// bitfield and the result is a piece it can serve that we lack.
    pub fn first_missing_in(&self, other: &Bitfield, from: usize, to: usize) -> Option<usize> {
        self.check_range(from, to);
        other.check_range(from, to);
        let theirs = other.inner.lock().bits.clone();
        let inner = self.inner.lock();
        scan_pair(&inner.bits, &theirs, from, to, false)
    }

    /// Highest index in `[from, to)` that is unset here but set in `other`.
    pub fn last_missing_in(&self, other: &Bitfield, from: usize, to: usize) -> Option<usize> {
        self.check_range(from, to);
        other.check_range(from, to);
        let theirs = other.inner.lock().bits.clone();
        let inner = self.inner.lock();
        scan_pair(&inner.bits, &theirs, from, to, true)
    }
}

impl Clone for Bitfield {
    fn clone(&self) -> Self {
        let inner = self.inner.lock();
        Self {
            size: self.size,
            inner: Mutex::new(Inner {
                bits: inner.bits.clone(),
                popcount: inner.popcount,
            }),
        }
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitfield")
            .field("size", &self.size)
            .field("count", &self.count())
            .finish()
    }
}

/// Scan `[from, to)` for a clear bit, skipping bytes rejected by
/// `byte_may_match`. `reversed` scans from the high end.
fn scan(
    bits: &[u8],
    from: usize,
    to: usize,
    reversed: bool,
    byte_may_match: impl Fn(u8) -> bool,
) -> Option<usize> {
    let indexes: Box<dyn Iterator<Item = usize>> = if reversed {
        Box::new((from / 8..to.div_ceil(8)).rev())
    } else {
        Box::new(from / 8..to.div_ceil(8))
    };

    for byte_index in indexes {
        let byte = bits[byte_index];
        if !byte_may_match(byte) {
            continue;
        }
        let lo = (byte_index * 8).max(from);
        let hi = ((byte_index + 1) * 8).min(to);
        if reversed {
            for index in (lo..hi).rev() {
                if byte & (0x80 >> (index % 8)) == 0 {
                    return Some(index);
                }
            }
        } else {
            for index in lo..hi {
                if byte & (0x80 >> (index % 8)) == 0 {
                    return Some(index);
                }
            }
        }
    }

    None
}

/// Scan for an index clear in `ours` and set in `theirs`.
fn scan_pair(ours: &[u8], theirs: &[u8], from: usize, to: usize, reversed: bool) -> Option<usize> {
    let indexes: Box<dyn Iterator<Item = usize>> = if reversed {
        Box::new((from / 8..to.div_ceil(8)).rev())
    } else {
        Box::new(from / 8..to.div_ceil(8))
    };

    for byte_index in indexes {
        let candidates = !ours[byte_index] & theirs[byte_index];
        if candidates == 0 {
            continue;
        }
        let lo = (byte_index * 8).max(from);
        let hi = ((byte_index + 1) * 8).min(to);
        if reversed {
            for index in (lo..hi).rev() {
                if candidates & (0x80 >> (index % 8)) != 0 {
                    return Some(index);
                }
            }
        } else {
            for index in lo..hi {
                if candidates & (0x80 >> (index % 8)) != 0 {
                    return Some(index);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn popcount_tracks_mutations() {
        let field = Bitfield::new(100);
        assert_eq!(field.count(), 0);

        assert!(field.set(0));
        assert!(field.set(99));
        assert!(!field.set(99)); // idempotent
        assert_eq!(field.count(), 2);

        assert!(field.unset(0));
        assert!(!field.unset(0));
        assert_eq!(field.count(), 1);

        field.set_range(10, 20);
        assert_eq!(field.count(), 11);
        field.set_range(15, 25); // overlap must not double-count
        assert_eq!(field.count(), 16);
        field.unset_range(0, 100);
        assert_eq!(field.count(), 0);
    }

    #[test]
    fn popcount_matches_full_scan_under_random_ops() {
        let mut rng = rand::rng();
        let size = 203;
        let field = Bitfield::new(size);
        let mut reference = vec![false; size];

        for _ in 0..2_000 {
            let index = rng.random_range(0..size);
            if rng.random_bool(0.5) {
                field.set(index);
                reference[index] = true;
            } else {
                field.unset(index);
                reference[index] = false;
            }
        }

        let expected = reference.iter().filter(|&&b| b).count();
        assert_eq!(field.count(), expected);
        for (index, &bit) in reference.iter().enumerate() {
            assert_eq!(field.get(index), bit);
        }
    }

    #[test]
    fn first_unset_matches_naive_scan() {
        let mut rng = rand::rng();

        for _ in 0..200 {
            let size = rng.random_range(1..120);
            let field = Bitfield::new(size);
            let mut reference = vec![false; size];
            for index in 0..size {
                if rng.random_bool(0.6) {
                    field.set(index);
                    reference[index] = true;
                }
            }

            let from = rng.random_range(0..size);
            let to = rng.random_range(from..=size);

            let naive = (from..to).find(|&i| !reference[i]);
            assert_eq!(field.first_unset_in(from, to), naive);

            let naive_rev = (from..to).rev().find(|&i| !reference[i]);
            assert_eq!(field.last_unset_in(from, to), naive_rev);
        }
    }

    #[test]
    fn missing_in_other_matches_naive_scan() {
        let mut rng = rand::rng();

        for _ in 0..200 {
            let size = rng.random_range(1..120);
            let ours = Bitfield::new(size);
            let theirs = Bitfield::new(size);
            let mut ours_ref = vec![false; size];
            let mut theirs_ref = vec![false; size];
            for index in 0..size {
                if rng.random_bool(0.5) {
                    ours.set(index);
                    ours_ref[index] = true;
                }
                if rng.random_bool(0.5) {
                    theirs.set(index);
                    theirs_ref[index] = true;
                }
            }

            let from = rng.random_range(0..size);
            let to = rng.random_range(from..=size);

            let naive = (from..to).find(|&i| !ours_ref[i] && theirs_ref[i]);
            assert_eq!(ours.first_missing_in(&theirs, from, to), naive);

            let naive_rev = (from..to).rev().find(|&i| !ours_ref[i] && theirs_ref[i]);
            assert_eq!(ours.last_missing_in(&theirs, from, to), naive_rev);
        }
    }

    #[test]
    fn byte_skip_runs_are_correct() {
        // All-set middle bytes must be skipped, match right after.
        let field = Bitfield::new(64);
        field.set_range(0, 48);
        assert_eq!(field.first_unset(), Some(48));
        assert_eq!(field.first_unset_in(8, 48), None);
        assert_eq!(field.last_unset_in(0, 64), Some(63));
    }

    #[test]
    fn wire_round_trip_masks_spare_bits() {
        let field = Bitfield::from_bytes(&[0b1010_1010, 0b1111_1111], 12);
        // Bits 12..16 are spare and must be masked off.
        assert_eq!(field.count(), 8);
        assert!(field.get(0));
        assert!(!field.get(1));
        assert!(field.get(8));

        let bytes = field.to_bytes();
        assert_eq!(bytes, vec![0b1010_1010, 0b1111_0000]);
    }

    #[test]
    fn copy_from_updates_popcount() {
        let source = Bitfield::full(32);
        let dest = Bitfield::new(32);
        dest.set(0); // outside the copied range, must survive

        dest.copy_from(&source, 8, 24);
        assert_eq!(dest.count(), 17);
        assert!(dest.get(0));
        assert!(dest.get(8));
        assert!(dest.get(23));
        assert!(!dest.get(24));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_get_panics() {
        let field = Bitfield::new(8);
        field.get(8);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_set_panics() {
        let field = Bitfield::new(8);
        field.set(9);
    }
}
