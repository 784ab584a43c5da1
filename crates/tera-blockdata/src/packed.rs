//! Bit-packed cell storage for fixed-width fields in a shared `Box<[AtomicU64]>`.
//!
//! Each field occupies exactly `bits` bits (4, 8 or 16). Since 64 is a multiple
//! of every supported width, no field straddles a word boundary, so a single
//! word-level atomic covers every field read-modify-write. Writes only touch
//! the bits they own; neighbours sharing the word are preserved.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A compact array of raw `bits`-wide fields that can be mutated through `&self`.
pub struct PackedCells {
    /// Raw storage. Fields are packed little-endian into 64-bit words.
    words: Box<[AtomicU64]>,
    /// Bits per field (4, 8 or 16).
    bits: u8,
    /// Total number of logical fields.
    len: usize,
}

impl PackedCells {
    /// Creates `len` zeroed fields of `bits` bits each.
    pub fn new(bits: u8, len: usize) -> Self {
        debug_assert!(matches!(bits, 4 | 8 | 16), "bits must be 4, 8, or 16");
        let total_bits = len as u64 * u64::from(bits);
        let word_count = total_bits.div_ceil(64) as usize;
        Self {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            bits,
            len,
        }
    }

    /// Rebuilds storage from its byte form (see [`write_bytes`](Self::write_bytes)).
    ///
    /// The caller must have checked `bytes.len() == PackedCells::byte_len(bits, len)`.
    pub fn from_bytes(bits: u8, len: usize, bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), Self::byte_len(bits, len));
        let words = bytes
            .chunks(8)
            .map(|chunk| {
                let mut word_bytes = [0u8; 8];
                word_bytes[..chunk.len()].copy_from_slice(chunk);
                AtomicU64::new(u64::from_le_bytes(word_bytes))
            })
            .collect();
        Self { words, bits, len }
    }

    /// Packs exactly `len` raw fields taken from `values`.
    pub fn from_raw_iter(bits: u8, len: usize, values: impl IntoIterator<Item = u64>) -> Self {
        let mut cells = Self::new(bits, len);
        let mut count = 0;
        for (index, raw) in values.into_iter().take(len).enumerate() {
            cells.put(index, raw);
            count += 1;
        }
        debug_assert_eq!(count, len, "iterator yielded too few fields");
        cells
    }

    /// Number of bytes `len` fields of `bits` bits serialize to.
    ///
    /// # Panics
    ///
    /// Panics if `len * bits` overflows `usize`. Lengths derived from an
    /// [`Extent`](crate::Extent) never do.
    pub fn byte_len(bits: u8, len: usize) -> usize {
        match Self::checked_byte_len(bits, len) {
            Some(bytes) => bytes,
            None => panic!("{len} fields of {bits} bits overflow usize"),
        }
    }

    /// Like [`byte_len`](Self::byte_len), returning `None` on overflow.
    pub fn checked_byte_len(bits: u8, len: usize) -> Option<usize> {
        len.checked_mul(usize::from(bits)).map(|total| total.div_ceil(8))
    }

    /// Returns the raw field at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len` in debug builds.
    #[inline]
    pub fn load(&self, index: usize) -> u64 {
        let (word, offset) = self.locate(index);
        (self.words[word].load(Ordering::Acquire) >> offset) & self.mask()
    }

    /// Stores `raw` at `index` and returns the previous field.
    ///
    /// Bits of `raw` above the field width are discarded.
    #[inline]
    pub fn swap(&self, index: usize, raw: u64) -> u64 {
        let (word, offset) = self.locate(index);
        let mask = self.mask();
        let field = (raw & mask) << offset;
        let previous = match self.words[word].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| Some((current & !(mask << offset)) | field),
        ) {
            Ok(previous) | Err(previous) => previous,
        };
        (previous >> offset) & mask
    }

    /// Stores `new` at `index` only if the field currently equals `expected`.
    ///
    /// Retries internally when a neighbouring field in the same word changes
    /// concurrently; fails only when this field differs from `expected`.
    #[inline]
    pub fn compare_exchange(&self, index: usize, expected: u64, new: u64) -> bool {
        let (word, offset) = self.locate(index);
        let mask = self.mask();
        let expected = expected & mask;
        let field = (new & mask) << offset;
        self.words[word]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                ((current >> offset) & mask == expected)
                    .then(|| (current & !(mask << offset)) | field)
            })
            .is_ok()
    }

    /// Stores `raw` at `index` through exclusive access, skipping the atomics.
    pub fn put(&mut self, index: usize, raw: u64) {
        let (word, offset) = self.locate(index);
        let mask = self.mask();
        let slot = self.words[word].get_mut();
        *slot = (*slot & !(mask << offset)) | ((raw & mask) << offset);
    }

    /// Iterates over all raw fields in index order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).map(|index| self.load(index))
    }

    /// Appends exactly [`byte_len`](Self::byte_len) bytes to `out`.
    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        let end = out.len() + Self::byte_len(self.bits, self.len);
        for word in self.words.iter() {
            out.extend_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
        }
        // The last word may be partially used.
        out.truncate(end);
    }

    /// Returns the number of bits per field.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Returns the number of logical fields.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the size of the backing words in bytes (not counting struct overhead).
    pub fn storage_bytes(&self) -> usize {
        self.words.len() * 8
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, u32) {
        debug_assert!(index < self.len, "index {index} out of bounds ({})", self.len);
        let bit_index = index * self.bits as usize;
        (bit_index / 64, (bit_index % 64) as u32)
    }

    #[inline]
    fn mask(&self) -> u64 {
        (1u64 << self.bits) - 1
    }
}

impl fmt::Debug for PackedCells {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedCells")
            .field("bits", &self.bits)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
