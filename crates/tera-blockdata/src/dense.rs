//! Dense block arrays: one packed element per voxel at a fixed width.
//!
//! This is the backend chunk initialization starts from. The whole volume
//! lives in one [`PackedCells`] buffer in column-major order, so the
//! serialized payload is exactly the in-memory packed layout.

use std::marker::PhantomData;

use crate::array::{BlockArray, TypeTag};
use crate::deflate::{Deflator, RawLayout};
use crate::error::BlockDataError;
use crate::extent::Extent;
use crate::packed::PackedCells;
use crate::width::{Bits4, Bits8, Bits16, ElementWidth};

/// Dense storage of `W::BITS`-bit elements.
#[derive(Debug)]
pub struct DenseArray<W: ElementWidth> {
    extent: Extent,
    cells: PackedCells,
    _width: PhantomData<W>,
}

/// Dense array of 4-bit elements (`0..=15`), two per byte.
pub type DenseArray4Bit = DenseArray<Bits4>;
/// Dense array of 8-bit elements (`-128..=127`).
pub type DenseArray8Bit = DenseArray<Bits8>;
/// Dense array of 16-bit elements (`-32768..=32767`).
pub type DenseArray16Bit = DenseArray<Bits16>;

impl<W: ElementWidth> DenseArray<W> {
    /// Creates a zero-filled array.
    pub fn new(extent: Extent) -> Self {
        Self {
            extent,
            cells: PackedCells::new(W::BITS, extent.volume()),
            _width: PhantomData,
        }
    }

    /// Rebuilds an array from its serialized payload.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::PayloadLength`] unless `bytes` is exactly
    /// [`payload_len`](Self::payload_len) long.
    pub fn from_bytes(extent: Extent, bytes: &[u8]) -> Result<Self, BlockDataError> {
        let expected = Self::payload_len(extent);
        if bytes.len() != expected {
            return Err(BlockDataError::PayloadLength {
                tag: W::DENSE_TAG,
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            extent,
            cells: PackedCells::from_bytes(W::BITS, extent.volume(), bytes),
            _width: PhantomData,
        })
    }

    /// Builds an array whose element at `(x, y, z)` is `f(x, y, z)`.
    pub fn from_fn(extent: Extent, mut f: impl FnMut(usize, usize, usize) -> i32) -> Self {
        Self::from_linear(extent, |offset| {
            let (x, z) = extent.column_coords(offset / extent.row_size());
            f(x, offset % extent.row_size(), z)
        })
    }

    /// Builds an array from a function of the linear offset.
    pub(crate) fn from_linear(extent: Extent, mut f: impl FnMut(usize) -> i32) -> Self {
        let mut cells = PackedCells::new(W::BITS, extent.volume());
        for offset in 0..extent.volume() {
            cells.put(offset, W::encode(f(offset)));
        }
        Self {
            extent,
            cells,
            _width: PhantomData,
        }
    }

    /// Copies every element of `source` into a new dense array (inflation).
    ///
    /// Every element of `source` must be representable at `W`.
    pub fn copy_from(source: &dyn BlockArray) -> Self {
        Self::from_fn(source.extent(), |x, y, z| source.get(x, y, z))
    }

    /// Payload length for an extent at this width.
    pub fn payload_len(extent: Extent) -> usize {
        PackedCells::byte_len(W::BITS, extent.volume())
    }

    /// Raw buffer view handed to deflators.
    pub fn raw_layout(&self) -> RawLayout<'_> {
        RawLayout {
            cells: &self.cells,
            row_size: self.extent.row_size(),
            extent: self.extent,
        }
    }
}

/// Copies `source` into a new dense array `bits` wide.
///
/// # Errors
///
/// Returns [`BlockDataError::UnsupportedBitWidth`] if no dense backend is
/// `bits` wide.
pub fn dense_copy(
    source: &dyn BlockArray,
    bits: u8,
) -> Result<Box<dyn BlockArray>, BlockDataError> {
    Ok(match bits {
        4 => Box::new(DenseArray4Bit::copy_from(source)),
        8 => Box::new(DenseArray8Bit::copy_from(source)),
        16 => Box::new(DenseArray16Bit::copy_from(source)),
        other => return Err(BlockDataError::UnsupportedBitWidth(other)),
    })
}

impl<W: ElementWidth> BlockArray for DenseArray<W> {
    fn type_tag(&self) -> TypeTag {
        W::DENSE_TAG
    }

    fn extent(&self) -> Extent {
        self.extent
    }

    fn bit_width(&self) -> u8 {
        W::BITS
    }

    #[inline]
    fn get(&self, x: usize, y: usize, z: usize) -> i32 {
        W::decode(self.cells.load(self.extent.linear_offset(x, y, z)))
    }

    #[inline]
    fn set(&self, x: usize, y: usize, z: usize, value: i32) -> i32 {
        let offset = self.extent.linear_offset(x, y, z);
        W::decode(self.cells.swap(offset, W::encode(value)))
    }

    #[inline]
    fn compare_and_set(&self, x: usize, y: usize, z: usize, value: i32, expected: i32) -> bool {
        let offset = self.extent.linear_offset(x, y, z);
        // An unrepresentable `expected` can never match a stored element.
        W::fits(expected)
            && self
                .cells
                .compare_exchange(offset, W::encode(expected), W::encode(value))
    }

    fn deflate(&self, deflator: &dyn Deflator) -> Option<Box<dyn BlockArray>> {
        W::visit_dense(deflator, self.raw_layout())
    }

    fn encoded_len(&self) -> usize {
        Self::payload_len(self.extent)
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        self.cells.write_bytes(out);
    }

    fn storage_bytes(&self) -> usize {
        self.cells.storage_bytes()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::contents_equal;

    fn assert_all_zero(array: &dyn BlockArray) {
        let extent = array.extent();
        for z in 0..extent.size_z() {
            for y in 0..extent.size_y() {
                for x in 0..extent.size_x() {
                    assert_eq!(array.get(x, y, z), 0, "non-zero at ({x}, {y}, {z})");
                }
            }
        }
    }

    #[test]
    fn test_new_arrays_are_zeroed() {
        let extent = Extent::new(3, 7, 2);
        assert_all_zero(&DenseArray4Bit::new(extent));
        assert_all_zero(&DenseArray8Bit::new(extent));
        assert_all_zero(&DenseArray16Bit::new(extent));
        assert_all_zero(&DenseArray8Bit::new(Extent::new(1, 1, 1)));
    }

    #[test]
    fn test_set_then_get_in_small_cube() {
        let array = DenseArray8Bit::new(Extent::new(2, 2, 2));
        assert_eq!(array.set(1, 1, 1, 5), 0);
        assert_eq!(array.get(1, 1, 1), 5);
        assert_eq!(array.get(0, 0, 0), 0);
    }

    #[test]
    fn test_set_leaves_other_cells_untouched() {
        let extent = Extent::new(4, 4, 4);
        let array = DenseArray4Bit::new(extent);
        array.set(2, 1, 3, 9);
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    let expected = if (x, y, z) == (2, 1, 3) { 9 } else { 0 };
                    assert_eq!(array.get(x, y, z), expected);
                }
            }
        }
    }

    #[test]
    fn test_set_returns_previous() {
        let array = DenseArray16Bit::new(Extent::new(2, 3, 2));
        assert_eq!(array.set(1, 2, 1, -1234), 0);
        assert_eq!(array.set(1, 2, 1, 32_000), -1234);
        assert_eq!(array.get(1, 2, 1), 32_000);
    }

    #[test]
    fn test_eight_bit_is_signed() {
        let array = DenseArray8Bit::new(Extent::new(1, 2, 1));
        array.set(0, 0, 0, -128);
        array.set(0, 1, 0, 127);
        assert_eq!(array.get(0, 0, 0), -128);
        assert_eq!(array.get(0, 1, 0), 127);
    }

    #[test]
    fn test_compare_and_set_mismatch_leaves_value() {
        let array = DenseArray8Bit::new(Extent::new(1, 1, 1));
        array.set(0, 0, 0, 4);
        assert!(!array.compare_and_set(0, 0, 0, 7, 3));
        assert_eq!(array.get(0, 0, 0), 4);
    }

    #[test]
    fn test_compare_and_set_match_stores() {
        let array = DenseArray4Bit::new(Extent::new(2, 2, 2));
        array.set(1, 0, 1, 4);
        assert!(array.compare_and_set(1, 0, 1, 7, 4));
        assert_eq!(array.get(1, 0, 1), 7);
        assert_eq!(array.get(0, 0, 1), 0);
    }

    #[test]
    fn test_compare_and_set_unrepresentable_expected_fails() {
        let array = DenseArray4Bit::new(Extent::new(1, 1, 1));
        // -16 truncates to the same nibble as 0, but must not match it.
        assert!(!array.compare_and_set(0, 0, 0, 3, -16));
        assert_eq!(array.get(0, 0, 0), 0);
    }

    #[test]
    fn test_from_bytes_one_short_is_rejected() {
        let extent = Extent::new(4, 4, 4);
        let bytes = vec![0u8; DenseArray8Bit::payload_len(extent) - 1];
        let result = DenseArray8Bit::from_bytes(extent, &bytes);
        assert_eq!(
            result.unwrap_err(),
            BlockDataError::PayloadLength {
                tag: TypeTag::Dense8Bit,
                expected: 64,
                actual: 63,
            }
        );
    }

    #[test]
    fn test_payload_matches_packed_layout() {
        let extent = Extent::new(1, 3, 1);
        let array = DenseArray4Bit::new(extent);
        array.set(0, 0, 0, 1);
        array.set(0, 1, 0, 2);
        array.set(0, 2, 0, 3);
        let mut bytes = Vec::new();
        array.write_payload(&mut bytes);
        assert_eq!(bytes, vec![0x21, 0x03]);
        assert_eq!(bytes.len(), array.encoded_len());

        let restored = DenseArray4Bit::from_bytes(extent, &bytes).unwrap();
        assert!(contents_equal(&array, &restored));
    }

    #[test]
    fn test_copy_from_duplicates_every_element() {
        let extent = Extent::new(3, 4, 5);
        let source = DenseArray16Bit::from_fn(extent, |x, y, z| (x * 100 + y * 10 + z) as i32);
        let copy = DenseArray16Bit::copy_from(&source);
        assert!(contents_equal(&source, &copy));

        // The copy is isolated from later writes to the source.
        source.set(0, 0, 0, -5);
        assert_eq!(copy.get(0, 0, 0), 0);
    }

    #[test]
    fn test_from_fn_places_elements_by_coordinate() {
        let extent = Extent::new(2, 3, 4);
        let array = DenseArray8Bit::from_fn(extent, |x, y, z| (x + 2 * y + 6 * z) as i32);
        for z in 0..4 {
            for y in 0..3 {
                for x in 0..2 {
                    assert_eq!(array.get(x, y, z), (x + 2 * y + 6 * z) as i32);
                }
            }
        }
    }

    #[test]
    fn test_concurrent_compare_and_set_counts_exactly() {
        let array = DenseArray16Bit::new(Extent::new(2, 2, 2));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        loop {
                            let seen = array.get(1, 1, 1);
                            if array.compare_and_set(1, 1, 1, seen + 1, seen) {
                                break;
                            }
                        }
                    }
                });
            }
        });
        assert_eq!(array.get(1, 1, 1), 4_000);
        assert_eq!(array.get(0, 1, 1), 0);
    }

    #[test]
    fn test_dense_copy_widens() {
        let extent = Extent::new(2, 2, 2);
        let source = DenseArray4Bit::from_fn(extent, |x, y, z| (x + 2 * y + 4 * z) as i32);
        let wide = dense_copy(&source, 16).unwrap();
        assert_eq!(wide.type_tag(), TypeTag::Dense16Bit);
        assert!(contents_equal(&source, wide.as_ref()));
        wide.set(1, 1, 1, -20_000);
        assert_eq!(wide.get(1, 1, 1), -20_000);
        assert_eq!(
            dense_copy(&source, 2).err(),
            Some(BlockDataError::UnsupportedBitWidth(2))
        );
    }

    #[test]
    fn test_large_extent_storage() {
        let array = DenseArray8Bit::new(Extent::new(16, 256, 16));
        assert_eq!(array.encoded_len(), 65_536);
        assert_eq!(array.storage_bytes(), 65_536);
        array.set(15, 255, 15, -7);
        assert_eq!(array.get(15, 255, 15), -7);
    }
}
