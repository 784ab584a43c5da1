//! Element widths supported by the dense and sparse backends.
//!
//! A width decides how an `i32` element maps onto its packed field and which
//! deflator entry point a backend of that width dispatches to. Adding a width
//! means adding one marker here plus one entry point pair on
//! [`Deflator`](crate::deflate::Deflator).

use std::fmt::Debug;

use crate::array::{BlockArray, TypeTag};
use crate::deflate::{Deflator, RawLayout};
use crate::sparse::SparseArray;

/// Compile-time description of one element width.
pub trait ElementWidth: Copy + Debug + Send + Sync + 'static {
    /// Bits per element.
    const BITS: u8;
    /// Smallest representable element.
    const MIN: i32;
    /// Largest representable element.
    const MAX: i32;
    /// Tag of the dense backend at this width.
    const DENSE_TAG: TypeTag;
    /// Tag of the sparse backend at this width.
    const SPARSE_TAG: TypeTag;

    /// Maps an element onto its raw field.
    ///
    /// Values outside `MIN..=MAX` are a caller contract violation: they panic
    /// in debug builds and are truncated to the low `BITS` bits in release.
    fn encode(value: i32) -> u64;

    /// Maps a raw field back to its element.
    fn decode(raw: u64) -> i32;

    /// Returns `true` if `value` is representable.
    fn fits(value: i32) -> bool {
        (Self::MIN..=Self::MAX).contains(&value)
    }

    /// Calls the deflator entry point for a dense array of this width.
    fn visit_dense(deflator: &dyn Deflator, layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>>;

    /// Calls the deflator entry point for a sparse array of this width.
    fn visit_sparse(deflator: &dyn Deflator, array: &SparseArray<Self>)
    -> Option<Box<dyn BlockArray>>;
}

/// 4-bit elements in `0..=15`, two per byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Bits4;

/// 8-bit elements in `-128..=127`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Bits8;

/// 16-bit elements in `-32768..=32767`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Bits16;

impl ElementWidth for Bits4 {
    const BITS: u8 = 4;
    const MIN: i32 = 0;
    const MAX: i32 = 15;
    const DENSE_TAG: TypeTag = TypeTag::Dense4Bit;
    const SPARSE_TAG: TypeTag = TypeTag::Sparse4Bit;

    #[inline]
    fn encode(value: i32) -> u64 {
        debug_assert!(Self::fits(value), "value {value} exceeds 4-bit range");
        u64::from(value as u8 & 0x0F)
    }

    #[inline]
    fn decode(raw: u64) -> i32 {
        (raw & 0x0F) as i32
    }

    fn visit_dense(deflator: &dyn Deflator, layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        deflator.deflate_dense_4bit(layout)
    }

    fn visit_sparse(
        deflator: &dyn Deflator,
        array: &SparseArray<Self>,
    ) -> Option<Box<dyn BlockArray>> {
        deflator.deflate_sparse_4bit(array)
    }
}

impl ElementWidth for Bits8 {
    const BITS: u8 = 8;
    const MIN: i32 = i8::MIN as i32;
    const MAX: i32 = i8::MAX as i32;
    const DENSE_TAG: TypeTag = TypeTag::Dense8Bit;
    const SPARSE_TAG: TypeTag = TypeTag::Sparse8Bit;

    #[inline]
    fn encode(value: i32) -> u64 {
        debug_assert!(Self::fits(value), "value {value} exceeds 8-bit range");
        u64::from(value as u8)
    }

    #[inline]
    fn decode(raw: u64) -> i32 {
        i32::from(raw as u8 as i8)
    }

    fn visit_dense(deflator: &dyn Deflator, layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        deflator.deflate_dense_8bit(layout)
    }

    fn visit_sparse(
        deflator: &dyn Deflator,
        array: &SparseArray<Self>,
    ) -> Option<Box<dyn BlockArray>> {
        deflator.deflate_sparse_8bit(array)
    }
}

impl ElementWidth for Bits16 {
    const BITS: u8 = 16;
    const MIN: i32 = i16::MIN as i32;
    const MAX: i32 = i16::MAX as i32;
    const DENSE_TAG: TypeTag = TypeTag::Dense16Bit;
    const SPARSE_TAG: TypeTag = TypeTag::Sparse16Bit;

    #[inline]
    fn encode(value: i32) -> u64 {
        debug_assert!(Self::fits(value), "value {value} exceeds 16-bit range");
        u64::from(value as u16)
    }

    #[inline]
    fn decode(raw: u64) -> i32 {
        i32::from(raw as u16 as i16)
    }

    fn visit_dense(deflator: &dyn Deflator, layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        deflator.deflate_dense_16bit(layout)
    }

    fn visit_sparse(
        deflator: &dyn Deflator,
        array: &SparseArray<Self>,
    ) -> Option<Box<dyn BlockArray>> {
        deflator.deflate_sparse_16bit(array)
    }
}

/// Returns the narrowest supported width able to hold every value in `min..=max`.
pub fn narrowest_bits(min: i32, max: i32) -> u8 {
    if Bits4::fits(min) && Bits4::fits(max) {
        Bits4::BITS
    } else if Bits8::fits(min) && Bits8::fits(max) {
        Bits8::BITS
    } else {
        Bits16::BITS
    }
}

/// Returns `true` if `value` is representable at a supported width of `bits`.
pub fn fits_bits(bits: u8, value: i32) -> bool {
    match bits {
        4 => Bits4::fits(value),
        8 => Bits8::fits(value),
        16 => Bits16::fits(value),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_widths_roundtrip_extremes() {
        for value in [Bits8::MIN, -1, 0, 1, Bits8::MAX] {
            assert_eq!(Bits8::decode(Bits8::encode(value)), value);
        }
        for value in [Bits16::MIN, -300, 0, 300, Bits16::MAX] {
            assert_eq!(Bits16::decode(Bits16::encode(value)), value);
        }
        for value in 0..=15 {
            assert_eq!(Bits4::decode(Bits4::encode(value)), value);
        }
    }

    #[test]
    fn test_encoding_stays_inside_field() {
        assert_eq!(Bits8::encode(-1), 0xFF);
        assert_eq!(Bits16::encode(-1), 0xFFFF);
        assert_eq!(Bits4::encode(15), 0xF);
    }

    #[test]
    fn test_narrowest_bits() {
        assert_eq!(narrowest_bits(0, 15), 4);
        assert_eq!(narrowest_bits(-1, 15), 8);
        assert_eq!(narrowest_bits(0, 16), 8);
        assert_eq!(narrowest_bits(-128, 127), 8);
        assert_eq!(narrowest_bits(0, 128), 16);
        assert_eq!(narrowest_bits(i16::MIN as i32, 0), 16);
    }

    #[test]
    fn test_fits_bits() {
        assert!(fits_bits(4, 15));
        assert!(!fits_bits(4, -1));
        assert!(fits_bits(8, -1));
        assert!(!fits_bits(8, 200));
        assert!(fits_bits(16, 200));
        assert!(!fits_bits(16, 40_000));
        assert!(!fits_bits(12, 0));
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_out_of_range_value_panics_in_debug() {
        let _ = Bits4::encode(16);
    }
}
